//! HTTP server wiring
//!
//! Builds the actix route table over the injected stores, resolver,
//! refresher, dispatcher and OAuth engine, applies the CORS headers, and
//! runs the server with graceful shutdown (sweepers aborted, file-backed
//! token store flushed).

mod discovery;
mod mcp_routes;
mod oauth_routes;
mod validation;

pub use mcp_routes::TransportRegistry;
pub use validation::{challenge_response, validate_origin, validate_protocol_version};

use crate::auth::{AuthResolver, TokenRefresher};
use crate::config::Config;
use crate::error::Result;
use crate::mcp::{McpDispatcher, RequestContextRegistry, ServerIdentity};
use crate::oauth::{CimdFetcher, OAuthFlowEngine};
use crate::storage::{SessionStore, TokenStore};
use crate::utils::throttle::{ThrottleConfig, ThrottledClient};
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared application state injected into every handler
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// Token store backend
    pub token_store: Arc<dyn TokenStore>,
    /// Session store backend
    pub session_store: Arc<dyn SessionStore>,
    /// Credential resolver
    pub resolver: Arc<AuthResolver>,
    /// Upstream token refresher
    pub refresher: Arc<TokenRefresher>,
    /// JSON-RPC dispatcher
    pub dispatcher: Arc<McpDispatcher>,
    /// Request-context registry
    pub contexts: Arc<RequestContextRegistry>,
    /// OAuth flow engine
    pub oauth_engine: Arc<OAuthFlowEngine>,
    /// Streaming transports
    pub transports: Arc<TransportRegistry>,
    /// Externally visible base URL
    pub base_url: String,
}

impl AppState {
    /// Assemble the full dependency graph from configuration
    pub async fn build(config: Config) -> Result<Self> {
        let base_url = config.server.base_url();

        let token_store = crate::storage::build_token_store(&config.storage).await?;
        let session_store = crate::storage::build_session_store(&config.storage);

        let throttle = ThrottleConfig {
            rps_limit: config.throttling.rps_limit,
            concurrency_limit: config.throttling.concurrency_limit,
            ..Default::default()
        };
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&token_store),
            config.refresher_provider(),
            ThrottledClient::new(throttle.clone()),
        ));

        let resolver = Arc::new(AuthResolver::new(
            config.auth.clone(),
            config.server.accept_headers.clone(),
            Arc::clone(&token_store),
            Arc::clone(&refresher),
        ));

        let contexts = Arc::new(RequestContextRegistry::new());
        let tools = Arc::new(crate::mcp::ToolRegistry::with_builtins().await?);
        let prompts = Arc::new(crate::mcp::PromptRegistry::new());
        let resources = Arc::new(crate::mcp::ResourceRegistry::new());

        let dispatcher = Arc::new(McpDispatcher::new(
            tools,
            prompts,
            resources,
            Arc::clone(&contexts),
            Arc::clone(&session_store),
            ServerIdentity {
                title: config.server.title.clone(),
                version: config.server.version.clone(),
                instructions: config.server.instructions.clone(),
            },
        ));

        let oauth_engine = Arc::new(OAuthFlowEngine::new(
            Arc::clone(&token_store),
            Arc::clone(&refresher),
            config.oauth.clone(),
            config.provider.clone(),
            CimdFetcher::new(config.cimd.clone()),
            ThrottledClient::new(throttle),
            base_url.clone(),
            config.server.is_development(),
        ));

        Ok(Self {
            config,
            token_store,
            session_store,
            resolver,
            refresher,
            dispatcher,
            contexts,
            oauth_engine,
            transports: Arc::new(TransportRegistry::new()),
            base_url,
        })
    }
}

/// Register all routes on an actix service config
///
/// Shared between `run` and the integration tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(mcp_routes::handle_health))
        .route("/mcp", web::post().to(mcp_routes::handle_mcp_post))
        .route("/mcp", web::get().to(mcp_routes::handle_mcp_get))
        .route("/mcp", web::delete().to(mcp_routes::handle_mcp_delete))
        .route("/mcp", web::method(actix_web::http::Method::OPTIONS).to(handle_preflight))
        .route(
            "/.well-known/oauth-authorization-server",
            web::get().to(oauth_routes::handle_authorization_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            web::get().to(oauth_routes::handle_protected_resource_metadata),
        )
        .route("/authorize", web::get().to(oauth_routes::handle_authorize))
        .route("/oauth/callback", web::get().to(oauth_routes::handle_callback))
        .route("/token", web::post().to(oauth_routes::handle_token))
        .route("/register", web::post().to(oauth_routes::handle_register))
        .route("/revoke", web::post().to(oauth_routes::handle_revoke));
}

async fn handle_preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

/// CORS headers applied to every response
fn cors_headers() -> middleware::DefaultHeaders {
    middleware::DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", "*"))
        .add(("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"))
        .add((
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, Mcp-Session-Id, MCP-Protocol-Version, Mcp-Protocol-Version, X-Api-Key, X-Auth-Token",
        ))
        .add(("Access-Control-Expose-Headers", "Mcp-Session-Id, WWW-Authenticate"))
}

/// Run the server until shutdown, then flush storage
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::build(config).await?;
    let bind_addr = (state.config.server.host.clone(), state.config.server.port);

    info!(
        "AuthBridge listening on {}:{} ({} mode, auth strategy {})",
        bind_addr.0,
        bind_addr.1,
        state.config.server.environment,
        state.config.auth.strategy
    );

    // Background sweeps: token store, session store, request contexts
    let mut sweepers = crate::storage::spawn_sweepers(
        Arc::clone(&state.token_store),
        Arc::clone(&state.session_store),
    );
    sweepers.push(RequestContextRegistry::spawn_sweeper(Arc::clone(&state.contexts)));

    let token_store = Arc::clone(&state.token_store);
    let app_state = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(cors_headers())
            .wrap(middleware::Logger::default())
            .configure(configure_routes)
    })
    .bind(bind_addr)?
    .shutdown_timeout(10)
    .run();

    let result = server.await;

    // Graceful shutdown: stop timers first so no sweep races the flush
    for sweeper in sweepers {
        sweeper.abort();
    }
    if let Err(e) = token_store.flush().await {
        warn!("Token store flush on shutdown failed: {}", e);
    } else {
        info!("Token store flushed");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    result.map_err(Into::into)
}
