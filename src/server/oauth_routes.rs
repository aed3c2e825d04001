//! HTTP envelope for the OAuth flow engine
//!
//! Maps `OAuthFlowError` kinds to OAuth 2.1 error bodies and performs the
//! redirects the engine computes.

use crate::oauth::{AuthorizeInput, OAuthFlowError, RegisterRequest, TokenRequest};
use crate::server::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{debug, error, warn};

/// Provider callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Provider authorization code
    pub code: Option<String>,
    /// Composite state round-tripped through the provider
    pub state: Option<String>,
    /// Provider error code
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// Query parameters for the protected-resource document
#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    /// Session correlation from the 401 challenge
    pub sid: Option<String>,
}

fn oauth_error_response(err: &OAuthFlowError) -> HttpResponse {
    if matches!(err, OAuthFlowError::Internal(_)) {
        error!("OAuth flow internal error: {}", err);
    } else {
        debug!("OAuth flow rejected: {}", err);
    }

    let mut body = serde_json::json!({"error": err.error_code()});
    let description = err.description();
    if !description.is_empty() {
        body["error_description"] = serde_json::json!(description);
    }

    let status = actix_web::http::StatusCode::from_u16(err.http_status())
        .unwrap_or(actix_web::http::StatusCode::BAD_REQUEST);
    HttpResponse::build(status).json(body)
}

/// GET `/authorize`
pub async fn handle_authorize(
    query: web::Query<AuthorizeInput>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state.oauth_engine.authorize(query.into_inner()).await {
        Ok(outcome) => HttpResponse::Found()
            .insert_header(("Location", outcome.redirect_to))
            .finish(),
        Err(e) => oauth_error_response(&e),
    }
}

/// GET `/oauth/callback`
pub async fn handle_callback(
    query: web::Query<CallbackQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let query = query.into_inner();

    if let Some(error) = query.error {
        warn!(
            "Provider denied authorization: {} ({})",
            error,
            query.error_description.as_deref().unwrap_or("")
        );
        return oauth_error_response(&OAuthFlowError::ProviderTokenError {
            code: error,
            description: query.error_description.unwrap_or_default(),
        });
    }

    let (code, composite_state) = match (query.code, query.state) {
        (Some(code), Some(state)) => (code, state),
        _ => {
            return oauth_error_response(&OAuthFlowError::InvalidRequest(
                "callback requires code and state".to_string(),
            ))
        }
    };

    match state.oauth_engine.callback(&composite_state, &code).await {
        Ok(redirect) => HttpResponse::Found()
            .insert_header(("Location", redirect))
            .finish(),
        Err(e) => oauth_error_response(&e),
    }
}

/// POST `/token`
pub async fn handle_token(
    form: web::Form<TokenRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state.oauth_engine.token(form.into_inner()).await {
        Ok(response) => HttpResponse::Ok()
            .insert_header(("Cache-Control", "no-store"))
            .json(response),
        Err(e) => oauth_error_response(&e),
    }
}

/// POST `/register`
pub async fn handle_register(
    body: Option<web::Json<RegisterRequest>>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let response = state.oauth_engine.register(request);
    HttpResponse::Created().json(response)
}

/// POST `/revoke`: stub, always 200
pub async fn handle_revoke() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({}))
}

/// GET `/.well-known/oauth-authorization-server`
pub async fn handle_authorization_server_metadata(state: web::Data<AppState>) -> HttpResponse {
    let doc = crate::server::discovery::authorization_server_metadata(&state.config, &state.base_url);
    HttpResponse::Ok().json(doc)
}

/// GET `/.well-known/oauth-protected-resource`
pub async fn handle_protected_resource_metadata(
    _req: HttpRequest,
    query: web::Query<ResourceQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let doc = crate::server::discovery::protected_resource_metadata(
        &state.config,
        &state.base_url,
        query.sid.as_deref(),
    );
    HttpResponse::Ok().json(doc)
}
