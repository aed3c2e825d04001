use anyhow::Result;
use authbridge::config::Config;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = authbridge::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Server host override
    #[arg(long)]
    host: Option<String>,

    /// Server port override
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let mut config = Config::load(Some(&cli.config)).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!(
        "Starting {} v{} on {}:{}",
        env!("CARGO_PKG_NAME"),
        authbridge::VERSION,
        config.server.host,
        config.server.port
    );

    // Configuration is logged with secrets masked
    if let Ok(dump) = serde_json::to_value(&config) {
        info!("Effective configuration: {}", authbridge::utils::redact_value(&dump));
    }

    authbridge::server::run(config).await?;
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();

    Ok(())
}
