use claude_gemini_proxy::config::config_search_paths;
use claude_gemini_proxy::{build_router, AppState, Gateway, ProxyConfig, SharedLogger};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "claude-gemini-proxy",
    about = "Anthropic Messages API gateway backed by Google Gemini",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Request journal path
    #[arg(long, default_value = "claude-gemini-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claude_gemini_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    config.validate()?;

    let api_key = config.resolve_api_key()?;
    let logger = SharedLogger::new(&cli.log_file)?;

    info!("claude-gemini-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", config.upstream.base_url);
    info!("  Big:       {}", config.models.big);
    info!("  Small:     {}", config.models.small);
    info!("  Retries:   {}", config.retry.max_retries);
    info!(
        "  Cache:     {}",
        if config.cache.enabled { "enabled" } else { "disabled" }
    );
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting claude-gemini-proxy base_url={} big={} small={} port={}",
            config.upstream.base_url, config.models.big, config.models.small, config.port
        ),
    );

    let config = Arc::new(config);
    let gateway = Gateway::new(Arc::clone(&config), api_key, logger.clone())?;
    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        gateway: Arc::new(gateway),
        logger: logger.clone(),
        shutdown: shutdown.clone(),
    });

    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  To use with Claude Code:");
    info!("    ANTHROPIC_BASE_URL=http://localhost:{} claude", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    logger.info("shutdown", "Stopped");
    Ok(())
}
