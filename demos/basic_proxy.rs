//! Start a claude-gemini-proxy server programmatically.
//!
//! Usage:
//!   export GEMINI_API_KEY=your_key
//!   cargo run --example basic_proxy

use claude_gemini_proxy::{build_router, AppState, Gateway, ProxyConfig, SharedLogger};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(ProxyConfig::find_and_load(None)?);
    let api_key = config.resolve_api_key()?;

    println!("Upstream: {}", config.upstream.base_url);
    println!("Models: big={} small={}", config.models.big, config.models.small);

    let logger = SharedLogger::new("proxy-example.log")?;
    let gateway = Gateway::new(Arc::clone(&config), api_key, logger.clone())?;

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        gateway: Arc::new(gateway),
        logger,
        shutdown: CancellationToken::new(),
    });

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Listening on http://{}", addr);
    println!();
    println!("  ANTHROPIC_BASE_URL=http://localhost:{} claude", port);

    axum::serve(listener, app).await?;
    Ok(())
}
