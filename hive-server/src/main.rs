use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use hive_core::config::RuntimeConfig;
use hive_core::session::SessionManager;
use hive_core::tools::ToolRegistry;

use hive_server::{llm_stub, routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::from_env();
    let keepalive = config.sse_keepalive;
    // The concrete provider is wired by the deployment; the stub keeps a
    // bare checkout runnable end to end.
    let llm = Arc::new(llm_stub::EchoProvider::default());
    let tools = Arc::new(ToolRegistry::new());
    let manager = Arc::new(SessionManager::new(config, llm, tools));

    let router = routes::router(routes::AppState { manager, keepalive });

    let addr: SocketAddr = std::env::var("HIVE_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:8420".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "hive server listening");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
