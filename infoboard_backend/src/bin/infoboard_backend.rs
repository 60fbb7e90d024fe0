use anyhow::{Context, Result};
use flume::unbounded;
use infoboard_backend::config::BoardConfig;
use infoboard_backend::runtime::BoardRuntime;
use infoboard_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,infoboard_backend=debug")),
        )
        .init();

    let config = BoardConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BoardRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap info board runtime")?;

    tracing::info!(
        "Starting info board proxy (optional INFOBOARD_TOKEN guards the control API; INFOBOARD_UPSTREAM_URL selects the agent backend)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
