use anyhow::{Context, Result};
use chimein_backend::config::BackendConfig;
use chimein_backend::runtime::BackendRuntime;
use chimein_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chimein_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting engagement backend (set CHIMEIN_BACKEND_TOKEN + optional CHIMEIN_BACKEND_BIND; auth mode via CHIMEIN_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
