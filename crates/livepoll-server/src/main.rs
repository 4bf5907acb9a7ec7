// Live poll server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Create mpsc channels
// 4. Bind and spawn the WebSocket server task
// 5. Spawn the poll loop task
// 6. Wait for Ctrl+C (or either task ending)
// 7. Cleanup on exit

use livepoll_core::config;
use livepoll_server::app;
use livepoll_server::ws_server;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("Live poll server starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: bind {}, default poll duration {} ms",
        config.server.bind_addr(),
        config.poll.default_duration_ms
    );

    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (timer_tx, timer_rx) = mpsc::channel(16);

    let listener = ws_server::TungsteniteListener::bind(&config.server.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr()))?;

    let outbound_buffer = config.server.outbound_buffer;
    let mut ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(listener, ws_tx, outbound_buffer).await {
            error!("WebSocket server error: {}", e);
        }
    });

    let app_state = app::AppState::new(&config.poll, timer_tx);
    let mut app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(ws_rx, timer_rx, app_state).await {
            error!("Poll loop error: {}", e);
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Ctrl+C received, shutting down");
        }
        _ = &mut app_handle => {
            info!("Poll loop finished");
        }
        _ = &mut ws_handle => {
            error!("WebSocket server stopped, shutting down");
        }
    }

    // Open connections hold event senders, so neither task drains on its
    // own; stop both. Aborting a finished task is a no-op.
    ws_handle.abort();
    app_handle.abort();

    info!("Live poll server shut down cleanly");
    Ok(())
}

/// Initialize tracing to stdout, filtered by `RUST_LOG`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("livepoll_server=info,livepoll_core=info,warn")),
        )
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
