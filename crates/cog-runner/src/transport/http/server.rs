//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::runner::Runner;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    /// Used in Kubernetes to allow graceful draining.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
        }
    }
}

/// Serve the runner until it terminates.
pub async fn serve(config: ServerConfig, runner: Arc<Runner>) -> anyhow::Result<()> {
    let app = routes(Arc::clone(&runner));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting cog-runner server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.await_explicit_shutdown, runner))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve once the runner has terminated.
///
/// SIGINT and SIGTERM only ask the worker to stop; the server keeps answering
/// until the worker has exited.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured.
async fn shutdown_signal(await_explicit_shutdown: bool, runner: Arc<Runner>) {
    let mut terminated = runner.terminated();

    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            // Ignore SIGTERM - wait forever (until SIGINT or explicit shutdown)
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect(
                    "failed to install SIGTERM handler - is tokio runtime configured correctly?",
                )
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = await_explicit_shutdown;
        std::future::pending::<()>()
    };

    let signalled = tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
            true
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
            true
        }
        _ = terminated.wait_for(|t| *t) => false,
    };

    if signalled {
        if let Err(e) = runner.shutdown() {
            tracing::error!(error = %e, "Failed to request worker shutdown");
            runner.terminate();
        }
    }

    if terminated.wait_for(|t| *t).await.is_err() {
        tracing::warn!("Runner dropped before terminating");
    }
}
