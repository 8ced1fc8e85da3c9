//! HTTP server implementation.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::error::BootstrapError;
use crate::worker::WorkerService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Bind the control listener. Done after the handler is constructed so a
/// controller only sees the port open once the worker can serve.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, BootstrapError> {
    let addr = config.address();
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BootstrapError::Bind { addr, source })
}

/// Serve the control channel until shutdown is requested or a signal arrives.
pub async fn serve(listener: TcpListener, service: Arc<WorkerService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    info!("Serving on {}", listener.local_addr()?);
    service
        .serve()
        .await
        .map_err(|fault| anyhow::anyhow!("cannot start serving: {fault}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    service.stop().await;
    info!("Worker stopped");

    Ok(())
}

/// Wait for SIGTERM, SIGINT or the `-SHUTDOWN-` request.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via {}...", crate::bridge::protocol::SHUTDOWN);
        }
    }
}
