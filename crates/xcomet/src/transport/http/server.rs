//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::EvaluationService;

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
            port: 8000,
        }
    }
}

/// Serve until SIGINT, SIGTERM or `POST /shutdown`, then stop the worker.
pub async fn serve(config: ServerConfig, service: Arc<EvaluationService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting xcomet server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Wait for SIGINT, SIGTERM or the `/shutdown` endpoint.
///
/// A signal handler that cannot be installed is logged and that source is
/// ignored; the remaining ones still work.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
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
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::manager::WorkerManager;
    use std::time::Duration;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
    }

    #[tokio::test]
    async fn serve_returns_after_explicit_shutdown() {
        let manager = WorkerManager::new(SupervisorConfig::new()).unwrap();
        let service = Arc::new(EvaluationService::new(Arc::clone(&manager)));
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        let server = tokio::spawn(serve(config, Arc::clone(&service)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.trigger_shutdown();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(manager.spawn_count(), 0);
        assert!(!manager.snapshot().await.is_ready());
    }

    #[tokio::test]
    async fn serve_rejects_bad_host() {
        let manager = WorkerManager::new(SupervisorConfig::new()).unwrap();
        let service = Arc::new(EvaluationService::new(manager));
        let config = ServerConfig {
            host: "not a host".to_string(),
            port: 0,
        };
        assert!(serve(config, service).await.is_err());
    }
}
