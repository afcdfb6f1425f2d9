//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::middleware::RateLimitLayer;
use crate::error::{Result, WindowGuardError};
use crate::metrics::PrometheusRecorder;
use crate::ratelimit::WindowLimiter;

/// HTTP front end: a rate-limited endpoint plus unlimited health and metrics.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<WindowLimiter>,
    recorder: Arc<PrometheusRecorder>,
    key_prefix: String,
}

impl HttpServer {
    pub fn new(
        addr: SocketAddr,
        limiter: Arc<WindowLimiter>,
        recorder: Arc<PrometheusRecorder>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            limiter,
            recorder,
            key_prefix: key_prefix.into(),
        }
    }

    /// Build the router. Only routes added before the rate-limit layer are
    /// limited.
    pub fn router(&self) -> Router {
        let layer = RateLimitLayer::new(
            Arc::clone(&self.limiter),
            self.recorder.clone(),
            self.key_prefix.as_str(),
        );

        Router::new()
            .route("/", get(hello_handler))
            .route_layer(layer)
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&self.recorder))
    }

    /// Bind the listener and start serving on a background task.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!(addr = %local_addr, "Starting HTTP server");

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                // a dropped sender also means stop
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                WindowGuardError::Io(e)
            })
        });

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Owner of the running server task.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, then wait up to `grace` for in-flight
    /// requests to finish. Past the deadline the task is aborted and an
    /// error returned.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let ServerHandle {
            shutdown_tx,
            mut task,
            ..
        } = self;

        let _ = shutdown_tx.send(());

        match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => {
                joined
                    .map_err(|e| WindowGuardError::Server(format!("server task failed: {}", e)))??;
                info!("HTTP server drained");
                Ok(())
            }
            Err(_) => {
                warn!(grace = ?grace, "In-flight requests did not drain in time, aborting");
                task.abort();
                Err(WindowGuardError::Server(format!(
                    "forced shutdown after {:?}",
                    grace
                )))
            }
        }
    }
}

async fn hello_handler() -> &'static str {
    "Hello, World!\n"
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(recorder): State<Arc<PrometheusRecorder>>) -> impl IntoResponse {
    match recorder.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
