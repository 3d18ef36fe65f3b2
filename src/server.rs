use crate::handlers::{health_check, upstream};
use crate::middleware::{admission_middleware, AdmissionState};
use axum::routing::{any, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Build the router: `/api/*` behind admission control, `/health` outside it.
pub fn create_app(state: AdmissionState) -> Router {
    Router::new()
        .route("/api/*path", any(upstream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(state: AdmissionState, bind_addr: SocketAddr) -> Self {
        Self {
            app: create_app(state),
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("custom-ratelimit listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
