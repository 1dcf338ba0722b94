//! HTTP surface. Authorization happens upstream; the caller identity arrives
//! in `X-User-Id` and the project in `X-Project-Token`.

pub mod error;
pub mod response;
pub mod routes;

use crate::core::PromptGateway;
use crate::reports::ReportService;
use crate::storage::Storage;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;
pub use response::*;

const API_PATH: &str = "/api";

/// Shared handler state.
pub struct AppState<S: Storage> {
    pub gateway: PromptGateway<S>,
    pub reports: ReportService<S>,
    pub storage: S,
}

/// Web API adapter for HTTP access
pub struct WebApiAdapter<S: Storage> {
    state: Arc<AppState<S>>,
    host: String,
    port: u16,
}

impl<S: Storage + 'static> WebApiAdapter<S> {
    pub fn new(state: AppState<S>, host: String, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            host,
            port,
        }
    }

    /// Build Axum router with all endpoints
    pub fn build_routes(&self) -> AxumRouter {
        AxumRouter::new()
            .route("/health", get(routes::health))
            .route(
                &format!("{}/prompts/:public_id/execute", API_PATH),
                post(routes::execute_prompt::<S>),
            )
            .route(
                &format!("{}/reports", API_PATH),
                get(routes::list_reports::<S>),
            )
            .route(
                &format!("{}/webhooks/:id/deliveries", API_PATH),
                get(routes::list_deliveries::<S>),
            )
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(axum::middleware::from_fn(logging_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(DefaultBodyLimit::max(1024 * 1024)), // 1MB
            )
    }

    /// Serve until `shutdown` fires, then drain in-flight metering and
    /// webhook work.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.build_routes();
        let addr = format!("{}:{}", self.host, self.port);

        info!(
            "Starting Web API on {} (Health: /health, API: {})",
            addr, API_PATH
        );

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .context("Failed to bind server")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

        info!("Draining background tasks");
        self.state.gateway.drain().await;
        Ok(())
    }
}

/// Logging middleware
async fn logging_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    tracing::info!("{} {} → {}", method, uri, status);

    response
}
