//! HTTP API.
//!
//! Host-facing endpoints (bootstrap script, step callback) authenticate
//! through signed capability URLs and the webhook through its HMAC
//! signature. Management endpoints take the `X-Hostwright-Token` header
//! when an API token is configured.

mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::deploy::Deployer;
use crate::error::Result;
use crate::lifecycle::ResourceService;
use crate::provision::Provisioner;

pub use error::ApiError;

/// Services shared by every request handler.
pub struct AppState {
    pub provisioner: Provisioner,
    pub deployer: Deployer,
    pub resources: ResourceService,
    /// Token for management endpoints (None disables their authentication).
    pub api_token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until the process is stopped.
pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    if state.api_token.is_none() {
        tracing::warn!(
            "No API token configured - management endpoints are unauthenticated. \
             Set HOSTWRIGHT_API_TOKEN for production use."
        );
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("hostwright listening on {}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
