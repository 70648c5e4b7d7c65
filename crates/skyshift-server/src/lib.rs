//! The SkyShift API server: authenticated, RBAC-gated CRUD and watch
//! endpoints over the object store, plus job log/exec side paths proxied
//! through the compatibility layer.

pub mod api;
pub mod auth;
pub mod bootstrap;

use std::net::SocketAddr;

use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::info;

pub use crate::{
    api::{build_router, AppState},
    auth::{Authorizer, TokenSigner},
    bootstrap::bootstrap,
};

#[derive(Debug, Snafu)]
pub enum ServeError {
    #[snafu(display("failed to bind {address}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("server terminated abnormally"))]
    Serve { source: std::io::Error },
}

/// Serves the API until `shutdown` fires.
pub async fn serve(
    address: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(%address, "api listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context(ServeSnafu)
}
