//! Static HTTP file server
//!
//! Serves the installer payload (kernel, initrd, rootfs, kickstart and the
//! mounted ISO tree) to the booting DPU.

use crate::error::{Result, ServiceError};
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHttpConfig {
    /// Directory served at `/`
    pub root: PathBuf,
    pub bind: SocketAddr,
}

impl Default for StaticHttpConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/www"),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
        }
    }
}

impl StaticHttpConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.bind)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.bind,
                source,
            })
    }
}

fn router(root: PathBuf) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(root))
        .layer(TraceLayer::new_for_http())
}

/// Serve `root` on `listener` until `shutdown` turns `true`
pub async fn serve_static(
    listener: TcpListener,
    root: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, root = %root.display(), "HTTP file server listening");

    axum::serve(listener, router(root))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| ServiceError::Serve {
            name: "http".to_string(),
            reason: e.to_string(),
        })?;

    info!(%addr, "HTTP file server stopped");
    Ok(())
}
