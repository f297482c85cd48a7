//! HTTP server lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::{router, AppState};
use crate::error::Result;

/// HTTP server for the admission control service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared request state
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Start the server with graceful shutdown.
    ///
    /// In-flight requests complete after `signal` resolves; new connections
    /// are refused.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            profiles = self.state.registry.len(),
            bound_routes = self.state.bindings.len(),
            "Starting HTTP server"
        );

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
