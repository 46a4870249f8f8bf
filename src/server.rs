//! Listener lifecycle for the control plane.
//!
//! Two TCP listeners share one [`Dispatcher`]: the HTTP API on
//! `server.port` and the WebSocket endpoint on `server.ws_port`. Both are
//! bound before either starts serving, so a port conflict leaves nothing
//! half-running.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, RouterConfig};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::shutdown::ShutdownCoordinator;

/// How long `stop` waits for WebSocket handlers to flush their close frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("refusing to bind non-loopback address {0}")]
    NonLoopback(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve the configured host to a loopback address.
fn resolve_host(host: &str) -> Result<IpAddr, ServerError> {
    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| ServerError::InvalidHost(host.to_string()))?
    };
    if !ip.is_loopback() {
        return Err(ServerError::NonLoopback(host.to_string()));
    }
    Ok(ip)
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// A running pair of listeners. Dropping the handle does not stop them;
/// call [`ServerHandle::stop`].
pub struct ServerHandle {
    api_addr: SocketAddr,
    ws_addr: SocketAddr,
    dispatcher: Dispatcher,
    shutdown: ShutdownCoordinator,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bind both listeners and start serving.
    ///
    /// Port 0 picks an ephemeral port; the bound addresses are available
    /// from [`api_addr`](Self::api_addr) and [`ws_addr`](Self::ws_addr).
    pub async fn start(config: &ServerConfig, dispatcher: Dispatcher) -> Result<Self, ServerError> {
        let ip = resolve_host(&config.host)?;
        let api_listener = bind(SocketAddr::new(ip, config.port)).await?;
        let ws_listener = bind(SocketAddr::new(ip, config.ws_port)).await?;
        let api_addr = api_listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: SocketAddr::new(ip, config.port), source })?;
        let ws_addr = ws_listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: SocketAddr::new(ip, config.ws_port), source })?;

        let shutdown = ShutdownCoordinator::new();
        let state = AppState::new(dispatcher.clone(), shutdown.clone());
        let router_config = RouterConfig::local(&[api_addr.port(), ws_addr.port()]);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::with_capacity(2);
        for (name, listener, app) in [
            ("http", api_listener, api::router(state.clone(), &router_config)),
            ("websocket", ws_listener, api::ws_router(state, &router_config)),
        ] {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await;
                if let Err(e) = result {
                    tracing::error!(listener = name, error = %e, "server error");
                }
            }));
        }

        tracing::info!(%api_addr, %ws_addr, "control plane listening");

        Ok(Self {
            api_addr,
            ws_addr,
            dispatcher,
            shutdown,
            cancel,
            tasks,
        })
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Close every WebSocket with a close frame, then stop both listeners.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.shutdown.shutdown();
        if !self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                remaining = self.shutdown.active_connections(),
                "websocket connections did not drain in time"
            );
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(?e, "server task panicked");
            }
        }
        tracing::info!("control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves_to_loopback() {
        assert_eq!(
            resolve_host("localhost").unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert!(resolve_host("127.0.0.1").is_ok());
        assert!(resolve_host("::1").is_ok());
        assert!(resolve_host("[::1]").is_ok());
    }

    #[test]
    fn non_loopback_is_refused() {
        assert!(matches!(
            resolve_host("0.0.0.0"),
            Err(ServerError::NonLoopback(_))
        ));
        assert!(matches!(
            resolve_host("192.168.1.10"),
            Err(ServerError::NonLoopback(_))
        ));
    }

    #[test]
    fn garbage_host_is_invalid() {
        assert!(matches!(
            resolve_host("not a host"),
            Err(ServerError::InvalidHost(_))
        ));
    }
}
