//! Core server: accepts stream connections and owns the session registry.

use crate::bridge;
use crate::session::SessionRegistry;
use crate::transport::websocket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termhub_core::TermResult;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often exited sessions are checked for removal.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// The termhub server instance.
pub struct TerminalServer {
    registry: Arc<SessionRegistry>,
    exited_retention: Duration,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TerminalServer {
    pub fn new(registry: Arc<SessionRegistry>, exited_retention: Duration) -> Self {
        Self {
            registry,
            exited_retention,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> TermResult<(SocketAddr, JoinHandle<()>)> {
        let listener = websocket::bind(addr).await?;
        let local = listener.local_addr()?;
        let server = self.clone();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        Ok((local, handle))
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut ws_rx = websocket::start_listener(listener);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let reaper = {
            let registry = self.registry.clone();
            let retention = self.exited_retention;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REAP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            registry.reap_exited(retention).await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        info!("termhub-server ready");

        loop {
            tokio::select! {
                Some(conn) = ws_rx.recv() => {
                    let registry = self.registry.clone();
                    let conn_shutdown = self.shutdown_tx.subscribe();
                    tokio::spawn(bridge::serve_connection(registry, conn, conn_shutdown));
                }
                _ = shutdown_rx.recv() => {
                    debug!("accept loop stopping");
                    break;
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        reaper.abort();
    }

    /// Close every open stream with a shutdown code, then terminate all
    /// sessions concurrently. Each termination is bounded by the graceful
    /// timeout plus the force-kill grace.
    pub async fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());

        for (id, result) in self.registry.close_all().await {
            match result {
                Ok(outcome) => debug!(session_id = %id, outcome = ?outcome, "session settled"),
                Err(e) => debug!(session_id = %id, error = %e, "session already gone"),
            }
        }
        info!("all sessions closed");
    }
}
