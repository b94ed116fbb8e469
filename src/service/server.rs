//! TCP accept loop and connection policy.
//!
//! The server owns the listener, the allow-list, and a map of live
//! connections. Everything protocol-shaped happens in the sessions; the
//! server's job is to admit or refuse peers and to keep the bookkeeping
//! that lets a session announce its own death through the close callback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{AllowList, ProxyConfig};
use crate::error::Result;
use crate::pcsc::ScardBackend;

use super::lock;
use super::session::Session;

/// Accepting server, bound to its listen address.
pub struct Server {
    listener: TcpListener,
    allow: AllowList,
    backend: Arc<dyn ScardBackend>,
    connections: Arc<Mutex<HashMap<u64, SocketAddr>>>,
    next_connection: AtomicU64,
}

impl Server {
    /// Bind the listen socket and build the allow-list. Fails fast on an
    /// unusable address or a malformed CIDR.
    pub async fn bind(config: &ProxyConfig, backend: Arc<dyn ScardBackend>) -> Result<Self> {
        let allow = config.allow_list()?;
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Server {
            listener,
            allow,
            backend,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: AtomicU64::new(0),
        })
    }

    /// The actual bound address. Useful when the configured port is 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Run until the shutdown channel fires. Live sessions are not torn
    /// down here; each one cleans up its own PC/SC state when its
    /// connection ends.
    pub async fn run_with_shutdown(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(address = %self.local_addr()?, "listening");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(error) => error!(%error, "accept failed"),
                },
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.allow.contains(peer.ip()) {
            // Dropping the stream closes it; a refused peer gets no bytes.
            warn!(%peer, "connection rejected by allow-list");
            return;
        }

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        lock(&self.connections).insert(id, peer);

        let connections = Arc::clone(&self.connections);
        let on_close = Box::new(move || {
            let remaining = {
                let mut map = lock(&connections);
                map.remove(&id);
                map.len()
            };
            info!(%peer, remaining, "connection closed");
        });

        info!(%peer, "connection accepted");
        Session::spawn(stream, peer, Arc::clone(&self.backend), on_close);
    }
}
