/// The relay listener: accepts local client sockets and serves each
/// with its own relay state and worker pool.
use std::net::SocketAddr;
use std::sync::Arc;

use courier_carrier::Carrier;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::relay;
use crate::RelayError;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Workers per attached client.
    pub workers: usize,
    /// Pending decoded frames before the reader blocks (back-pressure).
    pub queue_depth: usize,
    /// Buffered payloads between the relay and each carrier tunnel.
    pub tunnel_buffer: usize,
    /// Unacknowledged relay → client tunnel data frames.
    pub tunnel_window: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 16,
            tunnel_buffer: 64,
            tunnel_window: 64,
        }
    }
}

/// Accepts relay clients on a local socket.
pub struct RelayServer {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl RelayServer {
    /// Bind the listener and start accepting clients.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        carrier: Arc<Carrier>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("relay accept failed: {err}");
                        continue;
                    }
                };
                tracing::debug!(%peer, "relay client connecting");
                let carrier = carrier.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay::serve(socket, carrier, config).await {
                        tracing::debug!(%peer, "relay client ended: {err}");
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            acceptor,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}
