//! Opening the TCP socket.
//!
//! Resolution can yield several addresses (availability group listeners
//! publish one per subnet). They are either tried one after another or,
//! with multi-subnet failover, raced in parallel with the first connected
//! socket winning.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream, lookup_host};

/// Idle time before the first keep-alive probe.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Opens sockets for a connection attempt.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Resolve `host` and connect to `port` on one of its addresses.
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Connector over `tokio::net`.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    local_address: Option<IpAddr>,
    parallel: bool,
}

impl TcpConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(local_address: Option<IpAddr>, parallel: bool) -> Self {
        Self {
            local_address,
            parallel,
        }
    }

    async fn connect_one(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_address {
            socket.bind(SocketAddr::new(local, 0))?;
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        configure_keepalive(&stream);
        Ok(stream)
    }

    async fn connect_sequential(&self, addrs: Vec<SocketAddr>) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in addrs {
            match self.connect_one(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "address failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(no_addresses))
    }

    async fn connect_parallel(&self, addrs: Vec<SocketAddr>) -> io::Result<TcpStream> {
        let mut attempts: FuturesUnordered<_> =
            addrs.into_iter().map(|addr| self.connect_one(addr)).collect();
        let mut last_error = None;
        while let Some(outcome) = attempts.next().await {
            match outcome {
                // Dropping the set aborts the losing attempts.
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(no_addresses))
    }
}

#[async_trait]
impl SocketConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        tracing::debug!(host = %host, port, addresses = addrs.len(), parallel = self.parallel, "connecting");
        if self.parallel {
            self.connect_parallel(addrs).await
        } else {
            self.connect_sequential(addrs).await
        }
    }
}

fn no_addresses() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
}

/// Keep-alive failures are not fatal; the connection works without it.
fn configure_keepalive(stream: &TcpStream) {
    let socket = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!(error = %e, "failed to enable TCP keep-alive");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_and_enables_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = TcpConnector::default().connect("127.0.0.1", port).await.unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_skips_dead_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let connector = TcpConnector::new(None, true);
        let stream = connector.connect_parallel(vec![dead, live]).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_reports_last_error() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let err = TcpConnector::default()
            .connect_sequential(vec![dead])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let err = TcpConnector::default()
            .connect_sequential(Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
