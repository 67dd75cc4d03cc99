//! Mock SQL Browser service.
//!
//! Answers `CLNT_UCAST_INST` datagrams with an `SVR_RESP` listing the
//! configured instances. Unknown instances get no answer, like the real
//! service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

const CLNT_UCAST_INST: u8 = 0x04;
const SVR_RESP: u8 = 0x05;

/// A UDP responder on a loopback port.
#[derive(Debug)]
pub struct MockBrowser {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockBrowser {
    /// Serve `instances` as `(name, tcp port)` pairs.
    pub async fn start(instances: Vec<(String, u16)>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let queries = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let counter = Arc::clone(&queries);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let Ok((n, peer)) = received else { break };
                        counter.fetch_add(1, Ordering::SeqCst);
                        if n < 1 || buf[0] != CLNT_UCAST_INST {
                            continue;
                        }
                        let requested = String::from_utf8_lossy(&buf[1..n]).into_owned();
                        let Some(reply) = response_for(&instances, &requested) else {
                            tracing::debug!(instance = %requested, "mock browser has no such instance");
                            continue;
                        };
                        if socket.send_to(&reply, peer).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(Self {
            addr,
            queries,
            shutdown_tx,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port to configure as the browser port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Datagrams received so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockBrowser {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn response_for(instances: &[(String, u16)], requested: &str) -> Option<Vec<u8>> {
    let (name, port) = instances
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(requested))?;
    let body = format!(
        "ServerName;MOCK;InstanceName;{name};IsClustered;No;Version;16.0.1000.6;tcp;{port};;"
    );
    let mut reply = Vec::with_capacity(body.len() + 3);
    reply.push(SVR_RESP);
    reply.extend_from_slice(&(body.len() as u16).to_le_bytes());
    reply.extend_from_slice(body.as_bytes());
    Some(reply)
}
