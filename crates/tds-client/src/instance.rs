//! Named instance discovery through the SQL Browser service.
//!
//! The client sends `CLNT_UCAST_INST` (0x04 followed by the instance name)
//! to UDP 1434 and the browser answers with `SVR_RESP`: 0x05, a u16 length
//! and `;` separated key/value pairs, one instance per `;;` terminated
//! record. The `tcp` key carries the port.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

use crate::error::{Error, Result};

const CLNT_UCAST_INST: u8 = 0x04;
const SVR_RESP: u8 = 0x05;
const ATTEMPTS: u32 = 3;
const MAX_RESPONSE: usize = 4096;

/// Find the TCP port of `instance` on `host`.
pub(crate) async fn lookup_port(
    host: &str,
    browser_port: u16,
    instance: &str,
    lookup_timeout: Duration,
) -> Result<u16> {
    let addrs: Vec<SocketAddr> = lookup_host((host, browser_port)).await?.collect();
    let mut last_error = None;
    for addr in addrs {
        match lookup_port_at(addr, instance, lookup_timeout).await {
            Ok(port) => return Ok(port),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "instance lookup failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| Error::Connect(format!("Failed to resolve {host} for instance lookup"))))
}

/// Ask the browser at `addr`; the datagram is resent up to three times
/// within `lookup_timeout`.
pub(crate) async fn lookup_port_at(
    addr: SocketAddr,
    instance: &str,
    lookup_timeout: Duration,
) -> Result<u16> {
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let mut request = Vec::with_capacity(instance.len() + 1);
    request.push(CLNT_UCAST_INST);
    request.extend_from_slice(instance.as_bytes());

    let per_attempt = lookup_timeout / ATTEMPTS;
    let mut buf = vec![0u8; MAX_RESPONSE];
    for attempt in 1..=ATTEMPTS {
        tracing::debug!(%addr, instance = %instance, attempt, "querying SQL Browser");
        socket.send(&request).await?;
        match timeout(per_attempt, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                return parse_browser_response(&buf[..n], instance).ok_or_else(|| {
                    Error::Connect(format!("Port for {instance} not found in SQL Browser response"))
                });
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Err(Error::Connect(format!(
        "Failed to get response from SQL Server Browser on {addr}"
    )))
}

/// Extract the TCP port of `instance` from an `SVR_RESP` datagram.
pub(crate) fn parse_browser_response(datagram: &[u8], instance: &str) -> Option<u16> {
    let (&kind, rest) = datagram.split_first()?;
    if kind != SVR_RESP || rest.len() < 2 {
        return None;
    }
    let declared = usize::from(u16::from_le_bytes([rest[0], rest[1]]));
    let body = &rest[2..];
    let body = &body[..declared.min(body.len())];
    let text = String::from_utf8_lossy(body);

    text.split(";;").find_map(|record| {
        let fields: Vec<&str> = record.split(';').collect();
        let mut name = None;
        let mut tcp = None;
        for pair in fields.chunks(2) {
            if let [key, value] = pair {
                if key.eq_ignore_ascii_case("InstanceName") {
                    name = Some(*value);
                } else if key.eq_ignore_ascii_case("tcp") {
                    tcp = Some(*value);
                }
            }
        }
        match (name, tcp) {
            (Some(name), Some(port)) if name.eq_ignore_ascii_case(instance) => port.parse().ok(),
            _ => None,
        }
    })
}
