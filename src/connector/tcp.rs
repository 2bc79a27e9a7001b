use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConnectError;

/// Resolve and connect within one overall deadline, trying each resolved
/// address in turn.
pub(crate) async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let deadline = Instant::now() + timeout;
    let timed_out = || ConnectError::Timeout {
        host: host.to_string(),
        port,
        secs: timeout.as_secs(),
    };

    let addrs: Vec<SocketAddr> = match tokio::time::timeout(timeout, lookup_host((host, port))).await {
        Err(_) => return Err(timed_out()),
        Ok(Err(e)) => {
            return Err(ConnectError::DnsFailure {
                host: host.to_string(),
                reason: e.to_string(),
            })
        }
        Ok(Ok(addrs)) => addrs.collect(),
    };
    if addrs.is_empty() {
        return Err(ConnectError::DnsFailure {
            host: host.to_string(),
            reason: "no addresses found".into(),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(classify(host, port, timeout, &e));
            }
            Err(_) => last_error = Some(timed_out()),
        }
    }
    Err(last_error.unwrap_or_else(timed_out))
}

fn classify(host: &str, port: u16, timeout: Duration, err: &io::Error) -> ConnectError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ConnectError::ConnectionRefused {
            host: host.to_string(),
            port,
        },
        io::ErrorKind::TimedOut => ConnectError::Timeout {
            host: host.to_string(),
            port,
            secs: timeout.as_secs(),
        },
        _ => ConnectError::Unreachable {
            host: host.to_string(),
            port,
            reason: err.to_string(),
        },
    }
}

/// One live TCP connection. Dropping it closes the socket.
#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
    peer: String,
}

impl TcpSession {
    pub(crate) fn new(stream: TcpStream, peer: String) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read whatever the service sends first, up to `max_bytes`.
    /// `None` means nothing arrived within `wait` or the peer closed.
    pub async fn read_banner(
        &mut self,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Option<String>, ConnectError> {
        let mut buf = vec![0u8; max_bytes];
        match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Err(_) | Ok(Ok(0)) => Ok(None),
            Ok(Ok(n)) => Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned())),
            Ok(Err(e)) => Err(ConnectError::ProtocolError(format!(
                "read from {} failed: {e}",
                self.peer
            ))),
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "shutdown failed");
        }
    }
}
