pub mod ftp;
pub mod tcp;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::error::ConnectError;

pub use ftp::{FtpReply, FtpSession};
pub use tcp::TcpSession;

pub const DEFAULT_MAX_HOST_LEN: usize = 100;

/// Username/password pair. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", "")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where to connect and how long to wait.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Reject host strings that are empty, too long, or could be read as an option
/// by an external program. Runs before any I/O.
pub fn validate_host(host: &str, max_len: usize) -> Result<(), ConnectError> {
    if host.is_empty() || host.len() > max_len {
        return Err(ConnectError::InvalidArgument(
            "invalid host specified".into(),
        ));
    }
    if host.starts_with('-') {
        return Err(ConnectError::InvalidArgument(format!(
            "host may not start with '-': {host}"
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']' | '%');
    if let Some(bad) = host.chars().find(|c| !allowed(*c)) {
        return Err(ConnectError::InvalidArgument(format!(
            "invalid character {bad:?} in host"
        )));
    }
    Ok(())
}

/// Range-check a port number coming from untyped input.
pub fn validate_port(port: i64) -> Result<u16, ConnectError> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(ConnectError::InvalidArgument(format!(
            "invalid port number: {port}"
        )))
    }
}

/// Opens fresh, exclusively-owned sessions. No pooling, no reconnects.
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    max_host_len: usize,
}

impl Default for RemoteConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteConnector {
    pub fn new() -> Self {
        Self {
            max_host_len: DEFAULT_MAX_HOST_LEN,
        }
    }

    pub fn with_max_host_len(mut self, max_host_len: usize) -> Self {
        self.max_host_len = max_host_len;
        self
    }

    pub fn max_host_len(&self) -> usize {
        self.max_host_len
    }

    pub fn validate(&self, params: &ConnectParams) -> Result<(), ConnectError> {
        validate_host(&params.host, self.max_host_len)?;
        if params.port == 0 {
            return Err(ConnectError::InvalidArgument("invalid port number: 0".into()));
        }
        if params.timeout.is_zero() {
            return Err(ConnectError::InvalidArgument(
                "timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Open a raw TCP session.
    pub async fn tcp(&self, params: &ConnectParams) -> Result<TcpSession, ConnectError> {
        self.validate(params)?;
        let stream = tcp::dial(&params.host, params.port, params.timeout).await?;
        debug!(host = %params.host, port = params.port, "tcp session opened");
        Ok(TcpSession::new(stream, format!("{}:{}", params.host, params.port)))
    }

    /// Open an FTP session: connect, read the greeting, log in.
    pub async fn ftp(&self, params: &ConnectParams) -> Result<FtpSession, ConnectError> {
        self.validate(params)?;
        FtpSession::open(params).await
    }

    /// Run `op` against a TCP session that is closed afterwards on every path,
    /// including a panic inside `op`.
    pub async fn with_tcp<T, F>(&self, params: &ConnectParams, op: F) -> Result<T, ConnectError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut TcpSession) -> BoxFuture<'s, Result<T, ConnectError>> + Send,
    {
        let mut session = self.tcp(params).await?;
        let outcome = AssertUnwindSafe(op(&mut session)).catch_unwind().await;
        session.close().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Run `op` against a logged-in FTP session that is always sent `QUIT`.
    pub async fn with_ftp<T, F>(&self, params: &ConnectParams, op: F) -> Result<T, ConnectError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut FtpSession) -> BoxFuture<'s, Result<T, ConnectError>> + Send,
    {
        let mut session = self.ftp(params).await?;
        let outcome = AssertUnwindSafe(op(&mut session)).catch_unwind().await;
        session.quit().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn host_validation() {
        assert!(validate_host("", 100).is_err());
        assert!(validate_host(&"a".repeat(101), 100).is_err());
        assert!(validate_host("-oProxyCommand=x", 100).is_err());
        assert!(validate_host("example.com;rm", 100).is_err());
        assert!(validate_host("192.168.1.10", 100).is_ok());
        assert!(validate_host("::1", 100).is_ok());
        assert!(validate_host("db-01.internal", 100).is_ok());
    }

    #[test]
    fn port_validation() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-1).is_err());
        assert_eq!(validate_port(21).unwrap(), 21);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("bob", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("bob"));
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn empty_host_fails_without_io() {
        let started = Instant::now();
        let err = RemoteConnector::new()
            .ftp(&ConnectParams::new("", 21))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidArgument(_)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn long_host_fails_without_io() {
        let connector = RemoteConnector::new().with_max_host_len(10);
        let err = connector
            .tcp(&ConnectParams::new("abcdefghijk.example", 23))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let started = Instant::now();
        let err = RemoteConnector::new()
            .tcp(&ConnectParams::new("127.0.0.1", 1).with_timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ConnectionRefused { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn scoped_tcp_session_reads_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let banner = RemoteConnector::new()
            .with_tcp(
                &ConnectParams::new("127.0.0.1", port).with_timeout(Duration::from_secs(2)),
                |session| {
                    Box::pin(async move { session.read_banner(1024, Duration::from_secs(2)).await })
                },
            )
            .await
            .unwrap();
        assert_eq!(banner.as_deref(), Some("SSH-2.0-OpenSSH_9.6\r\n"));
    }

    #[tokio::test]
    async fn scoped_tcp_session_closes_on_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            // Returns 0 once the client side has been closed.
            tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap()
        });

        let result: Result<(), ConnectError> = RemoteConnector::new()
            .with_tcp(&ConnectParams::new("127.0.0.1", port), |_session| {
                Box::pin(async move { Err(ConnectError::ProtocolError("boom".into())) })
            })
            .await;
        assert!(result.is_err());

        let read = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }
}
