use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{tcp, ConnectParams, Credentials};
use crate::error::ConnectError;

const CHUNK: usize = 16 * 1024;

/// One server reply. Multi-line replies keep their lines joined by `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub text: String,
}

impl FtpReply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl std::fmt::Display for FtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Logged-in FTP control connection. Passive mode only.
///
/// Every read and write on the control and data channels is bounded by the
/// session timeout.
#[derive(Debug)]
pub struct FtpSession {
    control: BufReader<TcpStream>,
    host: String,
    port: u16,
    timeout: Duration,
    welcome: String,
}

impl FtpSession {
    pub(crate) async fn open(params: &ConnectParams) -> Result<Self, ConnectError> {
        let stream = tcp::dial(&params.host, params.port, params.timeout).await?;
        let mut session = Self {
            control: BufReader::new(stream),
            host: params.host.clone(),
            port: params.port,
            timeout: params.timeout,
            welcome: String::new(),
        };

        let mut greeting = session.read_reply().await?;
        // 120: service ready in a moment, the real greeting follows.
        if greeting.code == 120 {
            greeting = session.read_reply().await?;
        }
        if greeting.code != 220 {
            return Err(ConnectError::ProtocolError(format!(
                "unexpected greeting: {greeting}"
            )));
        }
        session.welcome = greeting.text;

        let credentials = params.credentials.clone().unwrap_or_else(Credentials::anonymous);
        session.login(&credentials).await?;
        debug!(host = %session.host, user = %credentials.username, "ftp session opened");
        Ok(session)
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<(), ConnectError> {
        let reply = self.command(&format!("USER {}", credentials.username)).await?;
        match reply.code {
            230 => return Ok(()),
            331 | 332 => {}
            code if code >= 500 => return Err(ConnectError::AuthenticationFailure(reply.text)),
            _ => {
                return Err(ConnectError::ProtocolError(format!(
                    "unexpected reply to USER: {reply}"
                )))
            }
        }

        let reply = self.send_line(&format!("PASS {}", credentials.password), "PASS ****").await?;
        match reply.code {
            230 | 202 => Ok(()),
            code if code >= 400 => Err(ConnectError::AuthenticationFailure(reply.text)),
            _ => Err(ConnectError::ProtocolError(format!(
                "unexpected reply to PASS: {reply}"
            ))),
        }
    }

    /// Send one command line and return the server's reply, whatever its code.
    pub async fn command(&mut self, line: &str) -> Result<FtpReply, ConnectError> {
        self.send_line(line, line).await
    }

    async fn send_line(&mut self, line: &str, shown: &str) -> Result<FtpReply, ConnectError> {
        if line.contains(['\r', '\n']) {
            return Err(ConnectError::InvalidArgument(
                "FTP arguments may not contain line breaks".into(),
            ));
        }
        debug!(host = %self.host, command = %shown, "ftp >");
        let wire = format!("{line}\r\n");
        match tokio::time::timeout(self.timeout, self.control.get_mut().write_all(wire.as_bytes())).await {
            Err(_) => return Err(self.timed_out()),
            Ok(Err(e)) => {
                return Err(ConnectError::ProtocolError(format!("write failed: {e}")))
            }
            Ok(Ok(())) => {}
        }
        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<String, ConnectError> {
        let mut buf = Vec::new();
        match tokio::time::timeout(self.timeout, self.control.read_until(b'\n', &mut buf)).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(ConnectError::ProtocolError(format!("read failed: {e}"))),
            Ok(Ok(0)) => Err(ConnectError::ProtocolError(
                "connection closed by server".into(),
            )),
            Ok(Ok(_)) => {
                let line = String::from_utf8_lossy(&buf);
                Ok(line.trim_end_matches(['\r', '\n']).to_string())
            }
        }
    }

    async fn read_reply(&mut self) -> Result<FtpReply, ConnectError> {
        let first = self.read_line().await?;
        let (code, multiline, rest) = parse_status_line(&first)?;
        let mut lines = vec![rest.to_string()];

        if multiline {
            let end = format!("{code} ");
            let bare = code.to_string();
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&end) {
                    lines.push(line[end.len()..].to_string());
                    break;
                }
                if line == bare {
                    break;
                }
                lines.push(line);
            }
        }

        let reply = FtpReply {
            code,
            text: lines.join("\n"),
        };
        debug!(host = %self.host, code = reply.code, "ftp <");
        Ok(reply)
    }

    async fn expect_completion(&mut self, what: &str) -> Result<FtpReply, ConnectError> {
        let reply = self.read_reply().await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(ConnectError::ProtocolError(format!("{what} failed: {reply}")))
        }
    }

    async fn require(&mut self, line: &str, code: u16) -> Result<FtpReply, ConnectError> {
        let reply = self.command(line).await?;
        if reply.code == code {
            Ok(reply)
        } else {
            Err(ConnectError::ProtocolError(format!("{line} failed: {reply}")))
        }
    }

    fn timed_out(&self) -> ConnectError {
        ConnectError::Timeout {
            host: self.host.clone(),
            port: self.port,
            secs: self.timeout.as_secs(),
        }
    }

    /// Enter passive mode and connect the data channel. The advertised address
    /// is ignored in favour of the control connection's peer, which survives NAT.
    async fn open_data(&mut self) -> Result<TcpStream, ConnectError> {
        let reply = self.require("PASV", 227).await?;
        let port = parse_pasv_port(&reply.text)?;
        let ip = self
            .control
            .get_ref()
            .peer_addr()
            .map_err(|e| ConnectError::ProtocolError(format!("no peer address: {e}")))?
            .ip();
        tcp::dial(&ip.to_string(), port, self.timeout).await
    }

    async fn start_transfer(&mut self, line: &str) -> Result<TcpStream, ConnectError> {
        let data = self.open_data().await?;
        let reply = self.command(line).await?;
        if !reply.is_preliminary() {
            return Err(ConnectError::ProtocolError(format!("{line} failed: {reply}")));
        }
        Ok(data)
    }

    pub async fn pwd(&mut self) -> Result<String, ConnectError> {
        let reply = self.require("PWD", 257).await?;
        Ok(parse_quoted_path(&reply.text).unwrap_or(reply.text))
    }

    pub async fn cwd(&mut self, dir: &str) -> Result<(), ConnectError> {
        let reply = self.command(&format!("CWD {dir}")).await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(ConnectError::ProtocolError(format!(
                "cannot change to {dir}: {reply}"
            )))
        }
    }

    /// Directory listing of the current directory, one entry per line.
    pub async fn list(&mut self) -> Result<Vec<String>, ConnectError> {
        self.require("TYPE A", 200).await?;
        let mut data = self.start_transfer("LIST").await?;
        let mut raw = Vec::new();
        copy_bounded(&mut data, &mut raw, self.timeout).await.map_err(|e| self.transfer_error(e))?;
        drop(data);
        self.expect_completion("LIST").await?;

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Download `remote` into `sink`. Returns the byte count.
    pub async fn retrieve<W>(&mut self, remote: &str, sink: &mut W) -> Result<u64, ConnectError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.require("TYPE I", 200).await?;
        let mut data = self.start_transfer(&format!("RETR {remote}")).await?;
        let copied = copy_bounded(&mut data, sink, self.timeout)
            .await
            .map_err(|e| self.transfer_error(e))?;
        drop(data);
        self.expect_completion("RETR").await?;
        Ok(copied)
    }

    /// Upload `source` as `remote`. Returns the byte count.
    pub async fn store<R>(&mut self, remote: &str, source: &mut R) -> Result<u64, ConnectError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.require("TYPE I", 200).await?;
        let mut data = self.start_transfer(&format!("STOR {remote}")).await?;
        let copied = copy_bounded(source, &mut data, self.timeout)
            .await
            .map_err(|e| self.transfer_error(e))?;
        if let Err(e) = data.shutdown().await {
            debug!(error = %e, "data channel shutdown failed");
        }
        drop(data);
        self.expect_completion("STOR").await?;
        Ok(copied)
    }

    /// `SIZE` of a remote file, or `None` if the server won't say.
    pub async fn size(&mut self, remote: &str) -> Result<Option<u64>, ConnectError> {
        let reply = self.command(&format!("SIZE {remote}")).await?;
        if reply.code == 213 {
            Ok(reply.text.trim().parse().ok())
        } else {
            Ok(None)
        }
    }

    /// Say goodbye and close. Best-effort: failures are only logged.
    pub async fn quit(mut self) {
        if let Err(e) = self.command("QUIT").await {
            debug!(host = %self.host, error = %e, "QUIT failed");
        }
        if let Err(e) = self.control.get_mut().shutdown().await {
            debug!(host = %self.host, error = %e, "control shutdown failed");
        }
    }

    fn transfer_error(&self, err: TransferError) -> ConnectError {
        match err {
            TransferError::TimedOut => self.timed_out(),
            TransferError::Io(e) => ConnectError::ProtocolError(format!("transfer failed: {e}")),
        }
    }
}

enum TransferError {
    TimedOut,
    Io(std::io::Error),
}

/// Copy until EOF with a per-read deadline instead of one for the whole transfer.
async fn copy_bounded<R, W>(reader: &mut R, writer: &mut W, per_read: Duration) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(per_read, reader.read(&mut buf)).await {
            Err(_) => return Err(TransferError::TimedOut),
            Ok(Err(e)) => return Err(TransferError::Io(e)),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            break;
        }
        match tokio::time::timeout(per_read, writer.write_all(&buf[..n])).await {
            Err(_) => return Err(TransferError::TimedOut),
            Ok(Err(e)) => return Err(TransferError::Io(e)),
            Ok(Ok(())) => {}
        }
        total += n as u64;
    }
    writer.flush().await.map_err(TransferError::Io)?;
    Ok(total)
}

fn parse_status_line(line: &str) -> Result<(u16, bool, &str), ConnectError> {
    let malformed = || ConnectError::ProtocolError(format!("malformed reply: {line:?}"));
    let digits = line.get(..3).ok_or_else(malformed)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let code: u16 = digits.parse().map_err(|_| malformed())?;
    match line.as_bytes().get(3) {
        None => Ok((code, false, "")),
        Some(b' ') => Ok((code, false, &line[4..])),
        Some(b'-') => Ok((code, true, &line[4..])),
        Some(_) => Err(malformed()),
    }
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_port(text: &str) -> Result<u16, ConnectError> {
    let group = text
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .find(|token| token.matches(',').count() == 5)
        .ok_or_else(|| ConnectError::ProtocolError(format!("bad PASV reply: {text}")))?;
    let numbers: Vec<u16> = group
        .split(',')
        .map(|n| n.parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| ConnectError::ProtocolError(format!("bad PASV reply: {text}")))?;
    if numbers.iter().any(|n| *n > 255) {
        return Err(ConnectError::ProtocolError(format!("bad PASV reply: {text}")));
    }
    Ok(numbers[4] * 256 + numbers[5])
}

fn parse_quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let end = text.rfind('"')?;
    (end > start).then(|| text[start + 1..end].replace("\"\"", "\""))
}
