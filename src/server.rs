//! Newline-delimited JSON transport for the request/response envelope.
//!
//! Each request line is `{"tool": ..., "arguments": {...}}` and gets exactly
//! one response line back. A connection is served one request at a time.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::tcp::dial;
use crate::error::{ConnectError, ToolError};
use crate::tools::dispatcher::HEALTH;
use crate::tools::Dispatcher;
use crate::types::{ToolRequest, ToolResponse, ToolResult};

/// Requests longer than this are answered with an error and skipped.
/// At most this many bytes of one line are ever buffered.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One newline-terminated request line, or the reason it cannot be read.
#[derive(Debug, PartialEq, Eq)]
enum RequestLine {
    Text(String),
    Rejected(String),
}

/// Splits the input on `\n`. Oversized lines are discarded as they stream in
/// and invalid UTF-8 is reported per line, so neither ends the stream.
#[derive(Debug)]
struct RequestLines {
    max_len: usize,
    next_index: usize,
    discarding: bool,
}

impl RequestLines {
    fn new(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
            discarding: false,
        }
    }

    fn too_long(&self) -> RequestLine {
        RequestLine::Rejected(format!("request exceeds {} bytes", self.max_len))
    }

    fn finish(&self, raw: &[u8]) -> RequestLine {
        if raw.len() > self.max_len {
            return self.too_long();
        }
        match std::str::from_utf8(raw) {
            Ok(text) => RequestLine::Text(text.to_string()),
            Err(e) => RequestLine::Rejected(format!("malformed request: {e}")),
        }
    }
}

impl Decoder for RequestLines {
    type Item = RequestLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<RequestLine>> {
        let newline = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| self.next_index + i);
        match newline {
            Some(end) => {
                let line = buf.split_to(end + 1);
                self.next_index = 0;
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(self.too_long()));
                }
                Ok(Some(self.finish(&line[..end])))
            }
            None if self.discarding || buf.len() > self.max_len => {
                buf.clear();
                self.next_index = 0;
                self.discarding = true;
                Ok(None)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<RequestLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(Some(self.too_long()));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(self.finish(&line)))
    }
}

/// Serve envelopes from `reader` to `writer` until EOF or `shutdown`.
/// Returns the number of lines answered.
pub async fn serve_stream<R, W>(
    dispatcher: &Dispatcher,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, RequestLines::new(MAX_LINE_BYTES));
    let mut answered = 0u64;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => line,
        };
        let response = match line.transpose()? {
            None => break,
            Some(RequestLine::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                respond(dispatcher, text).await
            }
            Some(RequestLine::Rejected(reason)) => {
                warn!(%reason, "unreadable request line");
                let rejected: ToolResult = Err(ToolError::invalid(reason));
                rejected.into()
            }
        };

        let mut encoded = serde_json::to_string(&response).map_err(io::Error::other)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
        answered += 1;
    }

    debug!(answered, "stream closed");
    Ok(answered)
}

async fn respond(dispatcher: &Dispatcher, line: &str) -> ToolResponse {
    match serde_json::from_str::<ToolRequest>(line) {
        Ok(request) => dispatcher.handle(&request).await,
        Err(e) => {
            warn!(error = %e, "malformed request line");
            let rejected: ToolResult = Err(ToolError::invalid(format!("malformed request: {e}")));
            rejected.into()
        }
    }
}

/// Serve over the process's stdin/stdout.
pub async fn serve_stdio(dispatcher: &Dispatcher, shutdown: CancellationToken) -> io::Result<u64> {
    serve_stream(dispatcher, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// Accept connections until `shutdown`, each with its own serving loop.
/// Waits for open connections to finish before returning.
pub async fn serve_tcp(
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, tools = dispatcher.registry().len(), "listening");

    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            // Reap finished connections so the set does not grow unbounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        debug!(%peer, "connection accepted");
        let dispatcher = Arc::clone(&dispatcher);
        let token = shutdown.child_token();
        connections.spawn(async move {
            let (read, write) = stream.into_split();
            match serve_stream(&dispatcher, read, write, token).await {
                Ok(answered) => debug!(%peer, answered, "connection closed"),
                Err(e) => debug!(%peer, error = %e, "connection ended with error"),
            }
        });
    }

    while connections.join_next().await.is_some() {}
    info!(addr = %local, "stopped listening");
    Ok(())
}

/// Ask a server for its `health` report. This is what an external monitor
/// calls to decide whether the dispatcher is reachable and answering.
pub async fn probe_health(addr: SocketAddr, timeout: Duration) -> Result<Value, ToolError> {
    let host = addr.ip().to_string();
    let timed_out = || ConnectError::Timeout {
        host: host.clone(),
        port: addr.port(),
        secs: timeout.as_secs(),
    };

    let exchange = async {
        let stream = dial(&host, addr.port(), timeout).await?;
        let (read, mut write) = stream.into_split();
        let request = format!("{{\"tool\":\"{HEALTH}\"}}\n");
        write
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ConnectError::ProtocolError(format!("write to {addr} failed: {e}")))?;

        let mut line = String::new();
        BufReader::new(read)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectError::ProtocolError(format!("read from {addr} failed: {e}")))?;
        if line.is_empty() {
            return Err(ConnectError::ProtocolError(format!(
                "{addr} closed the connection without answering"
            )));
        }
        Ok::<_, ConnectError>(line)
    };

    let line = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| timed_out())??;

    let response: ToolResponse = serde_json::from_str(line.trim()).map_err(|e| {
        ToolError::from(ConnectError::ProtocolError(format!(
            "unexpected health response from {addr}: {e}"
        )))
    })?;
    let report = response.into_result()?;
    serde_json::from_str(&report).map_err(|e| {
        ToolError::from(ConnectError::ProtocolError(format!(
            "health report from {addr} is not JSON: {e}"
        )))
    })
}
