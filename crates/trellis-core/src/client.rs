//! Control socket client used by the CLI and the integration tests.
//!
//! Each call opens its own connection, writes one request and reads one
//! reply.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::Remediation;
use crate::protocol::{self, ErrorBody, LINE_TERMINATOR, Request, Response};

/// Errors raised by [`ControlClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("trellis is not running (no socket at {socket_path})")]
    ServerNotRunning { socket_path: String },

    #[error("failed to talk to {socket_path}: {source}")]
    Io {
        socket_path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{}: {}", .0.code, .0.message)]
    Remote(ErrorBody),
}

impl ClientError {
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::ServerNotRunning { .. } => Some(
                Remediation::new("Start the host process first.")
                    .command("Start host", "trellis serve")
                    .alternative("Pass --socket or set TRELLIS_SOCKET_PATH for another instance."),
            ),
            Self::Remote(body) if body.code == "permission_denied" => Some(
                Remediation::new("Connect as the user that owns the socket.")
                    .alternative("For automated tests start the host with --socket-mode allow-all."),
            ),
            _ => None,
        }
    }
}

/// Client for one control socket.
#[derive(Debug)]
pub struct ControlClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Structured call. A remote error becomes [`ClientError::Remote`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let response = self.call_raw(method, params).await?;
        if response.ok {
            return Ok(response.result.unwrap_or(Value::Null));
        }
        Err(ClientError::Remote(response.error.unwrap_or_else(|| ErrorBody {
            code: "internal".to_string(),
            message: "error response without details".to_string(),
        })))
    }

    /// Structured call returning the full response envelope.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Response, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| ClientError::InvalidResponse(format!("failed to encode request: {e}")))?;
        let reply = self.exchange(&line, false).await?;
        let response: Response = serde_json::from_str(reply.trim_end())
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        if response.id != Value::from(id) {
            return Err(ClientError::InvalidResponse(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        Ok(response)
    }

    /// Send a line command and return the decoded response body.
    pub async fn send_line(&self, line: &str) -> Result<String, ClientError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.contains('\n') {
            return Err(ClientError::InvalidResponse(
                "line commands must be a single line".to_string(),
            ));
        }
        self.exchange(line, true).await
    }

    /// `system.ping` round trip.
    pub async fn ping(&self) -> Result<bool, ClientError> {
        let result = self.call("system.ping", serde_json::json!({})).await?;
        Ok(result.get("pong").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn exchange(&self, request: &str, line_reply: bool) -> Result<String, ClientError> {
        if !self.socket_exists() {
            return Err(ClientError::ServerNotRunning {
                socket_path: self.socket_path.display().to_string(),
            });
        }
        let io_err = |source| ClientError::Io {
            socket_path: self.socket_path.display().to_string(),
            source,
        };

        let stream = UnixStream::connect(&self.socket_path).await.map_err(io_err)?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(request.as_bytes()).await.map_err(io_err)?;
        writer.write_all(b"\n").await.map_err(io_err)?;
        writer.flush().await.map_err(io_err)?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        if !line_reply {
            let n = reader.read_line(&mut line).await.map_err(io_err)?;
            if n == 0 {
                return Err(ClientError::InvalidResponse("connection closed".to_string()));
            }
            return Ok(line);
        }

        let mut body = Vec::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.map_err(io_err)?;
            if n == 0 {
                return Err(ClientError::InvalidResponse(
                    "connection closed before end of response".to_string(),
                ));
            }
            let content = line.trim_end_matches(['\r', '\n']);
            if content == LINE_TERMINATOR {
                break;
            }
            body.push(content.to_string());
        }
        Ok(protocol::decode_line_response(&body))
    }
}
