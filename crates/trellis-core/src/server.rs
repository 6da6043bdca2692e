//! Control socket server.
//!
//! ```text
//! accept ──► connection task ──► read line ──► parse frame
//!                                                 │
//!                        spawn_blocking(dispatch) under timeout
//!                                                 │
//!                                      write reply, next line
//! ```
//!
//! One task per connection; requests on a connection are applied and
//! answered in order, even when an earlier one timed out.
//! Errors become error replies and never close the connection, except for a
//! peer rejected by [`SocketMode::Restricted`].

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::dispatch::{Dispatcher, ServerInfo};
use crate::error::Error;
use crate::logging;
use crate::protocol::{self, Frame, MAX_MESSAGE_SIZE};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// How long shutdown waits for running requests to finish.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Who may talk to the socket. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocketMode {
    /// Socket file `0600`; only peers with the socket owner's UID are served.
    #[default]
    Restricted,
    /// Socket file `0666`; every local peer is served. Meant for automated tests.
    AllowAll,
}

impl SocketMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::AllowAll => "allow-all",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "restricted" => Some(Self::Restricted),
            "allow-all" | "allowall" | "allow_all" => Some(Self::AllowAll),
            _ => None,
        }
    }

    /// Permission bits applied to the socket file.
    #[must_use]
    pub const fn file_mode(self) -> u32 {
        match self {
            Self::Restricted => 0o600,
            Self::AllowAll => 0o666,
        }
    }
}

impl std::fmt::Display for SocketMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup options of a [`ControlServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    pub mode: SocketMode,
    pub request_timeout: Duration,
}

impl ServerOptions {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            mode: SocketMode::Restricted,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SocketMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Endpoint facts handed to the dispatcher.
    #[must_use]
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            socket_path: self.socket_path.clone(),
            socket_mode: self.mode,
        }
    }
}

/// Shared per-connection state.
struct ConnContext {
    dispatcher: Dispatcher,
    mode: SocketMode,
    owner_uid: u32,
    timeout: Duration,
}

/// Listening control socket.
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
    ctx: Arc<ConnContext>,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file.
    pub fn bind(options: &ServerOptions, dispatcher: Dispatcher) -> std::io::Result<Self> {
        let socket_path = options.socket_path.clone();

        if std::fs::symlink_metadata(&socket_path).is_ok() {
            tracing::debug!(path = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(options.mode.file_mode()),
        )?;
        let owner_uid = std::fs::metadata(&socket_path)?.uid();
        tracing::info!(
            path = %socket_path.display(),
            mode = options.mode.as_str(),
            "control socket listening"
        );

        Ok(Self {
            socket_path,
            listener,
            ctx: Arc::new(ConnContext {
                dispatcher,
                mode: options.mode,
                owner_uid,
                timeout: options.request_timeout,
            }),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown_rx` fires, then remove the socket file.
    ///
    /// On shutdown, connections stop reading new requests and the requests
    /// already running (timed-out ones included) finish before this returns,
    /// bounded by [`SHUTDOWN_GRACE`].
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let next_conn = AtomicU64::new(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                            let ctx = Arc::clone(&self.ctx);
                            let stop = stop_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx, conn, stop).await {
                                    tracing::debug!(conn, error = %e, "control connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept control connection");
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "control connection task failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("control socket shutting down");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = connections.len(), "connections still busy at shutdown, aborting them");
            connections.abort_all();
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(path = %self.socket_path.display(), error = %e, "failed to remove socket file");
        }
    }
}

fn peer_allowed(stream: &UnixStream, ctx: &ConnContext) -> bool {
    if ctx.mode == SocketMode::AllowAll {
        return true;
    }
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == ctx.owner_uid,
        Err(e) => {
            tracing::warn!(error = %e, "peer credentials unavailable");
            false
        }
    }
}

/// Outcome of reading one request line.
enum ReadLine {
    Line,
    TooLarge,
    Eof,
}

/// Read one newline-terminated request into `buf`, bounded by
/// [`MAX_MESSAGE_SIZE`]. An oversized request is drained up to its newline.
async fn read_request<R>(reader: &mut R, buf: &mut String) -> std::io::Result<ReadLine>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = (MAX_MESSAGE_SIZE + 1) as u64;
    let mut bytes = Vec::new();
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut bytes)
        .await?;
    if n == 0 {
        return Ok(ReadLine::Eof);
    }
    buf.push_str(&String::from_utf8_lossy(&bytes));
    if bytes.ends_with(b"\n") || n <= MAX_MESSAGE_SIZE {
        return Ok(ReadLine::Line);
    }
    loop {
        bytes.clear();
        let n = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut bytes)
            .await?;
        if n == 0 || bytes.ends_with(b"\n") {
            break;
        }
    }
    Ok(ReadLine::TooLarge)
}

async fn handle_connection(
    stream: UnixStream,
    ctx: Arc<ConnContext>,
    conn: u64,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let allowed = peer_allowed(&stream, &ctx);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut straggler: Option<JoinHandle<String>> = None;
    tracing::debug!(conn, "control connection accepted");

    loop {
        let read = tokio::select! {
            read = read_request(&mut reader, &mut line) => read?,
            _ = stop.changed() => break,
        };
        if matches!(read, ReadLine::Eof) {
            break;
        }
        if !allowed {
            tracing::warn!(conn, "peer rejected by restricted socket mode");
            let reply = Dispatcher::reject_raw(
                &line,
                &Error::PermissionDenied("peer uid does not own the control socket".to_string()),
            );
            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }
        let reply = match read {
            ReadLine::TooLarge => {
                tracing::warn!(conn, limit = MAX_MESSAGE_SIZE, "request too large");
                Dispatcher::reject_raw(
                    &line,
                    &Error::Protocol(format!("request exceeds {MAX_MESSAGE_SIZE} bytes")),
                )
            }
            _ if line.trim().is_empty() => continue,
            _ => match protocol::parse_frame(&line) {
                Ok(frame) => run_frame(&ctx, frame, conn, &mut straggler).await,
                Err(err) => Dispatcher::reject_raw(&line, &err),
            },
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }

    if let Some(job) = straggler.take() {
        if let Err(e) = job.await {
            tracing::error!(conn, error = %e, "timed-out request task failed");
        }
    }
    tracing::debug!(conn, "control connection closed");
    Ok(())
}

/// Run one frame on the blocking pool under the request timeout.
///
/// A request that times out keeps running; only its reply is replaced. Its
/// job is parked in `straggler` and the connection's next frame waits for it,
/// so requests from one connection are applied in the order they were sent.
async fn run_frame(
    ctx: &ConnContext,
    frame: Frame,
    conn: u64,
    straggler: &mut Option<JoinHandle<String>>,
) -> String {
    if let Some(previous) = straggler.take() {
        tracing::debug!(conn, "waiting for timed-out request before the next one");
        if let Err(e) = previous.await {
            tracing::error!(conn, error = %e, "timed-out request task failed");
        }
    }

    let dispatcher = ctx.dispatcher.clone();
    let pending = frame.clone();
    let span = logging::request_span(conn, &frame);
    let mut job =
        tokio::task::spawn_blocking(move || span.in_scope(|| dispatcher.dispatch(pending)));
    let timeout_ms = u64::try_from(ctx.timeout.as_millis()).unwrap_or(u64::MAX);
    match tokio::time::timeout(ctx.timeout, &mut job).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(join_err)) => {
            tracing::error!(conn, error = %join_err, "request task failed");
            internal_reply(&frame, "request handler failed")
        }
        Err(_) => {
            tracing::warn!(conn, timeout_ms, "request timed out");
            *straggler = Some(job);
            Dispatcher::timeout_reply(&frame, timeout_ms)
        }
    }
}

fn internal_reply(frame: &Frame, message: &str) -> String {
    match frame {
        Frame::Structured(req) => {
            let resp = protocol::Response::failure_code(req.id.clone(), "internal", message);
            let mut line = serde_json::to_string(&resp).unwrap_or_default();
            line.push('\n');
            line
        }
        Frame::Line(_) => protocol::encode_line_response(&format!("ERROR: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_mode_parse_and_bits() {
        assert_eq!(SocketMode::parse("allow-all"), Some(SocketMode::AllowAll));
        assert_eq!(SocketMode::parse(" Restricted "), Some(SocketMode::Restricted));
        assert_eq!(SocketMode::parse("open"), None);
        assert_eq!(SocketMode::Restricted.file_mode(), 0o600);
        assert_eq!(SocketMode::AllowAll.file_mode(), 0o666);
        assert_eq!(SocketMode::default(), SocketMode::Restricted);
    }

    #[tokio::test]
    async fn denied_peer_is_dropped_even_when_oversized() {
        use crate::session::{Session, SessionTree, SurfaceSettings};

        let dir = tempfile::tempdir().unwrap();
        let uid = std::fs::metadata(dir.path()).unwrap().uid();
        let session = Arc::new(Session::new(SessionTree::bootstrap(SurfaceSettings::default())));
        let options = ServerOptions::new(dir.path().join("unused.sock"));
        let ctx = Arc::new(ConnContext {
            dispatcher: Dispatcher::new(session, options.info()),
            mode: SocketMode::Restricted,
            owner_uid: uid.wrapping_add(1),
            timeout: options.request_timeout,
        });
        let (server_end, client_end) = UnixStream::pair().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(handle_connection(server_end, ctx, 1, stop_rx));

        let (reader, mut writer) = client_end.into_split();
        let mut big = vec![b'x'; MAX_MESSAGE_SIZE + 16];
        big.push(b'\n');
        writer.write_all(&big).await.unwrap();

        let mut reply = String::new();
        let mut reader = BufReader::new(reader);
        tokio::time::timeout(Duration::from_secs(5), reader.read_to_string(&mut reply))
            .await
            .expect("denied peer should be disconnected")
            .unwrap();
        assert!(reply.starts_with("ERROR: permission denied"), "{reply}");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_request_bounds_line_length() {
        let mut input = "x".repeat(MAX_MESSAGE_SIZE + 10);
        input.push('\n');
        input.push_str("ping\n");
        let mut reader = BufReader::new(input.as_bytes());
        let mut buf = String::new();
        assert!(matches!(
            read_request(&mut reader, &mut buf).await.unwrap(),
            ReadLine::TooLarge
        ));
        assert!(matches!(
            read_request(&mut reader, &mut buf).await.unwrap(),
            ReadLine::Line
        ));
        assert_eq!(buf, "ping\n");
        assert!(matches!(
            read_request(&mut reader, &mut buf).await.unwrap(),
            ReadLine::Eof
        ));
    }
}
