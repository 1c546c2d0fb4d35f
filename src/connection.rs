//! One socket's worth of state: handshake, framed message loop, detach.
//!
//! A connection is driven by [`serve_connection`], which is generic over the
//! stream so tests can run it over an in-memory duplex pipe. Frames are
//! processed strictly in arrival order; each text frame is one command and
//! gets exactly one response before the next frame is looked at.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::browser::TabId;
use crate::dispatch::Dispatcher;
use crate::frame::{
    close_payload, write_frame, Frame, FrameDecoder, FrameError, Opcode, CLOSE_GOING_AWAY,
    CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL, CLOSE_TOO_BIG,
};
use crate::handshake::{
    not_found_response, upgrade_response, HandshakeBuffer, HandshakeError, HandshakeRequest, Route,
};
use crate::session::{RegistryError, Session, SessionRegistry};

const READ_BUF: usize = 8 * 1024;

/// Shared, per-connection state visible to handlers and the registry.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: String,
    session_id: Mutex<Option<String>>,
    /// Default target for tab-scoped commands.
    current_tab: Mutex<Option<TabId>>,
    /// Next event-log index this connection has not seen yet.
    event_cursor: AtomicU64,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: Mutex::new(None),
            current_tab: Mutex::new(None),
            event_cursor: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub(crate) fn bind_session(&self, session_id: &str) {
        *self.session_id.lock() = Some(session_id.to_string());
    }

    pub fn current_tab(&self) -> Option<TabId> {
        self.current_tab.lock().clone()
    }

    pub fn set_current_tab(&self, tab: Option<TabId>) {
        *self.current_tab.lock() = tab;
    }

    pub fn event_cursor(&self) -> u64 {
        self.event_cursor.load(Ordering::Acquire)
    }

    /// Move the cursor forward. A smaller value is ignored.
    pub fn advance_cursor(&self, to: u64) {
        self.event_cursor.fetch_max(to, Ordering::AcqRel);
    }

    /// Ask the connection task to close. Any response already being written
    /// is finished, then a close frame is sent and nothing more is written.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Limits applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
    pub max_frame_buffer_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_handshake_bytes: 16 * 1024,
            max_frame_buffer_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Why a connection ended before or during the framed phase.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("peer closed before completing the handshake")]
    HandshakeEof,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("server shutting down")]
    Shutdown,
}

/// What the frame loop should do after handling one frame.
enum Flow {
    Continue,
    Close,
}

/// Drive one accepted socket to completion.
///
/// Transport failures (bad handshake, oversized buffers, I/O errors) end the
/// connection without a response. On exit the connection is detached from
/// its session, which arms the session's grace timer if it was the last one.
pub async fn serve_connection<S>(
    stream: S,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let handshake = tokio::time::timeout(
        limits.handshake_timeout,
        read_handshake(&mut reader, limits.max_handshake_bytes),
    );
    let outcome = tokio::select! {
        _ = shutdown.cancelled() => Err(ConnectionError::Shutdown),
        result = handshake => {
            result.unwrap_or(Err(ConnectionError::HandshakeTimeout(limits.handshake_timeout)))
        }
    };
    let (request, leftover) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            tracing::debug!("closing connection: {e}");
            let _ = writer.shutdown().await;
            return;
        }
    };

    let conn = Arc::new(ConnectionHandle::new(registry.next_connection_id()));
    let session = match attach(&registry, &request, &conn) {
        Ok(session) => session,
        Err(RegistryError::SessionNotFound(requested)) => {
            tracing::info!(session = %requested, "join refused: session not found");
            let _ = writer.write_all(not_found_response(&requested).as_bytes()).await;
            let _ = writer.shutdown().await;
            return;
        }
        Err(e) => {
            tracing::debug!(conn = %conn.id(), "join refused: {e}");
            let _ = writer.shutdown().await;
            return;
        }
    };

    let response = upgrade_response(&request.nonce, session.id(), conn.id());
    if let Err(e) = write_all_flush(&mut writer, response.as_bytes()).await {
        tracing::debug!(conn = %conn.id(), "upgrade write failed: {e}");
        registry.detach(conn.id());
        return;
    }
    tracing::info!(session = %session.id(), conn = %conn.id(), "connection upgraded");
    drop(session);

    let result = frame_loop(
        &mut reader,
        &mut writer,
        &conn,
        &dispatcher,
        leftover,
        limits.max_frame_buffer_bytes,
        &shutdown,
    )
    .await;
    if let Err(e) = result {
        tracing::debug!(conn = %conn.id(), "connection ended: {e}");
    }

    conn.close();
    registry.detach(conn.id());
    let _ = writer.shutdown().await;
    tracing::info!(conn = %conn.id(), "connection closed");
}

/// Read until the handshake head is complete.
async fn read_handshake<R>(
    reader: &mut R,
    limit: usize,
) -> Result<(HandshakeRequest, Vec<u8>), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut handshake = HandshakeBuffer::new(limit);
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::HandshakeEof);
        }
        if let Some(done) = handshake.push(&buf[..n])? {
            return Ok(done);
        }
    }
}

/// Resolve the handshake route to a session and attach `conn` to it.
fn attach(
    registry: &SessionRegistry,
    request: &HandshakeRequest,
    conn: &Arc<ConnectionHandle>,
) -> Result<Arc<Session>, RegistryError> {
    match request.route() {
        Route::NewSession => {
            let session = registry.create()?;
            registry.attach(session.id(), conn)
        }
        Route::JoinSession(id) => registry.attach(&id, conn),
    }
}

async fn frame_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    conn: &Arc<ConnectionHandle>,
    dispatcher: &Dispatcher,
    leftover: Vec<u8>,
    max_buffered: usize,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new(max_buffered);
    let mut buf = vec![0u8; READ_BUF];
    let mut pending = leftover;

    loop {
        if !pending.is_empty() {
            if let Err(e) = decoder.push(&pending) {
                send_close(writer, CLOSE_TOO_BIG, "frame buffer limit exceeded").await;
                return Err(e.into());
            }
            pending.clear();
        }

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    send_close(writer, CLOSE_TOO_BIG, "frame too large").await;
                    return Err(e.into());
                }
            };
            if let Flow::Close = handle_frame(frame, writer, conn, dispatcher).await? {
                return Ok(());
            }
            if conn.is_closed() {
                send_close(writer, CLOSE_NORMAL, "session closed").await;
                return Ok(());
            }
        }

        tokio::select! {
            _ = conn.closed() => {
                send_close(writer, CLOSE_NORMAL, "session closed").await;
                return Ok(());
            }
            _ = shutdown.cancelled() => {
                send_close(writer, CLOSE_GOING_AWAY, "server shutting down").await;
                return Ok(());
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&buf[..n]);
            }
        }
    }
}

async fn handle_frame<W>(
    frame: Frame,
    writer: &mut W,
    conn: &Arc<ConnectionHandle>,
    dispatcher: &Dispatcher,
) -> Result<Flow, ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    match frame.opcode {
        Opcode::Text if frame.fin => {
            let Ok(text) = std::str::from_utf8(&frame.payload) else {
                send_close(writer, CLOSE_INVALID_PAYLOAD, "invalid UTF-8").await;
                return Ok(Flow::Close);
            };
            let response = dispatcher.handle_text(text, conn).await;
            let body = serde_json::to_vec(&response).map_err(io::Error::from)?;
            write_frame(writer, Opcode::Text, &body).await?;
            Ok(Flow::Continue)
        }
        Opcode::Ping => {
            write_frame(writer, Opcode::Pong, &frame.payload).await?;
            Ok(Flow::Continue)
        }
        Opcode::Close => {
            let code = frame.close_code().unwrap_or(CLOSE_NORMAL);
            tracing::debug!(conn = %conn.id(), code, "peer sent close");
            send_close(writer, CLOSE_NORMAL, "").await;
            Ok(Flow::Close)
        }
        opcode => {
            // Fragments, binary and pong frames are not part of the protocol.
            tracing::debug!(conn = %conn.id(), ?opcode, fin = frame.fin, "frame ignored");
            Ok(Flow::Continue)
        }
    }
}

async fn send_close<W: AsyncWrite + Unpin>(writer: &mut W, code: u16, reason: &str) {
    let _ = write_frame(writer, Opcode::Close, &close_payload(code, reason)).await;
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
