//! Opening handshake: HTTP-shaped upgrade request parsing and routing.
//!
//! The request path decides session membership:
//!
//! - `/session/<id>` joins an existing session (404 if it does not exist)
//! - anything else (`/`, `/new`, ...) creates a fresh session
//!
//! The upgrade response carries the assigned session and connection ids so
//! a client can reconnect to the same session later.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// Response header carrying the session id.
pub const SESSION_HEADER: &str = "X-Tabctl-Session";
/// Response header carrying the connection id.
pub const CONNECTION_HEADER: &str = "X-Tabctl-Connection";
/// Request header carrying the client nonce.
const NONCE_HEADER: &str = "sec-websocket-key";

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Where a handshake asked to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    NewSession,
    JoinSession(String),
}

/// Malformed or abusive handshakes. The connection is closed without a reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("handshake is not valid UTF-8")]
    NotUtf8,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("missing client nonce header")]
    MissingNonce,
}

/// The parts of an upgrade request the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    pub nonce: String,
}

impl HandshakeRequest {
    pub fn route(&self) -> Route {
        route_for_path(&self.path)
    }
}

/// Map a request path onto a [`Route`]. Query strings and a trailing slash
/// are ignored.
pub fn route_for_path(path: &str) -> Route {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.trim_end_matches('/');
    match path.strip_prefix("/session/") {
        Some(id) => Route::JoinSession(id.to_string()),
        None => Route::NewSession,
    }
}

/// Parse the request head (everything before the blank line).
pub fn parse_request(head: &str) -> Result<HandshakeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(HandshakeError::MalformedRequestLine)?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::MalformedRequestLine);
    };
    if method != "GET" || !path.starts_with('/') || !version.starts_with("HTTP/") {
        return Err(HandshakeError::MalformedRequestLine);
    }

    let nonce = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(NONCE_HEADER))
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingNonce)?;

    Ok(HandshakeRequest {
        path: path.to_string(),
        nonce,
    })
}

/// Accumulates bytes until the request head is complete.
#[derive(Debug)]
pub struct HandshakeBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl HandshakeBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append received bytes.
    ///
    /// Returns the parsed request plus any bytes that followed the blank
    /// line once the head is complete. Those bytes are the start of the
    /// first frame and must be fed to the frame decoder.
    pub fn push(
        &mut self,
        data: &[u8],
    ) -> Result<Option<(HandshakeRequest, Vec<u8>)>, HandshakeError> {
        let search_from = self.buf.len().saturating_sub(TERMINATOR.len() - 1);
        self.buf.extend_from_slice(data);

        let found = self.buf[search_from..]
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .map(|p| p + search_from);

        match found {
            Some(end) if end + TERMINATOR.len() <= self.limit => {
                let head = std::str::from_utf8(&self.buf[..end])
                    .map_err(|_| HandshakeError::NotUtf8)?;
                let request = parse_request(head)?;
                let rest = self.buf[end + TERMINATOR.len()..].to_vec();
                self.buf = Vec::new();
                Ok(Some((request, rest)))
            }
            Some(_) => Err(HandshakeError::TooLarge { limit: self.limit }),
            None if self.buf.len() > self.limit => {
                Err(HandshakeError::TooLarge { limit: self.limit })
            }
            None => Ok(None),
        }
    }
}

/// The `Sec-WebSocket-Accept` value for a client nonce.
pub fn accept_token(nonce: &str) -> String {
    derive_accept_key(nonce.as_bytes())
}

/// Build the `101 Switching Protocols` response.
pub fn upgrade_response(nonce: &str, session_id: &str, connection_id: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         {SESSION_HEADER}: {session_id}\r\n\
         {CONNECTION_HEADER}: {connection_id}\r\n\r\n",
        accept_token(nonce),
    )
}

/// Response for a `/session/<id>` request naming an unknown session.
pub fn not_found_response(session_id: &str) -> String {
    let body = format!("Session not found: {session_id}");
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}
