//! Session bootstrap for shell tooling.
//!
//! Scripts that talk to the server across several short-lived connections
//! need a session id to pin. [`create_session`] opens one connection on the
//! `/new` route, reads the id from the upgrade response and disconnects; the
//! session then survives on its grace timer until a client rejoins it.

use anyhow::{bail, Context};
use tokio_tungstenite::tungstenite;

use crate::handshake::SESSION_HEADER;

/// Default server URL when `TABCTL_WS_URL` is unset.
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:9876";

/// Create a fresh session and return its id.
pub async fn create_session(ws_url: &str) -> anyhow::Result<String> {
    let url = format!("{}/new", ws_url.trim_end_matches('/'));
    let (mut ws, response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Err(e) = ws.close(None).await {
        tracing::debug!(?e, "close after session bootstrap failed");
    }

    match session_id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => bail!("server response did not include {SESSION_HEADER}"),
    }
}

/// Whether `session_id` is still live on the server.
pub async fn session_exists(ws_url: &str, session_id: &str) -> anyhow::Result<bool> {
    let url = format!("{}/session/{session_id}", ws_url.trim_end_matches('/'));
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((mut ws, _)) => {
            let _ = ws.close(None).await;
            Ok(true)
        }
        Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 404 => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to connect to {url}")),
    }
}

/// Return the pinned session id if the server still has it, otherwise
/// create a session.
pub async fn ensure_session(pinned: Option<String>, ws_url: &str) -> anyhow::Result<String> {
    if let Some(id) = pinned.filter(|id| !id.trim().is_empty()) {
        if session_exists(ws_url, &id).await? {
            return Ok(id);
        }
        tracing::info!(session = %id, "pinned session is gone, creating a new one");
    }
    create_session(ws_url).await
}

/// Format a session id for `eval` in a POSIX shell.
pub fn shell_export(session_id: &str) -> String {
    format!("export TABCTL_SESSION_ID={session_id}")
}
