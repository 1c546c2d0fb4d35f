use std::time::Duration;

use thiserror::Error;

/// JSON-RPC code for a payload that is not a valid request.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC code for a method name with no registered handler.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Catch-all code for session, handler, and timeout failures.
pub const GENERIC_ERROR: i64 = -1;

/// Errors reported by the tab host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("Tab not found: {0}")]
    TabNotFound(String),
    #[error("No history entry to go {0}")]
    NoHistory(&'static str),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Structured error returned by a command.
///
/// Every variant maps onto the `{code, message}` pair sent back in the
/// response envelope. Nothing a handler does escapes the dispatcher as
/// anything other than one of these.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Unknown method: {0}")]
    MethodNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Tab not found: {0}")]
    TabNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Command '{method}' timed out after {}s", .after.as_secs_f64())]
    Timeout { method: String, after: Duration },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("{0}")]
    Handler(String),
}

impl CommandError {
    /// Numeric code placed in the response's `error.code`.
    pub fn code(&self) -> i64 {
        match self {
            CommandError::Parse(_) => PARSE_ERROR,
            CommandError::MethodNotFound(_) => METHOD_NOT_FOUND,
            _ => GENERIC_ERROR,
        }
    }

    /// Shorthand for wrapping an arbitrary handler failure.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        CommandError::Handler(msg.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Handler(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Handler(format!("JSON error: {e}"))
    }
}
