//! Command dispatch: envelope parsing, handler lookup, timeout, recording.
//!
//! Every text message goes through [`Dispatcher::handle_text`] and comes out
//! as exactly one [`Response`]. Parse failures, unknown methods, missing
//! sessions, handler errors and timeouts all become error envelopes; nothing
//! a handler does can take the connection down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{Browser, TabInfo};
use crate::connection::ConnectionHandle;
use crate::error::CommandError;
use crate::recording;
use crate::resolve::resolve_tab;
use crate::session::{Session, SessionRegistry};

/// Incoming command.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Opaque id, echoed back unchanged.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

/// Outgoing response: the request id plus either `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, err: &CommandError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
}

/// Parse a raw message. On failure the error comes back with whatever id
/// could be salvaged from the payload.
pub fn parse_request(text: &str) -> Result<Request, (Value, CommandError)> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| (Value::Null, CommandError::Parse(e.to_string())))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| (id, CommandError::Parse(e.to_string())))
}

/// Deserialize handler params, treating a missing object as `{}`.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CommandError> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| CommandError::InvalidParams(e.to_string()))
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, CommandError>>;
pub type Handler = Arc<dyn Fn(Value, CommandContext) -> HandlerFuture + Send + Sync>;

/// Method name to handler table, filled once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `method`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |params: Value, ctx: CommandContext| -> HandlerFuture {
            Box::pin(handler(params, ctx))
        });
        self.handlers.insert(method.to_string(), boxed);
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct CommandContext {
    pub session: Arc<Session>,
    pub connection: Arc<ConnectionHandle>,
    pub registry: SessionRegistry,
    pub dispatcher: Dispatcher,
}

impl CommandContext {
    pub fn browser(&self) -> &Arc<dyn Browser> {
        self.registry.browser()
    }

    /// Resolve a tab reference against this session. `None` if nothing
    /// owned matches.
    pub fn resolve_tab(&self, requested: Option<&str>) -> Option<TabInfo> {
        resolve_tab(
            self.browser().as_ref(),
            &self.session,
            &self.connection,
            requested,
        )
    }

    /// Like [`resolve_tab`](Self::resolve_tab) but turns a miss into an error.
    pub fn require_tab(&self, requested: Option<&str>) -> Result<TabInfo, CommandError> {
        self.resolve_tab(requested).ok_or_else(|| {
            CommandError::TabNotFound(requested.unwrap_or("no tab in this session").to_string())
        })
    }
}

struct DispatcherInner {
    handlers: HandlerRegistry,
    registry: SessionRegistry,
    timeout: Duration,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(handlers: HandlerRegistry, registry: SessionRegistry, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers,
                registry,
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Handle one raw message from `conn`.
    pub async fn handle_text(&self, text: &str, conn: &Arc<ConnectionHandle>) -> Response {
        let request = match parse_request(text) {
            Ok(request) => request,
            Err((id, err)) => {
                tracing::debug!(conn = %conn.id(), "unparseable request: {err}");
                return Response::failure(id, &err);
            }
        };
        let id = request.id.unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        match self.execute(&request.method, params, conn).await {
            Ok(result) => Response::success(id, result),
            Err(err) => Response::failure(id, &err),
        }
    }

    /// Run `method` on behalf of `conn`: look up the handler and session,
    /// race the handler against the timeout, record it if recording is on.
    pub async fn execute(
        &self,
        method: &str,
        params: Value,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Value, CommandError> {
        let session = self
            .inner
            .registry
            .session_for_connection(conn.id())
            .filter(|s| !s.is_destroyed());
        // Any call, even one that fails, counts as activity.
        let Some(handler) = self.inner.handlers.get(method) else {
            if let Some(session) = &session {
                session.touch();
            }
            return Err(CommandError::MethodNotFound(method.to_string()));
        };
        let session = session.ok_or_else(|| {
            CommandError::SessionNotFound(conn.session_id().unwrap_or_default())
        })?;

        let recorded_params =
            (session.is_recording() && recording::is_recorded(method)).then(|| params.clone());
        let ctx = CommandContext {
            session: session.clone(),
            connection: conn.clone(),
            registry: self.inner.registry.clone(),
            dispatcher: self.clone(),
        };

        // The handler runs as its own task; on timeout the JoinHandle is
        // dropped and whatever the task does later is ignored.
        let task = tokio::spawn(handler(params, ctx));
        let result = match tokio::time::timeout(self.inner.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(CommandError::handler(format!(
                "Command '{method}' failed: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!(
                    session = %session.id(),
                    conn = %conn.id(),
                    method,
                    "command timed out"
                );
                Err(CommandError::Timeout {
                    method: method.to_string(),
                    after: self.inner.timeout,
                })
            }
        };

        session.touch();
        match &result {
            Ok(_) => {
                if let Some(params) = recorded_params {
                    session.record_action(method, &params);
                }
            }
            Err(err) => {
                tracing::debug!(session = %session.id(), method, code = err.code(), "command failed: {err}");
            }
        }
        result
    }
}
