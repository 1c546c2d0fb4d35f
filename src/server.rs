//! TCP listener for the command protocol.
//!
//! [`Server::bind`] owns everything process-wide: the listener, the session
//! registry (installed as the browser's tab listener), the accept loop and
//! the stale sweep. [`Server::stop`] undoes all of it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::browser::Browser;
use crate::config::ServerConfig;
use crate::connection::{serve_connection, ConnectionLimits};
use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::lifecycle::spawn_sweeper;
use crate::session::SessionRegistry;

const MAX_BIND_BACKOFF: Duration = Duration::from_secs(60);

/// How long `stop` waits for connection tasks to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `addr`, retrying until it succeeds or `cancel` fires.
///
/// "Address in use" usually means another instance already owns the port,
/// so it is retried at a fixed `retry` interval. Anything else backs off
/// exponentially up to a minute.
pub async fn bind_with_retry(
    addr: SocketAddr,
    retry: Duration,
    cancel: &CancellationToken,
) -> io::Result<TcpListener> {
    let mut backoff = Duration::from_secs(1);
    loop {
        let delay = match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, "another instance is listening, retrying in {:?}", retry);
                retry
            }
            Err(e) => {
                tracing::error!(%addr, ?e, "bind failed, retrying in {:?}", backoff);
                let delay = backoff;
                backoff = (backoff * 2).min(MAX_BIND_BACKOFF);
                delay
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "bind cancelled"));
            }
        }
    }
}

/// A running command server.
pub struct Server {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    browser: Arc<dyn Browser>,
    cancel: CancellationToken,
    connections: TaskTracker,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start serving.
    pub async fn bind(
        config: &ServerConfig,
        browser: Arc<dyn Browser>,
        handlers: HandlerRegistry,
    ) -> io::Result<Self> {
        let cancel = CancellationToken::new();
        let listener = bind_with_retry(config.bind, config.bind_retry, &cancel).await?;
        let local_addr = listener.local_addr()?;

        let registry = SessionRegistry::new(browser.clone(), config.session_limits());
        browser.set_listener(Some(registry.tab_listener()));
        let dispatcher = Dispatcher::new(handlers, registry.clone(), config.command_timeout);
        let connections = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            dispatcher,
            config.connection_limits(),
            connections.clone(),
            cancel.clone(),
        ));
        let sweep_task = spawn_sweeper(
            registry.clone(),
            config.sweep_interval,
            config.stale_after,
            cancel.child_token(),
        );

        tracing::info!(addr = %local_addr, "command server listening");
        Ok(Self {
            local_addr,
            registry,
            browser,
            cancel,
            connections,
            accept_task,
            sweep_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stop accepting, destroy every session and uninstall the tab listener.
    pub async fn stop(self) {
        self.cancel.cancel();
        let destroyed = self.registry.close();
        self.browser.set_listener(None);

        if let Err(e) = self.accept_task.await {
            tracing::warn!(?e, "accept loop ended abnormally");
        }
        if let Err(e) = self.sweep_task.await {
            tracing::warn!(?e, "sweeper ended abnormally");
        }
        self.connections.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.connections.len(),
                "connections still open after shutdown timeout"
            );
        }
        tracing::info!(sessions = destroyed, "command server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    limits: ConnectionLimits,
    connections: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("accept loop received cancel signal");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(?e, "failed to set TCP_NODELAY");
                        }
                        connections.spawn(serve_connection(
                            stream,
                            registry.clone(),
                            dispatcher.clone(),
                            limits.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Avoid a tight loop under sustained accept errors.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
