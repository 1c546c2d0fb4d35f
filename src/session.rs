//! Sessions: logical tenants that group connections and own tabs.
//!
//! The [`SessionRegistry`] is the only way to create, find or destroy a
//! session. It keeps the session map and a reverse index from connection id
//! to session id, arms and cancels grace timers, and moves tab ownership
//! between sessions.
//!
//! Locking: the registry lock is taken before a session's own lock, never the
//! other way round, and neither is held while calling a [`Browser`] operation
//! that can fire [`TabListener`] callbacks (`open_tab`, `close_tab`), because
//! those callbacks re-enter the registry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::browser::{Browser, TabId, TabInfo, TabListener};
use crate::connection::ConnectionHandle;
use crate::error::CommandError;
use crate::recording::{redact_params, ActionLog, ActionRecord};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Event log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TabEventKind {
    TabOpened,
    TabClosed,
    PopupBlocked,
}

/// One tab lifecycle notification, as returned by `get_tab_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabEvent {
    pub index: u64,
    #[serde(rename = "type")]
    pub kind: TabEventKind,
    pub tab_id: TabId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<TabId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: u64,
}

/// Bounded event log with a monotonic index.
///
/// Readers keep their own cursor (the next index they want). Evicted entries
/// are simply gone; a slow reader skips them.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<TabEvent>,
    next_index: u64,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_index: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append an event and return its index.
    pub fn push(
        &mut self,
        kind: TabEventKind,
        tab_id: &str,
        opener_tab_id: Option<&str>,
        url: Option<&str>,
    ) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TabEvent {
            index,
            kind,
            tab_id: tab_id.to_string(),
            opener_tab_id: opener_tab_id.map(str::to_string),
            url: url.map(str::to_string),
            timestamp: now_ms(),
        });
        index
    }

    /// Events with `index >= cursor`, oldest first.
    pub fn since(&self, cursor: u64) -> Vec<TabEvent> {
        self.entries
            .iter()
            .filter(|e| e.index >= cursor)
            .cloned()
            .collect()
    }

    /// Index the next pushed event will get.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// Per-session limits taken from the server config.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub grace_period: Duration,
    pub event_log_capacity: usize,
    pub action_log_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            event_log_capacity: 200,
            action_log_capacity: 5000,
        }
    }
}

struct SessionState {
    connections: Vec<Arc<ConnectionHandle>>,
    /// Owned tabs, in adoption order.
    tabs: Vec<TabId>,
    events: EventLog,
    recording: bool,
    actions: ActionLog,
    last_activity: Instant,
    grace_timer: Option<AbortHandle>,
    destroyed: bool,
}

/// A logical tenant: the connections attached to it and the tabs it owns.
pub struct Session {
    id: String,
    created_at: SystemTime,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connections", &state.connections.len())
            .field("tabs", &state.tabs)
            .field("recording", &state.recording)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl Session {
    fn new(limits: &SessionLimits) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
            state: Mutex::new(SessionState {
                connections: Vec::new(),
                tabs: Vec::new(),
                events: EventLog::new(limits.event_log_capacity),
                recording: false,
                actions: ActionLog::new(limits.action_log_capacity),
                last_activity: Instant::now(),
                grace_timer: None,
                destroyed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        state.connections.iter().map(|c| c.id().to_string()).collect()
    }

    /// Snapshot of the owned tab ids, in adoption order.
    pub fn tabs(&self) -> Vec<TabId> {
        self.state.lock().tabs.clone()
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().tabs.len()
    }

    pub fn owns_tab(&self, tab_id: &str) -> bool {
        self.state.lock().tabs.iter().any(|t| t == tab_id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Time since the last command or attach.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn has_grace_timer(&self) -> bool {
        self.state.lock().grace_timer.is_some()
    }

    /// Record activity and cancel any pending grace timer.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        if let Some(timer) = state.grace_timer.take() {
            timer.abort();
        }
    }

    pub fn log_event(
        &self,
        kind: TabEventKind,
        tab_id: &str,
        opener_tab_id: Option<&str>,
        url: Option<&str>,
    ) -> u64 {
        self.state
            .lock()
            .events
            .push(kind, tab_id, opener_tab_id, url)
    }

    /// Events at or after `cursor`, plus the cursor to use next time.
    pub fn events_since(&self, cursor: u64) -> (Vec<TabEvent>, u64) {
        let state = self.state.lock();
        (state.events.since(cursor), state.events.next_index())
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    /// Start recording with an empty action log.
    pub fn start_recording(&self) {
        let mut state = self.state.lock();
        state.actions.clear();
        state.recording = true;
    }

    /// Stop recording. Returns how many actions were captured; they stay
    /// available for saving until the next `start_recording`.
    pub fn stop_recording(&self) -> usize {
        let mut state = self.state.lock();
        state.recording = false;
        state.actions.len()
    }

    /// Append an action if recording is on. Params are redacted first.
    pub fn record_action(&self, method: &str, params: &Value) -> bool {
        let mut state = self.state.lock();
        if !state.recording {
            return false;
        }
        state.actions.push(ActionRecord {
            method: method.to_string(),
            params: redact_params(params),
            timestamp: now_ms(),
        });
        true
    }

    pub fn actions(&self) -> Vec<ActionRecord> {
        self.state.lock().actions.snapshot()
    }

    fn add_tab(&self, tab_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.destroyed || state.tabs.iter().any(|t| t == tab_id) {
            return false;
        }
        state.tabs.push(tab_id.to_string());
        true
    }

    fn remove_tab(&self, tab_id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.tabs.len();
        state.tabs.retain(|t| t != tab_id);
        state.tabs.len() != before
    }

    fn add_connection(&self, conn: Arc<ConnectionHandle>) {
        let mut state = self.state.lock();
        state.connections.push(conn);
        state.last_activity = Instant::now();
        if let Some(timer) = state.grace_timer.take() {
            timer.abort();
        }
    }

    /// Returns how many connections remain.
    fn remove_connection(&self, conn_id: &str) -> usize {
        let mut state = self.state.lock();
        state.connections.retain(|c| c.id() != conn_id);
        state.connections.len()
    }

    fn set_grace_timer(&self, timer: AbortHandle) {
        let mut state = self.state.lock();
        if let Some(old) = state.grace_timer.replace(timer) {
            old.abort();
        }
    }

    /// Mark destroyed and hand back the connection and tab sets, clearing
    /// both so callbacks fired while closing tabs see an empty session.
    fn teardown(&self) -> (Vec<Arc<ConnectionHandle>>, Vec<TabId>) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.recording = false;
        if let Some(timer) = state.grace_timer.take() {
            timer.abort();
        }
        (
            std::mem::take(&mut state.connections),
            std::mem::take(&mut state.tabs),
        )
    }
}

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Tab not found: {0}")]
    TabNotFound(String),
    #[error("Server is shutting down")]
    Closed,
}

impl From<RegistryError> for CommandError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::SessionNotFound(id) => CommandError::SessionNotFound(id),
            RegistryError::TabNotFound(id) => CommandError::TabNotFound(id),
            RegistryError::Closed => CommandError::handler("Server is shutting down"),
        }
    }
}

/// Why a session was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Closed,
    GraceExpired,
    Stale,
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestroyReason::Closed => "closed",
            DestroyReason::GraceExpired => "grace period elapsed",
            DestroyReason::Stale => "stale",
            DestroyReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    pub session_id: String,
    pub tabs_closed: usize,
    pub connections_closed: usize,
}

struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    /// Connection id -> session id.
    connections: HashMap<String, String>,
    /// Set once on shutdown; no session is created or joined afterwards.
    closed: bool,
}

struct Shared {
    inner: RwLock<RegistryInner>,
    browser: Arc<dyn Browser>,
    limits: SessionLimits,
    next_connection: AtomicU64,
}

/// Owns every live session.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn new(browser: Arc<dyn Browser>, limits: SessionLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(RegistryInner {
                    sessions: HashMap::new(),
                    connections: HashMap::new(),
                    closed: false,
                }),
                browser,
                limits,
                next_connection: AtomicU64::new(0),
            }),
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub fn browser(&self) -> &Arc<dyn Browser> {
        &self.shared.browser
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.shared.limits
    }

    /// A listener to install on the browser. Holds the registry weakly.
    pub fn tab_listener(&self) -> Arc<dyn TabListener> {
        Arc::new(RegistryListener {
            shared: Arc::downgrade(&self.shared),
        })
    }

    pub fn next_connection_id(&self) -> String {
        let n = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{n}")
    }

    /// Create an empty session. Fails once the registry has been closed.
    pub fn create(&self) -> Result<Arc<Session>, RegistryError> {
        let session = Arc::new(Session::new(&self.shared.limits));
        {
            let mut inner = self.shared.inner.write();
            if inner.closed {
                return Err(RegistryError::Closed);
            }
            inner
                .sessions
                .insert(session.id().to_string(), session.clone());
        }
        tracing::info!(session = %session.id(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.inner.read().sessions.get(id).cloned()
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.shared.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.shared.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_for_connection(&self, conn_id: &str) -> Option<Arc<Session>> {
        let inner = self.shared.inner.read();
        let session_id = inner.connections.get(conn_id)?;
        inner.sessions.get(session_id).cloned()
    }

    /// Attach a connection to a session, cancelling any grace timer.
    pub fn attach(
        &self,
        session_id: &str,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Arc<Session>, RegistryError> {
        let mut inner = self.shared.inner.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        let session = inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        session.add_connection(conn.clone());
        inner
            .connections
            .insert(conn.id().to_string(), session_id.to_string());
        conn.bind_session(session_id);
        tracing::debug!(session = %session_id, conn = %conn.id(), "connection attached");
        Ok(session)
    }

    /// Detach a connection. Arms the session's grace timer when this was
    /// its last connection.
    pub fn detach(&self, conn_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.shared.inner.write();
        let session_id = inner.connections.remove(conn_id)?;
        let session = inner.sessions.get(&session_id).cloned()?;
        let remaining = session.remove_connection(conn_id);
        tracing::debug!(session = %session_id, conn = %conn_id, remaining, "connection detached");
        if remaining == 0 && !session.is_destroyed() {
            self.arm_grace(&session);
        }
        Some(session)
    }

    fn arm_grace(&self, session: &Arc<Session>) {
        let weak = Arc::downgrade(&self.shared);
        let id = session.id().to_string();
        let grace = self.shared.limits.grace_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = SessionRegistry::upgrade(&weak) {
                registry.destroy_where(&id, DestroyReason::GraceExpired, |s| {
                    s.connection_count() == 0
                });
            }
        });
        session.set_grace_timer(timer.abort_handle());
        tracing::debug!(session = %session.id(), grace_secs = grace.as_secs(), "grace timer armed");
    }

    /// Session id that owns `tab_id`, if that session is still live.
    pub fn owner_of(&self, tab_id: &str) -> Option<String> {
        let owner = self.shared.browser.tab(tab_id)?.owner?;
        let inner = self.shared.inner.read();
        inner
            .sessions
            .get(&owner)
            .filter(|s| s.owns_tab(tab_id))
            .map(|s| s.id().to_string())
    }

    /// Make `session_id` the owner of `tab_id`.
    ///
    /// Any previous owner loses the tab in the same step. Logs `tab_opened`
    /// on the claimant the first time it adopts the tab.
    pub fn claim_tab(
        &self,
        session_id: &str,
        tab_id: &str,
        opener: Option<&str>,
    ) -> Result<TabInfo, RegistryError> {
        let inner = self.shared.inner.write();
        let claimant = inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        let tab = self
            .shared
            .browser
            .tab(tab_id)
            .ok_or_else(|| RegistryError::TabNotFound(tab_id.to_string()))?;

        if let Some(previous) = tab.owner.as_deref().filter(|p| *p != session_id) {
            if let Some(old) = inner.sessions.get(previous) {
                old.remove_tab(tab_id);
                tracing::info!(tab = %tab_id, from = %previous, to = %session_id, "tab ownership transferred");
            }
        }
        self.shared
            .browser
            .set_owner(tab_id, Some(session_id))
            .map_err(|_| RegistryError::TabNotFound(tab_id.to_string()))?;
        if claimant.add_tab(tab_id) {
            claimant.log_event(TabEventKind::TabOpened, tab_id, opener, Some(&tab.url));
        }
        drop(inner);

        Ok(TabInfo {
            owner: Some(session_id.to_string()),
            ..tab
        })
    }

    /// Forget a tab that the host has closed.
    fn release_tab(&self, tab: &TabInfo) {
        let Some(owner) = tab.owner.as_deref() else {
            return;
        };
        let Some(session) = self.get(owner) else {
            return;
        };
        if session.remove_tab(&tab.id) {
            session.log_event(TabEventKind::TabClosed, &tab.id, None, Some(&tab.url));
        }
    }

    /// Destroy a session: close its connections and tabs and remove it.
    pub fn destroy(&self, id: &str, reason: DestroyReason) -> Option<DestroyReport> {
        self.destroy_where(id, reason, |_| true)
    }

    fn destroy_where<F>(&self, id: &str, reason: DestroyReason, pred: F) -> Option<DestroyReport>
    where
        F: FnOnce(&Session) -> bool,
    {
        let (connections, tabs) = {
            let mut inner = self.shared.inner.write();
            let session = inner.sessions.get(id)?;
            if !pred(session.as_ref()) {
                return None;
            }
            let session = inner.sessions.remove(id)?;
            let (connections, tabs) = session.teardown();
            for conn in &connections {
                inner.connections.remove(conn.id());
            }
            (connections, tabs)
        };

        for conn in &connections {
            conn.close();
        }
        let mut tabs_closed = 0;
        for tab in &tabs {
            match self.shared.browser.close_tab(tab) {
                Ok(()) => tabs_closed += 1,
                Err(e) => tracing::debug!(session = %id, tab = %tab, "tab already gone: {e}"),
            }
        }

        tracing::info!(
            session = %id,
            %reason,
            tabs_closed,
            connections = connections.len(),
            "session destroyed"
        );
        Some(DestroyReport {
            session_id: id.to_string(),
            tabs_closed,
            connections_closed: connections.len(),
        })
    }

    /// Refuse new sessions and joins from now on, then destroy every
    /// session. Returns how many were destroyed.
    pub fn close(&self) -> usize {
        self.shared.inner.write().closed = true;
        self.destroy_all(DestroyReason::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.read().closed
    }

    /// Destroy every session. Returns how many were destroyed.
    fn destroy_all(&self, reason: DestroyReason) -> usize {
        let ids: Vec<String> = self.shared.inner.read().sessions.keys().cloned().collect();
        ids.iter()
            .filter(|id| self.destroy(id, reason).is_some())
            .count()
    }

    /// Destroy sessions with no connections that have been idle longer than
    /// `stale_after`. Returns the destroyed ids.
    pub fn sweep_stale(&self, stale_after: Duration) -> Vec<String> {
        let is_stale = |s: &Session| s.connection_count() == 0 && s.idle_for() > stale_after;
        let candidates: Vec<String> = {
            let inner = self.shared.inner.read();
            inner
                .sessions
                .values()
                .filter(|s| is_stale(s))
                .map(|s| s.id().to_string())
                .collect()
        };
        candidates
            .into_iter()
            .filter(|id| self.destroy_where(id, DestroyReason::Stale, is_stale).is_some())
            .collect()
    }
}

/// Routes host tab notifications into the owning session.
struct RegistryListener {
    shared: Weak<Shared>,
}

impl TabListener for RegistryListener {
    fn on_tab_opened(&self, tab: &TabInfo, opener: Option<&str>) {
        let (Some(registry), Some(opener)) = (SessionRegistry::upgrade(&self.shared), opener) else {
            return;
        };
        let Some(owner) = registry.owner_of(opener) else {
            return;
        };
        if let Err(e) = registry.claim_tab(&owner, &tab.id, Some(opener)) {
            tracing::debug!(tab = %tab.id, session = %owner, "popup not adopted: {e}");
        }
    }

    fn on_tab_closed(&self, tab: &TabInfo) {
        if let Some(registry) = SessionRegistry::upgrade(&self.shared) {
            registry.release_tab(tab);
        }
    }

    fn on_popup_blocked(&self, opener: &str, url: &str) {
        let Some(registry) = SessionRegistry::upgrade(&self.shared) else {
            return;
        };
        if let Some(session) = registry.owner_of(opener).and_then(|id| registry.get(&id)) {
            session.log_event(TabEventKind::PopupBlocked, opener, None, Some(url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MemoryBrowser;

    fn setup(grace: Duration) -> (SessionRegistry, Arc<MemoryBrowser>) {
        let browser = Arc::new(MemoryBrowser::new());
        let registry = SessionRegistry::new(
            browser.clone(),
            SessionLimits {
                grace_period: grace,
                ..SessionLimits::default()
            },
        );
        browser.set_listener(Some(registry.tab_listener()));
        (registry, browser)
    }

    fn connect(registry: &SessionRegistry, session: &Session) -> Arc<ConnectionHandle> {
        let conn = Arc::new(ConnectionHandle::new(registry.next_connection_id()));
        registry.attach(session.id(), &conn).unwrap();
        conn
    }

    fn open_owned(registry: &SessionRegistry, browser: &MemoryBrowser, session: &Session) -> TabId {
        let tab = browser.open_tab("https://example.com/", None).unwrap();
        registry.claim_tab(session.id(), &tab.id, None).unwrap();
        tab.id
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn event_log_is_bounded_and_monotonic() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            let idx = log.push(TabEventKind::TabOpened, &format!("t{i}"), None, None);
            assert_eq!(idx, i);
        }
        assert_eq!(log.len(), 3);
        let events = log.since(0);
        assert_eq!(events.first().unwrap().index, 2);
        assert_eq!(log.since(4).len(), 1);
        assert!(log.since(5).is_empty());
        assert_eq!(log.next_index(), 5);
    }

    #[test]
    fn tab_event_serializes_type_tag() {
        let mut log = EventLog::new(8);
        log.push(TabEventKind::TabOpened, "tab-2", Some("tab-1"), None);
        let json = serde_json::to_value(&log.since(0)[0]).unwrap();
        assert_eq!(json["type"], "tab_opened");
        assert_eq!(json["opener_tab_id"], "tab-1");
        assert!(json.get("url").is_none());
    }

    #[tokio::test]
    async fn attach_to_unknown_session_fails() {
        let (registry, _browser) = setup(Duration::from_secs(300));
        let conn = Arc::new(ConnectionHandle::new(registry.next_connection_id()));
        assert!(matches!(
            registry.attach("nope", &conn),
            Err(RegistryError::SessionNotFound(_))
        ));
        assert!(conn.session_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_destroyed_after_grace_period() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        let conn = connect(&registry, &session);
        let tab = open_owned(&registry, &browser, &session);

        registry.detach(conn.id());
        assert!(session.has_grace_timer());

        tokio::time::sleep(Duration::from_secs(299)).await;
        settle().await;
        assert!(registry.get(session.id()).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(registry.get(session.id()).is_none());
        assert!(browser.tab(&tab).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_within_grace_keeps_session() {
        let (registry, _browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        let first = connect(&registry, &session);
        registry.detach(first.id());

        tokio::time::sleep(Duration::from_secs(100)).await;
        let _second = connect(&registry, &session);
        assert!(!session.has_grace_timer());

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert!(registry.get(session.id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_cancels_grace_timer() {
        let (registry, _browser) = setup(Duration::from_secs(60));
        let session = registry.create().unwrap();
        let conn = connect(&registry, &session);
        registry.detach(conn.id());
        session.touch();
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(registry.get(session.id()).is_some());
    }

    #[tokio::test]
    async fn destroy_closes_tabs_and_connections() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        let a = connect(&registry, &session);
        let b = connect(&registry, &session);
        open_owned(&registry, &browser, &session);
        open_owned(&registry, &browser, &session);

        let report = registry.destroy(session.id(), DestroyReason::Closed).unwrap();
        assert_eq!(report.tabs_closed, 2);
        assert_eq!(report.connections_closed, 2);
        assert_eq!(session.tab_count(), 0);
        assert_eq!(session.connection_count(), 0);
        assert!(session.is_destroyed());
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(browser.tab_count(), 0);
        assert!(registry.session_for_connection(a.id()).is_none());

        // Late detach from the closed connection is a no-op.
        assert!(registry.detach(a.id()).is_none());
        assert!(registry.destroy(session.id(), DestroyReason::Closed).is_none());
    }

    #[tokio::test]
    async fn claim_transfers_ownership() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let s1 = registry.create().unwrap();
        let s2 = registry.create().unwrap();
        let tab = open_owned(&registry, &browser, &s1);

        registry.claim_tab(s2.id(), &tab, None).unwrap();
        assert!(!s1.owns_tab(&tab));
        assert!(s2.owns_tab(&tab));
        assert_eq!(browser.tab(&tab).unwrap().owner.as_deref(), Some(s2.id()));
        assert_eq!(registry.owner_of(&tab).as_deref(), Some(s2.id()));

        // Closing it now logs on the new owner only.
        browser.close_tab(&tab).unwrap();
        let (s1_events, _) = s1.events_since(0);
        let (s2_events, _) = s2.events_since(0);
        assert_eq!(s1_events.len(), 1);
        assert_eq!(
            s2_events.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![TabEventKind::TabOpened, TabEventKind::TabClosed]
        );
    }

    #[tokio::test]
    async fn popup_is_adopted_by_opener_session() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        let opener = open_owned(&registry, &browser, &session);

        let popup = browser
            .open_popup(&opener, "https://popup.example/")
            .unwrap()
            .unwrap();
        assert!(session.owns_tab(&popup.id));
        assert_eq!(popup.owner.as_deref(), Some(session.id()));

        browser.set_block_popups(true);
        browser.open_popup(&opener, "https://ad.example/").unwrap();

        let (events, next) = session.events_since(1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TabEventKind::TabOpened);
        assert_eq!(events[0].opener_tab_id.as_deref(), Some(opener.as_str()));
        assert_eq!(events[1].kind, TabEventKind::PopupBlocked);
        assert_eq!(events[1].url.as_deref(), Some("https://ad.example/"));
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn unowned_tabs_are_not_adopted() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        let stray = browser.open_tab("about:blank", None).unwrap();
        browser.open_popup(&stray.id, "https://x.example/").unwrap();
        assert_eq!(session.tab_count(), 0);
        assert!(registry.owner_of(&stray.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_removes_idle_connectionless_sessions() {
        let (registry, _browser) = setup(Duration::from_secs(3600 * 24));
        let idle = registry.create().unwrap();
        let busy = registry.create().unwrap();
        let connected = registry.create().unwrap();
        let _conn = connect(&registry, &connected);

        tokio::time::advance(Duration::from_secs(1700)).await;
        busy.touch();
        tokio::time::advance(Duration::from_secs(200)).await;

        let swept = registry.sweep_stale(Duration::from_secs(1800));
        assert_eq!(swept, vec![idle.id().to_string()]);
        assert!(registry.get(busy.id()).is_some());
        assert!(registry.get(connected.id()).is_some());
    }

    #[tokio::test]
    async fn recording_redacts_and_respects_flag() {
        let (registry, _browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        assert!(!session.record_action("navigate", &serde_json::json!({})));

        session.start_recording();
        let blob = "z".repeat(5000);
        assert!(session.record_action("upload", &serde_json::json!({"file_data": blob})));
        assert_eq!(session.stop_recording(), 1);
        assert_eq!(
            session.actions()[0].params["file_data"],
            "[redacted 5000 bytes]"
        );
    }

    #[tokio::test]
    async fn closed_registry_refuses_new_sessions_and_joins() {
        let (registry, browser) = setup(Duration::from_secs(300));
        let session = registry.create().unwrap();
        open_owned(&registry, &browser, &session);

        assert_eq!(registry.close(), 1);
        assert!(registry.is_closed());
        assert!(registry.is_empty());
        assert_eq!(browser.tab_count(), 0);

        assert_eq!(registry.create().unwrap_err(), RegistryError::Closed);
        let late = Arc::new(ConnectionHandle::new("conn-late"));
        assert_eq!(
            registry.attach(session.id(), &late).unwrap_err(),
            RegistryError::Closed
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn destroy_all_empties_registry() {
        let (registry, browser) = setup(Duration::from_secs(300));
        for _ in 0..3 {
            let s = registry.create().unwrap();
            open_owned(&registry, &browser, &s);
        }
        assert_eq!(registry.destroy_all(DestroyReason::Shutdown), 3);
        assert!(registry.is_empty());
        assert_eq!(browser.tab_count(), 0);
    }
}
