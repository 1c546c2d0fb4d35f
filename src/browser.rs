//! The tab host: the application whose tabs sessions own and drive.
//!
//! [`Browser`] is the seam between the command server and the host. The
//! server only needs to open, close, look up and retag tabs; everything a
//! handler does inside a tab goes through the same trait. [`MemoryBrowser`]
//! is an in-process host that keeps tabs as plain records, used by the
//! standalone binary and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BrowserError;

pub type TabId = String;

/// Snapshot of one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabInfo {
    /// Stable id, never reused.
    pub id: TabId,
    /// Transient id assigned by the host's UI layer.
    pub linked_id: String,
    pub url: String,
    pub title: String,
    /// Session id the tab is tagged with, if any.
    pub owner: Option<String>,
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Expiry as seconds since the Unix epoch; `None` for a session cookie.
    #[serde(default)]
    pub expires: Option<i64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Receives tab lifecycle notifications from the host.
///
/// Callbacks can fire synchronously from inside [`Browser::open_tab`] or
/// [`Browser::close_tab`]; implementations must not assume the caller has
/// released any of its own state.
pub trait TabListener: Send + Sync {
    fn on_tab_opened(&self, tab: &TabInfo, opener: Option<&str>);
    fn on_tab_closed(&self, tab: &TabInfo);
    fn on_popup_blocked(&self, opener: &str, url: &str);
}

pub trait Browser: Send + Sync {
    fn open_tab(&self, url: &str, opener: Option<&str>) -> Result<TabInfo, BrowserError>;
    fn close_tab(&self, id: &str) -> Result<(), BrowserError>;
    fn navigate(&self, id: &str, url: &str) -> Result<TabInfo, BrowserError>;
    fn go_back(&self, id: &str) -> Result<TabInfo, BrowserError>;
    fn go_forward(&self, id: &str) -> Result<TabInfo, BrowserError>;
    fn reload(&self, id: &str) -> Result<TabInfo, BrowserError>;
    fn tab(&self, id: &str) -> Option<TabInfo>;
    /// Tag a tab with its owning session (or clear the tag).
    fn set_owner(&self, id: &str, owner: Option<&str>) -> Result<(), BrowserError>;
    /// Cookies visible to `url`, or the whole jar when `url` is `None`.
    fn cookies(&self, url: Option<&str>) -> Vec<Cookie>;
    fn set_cookie(&self, cookie: Cookie);
    /// Install or remove the process-wide tab listener.
    fn set_listener(&self, listener: Option<Arc<dyn TabListener>>);
}

/// Reject anything that is not an obviously loadable address.
pub fn validate_url(url: &str) -> Result<(), BrowserError> {
    const SCHEMES: [&str; 5] = ["about:", "http://", "https://", "file://", "data:"];
    if SCHEMES.iter().any(|s| url.starts_with(s)) && url.len() > 5 {
        Ok(())
    } else {
        Err(BrowserError::InvalidUrl(url.to_string()))
    }
}

/// Host part of a URL, without port.
pub fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then_some(host)
}

fn title_for(url: &str) -> String {
    match host_of(url) {
        Some(host) => host.to_string(),
        None if url == "about:blank" => "New Tab".to_string(),
        None => url.to_string(),
    }
}

fn cookie_matches(cookie: &Cookie, host: &str) -> bool {
    let domain = cookie.domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[derive(Debug)]
struct TabEntry {
    linked_id: String,
    history: Vec<String>,
    index: usize,
    owner: Option<String>,
}

impl TabEntry {
    fn info(&self, id: &str) -> TabInfo {
        let url = self.history[self.index].clone();
        TabInfo {
            id: id.to_string(),
            linked_id: self.linked_id.clone(),
            title: title_for(&url),
            url,
            owner: self.owner.clone(),
            can_go_back: self.index > 0,
            can_go_forward: self.index + 1 < self.history.len(),
        }
    }
}

#[derive(Default)]
struct BrowserState {
    tabs: HashMap<TabId, TabEntry>,
    next_id: u64,
    cookies: Vec<Cookie>,
    listener: Option<Arc<dyn TabListener>>,
    block_popups: bool,
}

/// In-memory tab host.
#[derive(Default)]
pub struct MemoryBrowser {
    state: Mutex<BrowserState>,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page content in `opener` asked for a new window.
    ///
    /// Opens it as a tab with `opener` recorded, or reports it as blocked
    /// when popup blocking is on.
    pub fn open_popup(&self, opener: &str, url: &str) -> Result<Option<TabInfo>, BrowserError> {
        let (blocked, listener) = {
            let state = self.state.lock();
            if !state.tabs.contains_key(opener) {
                return Err(BrowserError::TabNotFound(opener.to_string()));
            }
            (state.block_popups, state.listener.clone())
        };
        if blocked {
            if let Some(listener) = listener {
                listener.on_popup_blocked(opener, url);
            }
            return Ok(None);
        }
        self.open_tab(url, Some(opener)).map(Some)
    }

    pub fn set_block_popups(&self, block: bool) {
        self.state.lock().block_popups = block;
    }

    pub fn has_listener(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().tabs.len()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<TabInfo, BrowserError>
    where
        F: FnOnce(&mut TabEntry) -> Result<(), BrowserError>,
    {
        let mut state = self.state.lock();
        let entry = state
            .tabs
            .get_mut(id)
            .ok_or_else(|| BrowserError::TabNotFound(id.to_string()))?;
        f(entry)?;
        Ok(entry.info(id))
    }
}

impl Browser for MemoryBrowser {
    fn open_tab(&self, url: &str, opener: Option<&str>) -> Result<TabInfo, BrowserError> {
        validate_url(url)?;
        let (info, listener) = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("tab-{}", state.next_id);
            let entry = TabEntry {
                linked_id: format!("panel-{}", state.next_id),
                history: vec![url.to_string()],
                index: 0,
                owner: None,
            };
            let info = entry.info(&id);
            state.tabs.insert(id, entry);
            (info, state.listener.clone())
        };
        tracing::debug!(tab = %info.id, url = %info.url, "tab opened");
        if let Some(listener) = listener {
            listener.on_tab_opened(&info, opener);
        }
        Ok(self.tab(&info.id).unwrap_or(info))
    }

    fn close_tab(&self, id: &str) -> Result<(), BrowserError> {
        let (info, listener) = {
            let mut state = self.state.lock();
            let entry = state
                .tabs
                .remove(id)
                .ok_or_else(|| BrowserError::TabNotFound(id.to_string()))?;
            (entry.info(id), state.listener.clone())
        };
        tracing::debug!(tab = %id, "tab closed");
        if let Some(listener) = listener {
            listener.on_tab_closed(&info);
        }
        Ok(())
    }

    fn navigate(&self, id: &str, url: &str) -> Result<TabInfo, BrowserError> {
        validate_url(url)?;
        self.update(id, |entry| {
            entry.history.truncate(entry.index + 1);
            entry.history.push(url.to_string());
            entry.index += 1;
            Ok(())
        })
    }

    fn go_back(&self, id: &str) -> Result<TabInfo, BrowserError> {
        self.update(id, |entry| {
            if entry.index == 0 {
                return Err(BrowserError::NoHistory("back"));
            }
            entry.index -= 1;
            Ok(())
        })
    }

    fn go_forward(&self, id: &str) -> Result<TabInfo, BrowserError> {
        self.update(id, |entry| {
            if entry.index + 1 >= entry.history.len() {
                return Err(BrowserError::NoHistory("forward"));
            }
            entry.index += 1;
            Ok(())
        })
    }

    fn reload(&self, id: &str) -> Result<TabInfo, BrowserError> {
        self.update(id, |_| Ok(()))
    }

    fn tab(&self, id: &str) -> Option<TabInfo> {
        let state = self.state.lock();
        state.tabs.get(id).map(|entry| entry.info(id))
    }

    fn set_owner(&self, id: &str, owner: Option<&str>) -> Result<(), BrowserError> {
        self.update(id, |entry| {
            entry.owner = owner.map(str::to_string);
            Ok(())
        })
        .map(|_| ())
    }

    fn cookies(&self, url: Option<&str>) -> Vec<Cookie> {
        let state = self.state.lock();
        match url {
            None => state.cookies.clone(),
            Some(url) => match host_of(url) {
                Some(host) => state
                    .cookies
                    .iter()
                    .filter(|c| cookie_matches(c, host))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn set_cookie(&self, cookie: Cookie) {
        let mut state = self.state.lock();
        state
            .cookies
            .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path));
        state.cookies.push(cookie);
    }

    fn set_listener(&self, listener: Option<Arc<dyn TabListener>>) {
        self.state.lock().listener = listener;
    }
}
