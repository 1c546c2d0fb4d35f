//! Map an optional tab reference onto a tab the session owns.
//!
//! Without a reference the connection's current tab wins if the session
//! still owns it, then the session's first tab (which becomes current).
//! With a reference, owned tabs are matched by stable id, then linked id,
//! then URL. Tabs owned by other sessions are never considered.

use crate::browser::{Browser, TabInfo};
use crate::connection::ConnectionHandle;
use crate::session::Session;

pub fn resolve_tab(
    browser: &dyn Browser,
    session: &Session,
    conn: &ConnectionHandle,
    requested: Option<&str>,
) -> Option<TabInfo> {
    let owned: Vec<TabInfo> = session
        .tabs()
        .iter()
        .filter_map(|id| browser.tab(id))
        .collect();

    match requested {
        Some(wanted) => owned
            .iter()
            .find(|t| t.id == wanted)
            .or_else(|| owned.iter().find(|t| t.linked_id == wanted))
            .or_else(|| owned.iter().find(|t| t.url == wanted))
            .cloned(),
        None => {
            if let Some(current) = conn.current_tab() {
                if let Some(tab) = owned.iter().find(|t| t.id == current) {
                    return Some(tab.clone());
                }
            }
            let first = owned.into_iter().next();
            conn.set_current_tab(first.as_ref().map(|t| t.id.clone()));
            first
        }
    }
}
