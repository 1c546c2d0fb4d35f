//! Built-in command handlers.
//!
//! Each handler takes the raw `params` value and a [`CommandContext`] and
//! returns a JSON result. Tab-scoped handlers go through the resolver, so a
//! session can only ever touch its own tabs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::browser::{host_of, Cookie, TabInfo};
use crate::dispatch::{parse_params, CommandContext, HandlerRegistry};
use crate::error::{BrowserError, CommandError};
use crate::recording::{is_recorded, Recording};
use crate::session::DestroyReason;

type HandlerResult = Result<Value, CommandError>;

/// Handler table with every built-in method registered.
pub fn builtin_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("ping", ping);
    // Tabs
    registry.register("create_tab", create_tab);
    registry.register("close_tab", close_tab);
    registry.register("switch_tab", switch_tab);
    registry.register("list_tabs", list_tabs);
    registry.register("get_tab_events", get_tab_events);
    // Navigation
    registry.register("navigate", navigate);
    registry.register("go_back", go_back);
    registry.register("go_forward", go_forward);
    registry.register("reload", reload);
    registry.register("get_page_info", get_page_info);
    registry.register("wait", wait);
    // Cookies
    registry.register("get_cookies", get_cookies);
    registry.register("set_cookie", set_cookie);
    // Sessions
    registry.register("session_info", session_info);
    registry.register("session_close", session_close);
    registry.register("list_sessions", list_sessions);
    registry.register("session_save", session_save);
    registry.register("session_restore", session_restore);
    // Recording
    registry.register("record_start", record_start);
    registry.register("record_stop", record_stop);
    registry.register("record_save", record_save);
    registry.register("record_replay", record_replay);
    registry
}

#[derive(Debug, Default, Deserialize)]
struct TabParams {
    #[serde(default)]
    tab_id: Option<String>,
}

async fn ping(_params: Value, ctx: CommandContext) -> HandlerResult {
    Ok(json!({
        "pong": true,
        "session_id": ctx.session.id(),
        "connection_id": ctx.connection.id(),
    }))
}

// ── Tabs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTabParams {
    #[serde(default)]
    url: Option<String>,
}

/// Open a tab, hand it to the session and make it current.
fn open_owned_tab(ctx: &CommandContext, url: &str) -> Result<TabInfo, CommandError> {
    let browser = ctx.browser();
    let tab = browser.open_tab(url, None)?;
    match ctx.registry.claim_tab(ctx.session.id(), &tab.id, None) {
        Ok(tab) => Ok(tab),
        Err(e) => {
            // Session went away while the tab was opening.
            let _ = browser.close_tab(&tab.id);
            Err(e.into())
        }
    }
}

async fn create_tab(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: CreateTabParams = parse_params(params)?;
    let url = p.url.as_deref().unwrap_or("about:blank");
    let tab = open_owned_tab(&ctx, url)?;
    ctx.connection.set_current_tab(Some(tab.id.clone()));
    Ok(json!({"tab_id": tab.id, "url": tab.url}))
}

async fn close_tab(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: TabParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    ctx.browser().close_tab(&tab.id)?;
    if ctx.connection.current_tab().as_deref() == Some(tab.id.as_str()) {
        ctx.connection.set_current_tab(None);
    }
    Ok(json!({"success": true, "tab_id": tab.id}))
}

#[derive(Debug, Deserialize)]
struct SwitchTabParams {
    tab_id: String,
}

async fn switch_tab(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: SwitchTabParams = parse_params(params)?;
    let tab = ctx.require_tab(Some(&p.tab_id))?;
    ctx.connection.set_current_tab(Some(tab.id.clone()));
    Ok(json!({
        "success": true,
        "tab_id": tab.id,
        "url": tab.url,
        "title": tab.title,
    }))
}

async fn list_tabs(_params: Value, ctx: CommandContext) -> HandlerResult {
    let current = ctx.connection.current_tab();
    let browser = ctx.browser();
    let tabs: Vec<Value> = ctx
        .session
        .tabs()
        .iter()
        .filter_map(|id| browser.tab(id))
        .map(|tab| {
            json!({
                "tab_id": tab.id,
                "url": tab.url,
                "title": tab.title,
                "active": current.as_deref() == Some(tab.id.as_str()),
            })
        })
        .collect();
    Ok(Value::Array(tabs))
}

async fn get_tab_events(_params: Value, ctx: CommandContext) -> HandlerResult {
    let (events, next) = ctx.session.events_since(ctx.connection.event_cursor());
    ctx.connection.advance_cursor(next);
    Ok(json!({"events": events, "cursor": next}))
}

// ── Navigation ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NavigateParams {
    url: String,
    #[serde(default)]
    tab_id: Option<String>,
}

/// Shape the result of a history/navigation call.
///
/// The action is dispatched first, then the tab is looked up again to
/// confirm where it ended up. A tab that disappeared in between is reported
/// as a tentative success since the navigation may already have happened.
async fn settle_navigation(
    ctx: &CommandContext,
    tab_id: &str,
    outcome: Result<TabInfo, BrowserError>,
) -> HandlerResult {
    match outcome {
        Ok(_) => {}
        Err(BrowserError::TabNotFound(_)) => return Ok(tentative(tab_id)),
        Err(e) => return Err(e.into()),
    }
    tokio::task::yield_now().await;
    match ctx.browser().tab(tab_id).filter(|_| ctx.session.owns_tab(tab_id)) {
        Some(tab) => Ok(json!({"success": true, "tab_id": tab.id, "url": tab.url})),
        None => Ok(tentative(tab_id)),
    }
}

fn tentative(tab_id: &str) -> Value {
    json!({
        "success": true,
        "tab_id": tab_id,
        "note": "Tab closed before navigation could be confirmed; the action may have taken effect",
    })
}

async fn navigate(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: NavigateParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    let outcome = ctx.browser().navigate(&tab.id, &p.url);
    settle_navigation(&ctx, &tab.id, outcome).await
}

async fn go_back(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: TabParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    let outcome = ctx.browser().go_back(&tab.id);
    settle_navigation(&ctx, &tab.id, outcome).await
}

async fn go_forward(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: TabParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    let outcome = ctx.browser().go_forward(&tab.id);
    settle_navigation(&ctx, &tab.id, outcome).await
}

async fn reload(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: TabParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    let outcome = ctx.browser().reload(&tab.id);
    settle_navigation(&ctx, &tab.id, outcome).await
}

async fn get_page_info(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: TabParams = parse_params(params)?;
    let tab = ctx.require_tab(p.tab_id.as_deref())?;
    Ok(json!({
        "tab_id": tab.id,
        "url": tab.url,
        "title": tab.title,
        "can_go_back": tab.can_go_back,
        "can_go_forward": tab.can_go_forward,
    }))
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    seconds: f64,
}

async fn wait(params: Value, _ctx: CommandContext) -> HandlerResult {
    let p: WaitParams = parse_params(params)?;
    let duration = Duration::try_from_secs_f64(p.seconds)
        .map_err(|_| CommandError::InvalidParams(format!("bad wait duration: {}", p.seconds)))?;
    tokio::time::sleep(duration).await;
    Ok(json!({"success": true, "waited": p.seconds}))
}

// ── Cookies ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GetCookiesParams {
    #[serde(default)]
    url: Option<String>,
}

async fn get_cookies(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: GetCookiesParams = parse_params(params)?;
    let url = match p.url {
        Some(url) => Some(url),
        None => ctx.resolve_tab(None).map(|tab| tab.url),
    };
    let cookies = ctx.browser().cookies(url.as_deref());
    Ok(json!({"cookies": cookies}))
}

#[derive(Debug, Deserialize)]
struct SetCookieParams {
    name: String,
    value: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    http_only: bool,
    #[serde(default)]
    expires: Option<i64>,
}

async fn set_cookie(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: SetCookieParams = parse_params(params)?;
    let domain = match (p.domain, p.url.as_deref().and_then(host_of)) {
        (Some(domain), _) => domain,
        (None, Some(host)) => host.to_string(),
        (None, None) => {
            return Err(CommandError::InvalidParams(
                "set_cookie needs a domain or an http(s) url".into(),
            ))
        }
    };
    ctx.browser().set_cookie(Cookie {
        name: p.name,
        value: p.value,
        domain,
        path: p.path.unwrap_or_else(|| "/".to_string()),
        secure: p.secure,
        http_only: p.http_only,
        expires: p.expires,
    });
    Ok(json!({"success": true}))
}

// ── Sessions ─────────────────────────────────────────────────────────

async fn session_info(_params: Value, ctx: CommandContext) -> HandlerResult {
    Ok(json!({
        "session_id": ctx.session.id(),
        "connection_id": ctx.connection.id(),
        "connection_count": ctx.session.connection_count(),
        "tab_count": ctx.session.tab_count(),
        "created_at": ctx.session.created_at_ms(),
        "recording": ctx.session.is_recording(),
    }))
}

async fn session_close(_params: Value, ctx: CommandContext) -> HandlerResult {
    let report = ctx
        .registry
        .destroy(ctx.session.id(), DestroyReason::Closed)
        .ok_or_else(|| CommandError::SessionNotFound(ctx.session.id().to_string()))?;
    Ok(json!({
        "success": true,
        "session_id": report.session_id,
        "tabs_closed": report.tabs_closed,
    }))
}

async fn list_sessions(_params: Value, ctx: CommandContext) -> HandlerResult {
    let sessions: Vec<Value> = ctx
        .registry
        .list()
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id(),
                "connection_count": s.connection_count(),
                "tab_count": s.tab_count(),
                "created_at": s.created_at_ms(),
            })
        })
        .collect();
    Ok(Value::Array(sessions))
}

#[derive(Debug, Deserialize)]
struct FileParams {
    file_path: PathBuf,
}

/// Tab URLs and cookies exported by `session_save`.
#[derive(Debug, Serialize, Deserialize)]
struct SavedSession {
    version: u32,
    tabs: Vec<SavedTab>,
    cookies: Vec<Cookie>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedTab {
    url: String,
    #[serde(default)]
    title: String,
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CommandError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CommandError> {
    let body = tokio::fs::read(path).await.map_err(|e| {
        CommandError::handler(format!("Cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&body)
        .map_err(|e| CommandError::handler(format!("Invalid file {}: {e}", path.display())))
}

async fn session_save(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: FileParams = parse_params(params)?;
    let browser = ctx.browser();
    let tabs: Vec<SavedTab> = ctx
        .session
        .tabs()
        .iter()
        .filter_map(|id| browser.tab(id))
        .map(|tab| SavedTab {
            url: tab.url,
            title: tab.title,
        })
        .collect();
    let saved = SavedSession {
        version: 1,
        tabs,
        cookies: browser.cookies(None),
    };
    write_json(&p.file_path, &saved).await?;
    Ok(json!({
        "success": true,
        "file": p.file_path.display().to_string(),
        "tabs": saved.tabs.len(),
        "cookies": saved.cookies.len(),
    }))
}

async fn session_restore(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: FileParams = parse_params(params)?;
    let saved: SavedSession = read_json(&p.file_path).await?;

    let mut tabs_restored = 0;
    for tab in &saved.tabs {
        match open_owned_tab(&ctx, &tab.url) {
            Ok(opened) => {
                if ctx.connection.current_tab().is_none() {
                    ctx.connection.set_current_tab(Some(opened.id));
                }
                tabs_restored += 1;
            }
            Err(CommandError::SessionNotFound(id)) => return Err(CommandError::SessionNotFound(id)),
            Err(e) => tracing::warn!(session = %ctx.session.id(), url = %tab.url, "tab not restored: {e}"),
        }
    }
    let cookies_restored = saved.cookies.len();
    for cookie in saved.cookies {
        ctx.browser().set_cookie(cookie);
    }
    Ok(json!({
        "success": true,
        "tabs_restored": tabs_restored,
        "cookies_restored": cookies_restored,
    }))
}

// ── Recording ────────────────────────────────────────────────────────

async fn record_start(_params: Value, ctx: CommandContext) -> HandlerResult {
    ctx.session.start_recording();
    Ok(json!({"success": true, "recording": true}))
}

async fn record_stop(_params: Value, ctx: CommandContext) -> HandlerResult {
    let actions = ctx.session.stop_recording();
    Ok(json!({"success": true, "actions": actions}))
}

async fn record_save(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: FileParams = parse_params(params)?;
    let recording = Recording::new(ctx.session.actions());
    write_json(&p.file_path, &recording).await?;
    Ok(json!({
        "success": true,
        "file": p.file_path.display().to_string(),
        "actions": recording.actions.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct ReplayParams {
    file_path: PathBuf,
    /// Pause between actions, in seconds.
    #[serde(default)]
    delay: f64,
}

async fn record_replay(params: Value, ctx: CommandContext) -> HandlerResult {
    let p: ReplayParams = parse_params(params)?;
    let recording: Recording = read_json(&p.file_path).await?;
    let delay = Duration::try_from_secs_f64(p.delay)
        .map_err(|_| CommandError::InvalidParams(format!("bad delay: {}", p.delay)))?;

    let total = recording.actions.len();
    let mut replayed = 0;
    let mut errors = Vec::new();
    for (index, action) in recording.actions.into_iter().enumerate() {
        // Only state-changing commands are ever recorded; anything else in
        // the file (including record_replay itself) is refused.
        if !is_recorded(&action.method) {
            errors.push(json!({
                "index": index,
                "method": action.method,
                "error": format!("Method cannot be replayed: {}", action.method),
            }));
            continue;
        }
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match ctx
            .dispatcher
            .execute(&action.method, action.params, &ctx.connection)
            .await
        {
            Ok(_) => replayed += 1,
            Err(e) => errors.push(json!({
                "index": index,
                "method": action.method,
                "error": e.to_string(),
            })),
        }
    }

    let mut result = json!({
        "success": errors.is_empty(),
        "replayed": replayed,
        "total": total,
    });
    if !errors.is_empty() {
        result["errors"] = Value::Array(errors);
    }
    Ok(result)
}
