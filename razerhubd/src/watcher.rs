//! Automatic profile switching from window focus.
//!
//! The X11 backend listens for `_NET_ACTIVE_WINDOW` changes on a dedicated
//! thread and feeds focus contexts into a channel. The watcher debounces
//! bursts, resolves the settled context against profile rules in
//! definition order, and asks the store to switch. No matching rule means
//! no switch, so a manual selection stays active until a rule says
//! otherwise.

use crate::profiles::ProfileStore;
use async_trait::async_trait;
use razerhub_common::{AppContext, AppMatchRule, Profile};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ConnectionExt, EventMask, Window,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("focus backend unavailable: {0}")]
    Backend(String),
}

/// Source of focus-change events.
#[async_trait]
pub trait FocusBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Next focus change; `None` once the backend is gone.
    async fn recv(&mut self) -> Option<AppContext>;
}

x11rb::atom_manager! {
    Atoms: AtomsCookie {
        _NET_ACTIVE_WINDOW,
        _NET_WM_PID,
    }
}

/// Focus events from the X server.
pub struct X11Backend {
    events: mpsc::Receiver<AppContext>,
}

impl X11Backend {
    /// Connect to the display and start the reader thread. Fails up front
    /// when no X session is reachable so the daemon can log one clear
    /// warning and run without automatic switching.
    pub fn spawn() -> Result<Self, WatcherError> {
        let (conn, screen_num) =
            x11rb::connect(None).map_err(|e| WatcherError::Backend(e.to_string()))?;
        let (tx, rx) = mpsc::channel(32);
        std::thread::Builder::new()
            .name("razerhub-x11".to_string())
            .spawn(move || {
                if let Err(e) = watch_focus(&conn, screen_num, &tx) {
                    warn!("X11 focus watcher stopped: {}", e);
                }
            })
            .map_err(|e| WatcherError::Backend(e.to_string()))?;
        Ok(Self { events: rx })
    }
}

#[async_trait]
impl FocusBackend for X11Backend {
    fn name(&self) -> &'static str {
        "x11"
    }

    async fn recv(&mut self) -> Option<AppContext> {
        self.events.recv().await
    }
}

/// Backend fed from a plain channel, for environments where focus changes
/// come from an external integration instead of X11.
pub struct ChannelBackend {
    events: mpsc::Receiver<AppContext>,
}

impl ChannelBackend {
    pub fn new(events: mpsc::Receiver<AppContext>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl FocusBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn recv(&mut self) -> Option<AppContext> {
        self.events.recv().await
    }
}

type X11Result<T> = Result<T, Box<dyn std::error::Error>>;

fn watch_focus(
    conn: &RustConnection,
    screen_num: usize,
    tx: &mpsc::Sender<AppContext>,
) -> X11Result<()> {
    let root = conn.setup().roots[screen_num].root;
    let atoms = Atoms::new(conn)?.reply()?;
    conn.change_window_attributes(
        root,
        &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
    )?;
    conn.flush()?;
    info!("Watching X11 focus changes");

    // Report the currently focused window before the first change.
    if let Some(context) = read_context(conn, root, &atoms) {
        if tx.blocking_send(context).is_err() {
            return Ok(());
        }
    }

    loop {
        let event = conn.wait_for_event()?;
        if let Event::PropertyNotify(notify) = event {
            if notify.atom != atoms._NET_ACTIVE_WINDOW {
                continue;
            }
            if let Some(context) = read_context(conn, root, &atoms) {
                if tx.blocking_send(context).is_err() {
                    // Receiver hung up, the daemon is going away.
                    return Ok(());
                }
            }
        }
    }
}

fn read_context(conn: &RustConnection, root: Window, atoms: &Atoms) -> Option<AppContext> {
    let window = active_window(conn, root, atoms)?;
    let class = window_class(conn, window).unwrap_or_default();
    let exe = window_exe(conn, window, atoms).unwrap_or_default();
    if class.is_empty() && exe.is_empty() {
        return None;
    }
    Some(AppContext { exe, class })
}

fn active_window(conn: &RustConnection, root: Window, atoms: &Atoms) -> Option<Window> {
    let reply = conn
        .get_property(false, root, atoms._NET_ACTIVE_WINDOW, AtomEnum::WINDOW, 0, 1)
        .ok()?
        .reply()
        .ok()?;
    let window = reply.value32()?.next()?;
    if window == 0 {
        None
    } else {
        Some(window)
    }
}

/// WM_CLASS carries `instance\0class\0`; rules match against the class
/// half.
fn window_class(conn: &RustConnection, window: Window) -> Option<String> {
    let reply = conn
        .get_property(false, window, AtomEnum::WM_CLASS, AtomEnum::STRING, 0, 1024)
        .ok()?
        .reply()
        .ok()?;
    let parts: Vec<&[u8]> = reply.value.split(|&b| b == 0).filter(|p| !p.is_empty()).collect();
    let class = parts.get(1).or_else(|| parts.first())?;
    Some(String::from_utf8_lossy(class).to_string())
}

fn window_exe(conn: &RustConnection, window: Window, atoms: &Atoms) -> Option<String> {
    let reply = conn
        .get_property(false, window, atoms._NET_WM_PID, AtomEnum::CARDINAL, 0, 1)
        .ok()?
        .reply()
        .ok()?;
    let pid = reply.value32()?.next()?;
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    Some(comm.trim().to_string())
}

/// First profile whose rules match the context wins, in definition order.
pub fn resolve(profiles: &[Profile], context: &AppContext) -> Option<String> {
    profiles
        .iter()
        .find(|profile| profile.rules.iter().any(|rule| rule_matches(rule, context)))
        .map(|profile| profile.id.clone())
}

/// An empty field matches anything, but a rule must name at least one
/// pattern; both named fields have to match.
fn rule_matches(rule: &AppMatchRule, context: &AppContext) -> bool {
    if rule.exe.is_none() && rule.class.is_none() {
        return false;
    }
    let exe_ok = rule.exe.as_deref().map_or(true, |p| pattern_matches(p, &context.exe));
    let class_ok = rule
        .class
        .as_deref()
        .map_or(true, |p| pattern_matches(p, &context.class));
    exe_ok && class_ok
}

/// Regex match, falling back to a plain substring test for patterns that
/// do not parse as a regex.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(_) => value.contains(pattern),
    }
}

/// Debounces focus changes and drives the store.
pub struct AppWatcher {
    store: Arc<ProfileStore>,
    backend: Box<dyn FocusBackend>,
    enabled: Arc<AtomicBool>,
    debounce: Duration,
    last_context: Arc<RwLock<Option<AppContext>>>,
}

impl AppWatcher {
    pub fn new(
        store: Arc<ProfileStore>,
        backend: Box<dyn FocusBackend>,
        enabled: Arc<AtomicBool>,
        debounce_ms: u64,
        last_context: Arc<RwLock<Option<AppContext>>>,
    ) -> Self {
        Self {
            store,
            backend,
            enabled,
            debounce: Duration::from_millis(debounce_ms),
            last_context,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Application watcher running ({} backend, {:?} debounce)",
            self.backend.name(),
            self.debounce
        );
        while let Some(mut context) = self.backend.recv().await {
            // Collapse a burst of changes: only the context the focus
            // settles on gets resolved.
            let mut backend_closed = false;
            loop {
                match tokio::time::timeout(self.debounce, self.backend.recv()).await {
                    Ok(Some(newer)) => context = newer,
                    Ok(None) => {
                        backend_closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            *self.last_context.write().await = Some(context.clone());
            if self.enabled.load(Ordering::SeqCst) {
                self.apply(&context).await;
            }
            if backend_closed {
                break;
            }
        }
        info!("Application watcher stopped");
    }

    async fn apply(&self, context: &AppContext) {
        let profiles = self.store.list().await;
        let Some(target) = resolve(&profiles, context) else {
            debug!("No rule matches {} / {}", context.exe, context.class);
            return;
        };
        if self.store.active_id().await == target {
            return;
        }
        info!(
            "Focus moved to {} ({}), switching to profile {}",
            context.exe, context.class, target
        );
        if let Err(e) = self.store.switch_to(&target).await {
            warn!("Automatic switch to {} failed: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::engine::RemapEngine;
    use crate::macros::{MacroPlayer, MacroRecorder};
    use crate::output::testing::RecordingSink;
    use crate::output::EventSink;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    fn ctx(exe: &str, class: &str) -> AppContext {
        AppContext { exe: exe.to_string(), class: class.to_string() }
    }

    fn profile_with_rules(id: &str, rules: Vec<AppMatchRule>) -> Profile {
        Profile {
            id: id.to_string(),
            name: id.to_string(),
            mapping: Vec::new(),
            macros: Vec::new(),
            lighting: None,
            rules,
        }
    }

    #[test]
    fn first_matching_profile_wins() {
        let profiles = vec![
            Profile::passthrough_default(),
            profile_with_rules(
                "gaming",
                vec![AppMatchRule { exe: None, class: Some("Steam".into()) }],
            ),
            profile_with_rules(
                "broad",
                vec![AppMatchRule { exe: Some(".*".into()), class: None }],
            ),
        ];

        assert_eq!(resolve(&profiles, &ctx("steam", "Steam")), Some("gaming".into()));
        assert_eq!(resolve(&profiles, &ctx("firefox", "Navigator")), Some("broad".into()));
    }

    #[test]
    fn both_named_fields_must_match() {
        let rule = AppMatchRule { exe: Some("steam".into()), class: Some("Steam".into()) };
        assert!(rule_matches(&rule, &ctx("steam", "Steam")));
        assert!(!rule_matches(&rule, &ctx("steam", "Lutris")));
        assert!(!rule_matches(&rule, &ctx("lutris", "Steam")));
    }

    #[test]
    fn empty_rules_never_match() {
        assert!(!rule_matches(&AppMatchRule::default(), &ctx("steam", "Steam")));
    }

    #[test]
    fn patterns_fall_back_to_substring() {
        // Valid regex with alternation.
        assert!(pattern_matches("steam|lutris", "lutris"));
        assert!(!pattern_matches("^steam$", "proton-steam"));
        // Unbalanced paren is not a regex, substring applies.
        assert!(pattern_matches("fire(fox", "my-fire(fox-build"));
        assert!(!pattern_matches("fire(fox", "firefox"));
    }

    #[test]
    fn no_match_yields_none() {
        let profiles = vec![Profile::passthrough_default()];
        assert_eq!(resolve(&profiles, &ctx("steam", "Steam")), None);
    }

    async fn store_fixture(dir: &TempDir) -> Arc<ProfileStore> {
        let config =
            Arc::new(ConfigManager::with_base_dir(dir.path().to_path_buf()).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let failures = Arc::new(AtomicU64::new(0));
        let library = Arc::new(RwLock::new(HashMap::new()));
        let player = Arc::new(MacroPlayer::new(
            library.clone(),
            sink.clone() as Arc<dyn EventSink>,
            failures.clone(),
            8,
        ));
        let engine = Arc::new(RemapEngine::new(
            sink as Arc<dyn EventSink>,
            player,
            Arc::new(MacroRecorder::new()),
            failures,
        ));
        let store = Arc::new(ProfileStore::new(config, engine, library, None));
        store.bootstrap().await;
        store
    }

    #[tokio::test]
    async fn focus_changes_switch_profiles() {
        let dir = TempDir::new().unwrap();
        let store = store_fixture(&dir).await;
        store
            .upsert(profile_with_rules(
                "gaming",
                vec![AppMatchRule { exe: None, class: Some("Steam".into()) }],
            ))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let enabled = Arc::new(AtomicBool::new(true));
        let last = Arc::new(RwLock::new(None));
        let watcher = AppWatcher::new(
            store.clone(),
            Box::new(ChannelBackend::new(rx)),
            enabled.clone(),
            20,
            last.clone(),
        );
        let handle = tokio::spawn(watcher.run());

        tx.send(ctx("steam", "Steam")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.active_id().await, "gaming");

        // No rule matches the editor, the manual state stays.
        tx.send(ctx("code", "Code")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.active_id().await, "gaming");
        assert_eq!(last.read().await.clone(), Some(ctx("code", "Code")));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bursts_settle_on_the_last_context() {
        let dir = TempDir::new().unwrap();
        let store = store_fixture(&dir).await;
        store
            .upsert(profile_with_rules(
                "gaming",
                vec![AppMatchRule { exe: None, class: Some("Steam".into()) }],
            ))
            .await
            .unwrap();
        store
            .upsert(profile_with_rules(
                "editor",
                vec![AppMatchRule { exe: None, class: Some("Code".into()) }],
            ))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let watcher = AppWatcher::new(
            store.clone(),
            Box::new(ChannelBackend::new(rx)),
            Arc::new(AtomicBool::new(true)),
            50,
            Arc::new(RwLock::new(None)),
        );
        let handle = tokio::spawn(watcher.run());

        // Three changes inside one debounce window: only the last counts.
        tx.send(ctx("steam", "Steam")).await.unwrap();
        tx.send(ctx("firefox", "Navigator")).await.unwrap();
        tx.send(ctx("code", "Code")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.active_id().await, "editor");

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_watcher_records_context_without_switching() {
        let dir = TempDir::new().unwrap();
        let store = store_fixture(&dir).await;
        store
            .upsert(profile_with_rules(
                "gaming",
                vec![AppMatchRule { exe: None, class: Some("Steam".into()) }],
            ))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let last = Arc::new(RwLock::new(None));
        let watcher = AppWatcher::new(
            store.clone(),
            Box::new(ChannelBackend::new(rx)),
            Arc::new(AtomicBool::new(false)),
            20,
            last.clone(),
        );
        let handle = tokio::spawn(watcher.run());

        tx.send(ctx("steam", "Steam")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.active_id().await, razerhub_common::DEFAULT_PROFILE_ID);
        assert_eq!(last.read().await.clone(), Some(ctx("steam", "Steam")));

        drop(tx);
        handle.await.unwrap();
    }
}
