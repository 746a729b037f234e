//! Macro playback and recording.
//!
//! Each triggered macro runs as its own task. A macro id can only have one
//! run in flight: overlapping triggers for the same id are ignored with a
//! warning while different ids play concurrently. Hold-repeat runs loop
//! until the trigger is released, finishing the pass in flight before they
//! stop. Cancellation (daemon shutdown) stops a run at the next step
//! boundary and releases any key it still holds.

use crate::output::EventSink;
use razerhub_common::{
    EventType, InputEvent, MacroDefinition, MacroStep, OutputEvent, ReplayMode,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

/// Recorded inter-event delays are clamped to this range.
pub const MIN_STEP_DELAY_MS: u32 = 10;
pub const MAX_STEP_DELAY_MS: u32 = 5000;

/// Gap used between steps whose own delay is zero, so an undelayed
/// hold-repeat macro cannot spin the sink flat out.
pub const DEFAULT_STEP_DELAY_MS: u32 = 10;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("macro {0} is already playing")]
    Conflict(String),
    #[error("macro {0} is not in the library")]
    Unknown(String),
    #[error("concurrent macro limit ({0}) reached")]
    LimitReached(usize),
    #[error("a recording session is already active")]
    RecordingActive,
    #[error("no recording session is active")]
    NotRecording,
}

struct RunningMacro {
    held: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

/// Plays macros from the shared library through the event sink.
pub struct MacroPlayer {
    library: Arc<RwLock<HashMap<String, MacroDefinition>>>,
    running: Arc<Mutex<HashMap<String, RunningMacro>>>,
    sink: Arc<dyn EventSink>,
    injection_failures: Arc<AtomicU64>,
    max_concurrent: usize,
    default_delay_ms: u32,
}

impl MacroPlayer {
    pub fn new(
        library: Arc<RwLock<HashMap<String, MacroDefinition>>>,
        sink: Arc<dyn EventSink>,
        injection_failures: Arc<AtomicU64>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            library,
            running: Arc::new(Mutex::new(HashMap::new())),
            sink,
            injection_failures,
            max_concurrent,
            default_delay_ms: DEFAULT_STEP_DELAY_MS,
        }
    }

    pub fn with_default_delay(mut self, delay_ms: u32) -> Self {
        self.default_delay_ms = delay_ms;
        self
    }

    /// Trigger key pressed. Conflicts and unknown ids are logged, never
    /// propagated: the hot path must not fail on a bad trigger.
    pub async fn trigger_press(&self, id: &str) {
        match self.start(id, true).await {
            Ok(()) => {}
            Err(MacroError::Conflict(_)) => {
                warn!("Macro {} is already playing, ignoring trigger", id);
            }
            Err(e) => warn!("Macro trigger failed: {}", e),
        }
    }

    /// Trigger key released. Ends a hold-repeat run at its next pass
    /// boundary; no-op for `Once` runs and unknown ids.
    pub async fn trigger_release(&self, id: &str) {
        let running = self.running.lock().await;
        if let Some(run) = running.get(id) {
            run.held.store(false, Ordering::SeqCst);
        }
    }

    /// Control-surface playback: one pass even for hold-repeat macros.
    pub async fn play_once(&self, id: &str) -> Result<(), MacroError> {
        self.start(id, false).await
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.running.lock().await.contains_key(id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn start(&self, id: &str, held_initial: bool) -> Result<(), MacroError> {
        let def = {
            let library = self.library.read().await;
            library
                .get(id)
                .cloned()
                .ok_or_else(|| MacroError::Unknown(id.to_string()))?
        };
        if def.steps.is_empty() {
            debug!("Macro {} has no steps", id);
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if running.contains_key(id) {
            return Err(MacroError::Conflict(id.to_string()));
        }
        if running.len() >= self.max_concurrent {
            return Err(MacroError::LimitReached(self.max_concurrent));
        }

        let held = Arc::new(AtomicBool::new(held_initial));
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        running.insert(
            id.to_string(),
            RunningMacro {
                held: held.clone(),
                cancelled: cancelled.clone(),
                cancel_notify: cancel_notify.clone(),
            },
        );
        drop(running);

        debug!("Playing macro {} ({:?})", id, def.mode);
        tokio::spawn(run_playback(
            def,
            self.sink.clone(),
            self.running.clone(),
            held,
            cancelled,
            cancel_notify,
            self.injection_failures.clone(),
            self.default_delay_ms,
        ));
        Ok(())
    }

    /// Cancel every run and wait for the tasks to drain. Cancelled runs
    /// stop at the next step boundary and release held keys, so shutdown
    /// leaves the virtual device in a neutral state.
    pub async fn shutdown(&self) {
        {
            let running = self.running.lock().await;
            if running.is_empty() {
                return;
            }
            info!("Cancelling {} running macros", running.len());
            for run in running.values() {
                run.cancelled.store(true, Ordering::SeqCst);
                // notify_one stores a permit, so a runner that is between
                // steps right now still skips its next delay instead of
                // serving it in full.
                run.cancel_notify.notify_one();
            }
        }
        for _ in 0..100 {
            if self.running.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        warn!("Some macro tasks did not stop within the shutdown deadline");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_playback(
    def: MacroDefinition,
    sink: Arc<dyn EventSink>,
    running: Arc<Mutex<HashMap<String, RunningMacro>>>,
    held: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    injection_failures: Arc<AtomicU64>,
    default_delay_ms: u32,
) {
    let mut pressed: HashSet<u16> = HashSet::new();

    'playback: loop {
        for (idx, step) in def.steps.iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                break 'playback;
            }
            if let Err(e) = sink.emit(std::slice::from_ref(&step.event)).await {
                injection_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Macro {} step dropped: {}", def.id, e);
            }
            if step.event.event_type == EventType::Key {
                match step.event.value {
                    1 => {
                        pressed.insert(step.event.code);
                    }
                    0 => {
                        pressed.remove(&step.event.code);
                    }
                    _ => {}
                }
            }
            // A zero step delay means "use the configured default". The
            // final step of a one-shot pass never sleeps; hold-repeat keeps
            // its trailing gap so the next pass is paced.
            let last = idx + 1 == def.steps.len();
            let gap_ms = if step.delay_ms > 0 { step.delay_ms } else { default_delay_ms };
            if (!last || matches!(def.mode, ReplayMode::HoldRepeat)) && gap_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(gap_ms as u64)) => {}
                    _ = cancel_notify.notified() => {}
                }
            }
        }
        match def.mode {
            ReplayMode::Once => break,
            ReplayMode::HoldRepeat => {
                if cancelled.load(Ordering::SeqCst) || !held.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    if !pressed.is_empty() {
        debug!("Macro {} left {} keys pressed, releasing", def.id, pressed.len());
        let mut left: Vec<u16> = pressed.into_iter().collect();
        left.sort_unstable();
        for code in left {
            if let Err(e) = sink.key(code, 0).await {
                injection_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Release of key {} dropped: {}", code, e);
            }
        }
    }

    running.lock().await.remove(&def.id);
}

struct RecorderState {
    id: String,
    steps: Vec<MacroStep>,
    last_timestamp_us: u64,
}

/// Captures key events observed by the engine into a new macro. The engine
/// keeps dispatching while a recording runs, so the user sees what they
/// type.
pub struct MacroRecorder {
    active: AtomicBool,
    state: Mutex<Option<RecorderState>>,
}

impl MacroRecorder {
    pub fn new() -> Self {
        Self { active: AtomicBool::new(false), state: Mutex::new(None) }
    }

    /// Cheap hot-path check so the engine skips the recorder lock entirely
    /// when nothing is being recorded.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn start(&self, id: &str) -> Result<(), MacroError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(MacroError::RecordingActive);
        }
        *state = Some(RecorderState {
            id: id.to_string(),
            steps: Vec::new(),
            last_timestamp_us: 0,
        });
        self.active.store(true, Ordering::SeqCst);
        info!("Recording macro {}", id);
        Ok(())
    }

    /// Append a key event. The delay stored on the previous step is the
    /// gap to this event, clamped to [10, 5000] ms.
    pub async fn observe(&self, event: &InputEvent) {
        if event.event_type != EventType::Key {
            return;
        }
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return;
        };
        if let Some(last) = state.steps.last_mut() {
            let gap_ms = event.timestamp_us.saturating_sub(state.last_timestamp_us) / 1000;
            last.delay_ms = u32::try_from(gap_ms)
                .unwrap_or(u32::MAX)
                .clamp(MIN_STEP_DELAY_MS, MAX_STEP_DELAY_MS);
        }
        state.steps.push(MacroStep { event: OutputEvent::from(event), delay_ms: 0 });
        state.last_timestamp_us = event.timestamp_us;
    }

    pub async fn stop(&self) -> Result<MacroDefinition, MacroError> {
        let mut guard = self.state.lock().await;
        let state = guard.take().ok_or(MacroError::NotRecording)?;
        self.active.store(false, Ordering::SeqCst);
        info!("Recorded {} steps for macro {}", state.steps.len(), state.id);
        Ok(MacroDefinition { id: state.id, steps: state.steps, mode: ReplayMode::Once })
    }
}

impl Default for MacroRecorder {
    fn default() -> Self {
        Self::new()
    }
}
