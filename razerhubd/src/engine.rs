//! Event dispatch: the hot path between grabbed devices and the virtual
//! output.
//!
//! The engine resolves every key event against an immutable dispatch table.
//! Profile switches build a fresh table and swap it in atomically, so a
//! single event is only ever interpreted by one profile. Keys the virtual
//! device still holds are released before the swap to keep remapped keys
//! from sticking across profiles.

use crate::macros::{MacroPlayer, MacroRecorder};
use crate::output::EventSink;
use razerhub_common::{
    InputEvent, OutputEvent, Profile, TargetAction, DEFAULT_PROFILE_ID, EventType,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Key code to action lookup, built once per profile activation and never
/// mutated afterwards.
pub struct DispatchTable {
    entries: HashMap<u16, TargetAction>,
}

impl DispatchTable {
    /// Table with no mappings: everything passes through.
    pub fn passthrough() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Build the lookup from a profile's mapping. Duplicate sources keep
    /// the first entry.
    pub fn build(profile: &Profile) -> Self {
        let mut entries = HashMap::with_capacity(profile.mapping.len());
        for entry in &profile.mapping {
            if entries.contains_key(&entry.source) {
                warn!(
                    "Profile {}: duplicate mapping for key {}, keeping the first",
                    profile.id, entry.source
                );
                continue;
            }
            entries.insert(entry.source, entry.action.clone());
        }
        Self { entries }
    }

    pub fn resolve(&self, code: u16) -> &TargetAction {
        self.entries.get(&code).unwrap_or(&TargetAction::PassThrough)
    }

    pub fn mapped_keys(&self) -> usize {
        self.entries.len()
    }
}

/// The profile the engine currently dispatches with.
pub struct ActiveState {
    pub profile_id: String,
    pub table: DispatchTable,
}

/// Resolves input events against the active dispatch table and drives the
/// sink, the macro player, and the recorder.
pub struct RemapEngine {
    active: RwLock<Arc<ActiveState>>,
    sink: Arc<dyn EventSink>,
    player: Arc<MacroPlayer>,
    recorder: Arc<MacroRecorder>,
    /// Keys currently pressed on the virtual device by pass-through or
    /// remap dispatch. Macro-held keys are tracked by their own runs.
    held_outputs: Mutex<HashSet<u16>>,
    injection_failures: Arc<AtomicU64>,
}

impl RemapEngine {
    pub fn new(
        sink: Arc<dyn EventSink>,
        player: Arc<MacroPlayer>,
        recorder: Arc<MacroRecorder>,
        injection_failures: Arc<AtomicU64>,
    ) -> Self {
        Self {
            active: RwLock::new(Arc::new(ActiveState {
                profile_id: DEFAULT_PROFILE_ID.to_string(),
                table: DispatchTable::passthrough(),
            })),
            sink,
            player,
            recorder,
            held_outputs: Mutex::new(HashSet::new()),
            injection_failures,
        }
    }

    pub async fn active_profile_id(&self) -> String {
        self.active.read().await.profile_id.clone()
    }

    /// Install a new dispatch table. The table guard is held across the
    /// release sweep and the swap: dispatch in flight finishes under the
    /// old table before the sweep starts, and no event resolves until the
    /// new table is in, so a press cannot slip back into the held set
    /// between the two.
    pub async fn apply(&self, profile_id: &str, table: DispatchTable) {
        let mut active = self.active.write().await;
        self.release_all().await;
        let mapped = table.mapped_keys();
        *active = Arc::new(ActiveState { profile_id: profile_id.to_string(), table });
        debug!("Dispatch table for {} installed ({} mapped keys)", profile_id, mapped);
    }

    /// Release every key the engine is holding on the virtual device.
    pub async fn release_all(&self) {
        let held: Vec<u16> = {
            let mut guard = self.held_outputs.lock().await;
            let mut codes: Vec<u16> = guard.drain().collect();
            codes.sort_unstable();
            codes
        };
        for code in held {
            if let Err(e) = self.sink.key(code, 0).await {
                self.injection_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Release of key {} dropped: {}", code, e);
            }
        }
    }

    pub async fn handle_event(&self, event: &InputEvent) {
        match event.event_type {
            // The virtual device appends its own SYN_REPORT per write.
            EventType::Sync => {}
            EventType::Key => self.handle_key(event).await,
            EventType::Relative => self.forward(event).await,
            EventType::Absolute | EventType::Other(_) => {
                trace!(
                    "Dropping unhandled event type {:?} (code {})",
                    event.event_type, event.code
                );
            }
        }
    }

    async fn handle_key(&self, event: &InputEvent) {
        if self.recorder.is_active() {
            self.recorder.observe(event).await;
        }
        // Held until the dispatch is done, held-tracking included, so a
        // concurrent `apply` cannot interleave its release sweep with us.
        let state = self.active.read().await;
        match state.table.resolve(event.code) {
            TargetAction::PassThrough => self.emit_key(event.code, event.value).await,
            TargetAction::Remap(target) => self.emit_key(*target, event.value).await,
            TargetAction::Suppress => {
                trace!("Suppressed key {} (value {})", event.code, event.value);
            }
            TargetAction::Macro(id) => match event.value {
                1 => self.player.trigger_press(id).await,
                0 => self.player.trigger_release(id).await,
                // Auto-repeat of a trigger key is consumed, not replayed.
                _ => {}
            },
        }
    }

    async fn emit_key(&self, code: u16, value: i32) {
        {
            let mut held = self.held_outputs.lock().await;
            match value {
                1 => {
                    held.insert(code);
                }
                0 => {
                    held.remove(&code);
                }
                _ => {}
            }
        }
        if let Err(e) = self.sink.key(code, value).await {
            self.injection_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Key injection failed: {}", e);
        }
    }

    async fn forward(&self, event: &InputEvent) {
        if let Err(e) = self.sink.emit(&[OutputEvent::from(event)]).await {
            self.injection_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Event injection failed: {}", e);
        }
    }

    /// Drain the device channel until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InputEvent>) {
        debug!("Dispatch loop started");
        while let Some(event) = events.recv().await {
            self.handle_event(&event).await;
        }
        debug!("Dispatch loop stopped: input channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::RecordingSink;
    use crate::output::InjectionError;
    use async_trait::async_trait;
    use razerhub_common::{MacroDefinition, MacroStep, MappingEntry, ReplayMode};
    use std::time::Duration;

    fn key_event(code: u16, value: i32) -> InputEvent {
        InputEvent {
            device_id: "/dev/input/event5".into(),
            event_type: EventType::Key,
            code,
            value,
            timestamp_us: 0,
        }
    }

    fn profile_with(mapping: Vec<MappingEntry>) -> Profile {
        Profile { mapping, ..Profile::passthrough_default() }
    }

    struct Fixture {
        engine: Arc<RemapEngine>,
        player: Arc<MacroPlayer>,
        recorder: Arc<MacroRecorder>,
        sink: Arc<RecordingSink>,
        failures: Arc<AtomicU64>,
    }

    fn fixture(macros: Vec<MacroDefinition>) -> Fixture {
        let sink = Arc::new(RecordingSink::new());
        let failures = Arc::new(AtomicU64::new(0));
        let library = Arc::new(RwLock::new(
            macros.into_iter().map(|d| (d.id.clone(), d)).collect(),
        ));
        let player = Arc::new(MacroPlayer::new(
            library,
            sink.clone() as Arc<dyn EventSink>,
            failures.clone(),
            8,
        ));
        let recorder = Arc::new(MacroRecorder::new());
        let engine = Arc::new(RemapEngine::new(
            sink.clone() as Arc<dyn EventSink>,
            player.clone(),
            recorder.clone(),
            failures.clone(),
        ));
        Fixture { engine, player, recorder, sink, failures }
    }

    async fn wait_player_idle(player: &MacroPlayer) {
        for _ in 0..200 {
            if player.running_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("macro player did not go idle");
    }

    #[tokio::test]
    async fn passthrough_forwards_keys_and_motion() {
        let f = fixture(vec![]);

        f.engine.handle_event(&key_event(30, 1)).await;
        f.engine.handle_event(&key_event(30, 0)).await;
        f.engine
            .handle_event(&InputEvent {
                device_id: "/dev/input/event5".into(),
                event_type: EventType::Relative,
                code: 8,
                value: -1,
                timestamp_us: 0,
            })
            .await;
        // Sync markers and absolute axes are dropped.
        f.engine
            .handle_event(&InputEvent {
                device_id: "/dev/input/event5".into(),
                event_type: EventType::Sync,
                code: 0,
                value: 0,
                timestamp_us: 0,
            })
            .await;
        f.engine
            .handle_event(&InputEvent {
                device_id: "/dev/input/event5".into(),
                event_type: EventType::Absolute,
                code: 0,
                value: 128,
                timestamp_us: 0,
            })
            .await;

        assert_eq!(
            f.sink.take(),
            vec![
                OutputEvent::key(30, 1),
                OutputEvent::key(30, 0),
                OutputEvent { event_type: EventType::Relative, code: 8, value: -1 },
            ]
        );
    }

    #[tokio::test]
    async fn remap_preserves_press_values() {
        let f = fixture(vec![]);
        let profile = profile_with(vec![MappingEntry {
            source: 58,
            action: TargetAction::Remap(29),
        }]);
        f.engine.apply(&profile.id, DispatchTable::build(&profile)).await;

        for value in [1, 2, 0] {
            f.engine.handle_event(&key_event(58, value)).await;
        }

        assert_eq!(
            f.sink.take(),
            vec![
                OutputEvent::key(29, 1),
                OutputEvent::key(29, 2),
                OutputEvent::key(29, 0),
            ]
        );
    }

    #[tokio::test]
    async fn suppressed_keys_emit_nothing() {
        let f = fixture(vec![]);
        let profile =
            profile_with(vec![MappingEntry { source: 1, action: TargetAction::Suppress }]);
        f.engine.apply(&profile.id, DispatchTable::build(&profile)).await;

        f.engine.handle_event(&key_event(1, 1)).await;
        f.engine.handle_event(&key_event(1, 0)).await;

        assert!(f.sink.take().is_empty());
    }

    #[tokio::test]
    async fn macro_trigger_consumes_the_key() {
        let f = fixture(vec![MacroDefinition {
            id: "burst".into(),
            steps: vec![
                MacroStep { event: OutputEvent::key(30, 1), delay_ms: 0 },
                MacroStep { event: OutputEvent::key(30, 0), delay_ms: 0 },
            ],
            mode: ReplayMode::Once,
        }]);
        let profile = profile_with(vec![MappingEntry {
            source: 275,
            action: TargetAction::Macro("burst".into()),
        }]);
        f.engine.apply(&profile.id, DispatchTable::build(&profile)).await;

        f.engine.handle_event(&key_event(275, 1)).await;
        f.engine.handle_event(&key_event(275, 2)).await;
        f.engine.handle_event(&key_event(275, 0)).await;
        wait_player_idle(&f.player).await;

        let events = f.sink.take();
        assert_eq!(
            events,
            vec![OutputEvent::key(30, 1), OutputEvent::key(30, 0)],
            "trigger key must not leak and repeat must not replay"
        );
    }

    #[tokio::test]
    async fn switch_releases_held_keys_first() {
        let f = fixture(vec![]);
        let caps_to_ctrl = profile_with(vec![MappingEntry {
            source: 58,
            action: TargetAction::Remap(29),
        }]);
        f.engine
            .apply(&caps_to_ctrl.id, DispatchTable::build(&caps_to_ctrl))
            .await;

        f.engine.handle_event(&key_event(58, 1)).await;
        f.engine.apply(DEFAULT_PROFILE_ID, DispatchTable::passthrough()).await;
        // The physical release now resolves under the new table.
        f.engine.handle_event(&key_event(58, 0)).await;

        assert_eq!(
            f.sink.take(),
            vec![
                OutputEvent::key(29, 1),
                OutputEvent::key(29, 0),
                OutputEvent::key(58, 0),
            ]
        );
        assert_eq!(f.engine.active_profile_id().await, DEFAULT_PROFILE_ID);
    }

    /// Forwards to a recording sink but stalls on key releases, stretching
    /// the release sweep of a switch so concurrent dispatch has a wide
    /// window to race into.
    struct SlowReleaseSink {
        inner: Arc<RecordingSink>,
    }

    #[async_trait]
    impl EventSink for SlowReleaseSink {
        async fn emit(&self, events: &[OutputEvent]) -> Result<(), InjectionError> {
            for event in events {
                if event.event_type == EventType::Key && event.value == 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
            self.inner.emit(events).await
        }
    }

    #[tokio::test]
    async fn press_during_switch_resolves_after_the_swap() {
        let recording = Arc::new(RecordingSink::new());
        let sink: Arc<dyn EventSink> =
            Arc::new(SlowReleaseSink { inner: recording.clone() });
        let failures = Arc::new(AtomicU64::new(0));
        let player = Arc::new(MacroPlayer::new(
            Arc::new(RwLock::new(HashMap::new())),
            sink.clone(),
            failures.clone(),
            8,
        ));
        let engine = Arc::new(RemapEngine::new(
            sink,
            player,
            Arc::new(MacroRecorder::new()),
            failures,
        ));

        let remap = profile_with(vec![MappingEntry {
            source: 30,
            action: TargetAction::Remap(48),
        }]);
        engine.apply(&remap.id, DispatchTable::build(&remap)).await;
        engine.handle_event(&key_event(30, 1)).await;

        let switcher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .apply(DEFAULT_PROFILE_ID, DispatchTable::passthrough())
                    .await;
            })
        };
        // Land a second press inside the stalled release sweep. It must
        // wait for the swap and resolve as pass-through, not re-enter the
        // held set under the outgoing table.
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.handle_event(&key_event(30, 1)).await;
        switcher.await.unwrap();
        engine.handle_event(&key_event(30, 0)).await;

        assert_eq!(
            recording.take(),
            vec![
                OutputEvent::key(48, 1),
                OutputEvent::key(48, 0),
                OutputEvent::key(30, 1),
                OutputEvent::key(30, 0),
            ]
        );
        // Nothing is left held from the outgoing profile.
        engine.apply(DEFAULT_PROFILE_ID, DispatchTable::passthrough()).await;
        assert!(recording.take().is_empty());
    }

    #[tokio::test]
    async fn injection_failures_are_counted() {
        let f = fixture(vec![]);
        f.sink.set_failing(true);

        f.engine.handle_event(&key_event(30, 1)).await;
        f.engine
            .handle_event(&InputEvent {
                device_id: "/dev/input/event5".into(),
                event_type: EventType::Relative,
                code: 0,
                value: 3,
                timestamp_us: 0,
            })
            .await;

        assert_eq!(f.failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn recording_taps_dispatched_keys() {
        let f = fixture(vec![]);
        f.recorder.start("captured").await.unwrap();

        f.engine.handle_event(&key_event(30, 1)).await;
        f.engine.handle_event(&key_event(30, 0)).await;

        let def = f.recorder.stop().await.unwrap();
        assert_eq!(def.steps.len(), 2);
        // Dispatch keeps flowing while a recording is active.
        assert_eq!(
            f.sink.take(),
            vec![OutputEvent::key(30, 1), OutputEvent::key(30, 0)]
        );
    }

    #[tokio::test]
    async fn channel_loop_dispatches_until_closed() {
        let f = fixture(vec![]);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(f.engine.clone().run(rx));

        tx.send(key_event(30, 1)).await.unwrap();
        tx.send(key_event(30, 0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            f.sink.take(),
            vec![OutputEvent::key(30, 1), OutputEvent::key(30, 0)]
        );
    }
}
