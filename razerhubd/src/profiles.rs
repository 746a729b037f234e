//! Profile and macro library management.
//!
//! The store owns the ordered profile list and the macro library, validates
//! every mutation, and drives activation through the engine. Write
//! operations serialize on a switch lock so concurrent switches cannot
//! interleave; the engine itself only ever sees complete dispatch tables.

use crate::config::{valid_id, ConfigManager};
use crate::engine::{DispatchTable, RemapEngine};
use crate::lighting::LightingBridge;
use razerhub_common::{MacroDefinition, Profile, TargetAction, DEFAULT_PROFILE_ID};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("profile {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },
    #[error("{0}")]
    Refused(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Owns profiles and macros; all mutations go through here.
pub struct ProfileStore {
    profiles: RwLock<Vec<Profile>>,
    library: Arc<RwLock<HashMap<String, MacroDefinition>>>,
    engine: Arc<RemapEngine>,
    lighting: Option<Arc<LightingBridge>>,
    config: Arc<ConfigManager>,
    /// Serializes activation and every profile/macro mutation.
    switch_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(
        config: Arc<ConfigManager>,
        engine: Arc<RemapEngine>,
        library: Arc<RwLock<HashMap<String, MacroDefinition>>>,
        lighting: Option<Arc<LightingBridge>>,
    ) -> Self {
        Self {
            profiles: RwLock::new(Vec::new()),
            library,
            engine,
            lighting,
            config,
            switch_lock: Mutex::new(()),
        }
    }

    /// Load everything from disk and activate the persisted profile, or the
    /// built-in pass-through default when the pointer is missing or stale.
    pub async fn bootstrap(&self) {
        let _guard = self.switch_lock.lock().await;
        {
            let fresh = self.config.load_macros();
            *self.library.write().await = fresh;
        }
        self.load_profiles_from_disk().await;

        let target = self
            .config
            .read_active_pointer()
            .unwrap_or_else(|| DEFAULT_PROFILE_ID.to_string());
        if let Err(e) = self.activate(&target).await {
            warn!(
                "Stored active profile {} is unusable ({}), using {}",
                target, e, DEFAULT_PROFILE_ID
            );
            if let Err(e) = self.activate(DEFAULT_PROFILE_ID).await {
                warn!("Could not activate the default profile: {}", e);
            }
        }

        let profiles = self.profiles.read().await.len();
        let macros = self.library.read().await.len();
        info!("Loaded {} profiles and {} macros", profiles, macros);
    }

    /// Rebuild the in-memory profile list from disk. The built-in default
    /// sits at the front of the list; a `default.yaml` on disk replaces its
    /// content but not its position. Profiles that fail validation are
    /// skipped with a warning.
    async fn load_profiles_from_disk(&self) {
        let loaded = self.config.load_profiles();
        let mut default = Profile::passthrough_default();
        let mut rest = Vec::new();
        for profile in loaded {
            if profile.id == DEFAULT_PROFILE_ID {
                default = profile;
            } else {
                rest.push(profile);
            }
        }
        let mut profiles = Vec::with_capacity(rest.len() + 1);
        profiles.push(default);
        profiles.extend(rest);

        {
            let library = self.library.read().await;
            profiles.retain(|profile| match validate(profile, &library) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping profile: {}", e);
                    false
                }
            });
        }
        // An invalid default.yaml must not cost us the built-in fallback.
        if !profiles.iter().any(|p| p.id == DEFAULT_PROFILE_ID) {
            profiles.insert(0, Profile::passthrough_default());
        }
        *self.profiles.write().await = profiles;
    }

    pub async fn list(&self) -> Vec<Profile> {
        self.profiles.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Profile> {
        self.profiles.read().await.iter().find(|p| p.id == id).cloned()
    }

    pub async fn active_id(&self) -> String {
        self.engine.active_profile_id().await
    }

    pub async fn profile_count(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn macro_count(&self) -> usize {
        self.library.read().await.len()
    }

    /// Library contents sorted by id for stable listings.
    pub async fn macros(&self) -> Vec<MacroDefinition> {
        let library = self.library.read().await;
        let mut defs: Vec<MacroDefinition> = library.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Activate a profile. On any error the previously active profile keeps
    /// dispatching.
    pub async fn switch_to(&self, id: &str) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        self.activate(id).await
    }

    /// Activation body shared by `switch_to`, `bootstrap`, and `reload`.
    /// The caller must hold `switch_lock`.
    async fn activate(&self, id: &str) -> Result<(), ProfileError> {
        let profile = self
            .get(id)
            .await
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        {
            let library = self.library.read().await;
            validate(&profile, &library)?;
        }

        let table = DispatchTable::build(&profile);
        self.engine.apply(&profile.id, table).await;
        if let Err(e) = self.config.write_active_pointer(&profile.id) {
            warn!("Failed to persist the active profile pointer: {}", e);
        }
        info!("Activated profile {} ({})", profile.id, profile.name);
        self.push_lighting(&profile);
        Ok(())
    }

    /// Validate, store, and persist a profile. Replacing the active profile
    /// rebuilds and re-applies its dispatch table.
    pub async fn upsert(&self, profile: Profile) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        {
            let library = self.library.read().await;
            validate(&profile, &library)?;
        }
        self.config
            .save_profile(&profile)
            .map_err(|e| ProfileError::Storage(e.to_string()))?;

        let was_active = self.engine.active_profile_id().await == profile.id;
        {
            let mut profiles = self.profiles.write().await;
            match profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(slot) => *slot = profile.clone(),
                None => profiles.push(profile.clone()),
            }
        }
        if was_active {
            self.engine.apply(&profile.id, DispatchTable::build(&profile)).await;
            self.push_lighting(&profile);
            debug!("Active profile {} updated in place", profile.id);
        }
        Ok(())
    }

    /// Delete a stored profile. The active profile and the built-in default
    /// are refused.
    pub async fn remove(&self, id: &str) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        if id == DEFAULT_PROFILE_ID {
            return Err(ProfileError::Refused(
                "the built-in default profile cannot be deleted".to_string(),
            ));
        }
        if self.engine.active_profile_id().await == id {
            return Err(ProfileError::Refused(format!(
                "profile {} is active, switch away before deleting it",
                id
            )));
        }
        let removed = {
            let mut profiles = self.profiles.write().await;
            let before = profiles.len();
            profiles.retain(|p| p.id != id);
            profiles.len() != before
        };
        if !removed {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        self.config
            .delete_profile(id)
            .map_err(|e| ProfileError::Storage(e.to_string()))?;
        info!("Deleted profile {}", id);
        Ok(())
    }

    pub async fn upsert_macro(&self, def: MacroDefinition) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        if !valid_id(&def.id) {
            return Err(ProfileError::Invalid {
                id: def.id.clone(),
                reason: "macro id must be non-empty alphanumeric with - or _".to_string(),
            });
        }
        if def.steps.is_empty() {
            return Err(ProfileError::Invalid {
                id: def.id.clone(),
                reason: "a macro needs at least one step".to_string(),
            });
        }
        let snapshot = {
            let mut library = self.library.write().await;
            library.insert(def.id.clone(), def);
            library.clone()
        };
        self.config
            .save_macros(&snapshot)
            .map_err(|e| ProfileError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete a macro. Refused while any profile declares it.
    pub async fn remove_macro(&self, id: &str) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        {
            let profiles = self.profiles.read().await;
            if let Some(user) = profiles.iter().find(|p| p.macros.iter().any(|m| m == id)) {
                return Err(ProfileError::Refused(format!(
                    "macro {} is referenced by profile {}",
                    id, user.id
                )));
            }
        }
        let snapshot = {
            let mut library = self.library.write().await;
            if library.remove(id).is_none() {
                return Err(ProfileError::NotFound(id.to_string()));
            }
            library.clone()
        };
        self.config
            .save_macros(&snapshot)
            .map_err(|e| ProfileError::Storage(e.to_string()))?;
        info!("Deleted macro {}", id);
        Ok(())
    }

    /// Re-read profiles and macros from disk. The active profile stays
    /// active when it survives the reload; otherwise the store falls back
    /// to the default. The switch lock is held across the whole reload, so
    /// a switch that landed first is what the reload re-activates, and one
    /// that arrives later sees the fully rebuilt store.
    pub async fn reload(&self) -> Result<(), ProfileError> {
        let _guard = self.switch_lock.lock().await;
        {
            let fresh = self.config.load_macros();
            *self.library.write().await = fresh;
        }
        let previous = self.engine.active_profile_id().await;
        self.load_profiles_from_disk().await;

        if self.activate(&previous).await.is_err() {
            warn!(
                "Profile {} did not survive the reload, using {}",
                previous, DEFAULT_PROFILE_ID
            );
            self.activate(DEFAULT_PROFILE_ID).await?;
        }
        info!(
            "Configuration reloaded ({} profiles, {} macros)",
            self.profiles.read().await.len(),
            self.library.read().await.len()
        );
        Ok(())
    }

    fn push_lighting(&self, profile: &Profile) {
        let Some(bridge) = &self.lighting else { return };
        let Some(config) = profile.lighting.clone() else { return };
        let bridge = bridge.clone();
        let profile_id = profile.id.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.apply(&config).await {
                warn!("Lighting for profile {} skipped: {}", profile_id, e);
            }
        });
    }
}

/// A profile is accepted only if every mapping source is unique, every
/// macro reference is declared and resolvable, and every app rule names at
/// least one pattern.
fn validate(
    profile: &Profile,
    library: &HashMap<String, MacroDefinition>,
) -> Result<(), ProfileError> {
    let invalid = |reason: String| ProfileError::Invalid { id: profile.id.clone(), reason };

    if !valid_id(&profile.id) {
        return Err(invalid("id must be non-empty alphanumeric with - or _".to_string()));
    }
    if profile.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    for macro_id in &profile.macros {
        if !library.contains_key(macro_id) {
            return Err(invalid(format!("declared macro {} is not in the library", macro_id)));
        }
    }
    let declared: HashSet<&str> = profile.macros.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    for entry in &profile.mapping {
        if !seen.insert(entry.source) {
            return Err(invalid(format!("duplicate mapping for key code {}", entry.source)));
        }
        if let TargetAction::Macro(macro_id) = &entry.action {
            if !declared.contains(macro_id.as_str()) {
                return Err(invalid(format!("macro {} is not declared by the profile", macro_id)));
            }
        }
    }
    for rule in &profile.rules {
        if rule.exe.is_none() && rule.class.is_none() {
            return Err(invalid("application rule without exe or class".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::{MacroPlayer, MacroRecorder};
    use crate::output::testing::RecordingSink;
    use crate::output::EventSink;
    use razerhub_common::{
        AppMatchRule, MacroStep, MappingEntry, OutputEvent, ReplayMode,
    };
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    struct Fixture {
        store: ProfileStore,
        config: Arc<ConfigManager>,
        _dir: TempDir,
    }

    async fn store_over(base: std::path::PathBuf) -> (ProfileStore, Arc<ConfigManager>) {
        let config = Arc::new(ConfigManager::with_base_dir(base).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let failures = Arc::new(AtomicU64::new(0));
        let library = Arc::new(RwLock::new(HashMap::new()));
        let player = Arc::new(MacroPlayer::new(
            library.clone(),
            sink.clone() as Arc<dyn EventSink>,
            failures.clone(),
            8,
        ));
        let recorder = Arc::new(MacroRecorder::new());
        let engine = Arc::new(RemapEngine::new(
            sink as Arc<dyn EventSink>,
            player,
            recorder,
            failures,
        ));
        let store = ProfileStore::new(config.clone(), engine, library, None);
        store.bootstrap().await;
        (store, config)
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let (store, config) = store_over(dir.path().to_path_buf()).await;
        Fixture { store, config, _dir: dir }
    }

    fn gaming_profile() -> Profile {
        Profile {
            id: "gaming".into(),
            name: "Gaming".into(),
            mapping: vec![MappingEntry { source: 58, action: TargetAction::Remap(29) }],
            macros: Vec::new(),
            lighting: None,
            rules: Vec::new(),
        }
    }

    fn burst_macro() -> MacroDefinition {
        MacroDefinition {
            id: "burst".into(),
            steps: vec![MacroStep { event: OutputEvent::key(30, 1), delay_ms: 0 }],
            mode: ReplayMode::Once,
        }
    }

    #[tokio::test]
    async fn bootstrap_provides_the_default_profile() {
        let f = fixture().await;
        let profiles = f.store.list().await;
        assert_eq!(profiles[0].id, DEFAULT_PROFILE_ID);
        assert_eq!(f.store.active_id().await, DEFAULT_PROFILE_ID);
    }

    #[tokio::test]
    async fn switching_to_unknown_profile_keeps_state() {
        let f = fixture().await;
        match f.store.switch_to("ghost").await {
            Err(ProfileError::NotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected not-found, got {:?}", other.err()),
        }
        assert_eq!(f.store.active_id().await, DEFAULT_PROFILE_ID);
    }

    #[tokio::test]
    async fn saved_profiles_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = store_over(dir.path().to_path_buf()).await;
            store.upsert(gaming_profile()).await.unwrap();
            store.switch_to("gaming").await.unwrap();
            assert_eq!(store.active_id().await, "gaming");
        }

        // A fresh store over the same directory picks up both the profile
        // and the active pointer.
        let (store, _) = store_over(dir.path().to_path_buf()).await;
        assert_eq!(store.active_id().await, "gaming");
        assert!(store.get("gaming").await.is_some());
    }

    #[tokio::test]
    async fn validation_rejects_bad_profiles() {
        let f = fixture().await;

        let mut dup = gaming_profile();
        dup.mapping.push(MappingEntry { source: 58, action: TargetAction::Suppress });
        assert!(matches!(f.store.upsert(dup).await, Err(ProfileError::Invalid { .. })));

        let mut undeclared = gaming_profile();
        undeclared.mapping =
            vec![MappingEntry { source: 275, action: TargetAction::Macro("burst".into()) }];
        assert!(matches!(
            f.store.upsert(undeclared).await,
            Err(ProfileError::Invalid { .. })
        ));

        let mut missing = gaming_profile();
        missing.macros = vec!["burst".into()];
        missing.mapping =
            vec![MappingEntry { source: 275, action: TargetAction::Macro("burst".into()) }];
        assert!(matches!(
            f.store.upsert(missing).await,
            Err(ProfileError::Invalid { .. })
        ));

        let mut empty_rule = gaming_profile();
        empty_rule.rules = vec![AppMatchRule::default()];
        assert!(matches!(
            f.store.upsert(empty_rule).await,
            Err(ProfileError::Invalid { .. })
        ));

        // Nothing was stored.
        assert!(f.store.get("gaming").await.is_none());
    }

    #[tokio::test]
    async fn macro_backed_profile_is_accepted_once_the_macro_exists() {
        let f = fixture().await;
        f.store.upsert_macro(burst_macro()).await.unwrap();

        let mut profile = gaming_profile();
        profile.macros = vec!["burst".into()];
        profile.mapping =
            vec![MappingEntry { source: 275, action: TargetAction::Macro("burst".into()) }];
        f.store.upsert(profile).await.unwrap();
        f.store.switch_to("gaming").await.unwrap();
        assert_eq!(f.store.active_id().await, "gaming");
    }

    #[tokio::test]
    async fn active_and_default_profiles_cannot_be_deleted() {
        let f = fixture().await;
        assert!(matches!(
            f.store.remove(DEFAULT_PROFILE_ID).await,
            Err(ProfileError::Refused(_))
        ));

        f.store.upsert(gaming_profile()).await.unwrap();
        f.store.switch_to("gaming").await.unwrap();
        assert!(matches!(f.store.remove("gaming").await, Err(ProfileError::Refused(_))));

        f.store.switch_to(DEFAULT_PROFILE_ID).await.unwrap();
        f.store.remove("gaming").await.unwrap();
        assert!(f.store.get("gaming").await.is_none());
        assert!(matches!(
            f.store.remove("gaming").await,
            Err(ProfileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn referenced_macros_cannot_be_deleted() {
        let f = fixture().await;
        f.store.upsert_macro(burst_macro()).await.unwrap();

        let mut profile = gaming_profile();
        profile.macros = vec!["burst".into()];
        f.store.upsert(profile.clone()).await.unwrap();
        assert!(matches!(
            f.store.remove_macro("burst").await,
            Err(ProfileError::Refused(_))
        ));

        profile.macros.clear();
        f.store.upsert(profile).await.unwrap();
        f.store.remove_macro("burst").await.unwrap();
        assert_eq!(f.store.macro_count().await, 0);
        assert!(matches!(
            f.store.remove_macro("burst").await,
            Err(ProfileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_macros_are_rejected() {
        let f = fixture().await;
        let hollow = MacroDefinition {
            id: "hollow".into(),
            steps: Vec::new(),
            mode: ReplayMode::Once,
        };
        assert!(matches!(
            f.store.upsert_macro(hollow).await,
            Err(ProfileError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn reload_falls_back_when_the_active_profile_disappears() {
        let f = fixture().await;
        f.store.upsert(gaming_profile()).await.unwrap();
        f.store.switch_to("gaming").await.unwrap();

        std::fs::remove_file(f.config.base_dir().join("profiles").join("gaming.yaml"))
            .unwrap();
        f.store.reload().await.unwrap();

        assert_eq!(f.store.active_id().await, DEFAULT_PROFILE_ID);
        assert!(f.store.get("gaming").await.is_none());
    }

    #[tokio::test]
    async fn reload_picks_up_profiles_written_behind_the_store() {
        let f = fixture().await;
        f.config
            .save_profile(&Profile {
                id: "editor".into(),
                name: "Editor".into(),
                mapping: Vec::new(),
                macros: Vec::new(),
                lighting: None,
                rules: Vec::new(),
            })
            .unwrap();

        f.store.reload().await.unwrap();
        assert!(f.store.get("editor").await.is_some());
        assert_eq!(f.store.active_id().await, DEFAULT_PROFILE_ID);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reload_serializes_with_concurrent_switches() {
        let dir = TempDir::new().unwrap();
        let (store, config) = store_over(dir.path().to_path_buf()).await;
        let store = Arc::new(store);
        store.upsert(gaming_profile()).await.unwrap();
        let mut editor = gaming_profile();
        editor.id = "editor".into();
        editor.name = "Editor".into();
        store.upsert(editor).await.unwrap();

        let mut tasks = Vec::new();
        for round in 0..8 {
            let id = if round % 2 == 0 { "gaming" } else { "editor" };
            let switcher = store.clone();
            tasks.push(tokio::spawn(async move { switcher.switch_to(id).await }));
            let reloader = store.clone();
            tasks.push(tokio::spawn(async move { reloader.reload().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // However the tasks interleaved, the engine and the persisted
        // pointer must name the same profile, and it must still exist.
        let active = store.active_id().await;
        assert_eq!(config.read_active_pointer().as_deref(), Some(active.as_str()));
        assert!(store.get(&active).await.is_some());
    }
}
