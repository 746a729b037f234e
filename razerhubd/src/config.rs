//! On-disk configuration.
//!
//! Everything lives under a per-user directory (`$XDG_CONFIG_HOME/razerhub`
//! or `~/.config/razerhub`):
//!
//! - `config.yaml`: daemon settings, seeded with defaults on first run
//! - `profiles/<id>.yaml`: one file per profile
//! - `active-profile`: id of the profile to activate at startup
//! - `macros.yaml`: the macro library, with `macros.cache` as a bincode
//!   fast-load cache
//!
//! Profile files name keys through the shared schema table, so a mapping
//! reads like:
//!
//! ```yaml
//! id: gaming
//! name: Gaming
//! mapping:
//!   - key: CAPSLOCK
//!     action: { type: remap, key: CTRL }
//!   - key: MOUSE_SIDE
//!     action: { type: macro, id: burst }
//! macros: [burst]
//! rules:
//!   - class: steam
//! ```

use razerhub_common::{
    keymap, AppMatchRule, LightingConfig, MacroDefinition, MappingEntry, Profile, TargetAction,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MACRO_CACHE_MAGIC: u32 = 0x5248_4231;

/// Daemon settings, every field defaulted so a partial or missing
/// `config.yaml` still yields a working daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub daemon: DaemonSection,
    pub devices: DeviceSection,
    pub reconnect: ReconnectSection,
    pub watcher: WatcherSection,
    pub lighting: LightingSection,
    pub macros: MacroSection,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            daemon: DaemonSection::default(),
            devices: DeviceSection::default(),
            reconnect: ReconnectSection::default(),
            watcher: WatcherSection::default(),
            lighting: LightingSection::default(),
            macros: MacroSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Overrides the session socket path when set.
    pub socket_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self { socket_path: None, log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// USB vendor id to grab; 0 grabs every event device.
    pub vendor_filter: u16,
    pub event_queue_size: usize,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self { vendor_filter: 0x1532, event_queue_size: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self { initial_delay_ms: 250, max_delay_ms: 5000, max_attempts: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub enabled: bool,
    pub backend: String,
    pub debounce_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self { enabled: true, backend: "x11".to_string(), debounce_ms: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingSection {
    pub enabled: bool,
}

impl Default for LightingSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroSection {
    pub max_concurrent: usize,
    /// Gap inserted between steps that carry no delay of their own.
    pub default_delay_ms: u32,
}

impl Default for MacroSection {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_delay_ms: 10,
        }
    }
}

/// `$XDG_CONFIG_HOME/razerhub`, falling back to `~/.config/razerhub`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return Path::new(&dir).join("razerhub");
        }
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    Path::new(&home).join(".config").join("razerhub")
}

/// Is `id` safe to use as a file stem?
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Owns the config directory layout and all file I/O. All methods take
/// `&self`; callers serialize writes through the profile store.
#[derive(Debug)]
pub struct ConfigManager {
    base_dir: PathBuf,
    profiles_dir: PathBuf,
    macros_path: PathBuf,
    cache_path: PathBuf,
    active_path: PathBuf,
    settings: DaemonSettings,
}

impl ConfigManager {
    pub fn new() -> io::Result<Self> {
        Self::with_base_dir(default_config_dir())
    }

    pub fn with_base_dir(base_dir: PathBuf) -> io::Result<Self> {
        let profiles_dir = base_dir.join("profiles");
        std::fs::create_dir_all(&profiles_dir)?;
        let config_path = base_dir.join("config.yaml");
        let settings = Self::load_settings(&config_path);
        let manager = Self {
            macros_path: base_dir.join("macros.yaml"),
            cache_path: base_dir.join("macros.cache"),
            active_path: base_dir.join("active-profile"),
            base_dir,
            profiles_dir,
            settings,
        };
        if !config_path.exists() {
            manager.seed_default_settings(&config_path);
        }
        Ok(manager)
    }

    fn load_settings(path: &Path) -> DaemonSettings {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", path.display(), e);
                    DaemonSettings::default()
                }
            },
            Err(_) => DaemonSettings::default(),
        }
    }

    fn seed_default_settings(&self, path: &Path) {
        match serde_yaml::to_string(&self.settings) {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    warn!("Could not seed {}: {}", path.display(), e);
                } else {
                    info!("Wrote default settings to {}", path.display());
                }
            }
            Err(e) => warn!("Could not encode default settings: {}", e),
        }
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Control socket path: explicit setting, else the session default.
    pub fn socket_path(&self) -> PathBuf {
        self.settings
            .daemon
            .socket_path
            .clone()
            .unwrap_or_else(razerhub_common::ipc_client::resolve_socket_path)
    }

    /// Load every profile file, sorted by file name so definition order is
    /// stable across restarts. Files that fail to parse or resolve are
    /// skipped with a warning.
    pub fn load_profiles(&self) -> Vec<Profile> {
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.profiles_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
                .collect(),
            Err(e) => {
                warn!("Cannot read {}: {}", self.profiles_dir.display(), e);
                return Vec::new();
            }
        };
        paths.sort();

        let mut profiles = Vec::new();
        for path in paths {
            match self.load_profile_file(&path) {
                Ok(profile) => profiles.push(profile),
                Err(reason) => warn!("Skipping {}: {}", path.display(), reason),
            }
        }
        profiles
    }

    fn load_profile_file(&self, path: &Path) -> Result<Profile, String> {
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let file: ProfileFile = serde_yaml::from_str(&text).map_err(|e| e.to_string())?;
        decode_profile(file)
    }

    pub fn save_profile(&self, profile: &Profile) -> io::Result<()> {
        if !valid_id(&profile.id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("profile id {:?} is not filesystem-safe", profile.id),
            ));
        }
        let text = serde_yaml::to_string(&encode_profile(profile))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = self.profiles_dir.join(format!("{}.yaml", profile.id));
        std::fs::write(&path, text)?;
        debug!("Saved profile {} to {}", profile.id, path.display());
        Ok(())
    }

    pub fn delete_profile(&self, id: &str) -> io::Result<()> {
        if !valid_id(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("profile id {:?} is not filesystem-safe", id),
            ));
        }
        let path = self.profiles_dir.join(format!("{}.yaml", id));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn read_active_pointer(&self) -> Option<String> {
        let id = std::fs::read_to_string(&self.active_path).ok()?;
        let id = id.trim().to_string();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    pub fn write_active_pointer(&self, id: &str) -> io::Result<()> {
        std::fs::write(&self.active_path, id)
    }

    /// Load the macro library: bincode cache first, YAML as the source of
    /// truth when the cache is missing, stale, or corrupt.
    pub fn load_macros(&self) -> HashMap<String, MacroDefinition> {
        if let Some(macros) = self.load_macro_cache() {
            debug!("Loaded {} macros from cache", macros.len());
            return macros;
        }
        let defs: Vec<MacroDefinition> = match std::fs::read_to_string(&self.macros_path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(defs) => defs,
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", self.macros_path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        let macros: HashMap<String, MacroDefinition> =
            defs.into_iter().map(|d| (d.id.clone(), d)).collect();
        if !macros.is_empty() {
            if let Err(e) = self.write_macro_cache(&macros) {
                debug!("Could not rebuild macro cache: {}", e);
            }
        }
        macros
    }

    fn load_macro_cache(&self) -> Option<HashMap<String, MacroDefinition>> {
        // A macros.yaml written after the cache (hand edits included) wins.
        let cache_mtime = std::fs::metadata(&self.cache_path).ok()?.modified().ok();
        let yaml_mtime = std::fs::metadata(&self.macros_path)
            .and_then(|m| m.modified())
            .ok();
        if let (Some(cache), Some(yaml)) = (cache_mtime, yaml_mtime) {
            if yaml > cache {
                debug!("Macro cache is older than macros.yaml, rebuilding");
                return None;
            }
        }
        let bytes = std::fs::read(&self.cache_path).ok()?;
        if bytes.len() < 4 {
            return None;
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MACRO_CACHE_MAGIC {
            warn!("Macro cache has wrong magic, rebuilding from YAML");
            return None;
        }
        let defs: Vec<MacroDefinition> = bincode::deserialize(&bytes[4..]).ok()?;
        Some(defs.into_iter().map(|d| (d.id.clone(), d)).collect())
    }

    pub fn save_macros(&self, macros: &HashMap<String, MacroDefinition>) -> io::Result<()> {
        let mut defs: Vec<&MacroDefinition> = macros.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        let text = serde_yaml::to_string(&defs)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.macros_path, text)?;
        self.write_macro_cache(macros)
    }

    fn write_macro_cache(&self, macros: &HashMap<String, MacroDefinition>) -> io::Result<()> {
        let mut defs: Vec<&MacroDefinition> = macros.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        let payload = bincode::serialize(&defs)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut bytes = MACRO_CACHE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        std::fs::write(&self.cache_path, bytes)
    }
}

/// Persisted form of a profile, with key codes as schema names.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileFile {
    id: String,
    name: String,
    #[serde(default)]
    mapping: Vec<MappingFileEntry>,
    #[serde(default)]
    macros: Vec<String>,
    #[serde(default)]
    lighting: Option<LightingConfig>,
    #[serde(default)]
    rules: Vec<AppMatchRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingFileEntry {
    key: String,
    action: ActionFile,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ActionFile {
    PassThrough,
    Remap { key: String },
    Macro { id: String },
    Suppress,
}

fn decode_profile(file: ProfileFile) -> Result<Profile, String> {
    let mut mapping = Vec::with_capacity(file.mapping.len());
    for entry in file.mapping {
        let source = keymap::code_for(&entry.key)
            .ok_or_else(|| format!("unknown key name {:?}", entry.key))?;
        let action = match entry.action {
            ActionFile::PassThrough => TargetAction::PassThrough,
            ActionFile::Remap { key } => {
                let code = keymap::code_for(&key)
                    .ok_or_else(|| format!("unknown key name {:?}", key))?;
                TargetAction::Remap(code)
            }
            ActionFile::Macro { id } => TargetAction::Macro(id),
            ActionFile::Suppress => TargetAction::Suppress,
        };
        mapping.push(MappingEntry { source, action });
    }
    Ok(Profile {
        id: file.id,
        name: file.name,
        mapping,
        macros: file.macros,
        lighting: file.lighting,
        rules: file.rules,
    })
}

fn encode_profile(profile: &Profile) -> ProfileFile {
    let mapping = profile
        .mapping
        .iter()
        .map(|entry| MappingFileEntry {
            key: keymap::name_for(entry.source),
            action: match &entry.action {
                TargetAction::PassThrough => ActionFile::PassThrough,
                TargetAction::Remap(code) => ActionFile::Remap { key: keymap::name_for(*code) },
                TargetAction::Macro(id) => ActionFile::Macro { id: id.clone() },
                TargetAction::Suppress => ActionFile::Suppress,
            },
        })
        .collect();
    ProfileFile {
        id: profile.id.clone(),
        name: profile.name.clone(),
        mapping,
        macros: profile.macros.clone(),
        lighting: profile.lighting.clone(),
        rules: profile.rules.clone(),
    }
}
