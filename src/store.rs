//! Whole-document JSON persistence for the three logical documents this
//! kernel keeps on disk: `settings`, `programs`, `run_state`.
//!
//! Writes are temp-file + rename, the same crash-safety discipline a
//! `VACUUM INTO` snapshot-then-swap gets you for a database file. A corrupt
//! or unreadable document is logged once and replaced with its typed
//! default; for `Settings` specifically, a document missing top-level keys
//! is upgraded in place (defaults filled in, then re-saved).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{KernelError, KernelResult};

// ---------------------------------------------------------------------------
// Settings document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiCredentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl Default for WifiCredentials {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApConfig {
    #[serde(default = "default_ap_ssid")]
    pub ssid: String,
    #[serde(default = "default_ap_password")]
    pub password: String,
}

fn default_ap_ssid() -> String {
    "IrrigationSystem".to_string()
}

fn default_ap_password() -> String {
    "12345678".to_string()
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            ssid: default_ap_ssid(),
            password: default_ap_password(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyRelayConfig {
    #[serde(default = "default_safety_relay_pin")]
    pub pin: u8,
}

fn default_safety_relay_pin() -> u8 {
    13
}

impl Default for SafetyRelayConfig {
    fn default() -> Self {
        Self {
            pin: default_safety_relay_pin(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ZoneVisibility {
    Show,
    Hide,
}

impl ZoneVisibility {
    pub fn is_visible(self) -> bool {
        matches!(self, ZoneVisibility::Show)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneConfig {
    pub id: u32,
    pub name: String,
    pub pin: u8,
    #[serde(default = "default_zone_status")]
    pub status: ZoneVisibility,
}

fn default_zone_status() -> ZoneVisibility {
    ZoneVisibility::Show
}

fn default_zones() -> Vec<ZoneConfig> {
    (0..8u32)
        .map(|i| ZoneConfig {
            id: i,
            name: format!("Zone {}", i + 1),
            pin: 14 + i as u8,
            status: ZoneVisibility::Show,
        })
        .collect()
}

fn default_max_active_zones() -> u32 {
    3
}

fn default_activation_delay() -> u32 {
    5
}

fn default_max_zone_duration() -> u32 {
    180
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub client_enabled: bool,
    #[serde(default)]
    pub wifi: WifiCredentials,
    #[serde(default)]
    pub ap: ApConfig,
    #[serde(default = "default_zones")]
    pub zones: Vec<ZoneConfig>,
    #[serde(default = "default_max_active_zones")]
    pub max_active_zones: u32,
    #[serde(default = "default_activation_delay")]
    pub activation_delay: u32,
    #[serde(default)]
    pub safety_relay: SafetyRelayConfig,
    #[serde(default)]
    pub automatic_programs_enabled: bool,
    #[serde(default = "default_max_zone_duration")]
    pub max_zone_duration: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_enabled: false,
            wifi: WifiCredentials::default(),
            ap: ApConfig::default(),
            zones: default_zones(),
            max_active_zones: default_max_active_zones(),
            activation_delay: default_activation_delay(),
            safety_relay: SafetyRelayConfig::default(),
            automatic_programs_enabled: false,
            max_zone_duration: default_max_zone_duration(),
        }
    }
}

impl Settings {
    pub fn zone(&self, zone_id: u32) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.id == zone_id)
    }
}

// ---------------------------------------------------------------------------
// Program document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramStep {
    pub zone_id: u32,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "recurrence", rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    EveryOtherDay,
    Custom { interval_days: u32 },
}

impl Recurrence {
    /// `interval_days` clamped to >= 1 — a zero interval would never skip.
    pub fn interval_days(&self) -> u32 {
        match self {
            Recurrence::Daily => 1,
            Recurrence::EveryOtherDay => 2,
            Recurrence::Custom { interval_days } => (*interval_days).max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub months: BTreeSet<u8>,
    #[serde(flatten)]
    pub recurrence: Recurrence,
    pub activation_time: String,
    pub steps: Vec<ProgramStep>,
    #[serde(default)]
    pub last_run_date: Option<String>,
}

pub type ProgramsDocument = BTreeMap<String, Program>;

/// Next numeric id to allocate, given the current program map: max existing
/// numeric id + 1, starting at 1 when empty. Ids are stringified but
/// compared numerically.
pub fn next_program_id(programs: &ProgramsDocument) -> String {
    let max = programs
        .keys()
        .filter_map(|k| k.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

// ---------------------------------------------------------------------------
// Run-state document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub program_running: bool,
    pub current_program_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

const SETTINGS_FILE: &str = "user_settings.json";
const PROGRAMS_FILE: &str = "program.json";
const RUN_STATE_FILE: &str = "program_state.json";

#[derive(Clone)]
pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    async fn ensure_dir(&self) -> KernelResult<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| KernelError::io(format!("create data dir {}: {e}", self.data_dir.display())))
    }

    /// Whole-document replace: write to `<name>.tmp`, then rename over the
    /// final path so readers never observe a torn write.
    async fn write_atomic(&self, file: &str, bytes: &[u8]) -> KernelResult<()> {
        self.ensure_dir().await?;
        let final_path = self.path(file);
        let tmp_path = self.path(&format!("{file}.tmp"));
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| KernelError::io(format!("write {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| KernelError::io(format!("rename {} -> {}: {e}", tmp_path.display(), final_path.display())))
    }

    async fn read_raw(&self, file: &str) -> Option<Vec<u8>> {
        match tokio::fs::read(self.path(file)).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                error!(file, "failed to read document: {e}");
                None
            }
        }
    }

    // -- settings ------------------------------------------------------

    /// Load settings, filling in factory defaults for any missing top-level
    /// key and re-saving if the document was upgraded. A corrupt document is
    /// logged once and replaced outright with the factory default.
    pub async fn load_settings(&self) -> Settings {
        let Some(bytes) = self.read_raw(SETTINGS_FILE).await else {
            let defaults = Settings::default();
            if let Err(e) = self.save_settings(&defaults).await {
                error!("failed to write default settings: {e}");
            }
            return defaults;
        };

        let raw: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                error!("settings document corrupt, replacing with factory defaults: {e}");
                let defaults = Settings::default();
                let _ = self.save_settings(&defaults).await;
                return defaults;
            }
        };

        let settings: Settings = match serde_json::from_value(raw.clone()) {
            Ok(s) => s,
            Err(e) => {
                error!("settings document invalid, replacing with factory defaults: {e}");
                let defaults = Settings::default();
                let _ = self.save_settings(&defaults).await;
                return defaults;
            }
        };

        if document_missing_keys(&raw, &Settings::default()) {
            warn!("settings document missing keys — upgrading with defaults");
            if let Err(e) = self.save_settings(&settings).await {
                error!("failed to persist upgraded settings: {e}");
            }
        }

        settings
    }

    pub async fn save_settings(&self, settings: &Settings) -> KernelResult<()> {
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| KernelError::Internal(format!("serialize settings: {e}")))?;
        self.write_atomic(SETTINGS_FILE, &bytes).await
    }

    // -- programs --------------------------------------------------------

    pub async fn load_programs(&self) -> ProgramsDocument {
        let Some(bytes) = self.read_raw(PROGRAMS_FILE).await else {
            return ProgramsDocument::new();
        };
        match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                error!("programs document corrupt, replacing with empty map: {e}");
                ProgramsDocument::new()
            }
        }
    }

    pub async fn save_programs(&self, programs: &ProgramsDocument) -> KernelResult<()> {
        let bytes = serde_json::to_vec_pretty(programs)
            .map_err(|e| KernelError::Internal(format!("serialize programs: {e}")))?;
        self.write_atomic(PROGRAMS_FILE, &bytes).await
    }

    // -- run state ---------------------------------------------------------

    pub async fn load_run_state(&self) -> RunState {
        let Some(bytes) = self.read_raw(RUN_STATE_FILE).await else {
            return RunState::default();
        };
        match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                error!("run-state document corrupt, replacing with idle default: {e}");
                RunState::default()
            }
        }
    }

    pub async fn save_run_state(&self, state: &RunState) -> KernelResult<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| KernelError::Internal(format!("serialize run state: {e}")))?;
        self.write_atomic(RUN_STATE_FILE, &bytes).await
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// True if `raw` (as loaded from disk) is missing any top-level key present
/// in the typed default's own serialization — i.e. the on-disk document is a
/// partial settings file that needs upgrading.
fn document_missing_keys(raw: &serde_json::Value, default: &Settings) -> bool {
    let (Some(raw_obj), Ok(default_value)) = (raw.as_object(), serde_json::to_value(default)) else {
        return true;
    };
    let Some(default_obj) = default_value.as_object() else {
        return true;
    };
    default_obj.keys().any(|k| !raw_obj.contains_key(k))
}
