//! Persisted settings record
//!
//! The storage collaborator owns persistence; this crate only defines the flat
//! record it reads and writes and the partial update applied by the store.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Version string written into fresh settings records
pub const SETTINGS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default keyboard shortcut for the feature toggle
pub const DEFAULT_SHORTCUT: &str = "Alt+T";

/// Flat key-value record kept by the storage collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSettings {
    pub feature_enabled: bool,
    pub parameter: f64,
    pub shortcut_key: String,
    pub last_used: Option<Timestamp>,
    pub version: String,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            feature_enabled: false,
            parameter: 0.5,
            shortcut_key: DEFAULT_SHORTCUT.to_string(),
            last_used: None,
            version: SETTINGS_VERSION.to_string(),
        }
    }
}

impl PersistedSettings {
    /// Apply a partial update, returning the merged record
    pub fn merged(&self, patch: &SettingsPatch) -> Self {
        Self {
            feature_enabled: patch.feature_enabled.unwrap_or(self.feature_enabled),
            parameter: patch.parameter.unwrap_or(self.parameter),
            shortcut_key: patch
                .shortcut_key
                .clone()
                .unwrap_or_else(|| self.shortcut_key.clone()),
            last_used: patch.last_used.or(self.last_used),
            version: self.version.clone(),
        }
    }
}

/// Partial settings update; absent fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub feature_enabled: Option<bool>,
    pub parameter: Option<f64>,
    pub shortcut_key: Option<String>,
    pub last_used: Option<Timestamp>,
}

impl SettingsPatch {
    /// Whether the patch touches a field mirrored into feature state
    pub fn touches_mirrored_fields(&self) -> bool {
        self.feature_enabled.is_some() || self.parameter.is_some()
    }
}
