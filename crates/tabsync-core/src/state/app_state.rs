//! Application state tree
//!
//! The tree is immutable by convention: reducers never mutate a subtree in
//! place, they build the next one through the `with_*` constructors below.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::settings::PersistedSettings;
use crate::types::{ContextId, Timestamp};

// ----------------------------------------------------------------------------
// Feature State
// ----------------------------------------------------------------------------

/// The toggleable feature and its numeric parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureState {
    pub enabled: bool,
    pub parameter: f64,
    pub last_toggled_at: Option<Timestamp>,
}

impl FeatureState {
    pub fn from_settings(settings: &PersistedSettings) -> Self {
        Self {
            enabled: settings.feature_enabled,
            parameter: settings.parameter,
            last_toggled_at: settings.last_used,
        }
    }

    pub fn with_enabled(&self, enabled: bool, at: Timestamp) -> Self {
        Self {
            enabled,
            last_toggled_at: Some(at),
            ..self.clone()
        }
    }

    pub fn with_parameter(&self, parameter: f64) -> Self {
        Self {
            parameter,
            ..self.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Context State
// ----------------------------------------------------------------------------

/// Copy of the shared feature values held for one context
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredFlags {
    pub enabled: bool,
    pub parameter: f64,
}

/// Per-context mirror of shared state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub remote_url: String,
    pub title: String,
    pub mirrored_feature_flags: MirroredFlags,
    pub is_active_context: bool,
    pub last_synced_at: Option<Timestamp>,
    pub registered_at: Timestamp,
    pub last_activated_at: Option<Timestamp>,
}

impl ContextState {
    /// Seed a context from the current global settings
    pub fn seeded(url: String, title: String, feature: &FeatureState, at: Timestamp) -> Self {
        Self {
            remote_url: url,
            title,
            mirrored_feature_flags: MirroredFlags {
                enabled: feature.enabled,
                parameter: feature.parameter,
            },
            is_active_context: false,
            last_synced_at: None,
            registered_at: at,
            last_activated_at: None,
        }
    }

    pub fn with_active(&self, active: bool, at: Timestamp) -> Self {
        Self {
            is_active_context: active,
            last_activated_at: if active { Some(at) } else { self.last_activated_at },
            ..self.clone()
        }
    }

    pub fn with_flags(&self, flags: MirroredFlags) -> Self {
        Self {
            mirrored_feature_flags: flags,
            ..self.clone()
        }
    }

    pub fn with_location(&self, url: Option<String>, title: Option<String>) -> Self {
        Self {
            remote_url: url.unwrap_or_else(|| self.remote_url.clone()),
            title: title.unwrap_or_else(|| self.title.clone()),
            ..self.clone()
        }
    }

    pub fn with_synced_at(&self, at: Timestamp) -> Self {
        Self {
            last_synced_at: Some(at),
            ..self.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Context Registry
// ----------------------------------------------------------------------------

/// Registered contexts in insertion order plus the active one
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRegistry {
    #[serde(serialize_with = "serialize_entries")]
    contexts: Vec<(ContextId, ContextState)>,
    active_context: Option<ContextId>,
}

fn serialize_entries<S: Serializer>(
    entries: &[(ContextId, ContextState)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (id, state) in entries {
        map.serialize_entry(&id.to_string(), state)?;
    }
    map.end()
}

impl ContextRegistry {
    pub fn get(&self, id: &ContextId) -> Option<&ContextState> {
        self.contexts
            .iter()
            .find(|(key, _)| key == id)
            .map(|(_, state)| state)
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.get(id).is_some()
    }

    /// Registered ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = &ContextId> {
        self.contexts.iter().map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContextId, &ContextState)> {
        self.contexts.iter().map(|(id, state)| (id, state))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn active(&self) -> Option<ContextId> {
        self.active_context
    }

    /// Insert or replace a context, keeping its original position
    pub fn with_context(&self, id: ContextId, state: ContextState) -> Self {
        let mut contexts = self.contexts.clone();
        match contexts.iter_mut().find(|(key, _)| *key == id) {
            Some(entry) => entry.1 = state,
            None => contexts.push((id, state)),
        }
        Self {
            contexts,
            active_context: self.active_context,
        }
    }

    pub fn without_context(&self, id: &ContextId) -> Self {
        Self {
            contexts: self
                .contexts
                .iter()
                .filter(|(key, _)| key != id)
                .cloned()
                .collect(),
            active_context: self.active_context.filter(|active| active != id),
        }
    }

    /// Make `id` the only active context (or none), updating every entry flag
    pub fn with_active(&self, id: Option<ContextId>, at: Timestamp) -> Self {
        Self {
            contexts: self
                .contexts
                .iter()
                .map(|(key, state)| {
                    let active = Some(*key) == id;
                    let next = if active == state.is_active_context {
                        state.clone()
                    } else {
                        state.with_active(active, at)
                    };
                    (*key, next)
                })
                .collect(),
            active_context: id,
        }
    }

    /// Overwrite the mirrored flags of every context
    pub fn with_flags(&self, flags: MirroredFlags) -> Self {
        Self {
            contexts: self
                .contexts
                .iter()
                .map(|(key, state)| (*key, state.with_flags(flags)))
                .collect(),
            active_context: self.active_context,
        }
    }
}

// ----------------------------------------------------------------------------
// UI State
// ----------------------------------------------------------------------------

/// State of the transient UI surface
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub popup_open: bool,
    pub status_message: Option<String>,
    pub last_error: Option<String>,
}

// ----------------------------------------------------------------------------
// Application State
// ----------------------------------------------------------------------------

/// The single state tree owned by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub feature_state: FeatureState,
    pub context_registry: ContextRegistry,
    pub ui_state: UiState,
    pub settings: PersistedSettings,
}

impl Default for ApplicationState {
    fn default() -> Self {
        Self::from_settings(PersistedSettings::default())
    }
}

impl ApplicationState {
    /// Initial state hydrated from a persisted settings record
    pub fn from_settings(settings: PersistedSettings) -> Self {
        Self {
            feature_state: FeatureState::from_settings(&settings),
            context_registry: ContextRegistry::default(),
            ui_state: UiState::default(),
            settings,
        }
    }

    pub fn with_feature(&self, feature_state: FeatureState) -> Self {
        Self {
            feature_state,
            ..self.clone()
        }
    }

    pub fn with_contexts(&self, context_registry: ContextRegistry) -> Self {
        Self {
            context_registry,
            ..self.clone()
        }
    }

    pub fn with_ui(&self, ui_state: UiState) -> Self {
        Self {
            ui_state,
            ..self.clone()
        }
    }

    pub fn with_settings(&self, settings: PersistedSettings) -> Self {
        Self {
            settings,
            ..self.clone()
        }
    }

    /// Feature values as mirrored into each context
    pub fn mirrored_flags(&self) -> MirroredFlags {
        MirroredFlags {
            enabled: self.feature_state.enabled,
            parameter: self.feature_state.parameter,
        }
    }

    /// Whether settings and every context agree with the feature state
    pub fn mirrors_consistent(&self) -> bool {
        let flags = self.mirrored_flags();
        self.settings.feature_enabled == self.feature_state.enabled
            && self.settings.parameter == self.feature_state.parameter
            && self
                .context_registry
                .iter()
                .all(|(_, state)| state.mirrored_feature_flags == flags)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context(url: &str) -> ContextState {
        let feature = FeatureState::from_settings(&PersistedSettings::default());
        ContextState::seeded(url.into(), String::new(), &feature, Timestamp::new(1))
    }

    #[test]
    fn test_registry_preserves_insertion_order() {
        let registry = ContextRegistry::default()
            .with_context(ContextId::Tab(3), context("a"))
            .with_context(ContextId::Tab(1), context("b"))
            .with_context(ContextId::Tab(3), context("c"));

        let ids: Vec<_> = registry.ids().copied().collect();
        assert_eq!(ids, vec![ContextId::Tab(3), ContextId::Tab(1)]);
        assert_eq!(registry.get(&ContextId::Tab(3)).unwrap().remote_url, "c");
    }

    #[test]
    fn test_with_active_is_exclusive() {
        let registry = ContextRegistry::default()
            .with_context(ContextId::Tab(1), context("a"))
            .with_context(ContextId::Tab(2), context("b"))
            .with_active(Some(ContextId::Tab(1)), Timestamp::new(5))
            .with_active(Some(ContextId::Tab(2)), Timestamp::new(6));

        assert_eq!(registry.active(), Some(ContextId::Tab(2)));
        assert!(!registry.get(&ContextId::Tab(1)).unwrap().is_active_context);
        let second = registry.get(&ContextId::Tab(2)).unwrap();
        assert!(second.is_active_context);
        assert_eq!(second.last_activated_at, Some(Timestamp::new(6)));
    }

    #[test]
    fn test_without_active_context_clears_active() {
        let registry = ContextRegistry::default()
            .with_context(ContextId::Tab(1), context("a"))
            .with_active(Some(ContextId::Tab(1)), Timestamp::new(5))
            .without_context(&ContextId::Tab(1));
        assert!(registry.is_empty());
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn test_serialized_shape() {
        let state = ApplicationState::default().with_contexts(
            ContextRegistry::default().with_context(ContextId::Tab(9), context("https://x")),
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value["contextRegistry"]["contexts"]["tab:9"]["remoteUrl"],
            "https://x"
        );
        assert!(value["featureState"]["enabled"].is_boolean());
        assert!(value["uiState"]["popupOpen"].is_boolean());
        assert!(state.mirrors_consistent());
    }
}
