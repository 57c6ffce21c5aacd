//! Actions and their creators
//!
//! An action is the `{type, payload}` record consumed by one `dispatch` call.
//! Action types outside the closed set parse to `Unrecognized`, which the
//! reducer ignores.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::{PersistedSettings, SettingsPatch};
use crate::types::{ContextId, Timestamp};

// ----------------------------------------------------------------------------
// Action
// ----------------------------------------------------------------------------

/// State transition request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Set the feature flag, or flip it when `enabled` is absent
    ToggleFeature {
        enabled: Option<bool>,
        at: Timestamp,
    },
    /// Set the feature parameter (clamped by the reducer)
    UpdateParameter { value: f64 },
    RegisterContext {
        id: ContextId,
        url: String,
        title: String,
        at: Timestamp,
    },
    /// The context navigated or changed its title
    UpdateContext {
        id: ContextId,
        url: Option<String>,
        title: Option<String>,
    },
    ActivateContext { id: ContextId, at: Timestamp },
    /// Remove a context; `at` stamps the activation of any promoted successor
    UnregisterContext { id: ContextId, at: Timestamp },
    MarkContextSynced { id: ContextId, at: Timestamp },
    /// Replace settings with a record read from storage
    LoadSettings { settings: PersistedSettings },
    UpdateSettings { patch: SettingsPatch },
    SetPopupOpen { open: bool },
    SetStatus { message: Option<String> },
    RecordError { message: String },
    /// Back to defaults, keeping the current settings record
    Reset,
    #[serde(skip_deserializing)]
    Unrecognized,
}

/// Untyped `{type, payload}` record as received from another context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    /// Every action type the reducer understands
    pub const KNOWN_TYPES: [&'static str; 13] = [
        "TOGGLE_FEATURE",
        "UPDATE_PARAMETER",
        "REGISTER_CONTEXT",
        "UPDATE_CONTEXT",
        "ACTIVATE_CONTEXT",
        "UNREGISTER_CONTEXT",
        "MARK_CONTEXT_SYNCED",
        "LOAD_SETTINGS",
        "UPDATE_SETTINGS",
        "SET_POPUP_OPEN",
        "SET_STATUS",
        "RECORD_ERROR",
        "RESET",
    ];

    /// Wire name of the action type
    pub fn action_type(&self) -> &'static str {
        match self {
            Action::ToggleFeature { .. } => "TOGGLE_FEATURE",
            Action::UpdateParameter { .. } => "UPDATE_PARAMETER",
            Action::RegisterContext { .. } => "REGISTER_CONTEXT",
            Action::UpdateContext { .. } => "UPDATE_CONTEXT",
            Action::ActivateContext { .. } => "ACTIVATE_CONTEXT",
            Action::UnregisterContext { .. } => "UNREGISTER_CONTEXT",
            Action::MarkContextSynced { .. } => "MARK_CONTEXT_SYNCED",
            Action::LoadSettings { .. } => "LOAD_SETTINGS",
            Action::UpdateSettings { .. } => "UPDATE_SETTINGS",
            Action::SetPopupOpen { .. } => "SET_POPUP_OPEN",
            Action::SetStatus { .. } => "SET_STATUS",
            Action::RecordError { .. } => "RECORD_ERROR",
            Action::Reset => "RESET",
            Action::Unrecognized => "UNRECOGNIZED",
        }
    }

    /// Parse an action record received as JSON
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Self::from_record(serde_json::from_str(raw)?)
    }

    /// Type an untyped record; unknown types become `Unrecognized`
    pub fn from_record(record: ActionRecord) -> Result<Self, serde_json::Error> {
        if !Self::KNOWN_TYPES.contains(&record.action_type.as_str()) {
            return Ok(Action::Unrecognized);
        }
        serde_json::from_value(serde_json::json!({
            "type": record.action_type,
            "payload": record.payload,
        }))
    }

    /// The context an action is about, if any
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            Action::RegisterContext { id, .. }
            | Action::UpdateContext { id, .. }
            | Action::ActivateContext { id, .. }
            | Action::UnregisterContext { id, .. }
            | Action::MarkContextSynced { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Action Creator
// ----------------------------------------------------------------------------

/// Factory functions producing typed actions
pub struct ActionCreator;

impl ActionCreator {
    /// `at` is recorded as `settings.lastUsed`
    pub fn toggle_feature(enabled: Option<bool>, at: Timestamp) -> Action {
        Action::ToggleFeature { enabled, at }
    }

    pub fn update_parameter(value: f64) -> Action {
        Action::UpdateParameter { value }
    }

    pub fn register_context<U: Into<String>, T: Into<String>>(
        id: ContextId,
        url: U,
        title: T,
        at: Timestamp,
    ) -> Action {
        Action::RegisterContext {
            id,
            url: url.into(),
            title: title.into(),
            at,
        }
    }

    pub fn update_context(id: ContextId, url: Option<String>, title: Option<String>) -> Action {
        Action::UpdateContext { id, url, title }
    }

    pub fn activate_context(id: ContextId, at: Timestamp) -> Action {
        Action::ActivateContext { id, at }
    }

    pub fn unregister_context(id: ContextId, at: Timestamp) -> Action {
        Action::UnregisterContext { id, at }
    }

    pub fn mark_context_synced(id: ContextId, at: Timestamp) -> Action {
        Action::MarkContextSynced { id, at }
    }

    pub fn load_settings(settings: PersistedSettings) -> Action {
        Action::LoadSettings { settings }
    }

    pub fn update_settings(patch: SettingsPatch) -> Action {
        Action::UpdateSettings { patch }
    }

    pub fn set_popup_open(open: bool) -> Action {
        Action::SetPopupOpen { open }
    }

    pub fn set_status(message: Option<String>) -> Action {
        Action::SetStatus { message }
    }

    pub fn record_error<T: Into<String>>(message: T) -> Action {
        Action::RecordError {
            message: message.into(),
        }
    }

    pub fn reset() -> Action {
        Action::Reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_record_layout() {
        let action = ActionCreator::update_parameter(0.3);
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value, json!({ "type": "UPDATE_PARAMETER", "payload": { "value": 0.3 } }));

        let action = ActionCreator::activate_context(ContextId::Tab(4), Timestamp::new(10));
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["payload"]["id"], "tab:4");
    }

    #[test]
    fn test_unknown_action_type_parses_as_unrecognized() {
        let action = Action::from_json(r#"{"type":"LAUNCH_ROCKETS","payload":{"count":3}}"#).unwrap();
        assert_eq!(action, Action::Unrecognized);
    }

    #[test]
    fn test_known_action_parses() {
        let action = Action::from_json(r#"{"type":"SET_POPUP_OPEN","payload":{"open":true}}"#).unwrap();
        assert_eq!(action, ActionCreator::set_popup_open(true));
        assert_eq!(Action::from_json(r#"{"type":"RESET"}"#).unwrap(), Action::Reset);
    }

    #[test]
    fn test_known_action_with_bad_payload_fails() {
        assert!(Action::from_json(r#"{"type":"SET_POPUP_OPEN","payload":{"open":"yes"}}"#).is_err());
    }

    #[test]
    fn test_known_types_cover_every_variant() {
        for name in Action::KNOWN_TYPES {
            assert_ne!(name, Action::Unrecognized.action_type());
        }
        assert!(Action::KNOWN_TYPES.contains(&ActionCreator::reset().action_type()));
    }

    #[test]
    fn test_context_id_extraction() {
        assert_eq!(
            ActionCreator::unregister_context(ContextId::Tab(2), Timestamp::new(1)).context_id(),
            Some(ContextId::Tab(2))
        );
        assert_eq!(ActionCreator::reset().context_id(), None);
    }
}
