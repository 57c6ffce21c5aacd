//! Reducer
//!
//! `reduce` maps (state, action) to the next state. Every branch that touches
//! the feature flag or parameter rewrites all three copies of it: the feature
//! subtree, the settings record and the mirror held by each context.

use tracing::{debug, warn};

use super::action::Action;
use super::app_state::{ApplicationState, ContextState, UiState};
use crate::config::StoreConfig;
use crate::settings::PersistedSettings;
use crate::types::{ContextId, Timestamp};

/// Clamp a parameter into the configured bounds; non-finite values are rejected
pub fn clamp_parameter(value: f64, config: &StoreConfig) -> Option<f64> {
    if value.is_finite() {
        Some(value.clamp(config.parameter_min, config.parameter_max))
    } else {
        None
    }
}

/// Compute the next state for an action
pub fn reduce(state: &ApplicationState, action: &Action, config: &StoreConfig) -> ApplicationState {
    match action {
        Action::ToggleFeature { enabled, at } => {
            let enabled = enabled.unwrap_or(!state.feature_state.enabled);
            let settings = PersistedSettings {
                feature_enabled: enabled,
                last_used: Some(*at),
                ..state.settings.clone()
            };
            let next = state
                .with_feature(state.feature_state.with_enabled(enabled, *at))
                .with_settings(settings);
            remirror(&next)
        }

        Action::UpdateParameter { value } => match clamp_parameter(*value, config) {
            Some(parameter) => {
                let settings = PersistedSettings {
                    parameter,
                    ..state.settings.clone()
                };
                let next = state
                    .with_feature(state.feature_state.with_parameter(parameter))
                    .with_settings(settings);
                remirror(&next)
            }
            None => {
                warn!(value = %value, "Ignoring non-finite parameter update");
                state.clone()
            }
        },

        Action::RegisterContext { id, url, title, at } => {
            let registry = &state.context_registry;
            let registered = match registry.get(id) {
                Some(existing) => {
                    registry.with_context(*id, existing.with_location(Some(url.clone()), Some(title.clone())))
                }
                None => registry.with_context(
                    *id,
                    ContextState::seeded(url.clone(), title.clone(), &state.feature_state, *at),
                ),
            };
            let registered = if registered.active().is_none() {
                registered.with_active(Some(*id), *at)
            } else {
                registered
            };
            state.with_contexts(registered)
        }

        Action::UpdateContext { id, url, title } => match state.context_registry.get(id) {
            Some(existing) => state.with_contexts(
                state
                    .context_registry
                    .with_context(*id, existing.with_location(url.clone(), title.clone())),
            ),
            None => unknown_context(state, id, action),
        },

        Action::ActivateContext { id, at } => {
            if !state.context_registry.contains(id) {
                return unknown_context(state, id, action);
            }
            state.with_contexts(state.context_registry.with_active(Some(*id), *at))
        }

        Action::UnregisterContext { id, at } => {
            if !state.context_registry.contains(id) {
                return unknown_context(state, id, action);
            }
            let was_active = state.context_registry.active() == Some(*id);
            let remaining = state.context_registry.without_context(id);
            let remaining = if was_active {
                let successor = remaining.ids().next().copied();
                remaining.with_active(successor, *at)
            } else {
                remaining
            };
            state.with_contexts(remaining)
        }

        Action::MarkContextSynced { id, at } => match state.context_registry.get(id) {
            Some(existing) => state.with_contexts(
                state
                    .context_registry
                    .with_context(*id, existing.with_synced_at(*at)),
            ),
            None => unknown_context(state, id, action),
        },

        Action::LoadSettings { settings } => {
            let parameter = clamp_parameter(settings.parameter, config)
                .unwrap_or(state.feature_state.parameter);
            let settings = PersistedSettings {
                parameter,
                ..settings.clone()
            };
            let mut feature = state.feature_state.with_parameter(parameter);
            feature.enabled = settings.feature_enabled;
            feature.last_toggled_at = settings.last_used;
            remirror(&state.with_feature(feature).with_settings(settings))
        }

        Action::UpdateSettings { patch } => {
            let mut merged = state.settings.merged(patch);
            if let Some(parameter) = clamp_parameter(merged.parameter, config) {
                merged.parameter = parameter;
            } else {
                merged.parameter = state.settings.parameter;
            }
            if !patch.touches_mirrored_fields() {
                return state.with_settings(merged);
            }
            let mut feature = state.feature_state.with_parameter(merged.parameter);
            feature.enabled = merged.feature_enabled;
            remirror(&state.with_feature(feature).with_settings(merged))
        }

        Action::SetPopupOpen { open } => state.with_ui(UiState {
            popup_open: *open,
            ..state.ui_state.clone()
        }),

        Action::SetStatus { message } => state.with_ui(UiState {
            status_message: message.clone(),
            ..state.ui_state.clone()
        }),

        Action::RecordError { message } => state.with_ui(UiState {
            last_error: Some(message.clone()),
            ..state.ui_state.clone()
        }),

        Action::Reset => ApplicationState::from_settings(state.settings.clone()),

        Action::Unrecognized => {
            warn!("Unknown action type dispatched; state unchanged");
            state.clone()
        }
    }
}

/// Push the feature values into every context mirror
fn remirror(state: &ApplicationState) -> ApplicationState {
    state.with_contexts(state.context_registry.with_flags(state.mirrored_flags()))
}

fn unknown_context(state: &ApplicationState, id: &ContextId, action: &Action) -> ApplicationState {
    debug!(context = %id, action = action.action_type(), "Action for unregistered context ignored");
    state.clone()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
