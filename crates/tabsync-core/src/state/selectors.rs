//! Read-side helpers over the state tree
//!
//! Paths are dotted field names over the serialized (camelCase) tree, for
//! example `featureState.enabled` or `contextRegistry.contexts.tab:3.title`.
//! Array elements are addressed by decimal index. The empty path selects the
//! whole tree.

use serde_json::Value;

use super::app_state::{ApplicationState, ContextState};
use crate::types::ContextId;

/// Walk a dotted path through a JSON value
pub fn project<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Serialized projection of the state at `path`, `None` when the path is absent
pub fn select_path(state: &ApplicationState, path: &str) -> Option<Value> {
    let tree = serde_json::to_value(state).ok()?;
    project(&tree, path).cloned()
}

pub fn active_context(state: &ApplicationState) -> Option<ContextId> {
    state.context_registry.active()
}

pub fn context<'a>(state: &'a ApplicationState, id: &ContextId) -> Option<&'a ContextState> {
    state.context_registry.get(id)
}

pub fn registered_count(state: &ApplicationState) -> usize {
    state.context_registry.len()
}

pub fn is_feature_enabled(state: &ApplicationState) -> bool {
    state.feature_state.enabled
}

pub fn parameter(state: &ApplicationState) -> f64 {
    state.feature_state.parameter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::state::action::ActionCreator;
    use crate::state::reducer::reduce;
    use crate::types::Timestamp;
    use serde_json::json;

    #[test]
    fn test_project_walks_objects_and_arrays() {
        let value = json!({ "a": { "b": [10, { "c": true }] } });
        assert_eq!(project(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(project(&value, "a.b.1.c"), Some(&json!(true)));
        assert_eq!(project(&value, "a.x"), None);
        assert_eq!(project(&value, "a.b.7"), None);
        assert_eq!(project(&value, ""), Some(&value));
    }

    #[test]
    fn test_select_context_fields() {
        let state = reduce(
            &ApplicationState::default(),
            &ActionCreator::register_context(ContextId::Tab(3), "https://v", "Video", Timestamp::new(1)),
            &StoreConfig::default(),
        );
        assert_eq!(
            select_path(&state, "contextRegistry.contexts.tab:3.title"),
            Some(json!("Video"))
        );
        assert_eq!(
            select_path(&state, "contextRegistry.activeContext"),
            Some(json!("tab:3"))
        );
        assert_eq!(active_context(&state), Some(ContextId::Tab(3)));
        assert_eq!(registered_count(&state), 1);
        assert!(context(&state, &ContextId::Tab(3)).is_some());
        assert!(!is_feature_enabled(&state));
        assert_eq!(parameter(&state), 0.5);
    }
}
