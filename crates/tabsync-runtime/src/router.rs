//! Background router
//!
//! Request handlers of the privileged context. Feature changes are applied to
//! the store and then fanned out to every registered context as `STATE_SYNC`;
//! queries are answered from the current snapshot.

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use tabsync_core::{
    ActionCreator, ContextId, Message, MessageType, Registration, StateStore, TabsyncResult,
    ValidationError,
};

use crate::bus::MessageBus;
use crate::managers::TabStateManager;

/// Handler registrations of the background context
#[derive(Debug)]
pub struct BackgroundRouter {
    registrations: Vec<Registration>,
}

impl BackgroundRouter {
    /// Register the background handlers on `bus`
    pub fn install(bus: &MessageBus, store: StateStore, manager: TabStateManager) -> Self {
        let mut registrations = Vec::new();

        let fan_out = manager.clone();
        registrations.push(bus.on(MessageType::ToggleFeature, move |message| {
            let manager = fan_out.clone();
            async move { toggle_feature(&manager, &message).await }
        }));

        let fan_out = manager.clone();
        registrations.push(bus.on(MessageType::UpdateParameter, move |message| {
            let manager = fan_out.clone();
            async move { update_parameter(&manager, &message).await }
        }));

        let snapshot_store = store.clone();
        registrations.push(bus.on(MessageType::GetState, move |message| {
            let result = get_state(&snapshot_store, &message);
            async move { result }
        }));

        let lifecycle = manager;
        registrations.push(bus.on(MessageType::ContextReady, move |message| {
            let manager = lifecycle.clone();
            async move { context_ready(&manager, &message).await }
        }));

        registrations.push(bus.on(MessageType::Ping, |message| async move {
            debug!(source = %message.source, "Ping");
            Ok(Some(json!({ "pong": true })))
        }));

        info!(handlers = registrations.len(), "Background router installed");
        Self { registrations }
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.len()
    }

    /// Remove every handler this router registered
    pub fn uninstall(self) {
        for registration in self.registrations {
            registration.cancel();
        }
    }
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn toggle_feature(manager: &TabStateManager, message: &Message) -> TabsyncResult<Option<Value>> {
    let enabled = message.payload.get("enabled").and_then(Value::as_bool);
    let change = manager
        .store()
        .dispatch(ActionCreator::toggle_feature(enabled, manager.now()))?;
    let feature = &change.next.feature_state;
    info!(
        enabled = feature.enabled,
        trigger = message.payload.get("trigger").and_then(serde_json::Value::as_str).unwrap_or("api"),
        "Feature toggled"
    );

    manager.notify_all().await?;
    Ok(Some(json!({
        "enabled": feature.enabled,
        "parameter": feature.parameter,
    })))
}

async fn update_parameter(manager: &TabStateManager, message: &Message) -> TabsyncResult<Option<Value>> {
    let value = message
        .payload
        .get("value")
        .and_then(Value::as_f64)
        .ok_or_else(|| ValidationError::MissingField {
            field: "value".to_string(),
        })?;
    let change = manager
        .store()
        .dispatch(ActionCreator::update_parameter(value))?;
    let parameter = change.next.feature_state.parameter;
    debug!(requested = value, parameter, "Parameter updated");

    manager.notify_all().await?;
    Ok(Some(json!({ "parameter": parameter })))
}

fn get_state(store: &StateStore, message: &Message) -> TabsyncResult<Option<Value>> {
    let paths = message.payload.get("paths").and_then(Value::as_array);
    let Some(paths) = paths else {
        let state = store.get_state();
        return Ok(Some(serde_json::to_value(&*state)?));
    };

    let mut projected = Map::new();
    for path in paths.iter().filter_map(Value::as_str) {
        projected.insert(path.to_string(), store.select(path).unwrap_or(Value::Null));
    }
    Ok(Some(Value::Object(projected)))
}

async fn context_ready(manager: &TabStateManager, message: &Message) -> TabsyncResult<Option<Value>> {
    let ContextId::Tab(tab) = message.source else {
        return Ok(Some(json!({
            "error": format!("CONTEXT_READY from non-tab context {}", message.source),
        })));
    };
    let url = message
        .payload
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let title = message
        .payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();

    manager.register_tab(ContextId::Tab(tab), url, title).await?;
    let state = manager.store().get_state();
    Ok(Some(json!({
        "registered": true,
        "enabled": state.feature_state.enabled,
        "parameter": state.feature_state.parameter,
    })))
}
