//! Loopback simulation
//!
//! Wires a background runtime, a popup and `tabs` tab runtimes onto one
//! [`LoopbackNetwork`], lets the tabs announce themselves, applies the popup
//! actions and waits for every tab mirror to match the background state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tabsync_core::{
    ActionCreator, ApplicationState, ContextId, MessageType, TabsyncConfig, Timestamp,
};
use tabsync_harness::{LoopbackNetwork, MemorySettingsStorage, NetworkStats};
use tabsync_runtime::{BusStats, MessageBus, RuntimeBuilder, RuntimeHandle, SendOptions};

use crate::error::{CliError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the simulated popup does once the tabs are registered
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    pub tabs: u32,
    pub toggle: bool,
    pub parameter: Option<f64>,
}

/// Last snapshot a tab received, as the tab sees it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabMirror {
    pub context: String,
    pub enabled: bool,
    pub parameter: f64,
    pub is_active: bool,
    pub snapshots: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub delivered: u64,
    pub lost: u64,
    pub unreachable: u64,
}

impl From<NetworkStats> for NetworkSummary {
    fn from(stats: NetworkStats) -> Self {
        Self {
            delivered: stats.delivered,
            lost: stats.lost,
            unreachable: stats.unreachable,
        }
    }
}

/// Final state of a simulation run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub converged: bool,
    pub background: ApplicationState,
    pub tabs: Vec<TabMirror>,
    pub bus: BusStats,
    pub network: NetworkSummary,
}

struct SimulatedTab {
    runtime: RuntimeHandle,
    mirror: Arc<Mutex<TabMirror>>,
}

/// Run the scenario and report what every context ended up with
pub async fn simulate(config: TabsyncConfig, options: SimulationOptions) -> Result<SimulationReport> {
    if let Some(parameter) = options.parameter {
        if !parameter.is_finite() {
            return Err(CliError::InvalidArgument(format!(
                "parameter must be a finite number, got {parameter}"
            )));
        }
    }
    config.validate()?;

    let network = LoopbackNetwork::new();
    let storage = Arc::new(MemorySettingsStorage::new());

    let mut background = RuntimeBuilder::new(ContextId::Background)
        .with_config(config.clone())
        .with_transport(network.endpoint(ContextId::Background))
        .with_settings_storage(storage.clone())
        .build_and_start()
        .await?;
    attach(&network, background.bus());

    let mut tabs = Vec::with_capacity(options.tabs as usize);
    for id in 1..=options.tabs {
        tabs.push(open_tab(&network, &config, id).await?);
    }

    let mut popup = RuntimeBuilder::new(ContextId::Popup)
        .with_config(config.clone())
        .with_transport(network.endpoint(ContextId::Popup))
        .build_and_start()
        .await?;
    attach(&network, popup.bus());
    popup.store().dispatch(ActionCreator::set_popup_open(true))?;

    if options.toggle {
        let reply = popup
            .bus()
            .request(
                MessageType::ToggleFeature,
                json!({ "trigger": "popup" }),
                SendOptions::default(),
            )
            .await?;
        info!(enabled = %reply.payload["enabled"], "Feature toggled from popup");
    }

    if let Some(parameter) = options.parameter {
        let reply = popup
            .bus()
            .request(
                MessageType::UpdateParameter,
                json!({ "value": parameter }),
                SendOptions::default(),
            )
            .await?;
        info!(parameter = %reply.payload["parameter"], "Parameter updated from popup");
    }

    let deadline = Duration::from_millis(config.bus.response_timeout_ms);
    let converged = wait_for_convergence(&background, &tabs, deadline).await;
    if !converged {
        warn!(timeout_ms = config.bus.response_timeout_ms, "Tabs did not converge");
    }

    let report = SimulationReport {
        converged,
        background: (*background.store().get_state()).clone(),
        tabs: tabs.iter().map(|tab| lock(&tab.mirror).clone()).collect(),
        bus: background.bus().stats(),
        network: network.stats().into(),
    };
    debug!(saves = storage.saves().len(), "Settings writes during simulation");

    popup.shutdown();
    for tab in &mut tabs {
        tab.runtime.shutdown();
    }
    background.shutdown();

    Ok(report)
}

fn attach(network: &LoopbackNetwork, bus: &MessageBus) {
    let bus = bus.clone();
    network.attach(bus.identity(), move |raw, from| {
        let bus = bus.clone();
        async move { bus.receive(&raw, from).await }
    });
}

/// Start a tab runtime that mirrors STATE_SYNC snapshots, then announce it
async fn open_tab(network: &LoopbackNetwork, config: &TabsyncConfig, id: u32) -> Result<SimulatedTab> {
    let identity = ContextId::Tab(id);
    let runtime = RuntimeBuilder::new(identity)
        .with_config(config.clone())
        .with_transport(network.endpoint(identity))
        .build_and_start()
        .await?;
    attach(network, runtime.bus());

    let mirror = Arc::new(Mutex::new(TabMirror {
        context: identity.to_string(),
        ..TabMirror::default()
    }));
    let handler_mirror = mirror.clone();
    let store = runtime.store().clone();
    runtime
        .bus()
        .on(MessageType::StateSync, move |message| {
            apply_snapshot(&handler_mirror, &message.payload);
            if let Some(enabled) = message.payload["enabled"].as_bool() {
                // Stamped with the background's snapshot time, not the tab's
                let at = message.payload["timestamp"]
                    .as_u64()
                    .map(Timestamp::new)
                    .unwrap_or(message.created_at);
                if let Err(error) = store.dispatch(ActionCreator::toggle_feature(Some(enabled), at)) {
                    warn!(error = %error, "Cannot mirror feature state");
                }
            }
            if let Some(parameter) = message.payload["parameter"].as_f64() {
                if let Err(error) = store.dispatch(ActionCreator::update_parameter(parameter)) {
                    warn!(error = %error, "Cannot mirror parameter");
                }
            }
            async { Ok(None) }
        })
        .forget();

    let reply = runtime
        .bus()
        .request(
            MessageType::ContextReady,
            json!({ "url": format!("https://tab{id}.example"), "title": format!("Tab {id}") }),
            SendOptions::default(),
        )
        .await?;
    if reply.message_type == MessageType::SystemError {
        return Err(CliError::InvalidArgument(format!(
            "background refused {identity}: {}",
            reply.payload
        )));
    }
    debug!(context = %identity, "Tab registered");

    Ok(SimulatedTab { runtime, mirror })
}

fn apply_snapshot(mirror: &Mutex<TabMirror>, snapshot: &Value) {
    let mut mirror = lock(mirror);
    mirror.enabled = snapshot["enabled"].as_bool().unwrap_or(mirror.enabled);
    mirror.parameter = snapshot["parameter"].as_f64().unwrap_or(mirror.parameter);
    mirror.is_active = snapshot["isActive"].as_bool().unwrap_or(false);
    mirror.snapshots += 1;
}

async fn wait_for_convergence(
    background: &RuntimeHandle,
    tabs: &[SimulatedTab],
    within: Duration,
) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let state = background.store().get_state();
        let feature = &state.feature_state;
        let converged = tabs.iter().all(|tab| {
            let mirror = lock(&tab.mirror);
            mirror.snapshots > 0
                && mirror.enabled == feature.enabled
                && mirror.parameter == feature.parameter
        });
        if converged {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TabsyncConfig {
        let mut config = TabsyncConfig::testing();
        config.bus.response_timeout_ms = 2000;
        config.sync.sync_interval_ms = 60_000;
        config
    }

    #[tokio::test]
    async fn test_tabs_follow_popup_actions() {
        let report = simulate(
            config(),
            SimulationOptions {
                tabs: 3,
                toggle: true,
                parameter: Some(0.3),
            },
        )
        .await
        .unwrap();

        assert!(report.converged);
        assert!(report.background.feature_state.enabled);
        assert_eq!(report.background.feature_state.parameter, 0.3);
        assert_eq!(report.tabs.len(), 3);
        for tab in &report.tabs {
            assert!(tab.enabled);
            assert_eq!(tab.parameter, 0.3);
        }
        assert_eq!(report.tabs.iter().filter(|tab| tab.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_without_actions_tabs_hold_defaults() {
        let report = simulate(
            config(),
            SimulationOptions {
                tabs: 2,
                ..SimulationOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(report.converged);
        assert!(report.tabs.iter().all(|tab| !tab.enabled && tab.parameter == 0.5));
        assert_eq!(report.tabs[0].context, "tab:1");
    }

    #[tokio::test]
    async fn test_rejects_non_finite_parameter() {
        let result = simulate(
            config(),
            SimulationOptions {
                tabs: 1,
                parameter: Some(f64::NAN),
                ..SimulationOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(CliError::InvalidArgument(_))));
    }
}
