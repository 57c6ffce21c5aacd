//! Runtime Builder API
//!
//! Assembles the per-context pieces (store, bus, and for the background context
//! the tab-state manager, router and settings bridge) from a configuration and
//! the host collaborators, and hands back a handle owning them.

use std::sync::Arc;

use tracing::info;

use tabsync_core::{
    ApplicationState, ContextId, ContextNotifier, ErrorSink, SettingsStorage, StateStore,
    SystemTimeSource, TabsyncConfig, TabsyncError, TabsyncResult, TimeSource, TracingErrorSink,
    Transport,
};

use crate::bus::MessageBus;
use crate::managers::TabStateManager;
use crate::retry::RetryManager;
use crate::router::BackgroundRouter;
use crate::settings_bridge::SettingsBridge;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for the runtime of one context
pub struct RuntimeBuilder {
    identity: ContextId,
    config: TabsyncConfig,
    transport: Option<Arc<dyn Transport>>,
    error_sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn TimeSource>,
    settings_storage: Option<Arc<dyn SettingsStorage>>,
    initial_state: Option<ApplicationState>,
}

impl RuntimeBuilder {
    pub fn new(identity: ContextId) -> Self {
        Self {
            identity,
            config: TabsyncConfig::default(),
            transport: None,
            error_sink: Arc::new(TracingErrorSink),
            clock: Arc::new(SystemTimeSource),
            settings_storage: None,
            initial_state: None,
        }
    }

    pub fn with_config(mut self, config: TabsyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Channel used to reach other contexts; required
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Hydrate and persist settings through `storage` (background only)
    pub fn with_settings_storage(mut self, storage: Arc<dyn SettingsStorage>) -> Self {
        self.settings_storage = Some(storage);
        self
    }

    pub fn with_initial_state(mut self, state: ApplicationState) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Wire the components without starting timers or installing handlers
    pub fn build(self) -> TabsyncResult<RuntimeHandle> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| TabsyncError::config_error("a transport is required"))?;

        let store_config = self.config.store.clone();
        let store = match self.initial_state {
            Some(state) => StateStore::with_state(state, store_config),
            None => StateStore::new(store_config),
        };
        let bus = MessageBus::new(
            self.identity,
            transport,
            self.error_sink,
            self.clock.clone(),
            self.config.bus.clone(),
            RetryManager::new(self.config.retry.policy()),
        );

        let background = self.identity == ContextId::Background;
        let manager = background.then(|| {
            let notifier: Arc<dyn ContextNotifier> = Arc::new(bus.clone());
            TabStateManager::new(
                store.clone(),
                notifier,
                self.clock.clone(),
                self.config.sync.clone(),
            )
        });
        let settings = self
            .settings_storage
            .filter(|_| background)
            .map(|storage| SettingsBridge::new(store.clone(), storage));

        Ok(RuntimeHandle {
            identity: self.identity,
            config: self.config,
            bus,
            store,
            manager,
            settings,
            router: None,
            running: false,
        })
    }

    /// Build, then start the runtime
    pub async fn build_and_start(self) -> TabsyncResult<RuntimeHandle> {
        let mut handle = self.build()?;
        handle.start().await?;
        Ok(handle)
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle owning the runtime of one context
#[derive(Debug)]
pub struct RuntimeHandle {
    identity: ContextId,
    config: TabsyncConfig,
    bus: MessageBus,
    store: StateStore,
    manager: Option<TabStateManager>,
    settings: Option<SettingsBridge>,
    router: Option<BackgroundRouter>,
    running: bool,
}

impl RuntimeHandle {
    pub fn identity(&self) -> ContextId {
        self.identity
    }

    pub fn config(&self) -> &TabsyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The tab-state manager; only the background context has one
    pub fn manager(&self) -> Option<&TabStateManager> {
        self.manager.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Hydrate settings, install the background handlers and start the timer
    pub async fn start(&mut self) -> TabsyncResult<()> {
        if self.running {
            return Ok(());
        }
        if let Some(settings) = &self.settings {
            settings.start().await?;
        }
        if let Some(manager) = &self.manager {
            self.router = Some(BackgroundRouter::install(
                &self.bus,
                self.store.clone(),
                manager.clone(),
            ));
            manager.start()?;
        }
        self.running = true;
        info!(identity = %self.identity, "Tabsync runtime started");
        Ok(())
    }

    /// Stop timers and persistence, then dispose the bus
    pub fn shutdown(&mut self) {
        if let Some(router) = self.router.take() {
            router.uninstall();
        }
        if let Some(settings) = &self.settings {
            settings.stop();
        }
        if let Some(manager) = &self.manager {
            manager.dispose();
        }
        self.bus.dispose();
        self.running = false;
        info!(identity = %self.identity, "Tabsync runtime shut down");
    }
}

// ----------------------------------------------------------------------------
// Convenience Functions
// ----------------------------------------------------------------------------

/// Background runtime with short timers for tests and simulations
pub async fn create_test_runtime(transport: Arc<dyn Transport>) -> TabsyncResult<RuntimeHandle> {
    RuntimeBuilder::new(ContextId::Background)
        .with_config(TabsyncConfig::testing())
        .with_transport(transport)
        .build_and_start()
        .await
}
