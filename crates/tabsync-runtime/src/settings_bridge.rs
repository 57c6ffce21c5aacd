//! Settings persistence bridge
//!
//! Hydrates the store from the host's settings storage at startup and writes
//! the `settings` subtree back whenever it changes. Writes go through a single
//! writer task fed by a channel, so saves reach storage in change order.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tabsync_core::{
    ActionCreator, PersistedSettings, Registration, SettingsStorage, StateStore, TabsyncResult,
};

/// Path of the persisted subtree inside the application state
pub const SETTINGS_PATH: &str = "settings";

struct Writer {
    subscription: Registration,
    task: JoinHandle<()>,
}

/// Keeps the store's `settings` subtree and the storage record in step
pub struct SettingsBridge {
    store: StateStore,
    storage: Arc<dyn SettingsStorage>,
    writer: Mutex<Option<Writer>>,
}

impl SettingsBridge {
    pub fn new(store: StateStore, storage: Arc<dyn SettingsStorage>) -> Self {
        Self {
            store,
            storage,
            writer: Mutex::new(None),
        }
    }

    /// Load the stored record into the store
    ///
    /// A missing record leaves the defaults in place. Returns the settings the
    /// store holds afterwards.
    pub async fn hydrate(&self) -> TabsyncResult<PersistedSettings> {
        match self.storage.load().await? {
            Some(settings) => {
                debug!(enabled = settings.feature_enabled, parameter = settings.parameter, "Loaded stored settings");
                self.store.dispatch(ActionCreator::load_settings(settings))?;
            }
            None => info!("No stored settings; using defaults"),
        }
        Ok(self.store.get_state().settings.clone())
    }

    /// Hydrate, then persist every later change of the settings subtree
    ///
    /// Calling `start` again replaces the previous writer.
    pub async fn start(&self) -> TabsyncResult<PersistedSettings> {
        let settings = self.hydrate().await?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<PersistedSettings>();
        let storage = self.storage.clone();
        let task = tokio::spawn(async move {
            while let Some(settings) = receiver.recv().await {
                match storage.save(&settings).await {
                    Ok(()) => debug!(parameter = settings.parameter, "Persisted settings"),
                    Err(error) => warn!(error = %error, "Cannot persist settings"),
                }
            }
        });

        // Hydration happened before subscribing, so it is not written back
        let subscription = self.store.subscribe_to_path(SETTINGS_PATH, move |next, _| {
            match serde_json::from_value::<PersistedSettings>(next.clone()) {
                Ok(settings) => {
                    if sender.send(settings).is_err() {
                        debug!("Settings writer stopped; change not persisted");
                    }
                }
                Err(error) => warn!(error = %error, "Settings subtree does not decode"),
            }
        });

        let previous = lock(&self.writer).replace(Writer { subscription, task });
        if let Some(previous) = previous {
            previous.subscription.cancel();
        }
        Ok(settings)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Stop persisting; changes already queued are still written
    pub fn stop(&self) {
        if let Some(writer) = lock(&self.writer).take() {
            // Dropping the subscription's sender ends the writer loop
            writer.subscription.cancel();
            drop(writer.task);
        }
    }
}

impl Drop for SettingsBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SettingsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsBridge")
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
