//! Recording fakes for the notifier, error sink and settings storage

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use tabsync_core::{
    ContextId, ContextNotifier, ErrorSink, PersistedSettings, SettingsStorage, TabsyncError,
    TabsyncResult,
};

// ----------------------------------------------------------------------------
// Recording Notifier
// ----------------------------------------------------------------------------

/// Context notifier that records snapshots instead of sending them
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(ContextId, Value)>>,
    unreachable: Mutex<HashSet<ContextId>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make notifications to `id` fail like a closed tab
    pub fn make_unreachable(&self, id: ContextId) {
        lock(&self.unreachable).insert(id);
    }

    pub fn make_reachable(&self, id: &ContextId) {
        lock(&self.unreachable).remove(id);
    }

    pub fn sent(&self) -> Vec<(ContextId, Value)> {
        lock(&self.sent).clone()
    }

    /// Snapshots delivered to one context, oldest first
    pub fn sent_to(&self, id: ContextId) -> Vec<Value> {
        lock(&self.sent)
            .iter()
            .filter(|(target, _)| *target == id)
            .map(|(_, snapshot)| snapshot.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn clear(&self) {
        lock(&self.sent).clear();
    }
}

#[async_trait]
impl ContextNotifier for RecordingNotifier {
    async fn notify(&self, target: ContextId, snapshot: Value) -> TabsyncResult<()> {
        if lock(&self.unreachable).contains(&target) {
            return Err(TabsyncError::communication(
                target.to_string(),
                "Receiving end does not exist",
            ));
        }
        lock(&self.sent).push((target, snapshot));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Recording Error Sink
// ----------------------------------------------------------------------------

/// Error sink keeping `(origin, message)` pairs
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(String, String)> {
        lock(&self.reports).clone()
    }

    pub fn origins(&self) -> Vec<String> {
        lock(&self.reports)
            .iter()
            .map(|(origin, _)| origin.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.reports).is_empty()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, origin: &str, error: &TabsyncError) {
        lock(&self.reports).push((origin.to_string(), error.to_string()));
    }
}

// ----------------------------------------------------------------------------
// Memory Settings Storage
// ----------------------------------------------------------------------------

/// Settings storage held in memory
#[derive(Debug, Default)]
pub struct MemorySettingsStorage {
    record: Mutex<Option<PersistedSettings>>,
    saves: Mutex<Vec<PersistedSettings>>,
    fail_saves: Mutex<bool>,
}

impl MemorySettingsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `settings`
    pub fn with_record(settings: PersistedSettings) -> Self {
        let storage = Self::default();
        *lock(&storage.record) = Some(settings);
        storage
    }

    pub fn record(&self) -> Option<PersistedSettings> {
        lock(&self.record).clone()
    }

    /// Every record passed to `save`, oldest first
    pub fn saves(&self) -> Vec<PersistedSettings> {
        lock(&self.saves).clone()
    }

    pub fn fail_saves(&self, enabled: bool) {
        *lock(&self.fail_saves) = enabled;
    }
}

#[async_trait]
impl SettingsStorage for MemorySettingsStorage {
    async fn load(&self) -> TabsyncResult<Option<PersistedSettings>> {
        Ok(self.record())
    }

    async fn save(&self, settings: &PersistedSettings) -> TabsyncResult<()> {
        if *lock(&self.fail_saves) {
            return Err(TabsyncError::internal("storage quota exceeded"));
        }
        lock(&self.saves).push(settings.clone());
        *lock(&self.record) = Some(settings.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
