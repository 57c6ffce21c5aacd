//! Collaborator interfaces
//!
//! The host owns message delivery, settings persistence and error reporting.
//! The runtime consumes them only through the narrow traits below, so tests
//! and the simulator can substitute in-process fakes.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::errors::{TabsyncError, TabsyncResult};
use crate::settings::PersistedSettings;
use crate::types::ContextId;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Host-mediated channel between contexts
///
/// `deliver` hands a serialized wire record to `target` and may return the one
/// reply the host allows. Failures should be reported as
/// [`TabsyncError::Communication`] so the caller can retry them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, payload: String, target: ContextId) -> TabsyncResult<Option<String>>;
}

// ----------------------------------------------------------------------------
// Error Sink
// ----------------------------------------------------------------------------

/// Receives failures that are isolated at their call site instead of propagated
pub trait ErrorSink: Send + Sync {
    /// `origin` names the participant that failed, e.g. `handler:PING`
    fn report(&self, origin: &str, error: &TabsyncError);
}

/// Error sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, origin: &str, error: &TabsyncError) {
        warn!(origin, kind = ?error.kind(), error = %error, "Isolated failure");
    }
}

// ----------------------------------------------------------------------------
// Context Notifier
// ----------------------------------------------------------------------------

/// Pushes a state snapshot to one remote context, fire-and-forget
#[async_trait]
pub trait ContextNotifier: Send + Sync {
    async fn notify(&self, target: ContextId, snapshot: Value) -> TabsyncResult<()>;
}

// ----------------------------------------------------------------------------
// Settings Storage
// ----------------------------------------------------------------------------

/// Persistent store for the settings record
#[async_trait]
pub trait SettingsStorage: Send + Sync {
    /// Read the stored record; `None` when nothing has been saved yet
    async fn load(&self) -> TabsyncResult<Option<PersistedSettings>>;

    async fn save(&self, settings: &PersistedSettings) -> TabsyncResult<()>;
}
