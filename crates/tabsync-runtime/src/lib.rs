//! Tabsync Runtime Engine
//!
//! The async half of tabsync:
//! - `MessageBus`: prioritized, correlated messaging between contexts
//! - `RetryManager`: backoff around transport delivery
//! - `TabStateManager` and its `LockTable`: keeps every context's mirror of
//!   the shared state current
//! - `SettingsBridge`: settings hydration and persistence
//! - `BackgroundRouter`: the request handlers of the background context
//!
//! `RuntimeBuilder` wires these together for one context; `tabsync-core`
//! provides the types, the store and the collaborator traits they run on.

pub mod builder;
pub mod bus;
pub mod managers;
pub mod retry;
pub mod router;
pub mod settings_bridge;

pub use builder::{create_test_runtime, RuntimeBuilder, RuntimeHandle};
pub use bus::{
    handler_fn, BusStats, Direction, HandlerFn, MessageBus, MessageHandler, MessageMiddleware,
    QueueSizes, SendOptions, SendOutcome,
};
pub use managers::*;
pub use retry::RetryManager;
pub use router::BackgroundRouter;
pub use settings_bridge::{SettingsBridge, SETTINGS_PATH};

// Re-export core types for convenience
pub use tabsync_core::{
    Action, ActionCreator, ApplicationState, ContextId, ContextNotifier, ErrorSink, Message,
    MessageId, MessageType, PersistedSettings, Priority, Registration, SettingsStorage,
    StateStore, TabsyncConfig, TabsyncError, TabsyncResult, TimeSource, Timestamp, Transport,
};
