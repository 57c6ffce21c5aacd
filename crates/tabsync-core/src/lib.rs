//! Tabsync Core
//!
//! Runtime-free building blocks for coordinating state between the isolated
//! contexts of a browser extension: typed message envelopes and their wire
//! codec, schema validation, the three-class priority queue, retry arithmetic,
//! and the single-writer reducer store holding the shared application state.
//!
//! Nothing in this crate suspends or spawns. The collaborator traits the host
//! implements are declared here; the async message bus and the tab
//! reconciliation layer live in `tabsync-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod message;
pub mod queue;
pub mod registration;
pub mod retry;
pub mod settings;
pub mod state;
pub mod transport;
pub mod types;
pub mod validator;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{BusConfig, RetryConfig, StoreConfig, SyncConfig, TabsyncConfig};
pub use errors::{ErrorKind, Result, TabsyncError, TabsyncResult, ValidationError};
pub use message::{Message, MessageType, Priority, WireMessage};
pub use queue::MessageQueue;
pub use registration::Registration;
pub use retry::RetryPolicy;
pub use settings::{PersistedSettings, SettingsPatch};
pub use state::{
    Action, ActionCreator, ApplicationState, ContextState, StateChange, StateStore,
    StoreMiddleware,
};
pub use transport::{ContextNotifier, ErrorSink, SettingsStorage, TracingErrorSink, Transport};
pub use types::{ContextId, MessageId, SystemTimeSource, TimeSource, Timestamp};
pub use validator::{FieldKind, FieldRule, MessageValidator, Schema};
