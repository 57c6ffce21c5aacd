//! Synchronized application state
//!
//! The state tree, the closed action set, the pure reducer and the store that
//! serializes every mutation through `dispatch`.

pub mod action;
pub mod app_state;
pub mod reducer;
pub mod selectors;
pub mod store;

pub use action::{Action, ActionCreator, ActionRecord};
pub use app_state::{
    ApplicationState, ContextRegistry, ContextState, FeatureState, MirroredFlags, UiState,
};
pub use reducer::{clamp_parameter, reduce};
pub use store::{StateChange, StateStore, StoreMiddleware};
