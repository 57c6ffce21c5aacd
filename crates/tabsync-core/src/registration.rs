//! De-registration handles
//!
//! Registering a handler, middleware or subscriber returns a [`Registration`].
//! Calling [`Registration::cancel`] removes the registered item. Dropping the
//! handle without cancelling leaves the item registered for the owner's lifetime.

use core::fmt;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle that removes a registered item when cancelled
#[must_use = "dropping a Registration keeps the item registered; call cancel() to remove it"]
pub struct Registration {
    cancel: Option<CancelFn>,
}

impl Registration {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle for a registration that was refused; cancelling does nothing
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the registered item
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the item registered and discard the handle
    pub fn forget(mut self) {
        self.cancel = None;
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
