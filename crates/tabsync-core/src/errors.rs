//! Error types for tabsync
//!
//! This module contains the validation error raised by schema checks and the
//! unified `TabsyncError` returned by every fallible operation of the bus,
//! the state store and the tab-state manager.

// ----------------------------------------------------------------------------
// Validation Errors
// ----------------------------------------------------------------------------

/// Schema violations found while checking a (type, payload) pair
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown message type: {message_type}")]
    UnknownType { message_type: String },
    #[error("Payload required for {message_type}")]
    MissingPayload { message_type: String },
    #[error("Missing required field '{field}'")]
    MissingField { field: String },
    #[error("Field '{field}' must be of type {expected}, got {actual}")]
    WrongType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Field '{field}' out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Field '{field}' too long: {length} > {max}")]
    TooLong {
        field: String,
        length: usize,
        max: usize,
    },
    #[error("Field '{field}' has {length} items, expected {min}..={max}")]
    ArrayLength {
        field: String,
        length: usize,
        min: usize,
        max: usize,
    },
    #[error("Field '{field}' is malformed: '{value}'")]
    Malformed { field: String, value: String },
    #[error("Field '{field}' has value '{value}' which is not one of {allowed:?}")]
    NotAllowed {
        field: String,
        value: String,
        allowed: Vec<&'static str>,
    },
}

impl ValidationError {
    /// A wire field whose text does not decode
    pub fn malformed<F: Into<String>, V: Into<String>>(field: F, value: V) -> Self {
        ValidationError::Malformed {
            field: field.into(),
            value: value.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Error Classification
// ----------------------------------------------------------------------------

/// The four failure categories callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed message or action; never retried
    Validation,
    /// No response within the deadline
    Timeout,
    /// Transport delivery failed after retries
    Communication,
    /// Reentrancy violations, lifecycle misuse and other internal faults
    Internal,
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for tabsync
#[derive(Debug, thiserror::Error)]
pub enum TabsyncError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Timed out waiting for response to {message_id} after {timeout_ms}ms")]
    Timeout { message_id: String, timeout_ms: u64 },

    #[error("Communication error with {target}: {reason}")]
    Communication { target: String, reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// A middleware dropped the message before delivery
    #[error("Message {message_id} rejected by middleware")]
    Rejected { message_id: String },

    /// The component was disposed and cannot be used anymore
    #[error("{component} has been disposed")]
    Disposed { component: &'static str },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TabsyncError {
    /// Create an internal error with a reason
    pub fn internal<T: Into<String>>(reason: T) -> Self {
        TabsyncError::Internal {
            reason: reason.into(),
        }
    }

    /// Create a communication error for a target context
    pub fn communication<P: Into<String>, R: Into<String>>(target: P, reason: R) -> Self {
        TabsyncError::Communication {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error for a message
    pub fn timeout<M: Into<String>>(message_id: M, timeout_ms: u64) -> Self {
        TabsyncError::Timeout {
            message_id: message_id.into(),
            timeout_ms,
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TabsyncError::Configuration {
            reason: reason.into(),
        }
    }

    /// Classify this error into one of the four failure categories
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabsyncError::Validation(_) | TabsyncError::Serialization(_) => ErrorKind::Validation,
            TabsyncError::Timeout { .. } => ErrorKind::Timeout,
            TabsyncError::Communication { .. } => ErrorKind::Communication,
            TabsyncError::Internal { .. }
            | TabsyncError::Configuration { .. }
            | TabsyncError::Rejected { .. }
            | TabsyncError::Disposed { .. } => ErrorKind::Internal,
        }
    }

    /// Only transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Communication
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, TabsyncError>;
pub type TabsyncResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
