//! Core types for tabsync
//!
//! This module defines the identity and time types shared by the bus and the
//! state store, using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{TabsyncError, ValidationError};

// ----------------------------------------------------------------------------
// Context Identifier
// ----------------------------------------------------------------------------

const TAB_PREFIX: &str = "tab:";

/// One isolated execution context of the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContextId {
    /// The privileged background context
    Background,
    /// The transient UI surface
    Popup,
    /// A page-embedded content context, keyed by the host's tab number
    Tab(u32),
    /// Every reachable context
    Broadcast,
}

impl ContextId {
    /// Whether this identifier addresses every context
    pub fn is_broadcast(&self) -> bool {
        matches!(self, ContextId::Broadcast)
    }

    /// The host tab number, for page contexts
    pub fn tab_id(&self) -> Option<u32> {
        match self {
            ContextId::Tab(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Background => f.write_str("background"),
            ContextId::Popup => f.write_str("popup"),
            ContextId::Tab(id) => write!(f, "{}{}", TAB_PREFIX, id),
            ContextId::Broadcast => f.write_str("broadcast"),
        }
    }
}

impl FromStr for ContextId {
    type Err = TabsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "background" => Ok(ContextId::Background),
            "popup" => Ok(ContextId::Popup),
            "broadcast" => Ok(ContextId::Broadcast),
            other => other
                .strip_prefix(TAB_PREFIX)
                .and_then(|id| id.parse::<u32>().ok())
                .map(ContextId::Tab)
                .ok_or_else(|| ValidationError::malformed("context", s).into()),
        }
    }
}

impl TryFrom<String> for ContextId {
    type Error = TabsyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContextId> for String {
    fn from(value: ContextId) -> Self {
        value.to_string()
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Opaque message identity, unique per sender process
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an identifier received from another context
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Latest instant the ISO-8601 wire form can carry (9999-12-31T23:59:59.999Z)
    pub const MAX_WIRE: Timestamp = Timestamp(253_402_300_799_999);

    const MAX_WIRE_TEXT: &'static str = "9999-12-31T23:59:59.999Z";

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Add milliseconds to this timestamp
    pub fn add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Format as ISO-8601 with millisecond precision and a `Z` suffix
    ///
    /// Instants after [`Timestamp::MAX_WIRE`] are clamped to it, so the output
    /// always parses back with [`Timestamp::parse_iso8601`].
    pub fn to_iso8601(&self) -> String {
        let millis = self.0.min(Self::MAX_WIRE.0) as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| Self::MAX_WIRE_TEXT.to_string())
    }

    /// Parse an ISO-8601 / RFC 3339 timestamp
    pub fn parse_iso8601(value: &str) -> Result<Self, TabsyncError> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|_| ValidationError::malformed("timestamp", value))?;
        let millis = parsed.timestamp_millis();
        if millis < 0 {
            return Err(ValidationError::malformed("timestamp", value).into());
        }
        Ok(Self(millis as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps
///
/// Everything that compares times (lock expiry, sync stamps) reads the clock
/// through this trait so tests can drive time explicitly.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(Utc::now().timestamp_millis().max(0) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
