//! Message envelopes and their wire format
//!
//! A `Message` is the immutable envelope moved between contexts. On the wire
//! it is a flat JSON record:
//!
//! ```text
//! { type, data, id, timestamp (ISO-8601), source, target,
//!   priority (0=HIGH, 1=NORMAL, 2=LOW), needsResponse, responseToId }
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TabsyncError, ValidationError};
use crate::types::{ContextId, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Message Type
// ----------------------------------------------------------------------------

/// Closed set of message types understood by every context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    ToggleFeature,
    UpdateParameter,
    GetState,
    StateSync,
    SettingsChanged,
    ContextReady,
    Ping,
    ToggleFeatureResponse,
    UpdateParameterResponse,
    GetStateResponse,
    StateSyncResponse,
    SettingsChangedResponse,
    ContextReadyResponse,
    PingResponse,
    SystemError,
}

impl MessageType {
    /// Every message type, requests first
    pub const ALL: [MessageType; 15] = [
        MessageType::ToggleFeature,
        MessageType::UpdateParameter,
        MessageType::GetState,
        MessageType::StateSync,
        MessageType::SettingsChanged,
        MessageType::ContextReady,
        MessageType::Ping,
        MessageType::ToggleFeatureResponse,
        MessageType::UpdateParameterResponse,
        MessageType::GetStateResponse,
        MessageType::StateSyncResponse,
        MessageType::SettingsChangedResponse,
        MessageType::ContextReadyResponse,
        MessageType::PingResponse,
        MessageType::SystemError,
    ];

    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ToggleFeature => "TOGGLE_FEATURE",
            MessageType::UpdateParameter => "UPDATE_PARAMETER",
            MessageType::GetState => "GET_STATE",
            MessageType::StateSync => "STATE_SYNC",
            MessageType::SettingsChanged => "SETTINGS_CHANGED",
            MessageType::ContextReady => "CONTEXT_READY",
            MessageType::Ping => "PING",
            MessageType::ToggleFeatureResponse => "TOGGLE_FEATURE_RESPONSE",
            MessageType::UpdateParameterResponse => "UPDATE_PARAMETER_RESPONSE",
            MessageType::GetStateResponse => "GET_STATE_RESPONSE",
            MessageType::StateSyncResponse => "STATE_SYNC_RESPONSE",
            MessageType::SettingsChangedResponse => "SETTINGS_CHANGED_RESPONSE",
            MessageType::ContextReadyResponse => "CONTEXT_READY_RESPONSE",
            MessageType::PingResponse => "PING_RESPONSE",
            MessageType::SystemError => "SYSTEM_ERROR",
        }
    }

    /// The `<TYPE>_RESPONSE` counterpart of a request type
    ///
    /// Response types and `SYSTEM_ERROR` answer with `SYSTEM_ERROR`.
    pub fn response_type(&self) -> MessageType {
        match self {
            MessageType::ToggleFeature => MessageType::ToggleFeatureResponse,
            MessageType::UpdateParameter => MessageType::UpdateParameterResponse,
            MessageType::GetState => MessageType::GetStateResponse,
            MessageType::StateSync => MessageType::StateSyncResponse,
            MessageType::SettingsChanged => MessageType::SettingsChangedResponse,
            MessageType::ContextReady => MessageType::ContextReadyResponse,
            MessageType::Ping => MessageType::PingResponse,
            _ => MessageType::SystemError,
        }
    }

    /// Whether this type only ever answers another message
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::ToggleFeatureResponse
                | MessageType::UpdateParameterResponse
                | MessageType::GetStateResponse
                | MessageType::StateSyncResponse
                | MessageType::SettingsChangedResponse
                | MessageType::ContextReadyResponse
                | MessageType::PingResponse
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownType {
                message_type: s.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Priority
// ----------------------------------------------------------------------------

/// Priority class of a message; lower wire value is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All classes in service order
    pub const ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Index of this class in service order
    pub fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.index() as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = TabsyncError;

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Low),
            other => Err(ValidationError::malformed("priority", other.to_string()).into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Immutable envelope moved between contexts
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Value,
    pub id: MessageId,
    pub created_at: Timestamp,
    pub source: ContextId,
    pub target: ContextId,
    pub priority: Priority,
    pub needs_response: bool,
    pub response_to_id: Option<MessageId>,
}

impl Message {
    /// Create a new message with a fresh id, stamped with `created_at`
    pub fn new(
        message_type: MessageType,
        payload: Value,
        source: ContextId,
        target: ContextId,
        created_at: Timestamp,
    ) -> Self {
        Self {
            message_type,
            payload,
            id: MessageId::generate(),
            created_at,
            source,
            target,
            priority: Priority::Normal,
            needs_response: false,
            response_to_id: None,
        }
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Request a correlated response
    pub fn expecting_response(mut self) -> Self {
        self.needs_response = true;
        self
    }

    /// Build the response to this message, addressed back to its sender
    pub fn reply(
        &self,
        from: ContextId,
        message_type: MessageType,
        payload: Value,
        created_at: Timestamp,
    ) -> Message {
        Message {
            message_type,
            payload,
            id: MessageId::generate(),
            created_at,
            source: from,
            target: self.source,
            priority: self.priority,
            needs_response: false,
            response_to_id: Some(self.id.clone()),
        }
    }

    /// Whether this message answers another one
    pub fn is_response(&self) -> bool {
        self.response_to_id.is_some()
    }

    /// Serialize to the flat wire record
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireMessage::from(self))?)
    }

    /// Deserialize from the flat wire record
    pub fn deserialize(raw: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(raw)?;
        Message::try_from(wire)
    }
}

// ----------------------------------------------------------------------------
// Wire Format
// ----------------------------------------------------------------------------

/// Flat record exchanged with the host transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    pub id: String,
    pub timestamp: String,
    pub source: String,
    pub target: String,
    #[serde(default = "default_wire_priority")]
    pub priority: u8,
    #[serde(default)]
    pub needs_response: bool,
    #[serde(default)]
    pub response_to_id: Option<String>,
}

fn default_wire_priority() -> u8 {
    Priority::Normal.into()
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_type: message.message_type.as_str().to_string(),
            data: message.payload.clone(),
            id: message.id.to_string(),
            timestamp: message.created_at.to_iso8601(),
            source: message.source.to_string(),
            target: message.target.to_string(),
            priority: message.priority.into(),
            needs_response: message.needs_response,
            response_to_id: message.response_to_id.as_ref().map(|id| id.to_string()),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = TabsyncError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        Ok(Message {
            message_type: wire.message_type.parse()?,
            payload: wire.data,
            id: MessageId::new(wire.id),
            created_at: Timestamp::parse_iso8601(&wire.timestamp)?,
            source: wire.source.parse()?,
            target: wire.target.parse()?,
            priority: Priority::try_from(wire.priority)?,
            needs_response: wire.needs_response,
            response_to_id: wire.response_to_id.map(MessageId::new),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message {
            message_type: MessageType::UpdateParameter,
            payload: json!({ "value": 0.4 }),
            id: MessageId::new("msg-1"),
            created_at: Timestamp::new(1_700_000_000_000),
            source: ContextId::Popup,
            target: ContextId::Background,
            priority: Priority::High,
            needs_response: true,
            response_to_id: None,
        }
    }

    #[test]
    fn test_wire_layout() {
        let raw = sample().serialize().unwrap();
        assert_eq!(
            raw,
            r#"{"type":"UPDATE_PARAMETER","data":{"value":0.4},"id":"msg-1","timestamp":"2023-11-14T22:13:20.000Z","source":"popup","target":"background","priority":0,"needsResponse":true,"responseToId":null}"#
        );
    }

    #[test]
    fn test_round_trip() {
        let message = sample();
        let decoded = Message::deserialize(&message.serialize().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_reply_correlates() {
        let request = sample();
        let response = request.reply(
            ContextId::Background,
            MessageType::UpdateParameterResponse,
            json!({"ok": true}),
            Timestamp::new(1_700_000_000_500),
        );
        assert_eq!(response.response_to_id.as_ref(), Some(&request.id));
        assert_eq!(response.created_at, Timestamp::new(1_700_000_000_500));
        assert_eq!(response.target, ContextId::Popup);
        assert!(response.is_response());
    }

    #[test]
    fn test_deserialize_rejects_unknown_type() {
        let raw = r#"{"type":"NOPE","data":null,"id":"x","timestamp":"2023-11-14T22:13:20.000Z","source":"popup","target":"background","priority":1,"needsResponse":false,"responseToId":null}"#;
        let err = Message::deserialize(raw).unwrap_err();
        assert!(matches!(
            err,
            TabsyncError::Validation(ValidationError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_malformed() {
        assert!(Message::deserialize("not json").is_err());
        assert!(Message::deserialize(r#"{"type":"PING"}"#).is_err());
    }

    #[test]
    fn test_bad_wire_fields_are_validation_errors() {
        let records = [
            r#"{"type":"PING","data":{},"id":"x","timestamp":"2023-11-14T22:13:20.000Z","source":"options","target":"background","priority":1,"needsResponse":false,"responseToId":null}"#,
            r#"{"type":"PING","data":{},"id":"x","timestamp":"2023-11-14T22:13:20.000Z","source":"popup","target":"background","priority":7,"needsResponse":false,"responseToId":null}"#,
            r#"{"type":"PING","data":{},"id":"x","timestamp":"noon","source":"popup","target":"background","priority":1,"needsResponse":false,"responseToId":null}"#,
        ];
        for raw in records {
            let err = Message::deserialize(raw).unwrap_err();
            assert!(
                matches!(err, TabsyncError::Validation(ValidationError::Malformed { .. })),
                "unexpected error for {}: {}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_float_payload_is_bit_exact() {
        let value = -1.9543416044360766e285_f64;
        let mut message = sample();
        message.payload = json!({ "v": value });
        let decoded = Message::deserialize(&message.serialize().unwrap()).unwrap();
        let decoded_value = decoded.payload["v"].as_f64().unwrap();
        assert_eq!(decoded_value.to_bits(), value.to_bits());
    }

    #[test]
    fn test_response_types() {
        assert_eq!(MessageType::Ping.response_type(), MessageType::PingResponse);
        assert_eq!(MessageType::PingResponse.response_type(), MessageType::SystemError);
        assert_eq!(
            "GET_STATE_RESPONSE".parse::<MessageType>().unwrap(),
            MessageType::GetStateResponse
        );
        assert!(MessageType::GetStateResponse.is_response());
    }
}
