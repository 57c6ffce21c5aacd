//! Message schema validation
//!
//! Schemas are opt-in per message type: a type without a registered schema
//! passes unconditionally. Validation is a pure function of (type, payload).

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::ValidationError;
use crate::message::MessageType;

// ----------------------------------------------------------------------------
// Field Rules
// ----------------------------------------------------------------------------

/// Runtime type a payload field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::Bool => "boolean",
            FieldKind::Number => "number",
            FieldKind::String => "string",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Constraint set for one payload field
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Inclusive numeric range
    pub range: Option<(f64, f64)>,
    /// Maximum string length in characters
    pub max_length: Option<usize>,
    /// Inclusive array length bounds
    pub items: Option<(usize, usize)>,
    /// Kind every array element must have
    pub item_kind: Option<FieldKind>,
    /// Enumerated string values
    pub allowed: Option<&'static [&'static str]>,
}

impl FieldRule {
    fn new(name: &'static str, kind: FieldKind, required: bool) -> Self {
        Self {
            name,
            kind,
            required,
            range: None,
            max_length: None,
            items: None,
            item_kind: None,
            allowed: None,
        }
    }

    /// A field that must be present
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, kind, true)
    }

    /// A field that is checked only when present
    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self::new(name, kind, false)
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn items(mut self, min: usize, max: usize, kind: FieldKind) -> Self {
        self.items = Some((min, max));
        self.item_kind = Some(kind);
        self
    }

    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn check(&self, payload: &serde_json::Map<String, Value>) -> Result<(), ValidationError> {
        let value = match payload.get(self.name) {
            None | Some(Value::Null) if self.required => {
                return Err(ValidationError::MissingField {
                    field: self.name.to_string(),
                })
            }
            None | Some(Value::Null) => return Ok(()),
            Some(value) => value,
        };

        if !self.kind.matches(value) {
            return Err(ValidationError::WrongType {
                field: self.name.to_string(),
                expected: self.kind.name(),
                actual: json_type_name(value),
            });
        }

        if let (Some((min, max)), Some(number)) = (self.range, value.as_f64()) {
            if !(min..=max).contains(&number) {
                return Err(ValidationError::OutOfRange {
                    field: self.name.to_string(),
                    value: number,
                    min,
                    max,
                });
            }
        }

        if let Some(text) = value.as_str() {
            if let Some(max) = self.max_length {
                let length = text.chars().count();
                if length > max {
                    return Err(ValidationError::TooLong {
                        field: self.name.to_string(),
                        length,
                        max,
                    });
                }
            }
            if let Some(allowed) = self.allowed {
                if !allowed.contains(&text) {
                    return Err(ValidationError::NotAllowed {
                        field: self.name.to_string(),
                        value: text.to_string(),
                        allowed: allowed.to_vec(),
                    });
                }
            }
        }

        if let Some(items) = value.as_array() {
            if let Some((min, max)) = self.items {
                if items.len() < min || items.len() > max {
                    return Err(ValidationError::ArrayLength {
                        field: self.name.to_string(),
                        length: items.len(),
                        min,
                        max,
                    });
                }
            }
            if let Some(kind) = self.item_kind {
                if let Some(bad) = items.iter().find(|item| !kind.matches(item)) {
                    return Err(ValidationError::WrongType {
                        field: format!("{}[]", self.name),
                        expected: kind.name(),
                        actual: json_type_name(bad),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Ordered list of field rules for one message type
pub type Schema = Vec<FieldRule>;

/// Triggers a feature toggle may come from
pub const TOGGLE_TRIGGERS: &[&str] = &["keyboard", "popup", "context_menu", "api"];

// ----------------------------------------------------------------------------
// Message Validator
// ----------------------------------------------------------------------------

/// Schema registry checking (type, payload) pairs
#[derive(Debug, Clone)]
pub struct MessageValidator {
    schemas: HashMap<MessageType, Schema>,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::with_builtin_schemas()
    }
}

impl MessageValidator {
    /// A validator with no schemas; every known type passes
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// A validator carrying the schemas of the built-in request types
    pub fn with_builtin_schemas() -> Self {
        let mut validator = Self::empty();
        validator.register(
            MessageType::ToggleFeature,
            vec![
                FieldRule::optional("enabled", FieldKind::Bool),
                FieldRule::optional("trigger", FieldKind::String).one_of(TOGGLE_TRIGGERS),
            ],
        );
        validator.register(
            MessageType::UpdateParameter,
            vec![FieldRule::required("value", FieldKind::Number).range(0.0, 1.0)],
        );
        validator.register(
            MessageType::GetState,
            vec![FieldRule::optional("paths", FieldKind::Array).items(0, 16, FieldKind::String)],
        );
        validator.register(
            MessageType::StateSync,
            vec![
                FieldRule::required("enabled", FieldKind::Bool),
                FieldRule::required("parameter", FieldKind::Number),
                FieldRule::required("isActive", FieldKind::Bool),
                FieldRule::required("timestamp", FieldKind::Number),
            ],
        );
        validator.register(
            MessageType::SettingsChanged,
            vec![FieldRule::required("settings", FieldKind::Object)],
        );
        validator.register(
            MessageType::ContextReady,
            vec![
                FieldRule::required("url", FieldKind::String).max_length(2048),
                FieldRule::optional("title", FieldKind::String).max_length(512),
            ],
        );
        validator.register(
            MessageType::SystemError,
            vec![FieldRule::required("error", FieldKind::String)],
        );
        validator
    }

    /// Register or replace the schema for a type
    pub fn register(&mut self, message_type: MessageType, schema: Schema) {
        self.schemas.insert(message_type, schema);
    }

    /// Drop the schema for a type, making it pass unconditionally
    pub fn unregister(&mut self, message_type: MessageType) -> Option<Schema> {
        self.schemas.remove(&message_type)
    }

    pub fn has_schema(&self, message_type: MessageType) -> bool {
        self.schemas.contains_key(&message_type)
    }

    /// Validate a typed message type against its schema
    pub fn validate(&self, message_type: MessageType, payload: &Value) -> Result<(), ValidationError> {
        let Some(schema) = self.schemas.get(&message_type) else {
            return Ok(());
        };

        let fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => {
                return Err(ValidationError::MissingPayload {
                    message_type: message_type.to_string(),
                })
            }
            other => {
                return Err(ValidationError::WrongType {
                    field: "payload".to_string(),
                    expected: FieldKind::Object.name(),
                    actual: json_type_name(other),
                })
            }
        };

        schema.iter().try_for_each(|rule| rule.check(fields))
    }

    /// Validate a type given by its wire name
    pub fn validate_raw(&self, message_type: &str, payload: &Value) -> Result<MessageType, ValidationError> {
        let parsed: MessageType = message_type.parse()?;
        self.validate(parsed, payload)?;
        Ok(parsed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
