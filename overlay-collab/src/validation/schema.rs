//! Declared payload shapes for every registered message type.
//!
//! A [`Schema`] lists the fields a payload may carry. Checking a payload
//! rejects wrong types and out-of-range values, fills declared defaults,
//! and strips undeclared keys so nothing unexpected reaches a handler.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::protocol::MessageType;

/// Longest accepted URL before parsing.
pub const MAX_URL_LEN: usize = 2048;

/// Longest chat message, in characters.
pub const MAX_CHAT_LEN: usize = 5000;

#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A string of at most `max` characters. Free text is HTML-encoded
    /// during sanitization.
    Text { max: usize, free_text: bool },
    Number { min: f64, max: f64 },
    Integer { min: i64, max: i64 },
    Bool,
    Enum(&'static [&'static str]),
    /// Only http/https survive sanitization.
    Url,
    Array { max: usize, item: Box<FieldKind> },
    Record(Schema),
    /// Any JSON value; depth is bounded by the envelope scan.
    Any,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

/// Where and why a payload failed its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub problem: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.problem)
        } else {
            write!(f, "{}: {}", self.path, self.problem)
        }
    }
}

fn violation(path: &str, problem: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        problem: problem.into(),
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: false,
            default: None,
        });
        self
    }

    pub fn with_default(mut self, name: &'static str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(Field {
            name,
            kind,
            required: false,
            default: Some(default),
        });
        self
    }

    /// Validate `payload` in place. `null` counts as an empty object.
    pub fn check(&self, payload: &mut Value) -> Result<(), SchemaViolation> {
        if payload.is_null() {
            *payload = Value::Object(Map::new());
        }
        self.check_record(payload, "")
    }

    fn check_record(&self, value: &mut Value, path: &str) -> Result<(), SchemaViolation> {
        let Some(object) = value.as_object_mut() else {
            return Err(violation(path, "expected an object"));
        };

        object.retain(|key, _| self.fields.iter().any(|f| f.name == key.as_str()));

        for field in &self.fields {
            let field_path = join(path, field.name);
            let present = object.get(field.name).is_some_and(|v| !v.is_null());
            if present {
                if let Some(v) = object.get_mut(field.name) {
                    check_value(&field.kind, v, &field_path)?;
                }
                continue;
            }
            object.remove(field.name);
            if let Some(default) = &field.default {
                object.insert(field.name.to_string(), default.clone());
            } else if field.required {
                return Err(violation(&field_path, "missing required field"));
            }
        }
        Ok(())
    }
}

fn check_value(kind: &FieldKind, value: &mut Value, path: &str) -> Result<(), SchemaViolation> {
    match kind {
        FieldKind::Text { max, .. } => {
            let s = value.as_str().ok_or_else(|| violation(path, "expected a string"))?;
            let len = s.chars().count();
            if len > *max {
                return Err(violation(path, format!("length {len} exceeds {max}")));
            }
        }
        FieldKind::Number { min, max } => {
            let n = value.as_f64().ok_or_else(|| violation(path, "expected a number"))?;
            if !n.is_finite() || n < *min || n > *max {
                return Err(violation(path, format!("{n} outside [{min}, {max}]")));
            }
        }
        FieldKind::Integer { min, max } => {
            let n = value.as_i64().ok_or_else(|| violation(path, "expected an integer"))?;
            if n < *min || n > *max {
                return Err(violation(path, format!("{n} outside [{min}, {max}]")));
            }
        }
        FieldKind::Bool => {
            if !value.is_boolean() {
                return Err(violation(path, "expected a boolean"));
            }
        }
        FieldKind::Enum(options) => {
            let s = value.as_str().ok_or_else(|| violation(path, "expected a string"))?;
            if !options.contains(&s) {
                return Err(violation(path, format!("'{s}' is not one of {options:?}")));
            }
        }
        FieldKind::Url => {
            let s = value.as_str().ok_or_else(|| violation(path, "expected a URL string"))?;
            if s.len() > MAX_URL_LEN {
                return Err(violation(path, "URL too long"));
            }
        }
        FieldKind::Array { max, item } => {
            let items = value
                .as_array_mut()
                .ok_or_else(|| violation(path, "expected an array"))?;
            if items.len() > *max {
                return Err(violation(path, format!("{} items exceeds {max}", items.len())));
            }
            for (i, v) in items.iter_mut().enumerate() {
                check_value(item, v, &format!("{path}[{i}]"))?;
            }
        }
        FieldKind::Record(schema) => schema.check_record(value, path)?,
        FieldKind::Any => {}
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Registered message shapes
// ───────────────────────────────────────────────────────────────────

const ROLES: &[&str] = &["owner", "editor", "viewer"];
const BUTTONS: &[&str] = &["left", "middle", "right"];
const CHANGE_TYPES: &[&str] = &["attribute", "style", "text", "create", "delete"];

fn id() -> FieldKind {
    FieldKind::Text {
        max: 128,
        free_text: false,
    }
}

fn unit() -> FieldKind {
    FieldKind::Number { min: 0.0, max: 1.0 }
}

fn free_text(max: usize) -> FieldKind {
    FieldKind::Text {
        max,
        free_text: true,
    }
}

fn color() -> FieldKind {
    FieldKind::Text {
        max: 32,
        free_text: false,
    }
}

fn dom_change() -> Schema {
    Schema::new()
        .required("type", FieldKind::Enum(CHANGE_TYPES))
        .optional(
            "property",
            FieldKind::Text {
                max: 128,
                free_text: false,
            },
        )
        .optional("value", FieldKind::Any)
        .optional("oldValue", FieldKind::Any)
}

fn dom_delta() -> Schema {
    Schema::new()
        .required("entityId", id())
        .with_default(
            "timestamp",
            FieldKind::Number {
                min: 0.0,
                max: f64::MAX,
            },
            Value::from(0.0),
        )
        .required(
            "changes",
            FieldKind::Array {
                max: 128,
                item: Box::new(FieldKind::Record(dom_change())),
            },
        )
}

/// Message type → payload schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Shapes for every wire message type.
    pub fn standard() -> Self {
        let mut registry = Self::empty();

        registry.register(
            MessageType::PeerHello.as_str(),
            Schema::new()
                .required("userId", id())
                .with_default("role", FieldKind::Enum(ROLES), Value::from("viewer"))
                .with_default("hasControl", FieldKind::Bool, Value::from(false))
                .optional("displayName", free_text(64)),
        );
        registry.register(
            MessageType::MouseMove.as_str(),
            Schema::new()
                .required("u", unit())
                .required("v", unit())
                .with_default(
                    "velocity",
                    FieldKind::Number {
                        min: 0.0,
                        max: 1.0e6,
                    },
                    Value::from(0.0),
                ),
        );
        registry.register(
            MessageType::MouseClick.as_str(),
            Schema::new()
                .required("u", unit())
                .required("v", unit())
                .with_default("button", FieldKind::Enum(BUTTONS), Value::from("left")),
        );
        registry.register(MessageType::MouseLeave.as_str(), Schema::new());
        registry.register(
            MessageType::ScrollUpdate.as_str(),
            Schema::new().required("x", unit()).required("y", unit()),
        );
        registry.register(
            MessageType::ChatMessage.as_str(),
            Schema::new()
                .optional("id", id())
                .required("text", free_text(MAX_CHAT_LEN)),
        );
        registry.register(
            MessageType::NoteCreate.as_str(),
            Schema::new()
                .required("id", id())
                .with_default("text", free_text(2000), Value::from(""))
                .required("u", unit())
                .required("v", unit())
                .optional("color", color()),
        );
        registry.register(
            MessageType::NoteUpdate.as_str(),
            Schema::new()
                .required("id", id())
                .optional("text", free_text(2000))
                .optional("u", unit())
                .optional("v", unit())
                .optional("color", color()),
        );
        registry.register(
            MessageType::NoteDelete.as_str(),
            Schema::new().required("id", id()),
        );
        registry.register(
            MessageType::DrawingStroke.as_str(),
            Schema::new()
                .required("id", id())
                .required(
                    "points",
                    FieldKind::Array {
                        max: 4096,
                        item: Box::new(unit()),
                    },
                )
                .optional("color", color())
                .with_default(
                    "width",
                    FieldKind::Number {
                        min: 0.5,
                        max: 64.0,
                    },
                    Value::from(2.0),
                ),
        );
        registry.register(MessageType::DrawingClear.as_str(), Schema::new());
        registry.register(
            MessageType::DomBatch.as_str(),
            Schema::new().required(
                "deltas",
                FieldKind::Array {
                    max: 256,
                    item: Box::new(FieldKind::Record(dom_delta())),
                },
            ),
        );
        registry.register(
            MessageType::ControlRequest.as_str(),
            Schema::new().optional("reason", free_text(200)),
        );
        registry.register(
            MessageType::ControlGrant.as_str(),
            Schema::new()
                .required("peerId", id())
                .with_default("granted", FieldKind::Bool, Value::from(true)),
        );
        registry.register(
            MessageType::LinkShare.as_str(),
            Schema::new()
                .optional("url", FieldKind::Url)
                .optional("title", free_text(200)),
        );

        registry
    }

    pub fn register(&mut self, msg_type: &str, schema: Schema) {
        self.schemas.insert(msg_type.to_string(), schema);
    }

    pub fn get(&self, msg_type: &str) -> Option<&Schema> {
        self.schemas.get(msg_type)
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.schemas.contains_key(msg_type)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(msg_type: &str, mut payload: Value) -> Result<Value, SchemaViolation> {
        let registry = SchemaRegistry::standard();
        registry.get(msg_type).unwrap().check(&mut payload)?;
        Ok(payload)
    }

    #[test]
    fn test_standard_registry_covers_wire_types() {
        let registry = SchemaRegistry::standard();
        for kind in MessageType::ALL {
            assert_eq!(registry.contains(kind.as_str()), !kind.is_local(), "{kind}");
        }
        assert_eq!(registry.len(), 15);
    }

    #[test]
    fn test_mouse_move_out_of_range() {
        let err = check("mouse:move", json!({"u": 1.5, "v": 0.2})).unwrap_err();
        assert_eq!(err.path, "u");
    }

    #[test]
    fn test_mouse_move_velocity_default() {
        let payload = check("mouse:move", json!({"u": 0.5, "v": 0.5})).unwrap();
        assert_eq!(payload["velocity"], 0.0);
    }

    #[test]
    fn test_chat_length_limit() {
        let long = "a".repeat(MAX_CHAT_LEN + 1000);
        assert!(check("chat:message", json!({ "text": long })).is_err());
        let ok = "a".repeat(MAX_CHAT_LEN);
        assert!(check("chat:message", json!({ "text": ok })).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let err = check("note:delete", json!({})).unwrap_err();
        assert_eq!(err.to_string(), "id: missing required field");
    }

    #[test]
    fn test_unknown_keys_stripped() {
        let payload = check("mouse:leave", json!({"evil": "<script>"})).unwrap();
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn test_null_payload_is_empty_object() {
        let payload = check("drawing:clear", Value::Null).unwrap();
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn test_enum_rejects_unknown_value() {
        assert!(check("peer:hello", json!({"userId": "u", "role": "admin"})).is_err());
        let payload = check("peer:hello", json!({"userId": "u"})).unwrap();
        assert_eq!(payload["role"], "viewer");
        assert_eq!(payload["hasControl"], false);
    }

    #[test]
    fn test_dom_batch_nested_paths() {
        let err = check(
            "dom:batch",
            json!({"deltas": [{"entityId": "e1", "changes": [{"type": "explode"}]}]}),
        )
        .unwrap_err();
        assert_eq!(err.path, "deltas[0].changes[0].type");
    }

    #[test]
    fn test_drawing_points_bounded() {
        let points: Vec<f64> = vec![0.5; 5000];
        assert!(check("drawing:stroke", json!({"id": "s", "points": points})).is_err());
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(check("mouse:leave", json!([1, 2])).is_err());
    }
}
