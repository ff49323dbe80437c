//! Inbound envelope gate.
//!
//! Every byte string a peer sends passes through [`Validator::validate`]
//! before anything else sees it:
//!
//! ```text
//! size ─► parse ─► depth ─► envelope shape ─► clock ─► layer ─► identity
//!      ─► reputation ─► rate ─► schema ─► sanitize ─► dom safety ─► Envelope
//! ```
//!
//! The first failing stage rejects the message with a [`ValidationError`].

pub mod rate;
pub mod reputation;
pub mod sanitize;
pub mod schema;

pub use rate::{RateLimiter, RateWindow};
pub use reputation::{
    BlockCause, PeerReport, PeerReputation, ReportLedger, ReportReason, ReputationPolicy,
    ReputationSource,
};
pub use schema::{FieldKind, Schema, SchemaRegistry, SchemaViolation};

use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

use crate::protocol::{now_millis, Envelope, MessageType};

/// Validation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Largest accepted raw envelope
    pub max_message_bytes: usize,
    /// Deepest accepted JSON nesting (the envelope object is depth 1)
    pub max_depth: usize,
    /// Messages per peer per rolling second
    pub max_per_second: usize,
    /// Messages per peer per rolling minute
    pub max_per_minute: usize,
    /// Peers tracked by the rate limiter before LRU eviction
    pub max_tracked_peers: usize,
    /// Largest accepted distance between an envelope timestamp and the
    /// local clock, in either direction
    pub max_clock_skew_ms: i64,
    pub reputation: ReputationPolicy,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            max_depth: 10,
            max_per_second: 120,
            max_per_minute: 3_000,
            max_tracked_peers: 1_024,
            max_clock_skew_ms: 5 * 60 * 1_000,
            reputation: ReputationPolicy::default(),
        }
    }
}

impl ValidationConfig {
    pub fn for_testing() -> Self {
        Self {
            max_message_bytes: 16 * 1024,
            max_depth: 10,
            max_per_second: 1_000,
            max_per_minute: 10_000,
            max_tracked_peers: 64,
            max_clock_skew_ms: 60 * 1_000,
            reputation: ReputationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Message nested deeper than {max}")]
    TooDeep { max: usize },
    #[error("Timestamp {timestamp} outside accepted clock skew")]
    ClockSkew { timestamp: i64 },
    #[error("Layer mismatch: expected {expected}, got {actual}")]
    LayerMismatch { expected: String, actual: String },
    #[error("Impersonation: envelope claims {claimed}, channel bound to {bound}")]
    Impersonation { claimed: String, bound: String },
    #[error("Sender blocked: {0}")]
    Blocked(String),
    #[error("Rate limited ({0})")]
    RateLimited(RateWindow),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {msg_type} payload: {reason}")]
    Schema { msg_type: String, reason: String },
    #[error("Unsafe DOM property: {0}")]
    UnsafeProperty(String),
    #[error("Element tag not allowed: {0}")]
    UnsafeTag(String),
}

/// Who a message came from, as far as the link knows.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    /// Transport-level peer id, used as the rate key before a handshake.
    pub peer_id: &'a str,
    /// User id bound to the channel at handshake, if it completed.
    pub bound_user: Option<&'a str>,
}

impl<'a> Origin<'a> {
    pub fn unbound(peer_id: &'a str) -> Self {
        Self {
            peer_id,
            bound_user: None,
        }
    }

    pub fn bound(peer_id: &'a str, user_id: &'a str) -> Self {
        Self {
            peer_id,
            bound_user: Some(user_id),
        }
    }

    fn rate_key(&self) -> &'a str {
        self.bound_user.unwrap_or(self.peer_id)
    }
}

/// Deepest nesting level in `value`, scanned iteratively.
pub fn json_depth(value: &Value) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(value, 1usize)];
    while let Some((v, depth)) = stack.pop() {
        deepest = deepest.max(depth);
        match v {
            Value::Array(items) => stack.extend(items.iter().map(|i| (i, depth + 1))),
            Value::Object(map) => stack.extend(map.values().map(|i| (i, depth + 1))),
            _ => {}
        }
    }
    deepest
}

/// Attribute names a remote peer may set.
pub fn is_safe_property(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')) {
        return false;
    }
    !name.to_ascii_lowercase().starts_with("on")
}

/// Tags a remote `create` may instantiate. Anything that executes,
/// embeds another document or changes how the page resolves URLs is absent.
pub const ALLOWED_TAGS: &[&str] = &[
    "a", "article", "aside", "b", "blockquote", "br", "button", "code", "div", "em", "footer",
    "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "i", "img", "label", "li", "mark", "ol",
    "p", "pre", "section", "small", "span", "strong", "ul",
    // svg drawing primitives
    "circle", "ellipse", "g", "line", "path", "polygon", "polyline", "rect", "svg", "text",
    "tspan",
];

/// Attributes whose value is fetched or navigated to.
const URL_ATTRIBUTES: &[&str] = &[
    "action",
    "background",
    "cite",
    "formaction",
    "href",
    "poster",
    "src",
    "srcset",
    "xlink:href",
];

pub fn is_allowed_tag(tag: &str) -> bool {
    ALLOWED_TAGS.contains(&tag.to_ascii_lowercase().as_str())
}

pub fn is_url_attribute(name: &str) -> bool {
    URL_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str())
}

/// Reject unsafe properties and tags; rewrite URL attributes to their
/// normalized http(s) form and drop the ones that have none.
fn check_dom_batch(payload: &mut Value) -> Result<(), ValidationError> {
    let Some(deltas) = payload.get_mut("deltas").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for delta in deltas {
        let Some(changes) = delta.get_mut("changes").and_then(Value::as_array_mut) else {
            continue;
        };
        for change in changes.iter() {
            if let Some(property) = change.get("property").and_then(Value::as_str) {
                if !is_safe_property(property) {
                    return Err(ValidationError::UnsafeProperty(property.to_string()));
                }
            }
            if change["type"] == "create" {
                let tag = change["value"]["tag"].as_str().unwrap_or_default();
                if !is_allowed_tag(tag) {
                    return Err(ValidationError::UnsafeTag(tag.to_string()));
                }
                if let Some(attrs) = change["value"]["dataAttributes"].as_object() {
                    if let Some(bad) = attrs
                        .keys()
                        .find(|k| !k.starts_with("data-") || !is_safe_property(k))
                    {
                        return Err(ValidationError::UnsafeProperty(bad.clone()));
                    }
                }
            }
        }
        changes.retain_mut(|change| {
            let url_attribute = change["type"] == "attribute"
                && change
                    .get("property")
                    .and_then(Value::as_str)
                    .is_some_and(is_url_attribute);
            if !url_attribute {
                return true;
            }
            let cleaned = match change.get("value") {
                None | Some(Value::Null) => return true,
                Some(Value::String(s)) => sanitize::safe_url(s),
                Some(_) => None,
            };
            match cleaned {
                Some(url) => {
                    change["value"] = Value::String(url);
                    true
                }
                None => {
                    log::warn!("Dropped URL attribute without an http(s) value from dom:batch");
                    false
                }
            }
        });
    }
    Ok(())
}

/// The inbound gate for one layer.
pub struct Validator {
    config: ValidationConfig,
    layer_id: String,
    registry: SchemaRegistry,
    limiter: Mutex<RateLimiter>,
    reputation: Option<Arc<dyn ReputationSource>>,
}

impl Validator {
    pub fn new(config: ValidationConfig, layer_id: impl Into<String>) -> Self {
        let limiter = RateLimiter::new(
            config.max_per_second,
            config.max_per_minute,
            config.max_tracked_peers,
        );
        Self {
            config,
            layer_id: layer_id.into(),
            registry: SchemaRegistry::standard(),
            limiter: Mutex::new(limiter),
            reputation: None,
        }
    }

    pub fn with_reputation(mut self, source: Arc<dyn ReputationSource>) -> Self {
        self.reputation = Some(source);
        self
    }

    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run every stage. On success the returned envelope's payload has
    /// defaults filled, undeclared keys stripped and free text encoded.
    pub fn validate(&self, raw: &[u8], origin: Origin<'_>) -> Result<Envelope, ValidationError> {
        if raw.len() > self.config.max_message_bytes {
            return Err(ValidationError::TooLarge {
                size: raw.len(),
                max: self.config.max_message_bytes,
            });
        }

        let value: Value =
            serde_json::from_slice(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if json_depth(&value) > self.config.max_depth {
            return Err(ValidationError::TooDeep {
                max: self.config.max_depth,
            });
        }

        let mut envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ValidationError::Malformed(format!("envelope shape: {e}")))?;
        if envelope.user_id.is_empty() || envelope.user_id.len() > 128 {
            return Err(ValidationError::Malformed("invalid userId".into()));
        }

        if envelope.timestamp.abs_diff(now_millis()) > self.config.max_clock_skew_ms.unsigned_abs() {
            return Err(ValidationError::ClockSkew {
                timestamp: envelope.timestamp,
            });
        }

        if envelope.layer_id != self.layer_id {
            return Err(ValidationError::LayerMismatch {
                expected: self.layer_id.clone(),
                actual: envelope.layer_id,
            });
        }

        if let Some(bound) = origin.bound_user {
            if envelope.user_id != bound {
                return Err(ValidationError::Impersonation {
                    claimed: envelope.user_id,
                    bound: bound.to_string(),
                });
            }
        }

        if let Some(source) = &self.reputation {
            if let Some(cause) =
                self.config
                    .reputation
                    .evaluate(source.as_ref(), &envelope.user_id, now_millis())
            {
                return Err(ValidationError::Blocked(cause.to_string()));
            }
        }

        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_record(origin.rate_key(), Instant::now())
            .map_err(ValidationError::RateLimited)?;

        let local = envelope.kind().is_some_and(|k| k.is_local());
        let schema = match self.registry.get(&envelope.msg_type) {
            Some(schema) if !local => schema,
            _ => return Err(ValidationError::UnknownType(envelope.msg_type)),
        };
        schema
            .check(&mut envelope.payload)
            .map_err(|v| ValidationError::Schema {
                msg_type: envelope.msg_type.clone(),
                reason: v.to_string(),
            })?;

        sanitize::sanitize(schema, &mut envelope.payload);

        if envelope.is(MessageType::DomBatch) {
            check_dom_batch(&mut envelope.payload)?;
        }

        Ok(envelope)
    }

    /// Forget a peer's rate windows, e.g. after it disconnects.
    pub fn forget(&self, rate_key: &str) {
        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(rate_key);
    }
}
