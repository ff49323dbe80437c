//! # overlay-core — element model for the collaborative overlay
//!
//! The replication layer never talks to a rendering surface directly. It
//! goes through [`DomTarget`], which exposes mutation capture
//! (`observe` + `take_records`) and the primitive mutate operations the
//! apply path needs. [`ElementTree`] is the in-memory implementation used
//! by tests, benchmarks and headless peers.
//!
//! ```text
//! app code ──mutate──► ElementTree ──records──► DomReplicator (overlay-collab)
//!                          ▲                          │
//!                          └──────── apply ◄──────────┘  (remote deltas)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod target;
pub mod tree;

pub use target::{DomError, DomTarget, MutationRecord};
pub use tree::ElementTree;

/// Attribute that opts an element into replication.
pub const SYNC_MARKER: &str = "data-sync";

/// Attribute carrying the stable cross-peer entity id.
pub const ENTITY_ID_ATTR: &str = "data-entity-id";

/// Stable identifier tying one local element to its replicas on other peers.
pub type EntityId = String;

/// Generate a fresh entity id for a newly marked element.
pub fn new_entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}

/// Full serialized form of one element, carried by `create` changes.
///
/// Only `data-*` attributes travel; everything else on the element is
/// considered local presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    pub entity_id: EntityId,
    pub tag: String,
    /// Entity id of the parent element, if the parent is itself replicated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    #[serde(default)]
    pub data_attributes: BTreeMap<String, String>,
    /// Inline style, serialized as one declaration string.
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub text: String,
}

impl ElementSnapshot {
    /// Snapshot of a new, marked element with no content.
    pub fn marked(entity_id: impl Into<EntityId>, tag: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        let mut data_attributes = BTreeMap::new();
        data_attributes.insert(SYNC_MARKER.to_string(), "true".to_string());
        data_attributes.insert(ENTITY_ID_ATTR.to_string(), entity_id.clone());
        Self {
            entity_id,
            tag: tag.into(),
            parent: None,
            data_attributes,
            style: String::new(),
            text: String::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<EntityId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data_attributes.insert(name.into(), value.into());
        self
    }

    /// Whether the snapshot carries the replication marker.
    pub fn is_marked(&self) -> bool {
        self.data_attributes.contains_key(SYNC_MARKER)
    }
}
