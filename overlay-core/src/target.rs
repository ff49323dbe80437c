//! Mutation capture and primitive mutation capability.
//!
//! Modelled on the browser's `MutationObserver`: a target records
//! mutations under observed roots into a queue, and the consumer drains
//! that queue with [`DomTarget::take_records`]. Draining is what lets the
//! replicator discard exactly the records its own apply produced.

use thiserror::Error;

use crate::{ElementSnapshot, EntityId};

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    /// An attribute changed. `style` is reported here too, as on the web.
    Attribute {
        target: EntityId,
        name: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    /// Text content of an element changed.
    Text {
        target: EntityId,
        old_value: String,
        new_value: String,
    },
    /// An element was inserted under an observed root.
    ChildAdded { snapshot: ElementSnapshot },
    /// An element was removed. `marked` reflects its state at removal.
    ChildRemoved { target: EntityId, marked: bool },
}

impl MutationRecord {
    /// Entity the record is about.
    pub fn target(&self) -> &str {
        match self {
            MutationRecord::Attribute { target, .. } => target,
            MutationRecord::Text { target, .. } => target,
            MutationRecord::ChildAdded { snapshot } => &snapshot.entity_id,
            MutationRecord::ChildRemoved { target, .. } => target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
    #[error("Element not found: {0}")]
    NotFound(EntityId),
    #[error("Entity id already in use: {0}")]
    DuplicateEntity(EntityId),
    #[error("Cannot remove the root element")]
    RootRemoval,
}

/// Environment-specific rendering surface, reduced to what replication needs.
pub trait DomTarget {
    /// Start recording mutations in the subtree rooted at `root`.
    fn observe(&mut self, root: &str) -> Result<(), DomError>;

    /// Drain every record queued since the last call.
    fn take_records(&mut self) -> Vec<MutationRecord>;

    fn contains(&self, id: &str) -> bool;

    /// Whether the element carries the replication marker.
    fn is_marked(&self, id: &str) -> bool;

    fn snapshot(&self, id: &str) -> Option<ElementSnapshot>;

    fn set_attribute(&mut self, id: &str, name: &str, value: &str) -> Result<(), DomError>;

    fn remove_attribute(&mut self, id: &str, name: &str) -> Result<(), DomError>;

    /// Replace the full inline style string.
    fn set_style(&mut self, id: &str, style: &str) -> Result<(), DomError>;

    fn set_text(&mut self, id: &str, text: &str) -> Result<(), DomError>;

    /// Instantiate an element from a snapshot and append it to `parent`
    /// (the root when `None`).
    fn create_element(
        &mut self,
        parent: Option<&str>,
        snapshot: &ElementSnapshot,
    ) -> Result<(), DomError>;

    fn remove_element(&mut self, id: &str) -> Result<(), DomError>;
}
