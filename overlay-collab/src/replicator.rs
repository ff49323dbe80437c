//! DOM delta replication over a [`DomTarget`].
//!
//! ```text
//! local mutation ──► take_records ──► pending (per entity, coalesced)
//!                                         │ every flush window
//!                                         ▼
//!                              dom:batch { deltas } ──► peers
//!
//! dom:batch ──► apply (suppress scope) ──► DomTarget writes
//!                   └─ records produced here are drained and discarded
//! ```
//!
//! Per entity: `absent --create--> present --(attribute|style|text)*-->
//! present --delete--> absent`. Updates that arrive for an absent entity
//! are parked and replayed by a later `create`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use overlay_core::{DomError, DomTarget, ElementSnapshot, EntityId, MutationRecord, ENTITY_ID_ATTR, SYNC_MARKER};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::link::{HandlerError, LinkManager};
use crate::protocol::{now_millis, MessageType};
use crate::transport::Transport;
use crate::validation::{is_allowed_tag, is_url_attribute, sanitize};

/// Most changes carried by one delta.
pub const MAX_CHANGES_PER_DELTA: usize = 128;

/// Most deltas carried by one `dom:batch` message.
pub const MAX_DELTAS_PER_MESSAGE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Attribute,
    Style,
    Text,
    Create,
    Delete,
}

/// One change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl DomChange {
    pub fn attribute(name: &str, value: Option<&str>, old_value: Option<&str>) -> Self {
        Self {
            kind: ChangeKind::Attribute,
            property: Some(name.to_string()),
            value: value.map(Value::from),
            old_value: old_value.map(Value::from),
        }
    }

    pub fn style(style: &str, old_value: Option<&str>) -> Self {
        Self {
            kind: ChangeKind::Style,
            property: None,
            value: Some(Value::from(style)),
            old_value: old_value.map(Value::from),
        }
    }

    pub fn text(text: &str, old_value: Option<&str>) -> Self {
        Self {
            kind: ChangeKind::Text,
            property: None,
            value: Some(Value::from(text)),
            old_value: old_value.map(Value::from),
        }
    }

    pub fn create(snapshot: &ElementSnapshot) -> Self {
        Self {
            kind: ChangeKind::Create,
            property: None,
            value: serde_json::to_value(snapshot).ok(),
            old_value: None,
        }
    }

    pub fn delete() -> Self {
        Self {
            kind: ChangeKind::Delete,
            property: None,
            value: None,
            old_value: None,
        }
    }

    fn is_structural(&self) -> bool {
        matches!(self.kind, ChangeKind::Create | ChangeKind::Delete)
    }

    fn value_str(&self) -> Option<String> {
        match self.value.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Changes for one entity accumulated over one flush window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomDelta {
    pub entity_id: EntityId,
    #[serde(default)]
    pub timestamp: f64,
    pub changes: Vec<DomChange>,
}

#[derive(Debug, Deserialize)]
struct DomBatch {
    deltas: Vec<DomDelta>,
}

/// Replicator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Batch window
    pub flush_interval_ms: u64,
    /// How long updates for an absent entity wait for its create
    pub park_ttl_ms: u64,
    pub max_parked_per_entity: usize,
    pub max_parked_entities: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
            park_ttl_ms: 5_000,
            max_parked_per_entity: 32,
            max_parked_entities: 256,
        }
    }
}

/// What happened to one received change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Entity absent; kept until its create arrives.
    Parked,
    /// Entity absent or not replicated; change discarded.
    Missing,
    /// Create for an entity that already exists.
    Duplicate,
    /// Change could not be interpreted.
    Invalid,
}

/// Tally of one [`DomReplicator::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub parked: usize,
    pub missing: usize,
    pub duplicates: usize,
    pub invalid: usize,
    /// Parked updates replayed by creates in this call.
    pub replayed: usize,
}

impl ApplyReport {
    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Parked => self.parked += 1,
            ApplyOutcome::Missing => self.missing += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Invalid => self.invalid += 1,
        }
    }
}

#[derive(Debug, Default)]
struct PendingDelta {
    first_at: f64,
    changes: Vec<DomChange>,
}

impl PendingDelta {
    /// Index after the last create/delete. Updates only coalesce past it.
    fn epoch_start(&self) -> usize {
        self.changes
            .iter()
            .rposition(DomChange::is_structural)
            .map_or(0, |i| i + 1)
    }

    fn push(&mut self, change: DomChange) {
        match change.kind {
            ChangeKind::Create => self.changes.push(change),
            ChangeKind::Delete => {
                match self
                    .changes
                    .iter()
                    .rposition(|c| c.kind == ChangeKind::Create)
                {
                    // Created and removed in the same window: nothing new
                    // reaches peers past what preceded the create.
                    Some(i) => self.changes.truncate(i),
                    None => {
                        self.changes.clear();
                        self.changes.push(change);
                    }
                }
            }
            _ => {
                let start = self.epoch_start();
                let existing = self.changes[start..]
                    .iter_mut()
                    .find(|c| c.kind == change.kind && c.property == change.property);
                match existing {
                    Some(c) => c.value = change.value,
                    None => self.changes.push(change),
                }
            }
        }
    }

    fn has_create(&self) -> bool {
        self.changes.iter().any(|c| c.kind == ChangeKind::Create)
    }

    fn ends_in_delete(&self) -> bool {
        self.changes.last().is_some_and(|c| c.kind == ChangeKind::Delete)
    }
}

struct Parked {
    at: Instant,
    change: DomChange,
}

struct State<D> {
    target: D,
    root: EntityId,
    pending: IndexMap<EntityId, PendingDelta>,
    parked: HashMap<EntityId, Vec<Parked>>,
    suppress_depth: u32,
    discarded: u64,
}

impl<D: DomTarget> State<D> {
    fn queue(&mut self, entity: &str, change: DomChange) {
        let delta = self
            .pending
            .entry(entity.to_string())
            .or_insert_with(|| PendingDelta {
                first_at: now_millis() as f64,
                changes: Vec::new(),
            });
        delta.push(change);
        if delta.changes.is_empty() {
            self.pending.shift_remove(entity);
        }
    }

    /// Turn queued mutation records into pending changes.
    fn capture(&mut self) {
        for record in self.target.take_records() {
            match record {
                MutationRecord::Attribute {
                    target,
                    name,
                    old_value,
                    new_value,
                } => {
                    if name == SYNC_MARKER {
                        if new_value.is_some() && !self.pending_create(&target) {
                            if let Some(snapshot) = self.target.snapshot(&target) {
                                self.queue(&target, DomChange::create(&snapshot));
                            }
                        } else if new_value.is_none() && old_value.is_some() {
                            // Unmarked elements stop replicating; peers drop their copy.
                            self.queue(&target, DomChange::delete());
                        }
                        continue;
                    }
                    if name == ENTITY_ID_ATTR || !self.tracks(&target) {
                        continue;
                    }
                    let change = if name == "style" {
                        DomChange::style(new_value.as_deref().unwrap_or(""), old_value.as_deref())
                    } else {
                        DomChange::attribute(&name, new_value.as_deref(), old_value.as_deref())
                    };
                    self.queue(&target, change);
                }
                MutationRecord::Text {
                    target,
                    old_value,
                    new_value,
                } => {
                    if self.tracks(&target) {
                        self.queue(&target, DomChange::text(&new_value, Some(&old_value)));
                    }
                }
                MutationRecord::ChildAdded { snapshot } => {
                    if snapshot.is_marked() {
                        let entity = snapshot.entity_id.clone();
                        self.queue(&entity, DomChange::create(&snapshot));
                    }
                }
                MutationRecord::ChildRemoved { target, marked } => {
                    if marked {
                        self.queue(&target, DomChange::delete());
                    }
                }
            }
        }
    }

    fn tracks(&self, entity: &str) -> bool {
        self.target.is_marked(entity)
            || self
                .pending
                .get(entity)
                .is_some_and(|delta| !delta.ends_in_delete())
    }

    fn pending_create(&self, entity: &str) -> bool {
        self.pending.get(entity).is_some_and(PendingDelta::has_create)
    }

    fn enter_suppress(&mut self) {
        if self.suppress_depth == 0 {
            self.capture();
        }
        self.suppress_depth += 1;
    }

    fn exit_suppress(&mut self) {
        self.suppress_depth = self.suppress_depth.saturating_sub(1);
        if self.suppress_depth == 0 {
            let echoed = self.target.take_records().len();
            self.discarded += echoed as u64;
            if echoed > 0 {
                log::debug!("Discarded {echoed} records produced by remote apply");
            }
        }
    }

    fn expire_parked(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.parked.retain(|entity, changes| {
            let before = changes.len();
            changes.retain(|p| now.duration_since(p.at) < ttl);
            if changes.len() < before {
                log::warn!(
                    "Dropped {} parked updates for {entity}: create never arrived",
                    before - changes.len()
                );
            }
            !changes.is_empty()
        });
    }

    fn park(&mut self, entity: &str, change: DomChange, config: &ReplicatorConfig) -> ApplyOutcome {
        if !self.parked.contains_key(entity) && self.parked.len() >= config.max_parked_entities {
            log::warn!("Park limit reached, dropping update for missing entity {entity}");
            return ApplyOutcome::Missing;
        }
        let queue = self.parked.entry(entity.to_string()).or_default();
        if queue.len() >= config.max_parked_per_entity {
            queue.remove(0);
        }
        queue.push(Parked {
            at: Instant::now(),
            change,
        });
        log::warn!("Entity {entity} not found, parking update until it is created");
        ApplyOutcome::Parked
    }

    fn apply_change(
        &mut self,
        entity: &str,
        change: DomChange,
        config: &ReplicatorConfig,
        report: &mut ApplyReport,
    ) -> ApplyOutcome {
        match change.kind {
            ChangeKind::Create => self.apply_create(entity, &change, config, report),
            ChangeKind::Delete => {
                if let Some(parked) = self.parked.remove(entity) {
                    log::warn!("Discarded {} parked updates for deleted {entity}", parked.len());
                }
                if !self.target.contains(entity) {
                    log::warn!("Delete for missing entity {entity} skipped");
                    return ApplyOutcome::Missing;
                }
                if !self.target.is_marked(entity) {
                    log::warn!("Refusing to delete unreplicated element {entity}");
                    return ApplyOutcome::Missing;
                }
                outcome(entity, self.target.remove_element(entity))
            }
            ChangeKind::Attribute | ChangeKind::Style | ChangeKind::Text => {
                if !self.target.contains(entity) {
                    return self.park(entity, change, config);
                }
                if !self.target.is_marked(entity) {
                    log::warn!("Refusing to update unreplicated element {entity}");
                    return ApplyOutcome::Missing;
                }
                self.apply_update(entity, &change)
            }
        }
    }

    fn apply_create(
        &mut self,
        entity: &str,
        change: &DomChange,
        config: &ReplicatorConfig,
        report: &mut ApplyReport,
    ) -> ApplyOutcome {
        let Some(mut snapshot) = change
            .value
            .clone()
            .and_then(|v| serde_json::from_value::<ElementSnapshot>(v).ok())
        else {
            log::warn!("Create for {entity} carries no usable snapshot");
            return ApplyOutcome::Invalid;
        };
        if !is_allowed_tag(&snapshot.tag) {
            log::warn!("Create for {entity} uses disallowed tag '{}'", snapshot.tag);
            return ApplyOutcome::Invalid;
        }
        if self.target.contains(entity) {
            log::debug!("Entity {entity} already exists, create skipped");
            return ApplyOutcome::Duplicate;
        }

        snapshot.entity_id = entity.to_string();
        snapshot
            .data_attributes
            .insert(SYNC_MARKER.to_string(), "true".to_string());
        snapshot
            .data_attributes
            .insert(ENTITY_ID_ATTR.to_string(), entity.to_string());
        let parent = match snapshot.parent.as_deref() {
            Some(p) if self.target.contains(p) => p.to_string(),
            Some(p) => {
                log::warn!("Parent {p} of {entity} not found, appending to root");
                self.root.clone()
            }
            None => self.root.clone(),
        };

        let created = outcome(entity, self.target.create_element(Some(&parent), &snapshot));
        if created == ApplyOutcome::Applied {
            if let Some(parked) = self.parked.remove(entity) {
                let ttl = Duration::from_millis(config.park_ttl_ms);
                self.enter_suppress();
                for p in parked.into_iter().filter(|p| p.at.elapsed() < ttl) {
                    let replayed = self.apply_change(entity, p.change, config, report);
                    if replayed == ApplyOutcome::Applied {
                        report.replayed += 1;
                    }
                }
                self.exit_suppress();
            }
        }
        created
    }

    fn apply_update(&mut self, entity: &str, change: &DomChange) -> ApplyOutcome {
        match change.kind {
            ChangeKind::Attribute => {
                let Some(name) = change.property.as_deref() else {
                    return ApplyOutcome::Invalid;
                };
                if name == SYNC_MARKER || name == ENTITY_ID_ATTR {
                    return ApplyOutcome::Invalid;
                }
                let value = match change.value_str() {
                    Some(value) if is_url_attribute(name) => match sanitize::safe_url(&value) {
                        Some(url) => Some(url),
                        None => {
                            log::warn!("Refusing non-http(s) {name} on {entity}");
                            return ApplyOutcome::Invalid;
                        }
                    },
                    other => other,
                };
                let result = match value {
                    Some(value) => self.target.set_attribute(entity, name, &value),
                    None => self.target.remove_attribute(entity, name),
                };
                outcome(entity, result)
            }
            ChangeKind::Style => {
                let style = change.value_str().unwrap_or_default();
                outcome(entity, self.target.set_style(entity, &style))
            }
            ChangeKind::Text => {
                let text = change.value_str().unwrap_or_default();
                outcome(entity, self.target.set_text(entity, &text))
            }
            ChangeKind::Create | ChangeKind::Delete => ApplyOutcome::Invalid,
        }
    }
}

fn outcome(entity: &str, result: Result<(), DomError>) -> ApplyOutcome {
    match result {
        Ok(()) => ApplyOutcome::Applied,
        Err(e) => {
            log::warn!("Apply to {entity} failed: {e}");
            ApplyOutcome::Missing
        }
    }
}

/// Keeps the marked subtree of one [`DomTarget`] in step with peers.
///
/// Cheap to clone; clones share the same target and pending set.
pub struct DomReplicator<D> {
    state: Arc<Mutex<State<D>>>,
    config: ReplicatorConfig,
}

impl<D> Clone for DomReplicator<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: DomTarget> DomReplicator<D> {
    /// Start observing `root` on `target`.
    pub fn new(mut target: D, root: &str, config: ReplicatorConfig) -> Result<Self, DomError> {
        target.observe(root)?;
        // Mutations made before replication started are not replayed.
        target.take_records();
        Ok(Self {
            state: Arc::new(Mutex::new(State {
                target,
                root: root.to_string(),
                pending: IndexMap::new(),
                parked: HashMap::new(),
                suppress_depth: 0,
                discarded: 0,
            })),
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the target locally. Resulting records are captured.
    pub fn with_target<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state.target);
        if state.suppress_depth == 0 {
            state.capture();
        }
        result
    }

    /// Read the target.
    pub fn inspect<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.lock().target)
    }

    /// Add an element to replication after start. Marks it when needed and
    /// queues its `create`.
    pub fn observe(&self, entity_id: &str) -> Result<(), DomError> {
        let mut state = self.lock();
        if !state.target.contains(entity_id) {
            return Err(DomError::NotFound(entity_id.to_string()));
        }
        state.target.observe(entity_id)?;
        if !state.target.is_marked(entity_id) {
            state.target.set_attribute(entity_id, ENTITY_ID_ATTR, entity_id)?;
            state.target.set_attribute(entity_id, SYNC_MARKER, "true")?;
        }
        state.capture();
        if !state.pending_create(entity_id) {
            if let Some(snapshot) = state.target.snapshot(entity_id) {
                state.queue(entity_id, DomChange::create(&snapshot));
            }
        }
        Ok(())
    }

    /// Drain the pending set into deltas. `None` when nothing changed.
    pub fn flush(&self) -> Option<Vec<DomDelta>> {
        let mut state = self.lock();
        if state.suppress_depth == 0 {
            state.capture();
        }
        if state.pending.is_empty() {
            return None;
        }
        let mut deltas = Vec::with_capacity(state.pending.len());
        for (entity_id, pending) in state.pending.drain(..) {
            for chunk in pending.changes.chunks(MAX_CHANGES_PER_DELTA) {
                deltas.push(DomDelta {
                    entity_id: entity_id.clone(),
                    timestamp: pending.first_at,
                    changes: chunk.to_vec(),
                });
            }
        }
        Some(deltas)
    }

    /// Apply received deltas. Never produces outbound deltas of its own.
    pub fn apply(&self, deltas: &[DomDelta]) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut state = self.lock();
        state.expire_parked(Duration::from_millis(self.config.park_ttl_ms));
        state.enter_suppress();
        for delta in deltas {
            for change in &delta.changes {
                let result = state.apply_change(&delta.entity_id, change.clone(), &self.config, &mut report);
                report.count(result);
            }
        }
        state.exit_suppress();
        report
    }

    /// Entities with queued local changes.
    pub fn pending_entities(&self) -> usize {
        self.lock().pending.len()
    }

    /// Updates waiting for a create.
    pub fn parked_updates(&self) -> usize {
        self.lock().parked.values().map(Vec::len).sum()
    }

    /// Records dropped because a remote apply produced them.
    pub fn discarded_records(&self) -> u64 {
        self.lock().discarded
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }
}

impl<D: DomTarget + Send + 'static> DomReplicator<D> {
    /// Apply `dom:batch` from `link` and broadcast local deltas every flush
    /// window. Abort the returned task to stop sending.
    pub fn attach<T: Transport>(&self, link: &LinkManager<T>) -> JoinHandle<()> {
        let replicator = self.clone();
        link.on(MessageType::DomBatch.as_str(), move |env| {
            let batch: DomBatch = env
                .payload_as()
                .map_err(|e| HandlerError::new(e.to_string()))?;
            let report = replicator.apply(&batch.deltas);
            log::debug!("Applied dom:batch from {}: {report:?}", env.user_id);
            Ok(())
        });

        let replicator = self.clone();
        let link = link.clone();
        let period = Duration::from_millis(self.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(deltas) = replicator.flush() else {
                    continue;
                };
                for chunk in deltas.chunks(MAX_DELTAS_PER_MESSAGE) {
                    link.broadcast(MessageType::DomBatch.as_str(), json!({ "deltas": chunk }));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::ElementTree;

    fn replica() -> DomReplicator<ElementTree> {
        DomReplicator::new(ElementTree::new("root"), "root", ReplicatorConfig::default()).unwrap()
    }

    fn changes_of(deltas: &[DomDelta], entity: &str) -> Vec<DomChange> {
        deltas
            .iter()
            .filter(|d| d.entity_id == entity)
            .flat_map(|d| d.changes.clone())
            .collect()
    }

    #[test]
    fn test_empty_pending_produces_no_flush() {
        let rep = replica();
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_create_captured_with_snapshot() {
        let rep = replica();
        rep.with_target(|t| {
            t.append_marked("root", "note-1", "div").unwrap();
            t.set_text("note-1", "hello").unwrap();
        });
        let deltas = rep.flush().unwrap();
        let changes = changes_of(&deltas, "note-1");
        assert_eq!(changes[0].kind, ChangeKind::Create);
        assert_eq!(changes[0].value.as_ref().unwrap()["tag"], "div");
        assert_eq!(changes[1], DomChange::text("hello", Some("")));
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_style_captured_whole() {
        let rep = replica();
        rep.with_target(|t| t.append_marked("root", "n", "div").unwrap());
        let _ = rep.flush();
        rep.with_target(|t| t.set_style("n", "color: red; margin: 0 4px;").unwrap());
        let changes = changes_of(&rep.flush().unwrap(), "n");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Style);
        assert!(changes[0].property.is_none());
        assert_eq!(changes[0].value, Some(Value::from("color: red; margin: 0 4px;")));
    }

    #[test]
    fn test_same_property_coalesces() {
        let rep = replica();
        rep.with_target(|t| t.append_marked("root", "n", "div").unwrap());
        let _ = rep.flush();
        rep.with_target(|t| {
            t.set_attribute("n", "data-color", "red").unwrap();
            t.set_attribute("n", "data-color", "green").unwrap();
            t.set_attribute("n", "data-color", "blue").unwrap();
        });
        let changes = changes_of(&rep.flush().unwrap(), "n");
        assert_eq!(changes, vec![DomChange::attribute("data-color", Some("blue"), None)]);
    }

    #[test]
    fn test_unmarked_elements_ignored() {
        let rep = replica();
        rep.with_target(|t| {
            t.append_element("root", "plain", "div").unwrap();
            t.set_text("plain", "x").unwrap();
        });
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let rep = replica();
        rep.with_target(|t| {
            t.append_marked("root", "tmp", "div").unwrap();
            t.set_text("tmp", "x").unwrap();
            t.remove_element("tmp").unwrap();
        });
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_delete_supersedes_updates() {
        let rep = replica();
        rep.with_target(|t| t.append_marked("root", "n", "div").unwrap());
        let _ = rep.flush();
        rep.with_target(|t| {
            t.set_text("n", "bye").unwrap();
            t.remove_element("n").unwrap();
        });
        assert_eq!(changes_of(&rep.flush().unwrap(), "n"), vec![DomChange::delete()]);
    }

    #[test]
    fn test_unmarking_replicates_delete() {
        let rep = replica();
        rep.with_target(|t| t.append_marked("root", "n", "div").unwrap());
        let _ = rep.flush();
        rep.with_target(|t| {
            t.set_text("n", "draft").unwrap();
            t.remove_attribute("n", SYNC_MARKER).unwrap();
            t.set_text("n", "local only").unwrap();
        });
        assert_eq!(changes_of(&rep.flush().unwrap(), "n"), vec![DomChange::delete()]);

        rep.with_target(|t| t.set_text("n", "still local").unwrap());
        assert!(rep.flush().is_none());

        rep.with_target(|t| {
            t.append_marked("root", "brief", "div").unwrap();
            t.remove_attribute("brief", SYNC_MARKER).unwrap();
        });
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_observe_after_start_queues_create() {
        let rep = replica();
        rep.with_target(|t| t.append_element("root", "late", "section").unwrap());
        assert!(rep.flush().is_none());

        rep.observe("late").unwrap();
        let changes = changes_of(&rep.flush().unwrap(), "late");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Create);
        assert!(rep.observe("missing").is_err());
    }

    #[test]
    fn test_apply_does_not_echo() {
        let source = replica();
        let sink = replica();
        source.with_target(|t| {
            t.append_marked("root", "n", "div").unwrap();
            t.set_style("n", "left: 10px;").unwrap();
            t.set_attribute("n", "data-color", "red").unwrap();
        });
        let deltas = source.flush().unwrap();

        let report = sink.apply(&deltas);
        assert_eq!(report.applied, 3);
        assert!(sink.flush().is_none());
        assert!(sink.discarded_records() > 0);
    }

    #[test]
    fn test_local_records_survive_apply() {
        let local = replica();
        let remote = replica();
        remote.with_target(|t| t.append_marked("root", "r", "div").unwrap());
        let deltas = remote.flush().unwrap();

        // Local mutation made directly on the target, not yet captured.
        {
            let mut state = local.lock();
            state.target.append_marked("root", "l", "div").unwrap();
        }
        local.apply(&deltas);
        let flushed = local.flush().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].entity_id, "l");
    }

    #[test]
    fn test_missing_entity_update_parked_then_replayed() {
        let rep = replica();
        let update = DomDelta {
            entity_id: "n".into(),
            timestamp: 1.0,
            changes: vec![DomChange::text("early", None)],
        };
        let report = rep.apply(std::slice::from_ref(&update));
        assert_eq!(report.parked, 1);
        assert_eq!(rep.parked_updates(), 1);

        let create = DomDelta {
            entity_id: "n".into(),
            timestamp: 2.0,
            changes: vec![DomChange::create(&ElementSnapshot::marked("n", "div"))],
        };
        let report = rep.apply(&[create]);
        assert_eq!(report.applied, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(rep.parked_updates(), 0);
        assert_eq!(rep.inspect(|t| t.text("n").map(str::to_string)), Some("early".into()));
        assert!(rep.flush().is_none());
    }

    #[test]
    fn test_delete_discards_parked() {
        let rep = replica();
        rep.apply(&[DomDelta {
            entity_id: "n".into(),
            timestamp: 0.0,
            changes: vec![DomChange::text("x", None)],
        }]);
        let report = rep.apply(&[DomDelta {
            entity_id: "n".into(),
            timestamp: 0.0,
            changes: vec![DomChange::delete()],
        }]);
        assert_eq!(report.missing, 1);
        assert_eq!(rep.parked_updates(), 0);
    }

    #[test]
    fn test_parked_bounded_per_entity() {
        let rep = DomReplicator::new(
            ElementTree::new("root"),
            "root",
            ReplicatorConfig {
                max_parked_per_entity: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let changes = (0..5).map(|i| DomChange::text(&i.to_string(), None)).collect();
        rep.apply(&[DomDelta {
            entity_id: "n".into(),
            timestamp: 0.0,
            changes,
        }]);
        assert_eq!(rep.parked_updates(), 2);
    }

    #[test]
    fn test_duplicate_create_skipped() {
        let rep = replica();
        let create = DomDelta {
            entity_id: "n".into(),
            timestamp: 0.0,
            changes: vec![DomChange::create(&ElementSnapshot::marked("n", "div"))],
        };
        assert_eq!(rep.apply(std::slice::from_ref(&create)).applied, 1);
        assert_eq!(rep.apply(&[create]).duplicates, 1);
    }

    #[test]
    fn test_unreplicated_element_not_touched() {
        let rep = replica();
        rep.with_target(|t| t.append_element("root", "plain", "div").unwrap());
        let report = rep.apply(&[DomDelta {
            entity_id: "plain".into(),
            timestamp: 0.0,
            changes: vec![DomChange::text("pwned", None), DomChange::delete()],
        }]);
        assert_eq!(report.missing, 2);
        assert!(rep.inspect(|t| t.contains("plain")));
    }

    #[test]
    fn test_script_create_and_javascript_href_refused() {
        let rep = replica();
        let mut script = ElementSnapshot::marked("s", "script");
        script.text = "alert(document.cookie)".into();
        let report = rep.apply(&[DomDelta {
            entity_id: "s".into(),
            timestamp: 0.0,
            changes: vec![DomChange::create(&script)],
        }]);
        assert_eq!(report.invalid, 1);
        assert!(!rep.inspect(|t| t.contains("s")));

        rep.with_target(|t| t.append_marked("root", "link", "a").unwrap());
        let _ = rep.flush();
        let report = rep.apply(&[DomDelta {
            entity_id: "link".into(),
            timestamp: 0.0,
            changes: vec![
                DomChange::attribute("href", Some("javascript:alert(1)"), None),
                DomChange::attribute("title", Some("docs"), None),
            ],
        }]);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(rep.inspect(|t| t.attribute("link", "href").map(str::to_string)), None);

        rep.apply(&[DomDelta {
            entity_id: "link".into(),
            timestamp: 0.0,
            changes: vec![DomChange::attribute("href", Some("https://example.com"), None)],
        }]);
        assert_eq!(
            rep.inspect(|t| t.attribute("link", "href").map(str::to_string)),
            Some("https://example.com/".into())
        );
    }

    #[test]
    fn test_create_under_missing_parent_uses_root() {
        let rep = replica();
        let snapshot = ElementSnapshot::marked("child", "span").with_parent("ghost");
        rep.apply(&[DomDelta {
            entity_id: "child".into(),
            timestamp: 0.0,
            changes: vec![DomChange::create(&snapshot)],
        }]);
        assert_eq!(rep.inspect(|t| t.parent("child").map(str::to_string)), Some("root".into()));
    }

    #[test]
    fn test_delta_wire_shape() {
        let delta = DomDelta {
            entity_id: "n".into(),
            timestamp: 12.5,
            changes: vec![DomChange::attribute("data-x", Some("1"), Some("0"))],
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["entityId"], "n");
        assert_eq!(json["changes"][0]["type"], "attribute");
        assert_eq!(json["changes"][0]["property"], "data-x");
        assert_eq!(json["changes"][0]["oldValue"], "0");
    }
}
