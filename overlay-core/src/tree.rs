//! In-memory element tree implementing [`DomTarget`].
//!
//! Elements are keyed by entity id. Every element has one, marked or not;
//! only marked elements (carrying [`SYNC_MARKER`]) take part in
//! replication. Mutations are recorded when the touched element lies
//! under an observed root.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::target::{DomError, DomTarget, MutationRecord};
use crate::{ElementSnapshot, EntityId, ENTITY_ID_ATTR, SYNC_MARKER};

#[derive(Debug, Clone)]
struct Element {
    tag: String,
    attributes: BTreeMap<String, String>,
    style: String,
    text: String,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
}

impl Element {
    fn new(tag: impl Into<String>, parent: Option<EntityId>) -> Self {
        Self {
            tag: tag.into(),
            attributes: BTreeMap::new(),
            style: String::new(),
            text: String::new(),
            parent,
            children: Vec::new(),
        }
    }
}

/// Headless element tree with a `MutationObserver`-style record queue.
#[derive(Debug, Clone)]
pub struct ElementTree {
    root: EntityId,
    elements: HashMap<EntityId, Element>,
    observed: HashSet<EntityId>,
    records: Vec<MutationRecord>,
}

impl ElementTree {
    /// Create a tree holding only a root element.
    pub fn new(root: impl Into<EntityId>) -> Self {
        let root = root.into();
        let mut elements = HashMap::new();
        elements.insert(root.clone(), Element::new("body", None));
        Self {
            root,
            elements,
            observed: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Root element id.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Number of elements, root included.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.len() <= 1
    }

    /// Append a plain (unmarked) element.
    pub fn append_element(
        &mut self,
        parent: &str,
        id: impl Into<EntityId>,
        tag: &str,
    ) -> Result<(), DomError> {
        let id = id.into();
        if self.elements.contains_key(&id) {
            return Err(DomError::DuplicateEntity(id));
        }
        let parent_el = self
            .elements
            .get_mut(parent)
            .ok_or_else(|| DomError::NotFound(parent.to_string()))?;
        parent_el.children.push(id.clone());
        self.elements
            .insert(id.clone(), Element::new(tag, Some(parent.to_string())));

        if let Some(snapshot) = self.snapshot(&id) {
            self.record(&id, MutationRecord::ChildAdded { snapshot });
        }
        Ok(())
    }

    /// Append an element that is marked for replication from the start.
    pub fn append_marked(
        &mut self,
        parent: &str,
        id: impl Into<EntityId>,
        tag: &str,
    ) -> Result<(), DomError> {
        let id = id.into();
        let mut snapshot = ElementSnapshot::marked(id, tag);
        if parent != self.root {
            snapshot.parent = Some(parent.to_string());
        }
        self.create_element(Some(parent), &snapshot)
    }

    /// Opt an existing element into replication.
    pub fn mark(&mut self, id: &str) -> Result<(), DomError> {
        self.set_attribute(id, ENTITY_ID_ATTR, id)?;
        self.set_attribute(id, SYNC_MARKER, "true")
    }

    pub fn attribute(&self, id: &str, name: &str) -> Option<&str> {
        let el = self.elements.get(id)?;
        if name == "style" {
            return Some(el.style.as_str());
        }
        el.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self, id: &str) -> Option<&BTreeMap<String, String>> {
        self.elements.get(id).map(|el| &el.attributes)
    }

    pub fn style(&self, id: &str) -> Option<&str> {
        self.elements.get(id).map(|el| el.style.as_str())
    }

    pub fn text(&self, id: &str) -> Option<&str> {
        self.elements.get(id).map(|el| el.text.as_str())
    }

    pub fn tag(&self, id: &str) -> Option<&str> {
        self.elements.get(id).map(|el| el.tag.as_str())
    }

    pub fn parent(&self, id: &str) -> Option<&str> {
        self.elements.get(id)?.parent.as_deref()
    }

    pub fn children(&self, id: &str) -> &[EntityId] {
        self.elements
            .get(id)
            .map(|el| el.children.as_slice())
            .unwrap_or(&[])
    }

    /// Ids of every marked element, sorted.
    pub fn marked_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .elements
            .iter()
            .filter(|(_, el)| el.attributes.contains_key(SYNC_MARKER))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Records queued but not yet drained.
    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    fn is_observed(&self, id: &str) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.observed.contains(current) {
                return true;
            }
            cursor = self.elements.get(current).and_then(|el| el.parent.as_deref());
        }
        false
    }

    fn record(&mut self, id: &str, record: MutationRecord) {
        if self.is_observed(id) {
            self.records.push(record);
        }
    }

    fn element_mut(&mut self, id: &str) -> Result<&mut Element, DomError> {
        self.elements
            .get_mut(id)
            .ok_or_else(|| DomError::NotFound(id.to_string()))
    }

    fn collect_subtree(&self, id: &str, out: &mut Vec<EntityId>) {
        out.push(id.to_string());
        for child in self.children(id) {
            self.collect_subtree(child, out);
        }
    }
}

impl DomTarget for ElementTree {
    fn observe(&mut self, root: &str) -> Result<(), DomError> {
        if !self.elements.contains_key(root) {
            return Err(DomError::NotFound(root.to_string()));
        }
        self.observed.insert(root.to_string());
        Ok(())
    }

    fn take_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }

    fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    fn is_marked(&self, id: &str) -> bool {
        self.elements
            .get(id)
            .is_some_and(|el| el.attributes.contains_key(SYNC_MARKER))
    }

    fn snapshot(&self, id: &str) -> Option<ElementSnapshot> {
        let el = self.elements.get(id)?;
        let parent = el
            .parent
            .as_deref()
            .filter(|p| *p != self.root && self.is_marked(p))
            .map(str::to_string);
        let data_attributes = el
            .attributes
            .iter()
            .filter(|(name, _)| name.starts_with("data-"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(ElementSnapshot {
            entity_id: id.to_string(),
            tag: el.tag.clone(),
            parent,
            data_attributes,
            style: el.style.clone(),
            text: el.text.clone(),
        })
    }

    fn set_attribute(&mut self, id: &str, name: &str, value: &str) -> Result<(), DomError> {
        if name == "style" {
            return self.set_style(id, value);
        }
        let el = self.element_mut(id)?;
        let old_value = el.attributes.insert(name.to_string(), value.to_string());
        self.record(
            id,
            MutationRecord::Attribute {
                target: id.to_string(),
                name: name.to_string(),
                old_value,
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_attribute(&mut self, id: &str, name: &str) -> Result<(), DomError> {
        if name == "style" {
            return self.set_style(id, "");
        }
        let el = self.element_mut(id)?;
        let old_value = el.attributes.remove(name);
        if old_value.is_some() {
            self.record(
                id,
                MutationRecord::Attribute {
                    target: id.to_string(),
                    name: name.to_string(),
                    old_value,
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn set_style(&mut self, id: &str, style: &str) -> Result<(), DomError> {
        let el = self.element_mut(id)?;
        let old_value = std::mem::replace(&mut el.style, style.to_string());
        self.record(
            id,
            MutationRecord::Attribute {
                target: id.to_string(),
                name: "style".to_string(),
                old_value: Some(old_value),
                new_value: Some(style.to_string()),
            },
        );
        Ok(())
    }

    fn set_text(&mut self, id: &str, text: &str) -> Result<(), DomError> {
        let el = self.element_mut(id)?;
        let old_value = std::mem::replace(&mut el.text, text.to_string());
        self.record(
            id,
            MutationRecord::Text {
                target: id.to_string(),
                old_value,
                new_value: text.to_string(),
            },
        );
        Ok(())
    }

    fn create_element(
        &mut self,
        parent: Option<&str>,
        snapshot: &ElementSnapshot,
    ) -> Result<(), DomError> {
        if self.elements.contains_key(&snapshot.entity_id) {
            return Err(DomError::DuplicateEntity(snapshot.entity_id.clone()));
        }
        let parent_id = parent.unwrap_or(self.root.as_str()).to_string();
        self.element_mut(&parent_id)?
            .children
            .push(snapshot.entity_id.clone());

        let mut el = Element::new(snapshot.tag.clone(), Some(parent_id));
        el.attributes = snapshot.data_attributes.clone();
        el.style = snapshot.style.clone();
        el.text = snapshot.text.clone();
        self.elements.insert(snapshot.entity_id.clone(), el);

        if let Some(recorded) = self.snapshot(&snapshot.entity_id) {
            self.record(
                &snapshot.entity_id,
                MutationRecord::ChildAdded { snapshot: recorded },
            );
        }
        Ok(())
    }

    fn remove_element(&mut self, id: &str) -> Result<(), DomError> {
        if id == self.root {
            return Err(DomError::RootRemoval);
        }
        if !self.elements.contains_key(id) {
            return Err(DomError::NotFound(id.to_string()));
        }
        // Observation is decided before the subtree is detached.
        let observed = self.is_observed(id);
        let marked = self.is_marked(id);

        let mut subtree = Vec::new();
        self.collect_subtree(id, &mut subtree);
        if let Some(parent) = self.parent(id).map(str::to_string) {
            if let Some(parent_el) = self.elements.get_mut(&parent) {
                parent_el.children.retain(|child| child != id);
            }
        }
        for removed in &subtree {
            self.elements.remove(removed);
            self.observed.remove(removed);
        }

        if observed {
            self.records.push(MutationRecord::ChildRemoved {
                target: id.to_string(),
                marked,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed_tree() -> ElementTree {
        let mut tree = ElementTree::new("root");
        tree.observe("root").unwrap();
        tree
    }

    #[test]
    fn test_new_tree_has_root_only() {
        let tree = ElementTree::new("root");
        assert_eq!(tree.root(), "root");
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_unobserved_mutations_not_recorded() {
        let mut tree = ElementTree::new("root");
        tree.append_marked("root", "a", "div").unwrap();
        tree.set_text("a", "hello").unwrap();
        assert!(tree.take_records().is_empty());
    }

    #[test]
    fn test_attribute_record_has_old_and_new() {
        let mut tree = observed_tree();
        tree.append_marked("root", "a", "div").unwrap();
        tree.take_records();

        tree.set_attribute("a", "data-color", "red").unwrap();
        tree.set_attribute("a", "data-color", "blue").unwrap();
        let records = tree.take_records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1],
            MutationRecord::Attribute {
                target: "a".into(),
                name: "data-color".into(),
                old_value: Some("red".into()),
                new_value: Some("blue".into()),
            }
        );
    }

    #[test]
    fn test_style_routed_through_attribute() {
        let mut tree = observed_tree();
        tree.append_marked("root", "a", "div").unwrap();
        tree.take_records();

        tree.set_attribute("a", "style", "left: 4px;").unwrap();
        assert_eq!(tree.style("a"), Some("left: 4px;"));
        assert_eq!(tree.attribute("a", "style"), Some("left: 4px;"));
        match &tree.take_records()[0] {
            MutationRecord::Attribute { name, .. } => assert_eq!(name, "style"),
            other => panic!("Expected attribute record, got {other:?}"),
        }
    }

    #[test]
    fn test_create_records_snapshot() {
        let mut tree = observed_tree();
        let snap = ElementSnapshot::marked("note", "div").with_text("hi");
        tree.create_element(None, &snap).unwrap();
        match &tree.take_records()[..] {
            [MutationRecord::ChildAdded { snapshot }] => {
                assert_eq!(snapshot.entity_id, "note");
                assert_eq!(snapshot.text, "hi");
                assert!(snapshot.is_marked());
            }
            other => panic!("Unexpected records {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let mut tree = observed_tree();
        tree.append_marked("root", "a", "div").unwrap();
        let err = tree
            .create_element(None, &ElementSnapshot::marked("a", "div"))
            .unwrap_err();
        assert_eq!(err, DomError::DuplicateEntity("a".into()));
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = observed_tree();
        tree.append_marked("root", "a", "div").unwrap();
        tree.append_marked("a", "b", "span").unwrap();
        tree.take_records();

        tree.remove_element("a").unwrap();
        assert!(!tree.contains("a"));
        assert!(!tree.contains("b"));
        assert!(tree.children("root").is_empty());
        assert_eq!(
            tree.take_records(),
            vec![MutationRecord::ChildRemoved {
                target: "a".into(),
                marked: true
            }]
        );
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut tree = observed_tree();
        assert_eq!(tree.remove_element("root"), Err(DomError::RootRemoval));
    }

    #[test]
    fn test_snapshot_parent_only_when_marked() {
        let mut tree = observed_tree();
        tree.append_element("root", "plain", "div").unwrap();
        tree.append_marked("plain", "child", "div").unwrap();
        tree.append_marked("root", "board", "div").unwrap();
        tree.append_marked("board", "card", "div").unwrap();

        assert_eq!(tree.snapshot("child").unwrap().parent, None);
        assert_eq!(tree.snapshot("card").unwrap().parent.as_deref(), Some("board"));
    }

    #[test]
    fn test_mark_existing_element() {
        let mut tree = observed_tree();
        tree.append_element("root", "x", "div").unwrap();
        assert!(!tree.is_marked("x"));
        tree.mark("x").unwrap();
        assert!(tree.is_marked("x"));
        assert_eq!(tree.attribute("x", ENTITY_ID_ATTR), Some("x"));
        assert_eq!(tree.marked_ids(), vec!["x".to_string()]);
    }

    #[test]
    fn test_missing_element_errors() {
        let mut tree = observed_tree();
        assert_eq!(
            tree.set_text("ghost", "boo"),
            Err(DomError::NotFound("ghost".into()))
        );
        assert!(tree.observe("ghost").is_err());
    }
}
