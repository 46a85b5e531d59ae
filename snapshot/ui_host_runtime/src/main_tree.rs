//! Main side of the tree: instances mirrored from the background side, each
//! backed by a real element once it is attached somewhere.

use crate::backend::UiBackend;
use crate::error::ApplyError;
use crate::main_thread_value::MainThreadValueStore;
use crate::patch::{AttributeKey, MAX_SLOT_INDEX};
use crate::registry::{NodeId, NodeRegistry};
use crate::snapshot::{DynamicPart, SnapshotDefinitions};
use crate::worklet_ref::{
    AttachedRef, QueuedRef, WorkletRef, WorkletRefQueue, WorkletRunner, attach_worklet_ref,
    release_worklet_ref,
};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

const HAS_REF_ATTRIBUTE: &str = "has-react-ref";
const HAS_GESTURE_ATTRIBUTE: &str = "has-react-gesture";

#[derive(Debug)]
pub struct SnapshotInstance<E> {
    id: NodeId,
    node_type: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    values: Vec<Value>,
    element: Option<E>,
    worklet_refs: BTreeMap<usize, AttachedRef>,
}

impl<E> SnapshotInstance<E> {
    fn new(id: NodeId, node_type: Option<&str>) -> Self {
        Self {
            id,
            node_type: node_type.map(str::to_string),
            parent: None,
            children: Vec::new(),
            values: Vec::new(),
            element: None,
            worklet_refs: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn element(&self) -> Option<&E> {
        self.element.as_ref()
    }

    pub fn worklet_refs(&self) -> &BTreeMap<usize, AttachedRef> {
        &self.worklet_refs
    }
}

pub struct MainTree<B: UiBackend> {
    registry: NodeRegistry<SnapshotInstance<B::Element>>,
    backend: B,
    definitions: SnapshotDefinitions,
    values: MainThreadValueStore<B::Element>,
    ref_queue: WorkletRefQueue<B::Element>,
    runner: Box<dyn WorkletRunner<B::Element>>,
}

impl<B: UiBackend + fmt::Debug> fmt::Debug for MainTree<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainTree")
            .field("nodes", &self.registry.len())
            .field("backend", &self.backend)
            .field("definitions", &self.definitions.len())
            .field("values", &self.values.len())
            .field("queued_refs", &self.ref_queue.len())
            .finish()
    }
}

impl<B: UiBackend> MainTree<B> {
    pub fn new<R>(backend: B, runner: R) -> Self
    where
        R: WorkletRunner<B::Element> + 'static,
    {
        Self {
            registry: NodeRegistry::new(),
            backend,
            definitions: SnapshotDefinitions::new(),
            values: MainThreadValueStore::default(),
            ref_queue: WorkletRefQueue::default(),
            runner: Box::new(runner),
        }
    }

    pub fn with_definitions(mut self, definitions: SnapshotDefinitions) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn definitions(&self) -> &SnapshotDefinitions {
        &self.definitions
    }

    pub fn definitions_mut(&mut self) -> &mut SnapshotDefinitions {
        &mut self.definitions
    }

    pub fn values(&self) -> &MainThreadValueStore<B::Element> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut MainThreadValueStore<B::Element> {
        &mut self.values
    }

    pub fn get(&self, id: NodeId) -> Option<&SnapshotInstance<B::Element>> {
        self.registry.get(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.registry.contains(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn element(&self, id: NodeId) -> Option<&B::Element> {
        self.registry.get(id).and_then(SnapshotInstance::element)
    }

    pub fn queued_refs(&self) -> usize {
        self.ref_queue.len()
    }

    /// Elements of materialized nodes that have no parent node.
    pub fn root_elements(&self) -> Vec<B::Element> {
        self.registry
            .ids()
            .filter_map(|id| self.registry.get(id))
            .filter(|node| node.parent.is_none())
            .filter_map(|node| node.element.clone())
            .collect()
    }

    /// Registers a node. Its element is created on first attach.
    pub fn create(&mut self, node_type: Option<&str>, id: NodeId) {
        if let Some(previous) = self.registry.register(id, SnapshotInstance::new(id, node_type)) {
            log::debug!(
                "node {id} re-created as {:?} (was {:?})",
                node_type,
                previous.node_type
            );
        }
    }

    /// Returns the node's element, creating it and replaying stored slot
    /// values if needed. `None` for unknown ids.
    pub fn materialize(&mut self, id: NodeId) -> Result<Option<B::Element>, ApplyError> {
        let Some(node) = self.registry.get_mut(id) else {
            return Ok(None);
        };
        if let Some(element) = &node.element {
            return Ok(Some(element.clone()));
        }

        let tag = self.definitions.tag_for(node.node_type.as_deref());
        let element = self.backend.create_element(&tag).map_err(ApplyError::Backend)?;
        node.element = Some(element.clone());
        let stored = node.values.clone();

        for (index, value) in stored.iter().enumerate() {
            if !value.is_null() {
                self.apply_part(id, index, &Value::Null, value)?;
            }
        }
        Ok(Some(element))
    }

    /// Callers check that both ids exist. An unknown or foreign `before`
    /// appends. Returns `false` when the insert would make `child` its own
    /// ancestor; nothing is changed then.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        before: Option<NodeId>,
    ) -> Result<bool, ApplyError> {
        if self.is_ancestor_or_self(child, parent) {
            log::warn!("InsertBefore: node {child} cannot be inserted under node {parent}");
            return Ok(false);
        }

        let (Some(parent_element), Some(child_element)) =
            (self.materialize(parent)?, self.materialize(child)?)
        else {
            return Ok(false);
        };

        self.detach(child);

        let Some(parent_node) = self.registry.get_mut(parent) else {
            return Ok(false);
        };
        let position = before.and_then(|before| {
            parent_node
                .children
                .iter()
                .position(|existing| *existing == before)
        });
        let index = position.unwrap_or(parent_node.children.len());
        parent_node.children.insert(index, child);
        let before_sibling =
            position.and_then(|index| parent_node.children.get(index + 1).copied());
        let before_element = before_sibling.and_then(|sibling| self.element(sibling).cloned());

        if let Some(child_node) = self.registry.get_mut(child) {
            child_node.parent = Some(parent);
        }

        self.backend
            .insert_before(&parent_element, &child_element, before_element.as_ref())
            .map_err(ApplyError::Backend)?;
        Ok(true)
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.registry.get(node).and_then(|instance| instance.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Returns `false` when `child` is not currently under `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<bool, ApplyError> {
        if self.registry.get(child).and_then(|node| node.parent) != Some(parent) {
            log::warn!("RemoveChild: node {child} is not a child of node {parent}");
            return Ok(false);
        }

        self.unref(child, true);

        if let (Some(parent_element), Some(child_element)) =
            (self.element(parent).cloned(), self.element(child).cloned())
        {
            self.backend
                .remove_child(&parent_element, &child_element)
                .map_err(ApplyError::Backend)?;
        }

        self.detach(child);
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.registry.unregister(id) {
                stack.extend(node.children);
            }
        }
        Ok(true)
    }

    /// Stores a slot value and, once the node has an element, pushes it to
    /// the backend. Re-setting an identical value does nothing.
    pub fn set_attribute(
        &mut self,
        id: NodeId,
        key: AttributeKey,
        value: Value,
    ) -> Result<(), ApplyError> {
        match key {
            AttributeKey::Index(index) => self.set_slot(id, index, value),
            AttributeKey::Values => match value {
                Value::Array(values) => self.set_values(id, values),
                other => {
                    log::warn!("node {id}: \"values\" payload must be an array, got {other}");
                    Ok(())
                }
            },
        }
    }

    /// Replaces the whole slot record; slots beyond the new length reset.
    pub fn set_values(&mut self, id: NodeId, values: Vec<Value>) -> Result<(), ApplyError> {
        let Some(previous_len) = self.registry.get(id).map(|node| node.values.len()) else {
            return Ok(());
        };
        let len = values.len();
        for (index, value) in values.into_iter().enumerate() {
            self.set_slot(id, index, value)?;
        }
        for index in len..previous_len {
            self.set_slot(id, index, Value::Null)?;
        }
        if let Some(node) = self.registry.get_mut(id) {
            node.values.truncate(len);
        }
        Ok(())
    }

    fn set_slot(&mut self, id: NodeId, index: usize, value: Value) -> Result<(), ApplyError> {
        if index > MAX_SLOT_INDEX {
            log::warn!("node {id}: slot index {index} out of range; ignored");
            return Ok(());
        }
        let Some(node) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if node.values.len() <= index {
            node.values.resize(index + 1, Value::Null);
        }
        if node.values[index] == value {
            return Ok(());
        }
        let old = std::mem::replace(&mut node.values[index], value.clone());
        if node.element.is_none() {
            return Ok(());
        }
        self.apply_part(id, index, &old, &value)
    }

    fn apply_part(
        &mut self,
        id: NodeId,
        index: usize,
        old: &Value,
        new: &Value,
    ) -> Result<(), ApplyError> {
        let Some(node) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(element) = node.element.clone() else {
            return Ok(());
        };

        let part = self.definitions.part_for(node.node_type.as_deref(), index);
        match part {
            DynamicPart::Attribute { key } => self.set_backend_attribute(&element, &key, new),
            DynamicPart::Text => self.set_backend_attribute(&element, "text", new),
            DynamicPart::Style => self.apply_style(&element, old, new),
            DynamicPart::Ref => self.update_background_ref(&element, id, index, old, new),
            DynamicPart::MainThreadRef => self.update_worklet_ref(id, index, &element, new),
            DynamicPart::MainThreadEvent { name } => {
                self.set_backend_attribute(&element, &format!("main-thread:{name}"), new)
            }
            DynamicPart::Gesture => self.update_gesture(&element, new),
            DynamicPart::Spread => self.apply_spread(id, index, &element, old, new),
        }
    }

    fn set_backend_attribute(
        &mut self,
        element: &B::Element,
        key: &str,
        value: &Value,
    ) -> Result<(), ApplyError> {
        self.backend
            .set_attribute(element, key, value)
            .map_err(ApplyError::Backend)
    }

    fn apply_style(
        &mut self,
        element: &B::Element,
        old: &Value,
        new: &Value,
    ) -> Result<(), ApplyError> {
        let new_map = new.as_object();
        if let Some(old_map) = old.as_object() {
            for key in old_map.keys() {
                if !new_map.is_some_and(|map| map.contains_key(key)) {
                    self.backend
                        .set_style_property(element, key, &Value::Null)
                        .map_err(ApplyError::Backend)?;
                }
            }
        }

        match new {
            Value::Object(map) => {
                for (key, value) in map {
                    if old.get(key) != Some(value) {
                        self.backend
                            .set_style_property(element, key, value)
                            .map_err(ApplyError::Backend)?;
                    }
                }
                Ok(())
            }
            Value::String(_) => self.set_backend_attribute(element, "style", new),
            Value::Null if old.is_string() => self.set_backend_attribute(element, "style", new),
            Value::Null => Ok(()),
            other => {
                log::warn!("ignoring style value {other}");
                Ok(())
            }
        }
    }

    /// A background ref becomes a selector attribute the background side can
    /// address: a string names the attribute, any other truthy value uses
    /// `react-ref-{id}-{index}`.
    fn update_background_ref(
        &mut self,
        element: &B::Element,
        id: NodeId,
        index: usize,
        old: &Value,
        new: &Value,
    ) -> Result<(), ApplyError> {
        let old_attribute = ref_attribute(id, index, old);
        let new_attribute = ref_attribute(id, index, new);

        if let Some(old_attribute) = &old_attribute {
            if new_attribute.as_ref() != Some(old_attribute) {
                self.set_backend_attribute(element, old_attribute, &Value::Null)?;
            }
        }
        if let Some(new_attribute) = &new_attribute {
            self.set_backend_attribute(element, new_attribute, &json!(1))?;
        }
        Ok(())
    }

    fn update_worklet_ref(
        &mut self,
        id: NodeId,
        slot: usize,
        element: &B::Element,
        new: &Value,
    ) -> Result<(), ApplyError> {
        let Some(node) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if let Some(attached) = node.worklet_refs.remove(&slot) {
            release_worklet_ref(attached, &mut self.values, self.runner.as_mut());
        }

        if let Some(target) = WorkletRef::classify(new)? {
            node.worklet_refs.insert(
                slot,
                AttachedRef {
                    target: target.clone(),
                    unmount: None,
                },
            );
            self.ref_queue.push(QueuedRef {
                node: id,
                slot,
                target,
                element: element.clone(),
            });
        }

        self.set_backend_attribute(element, HAS_REF_ATTRIBUTE, &json!(true))
    }

    fn update_gesture(&mut self, element: &B::Element, new: &Value) -> Result<(), ApplyError> {
        if new.is_null() {
            self.set_backend_attribute(element, HAS_GESTURE_ATTRIBUTE, &Value::Null)?;
            return self.set_backend_attribute(element, "gesture", &Value::Null);
        }
        self.set_backend_attribute(element, HAS_GESTURE_ATTRIBUTE, &json!(true))?;
        self.set_backend_attribute(element, "flatten", &json!(false))?;
        self.set_backend_attribute(element, "gesture", new)
    }

    fn apply_spread(
        &mut self,
        id: NodeId,
        index: usize,
        element: &B::Element,
        old: &Value,
        new: &Value,
    ) -> Result<(), ApplyError> {
        let empty = Map::new();
        let old_map = old.as_object().unwrap_or(&empty);
        let new_map = new.as_object().unwrap_or(&empty);

        for (key, previous) in old_map {
            if !new_map.contains_key(key) {
                self.apply_spread_entry(id, index, element, key, previous, &Value::Null)?;
            }
        }
        for (key, value) in new_map {
            let previous = old_map.get(key).unwrap_or(&Value::Null);
            if previous != value {
                self.apply_spread_entry(id, index, element, key, previous, value)?;
            }
        }
        Ok(())
    }

    fn apply_spread_entry(
        &mut self,
        id: NodeId,
        index: usize,
        element: &B::Element,
        key: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), ApplyError> {
        match key {
            "style" => self.apply_style(element, old, new),
            "ref" => self.update_background_ref(element, id, index, old, new),
            "main-thread:ref" => self.update_worklet_ref(id, index, element, new),
            "main-thread:gesture" => self.update_gesture(element, new),
            _ => self.set_backend_attribute(element, key, new),
        }
    }

    /// Releases every worklet ref held by `id`, and by its subtree when
    /// `recursive`. Each ref is released once.
    pub fn unref(&mut self, id: NodeId, recursive: bool) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.registry.get_mut(current) else {
                continue;
            };
            let attached = std::mem::take(&mut node.worklet_refs);
            if recursive {
                stack.extend(node.children.iter().copied());
            }
            for attached in attached.into_values() {
                release_worklet_ref(attached, &mut self.values, self.runner.as_mut());
            }
        }
    }

    /// Attaches queued worklet refs in order. Entries whose node is gone or
    /// whose slot has moved on since they were queued are skipped.
    pub fn apply_ref_queue(&mut self) -> usize {
        let mut applied = 0;
        while let Some(entry) = self.ref_queue.pop() {
            let Some(node) = self.registry.get_mut(entry.node) else {
                log::debug!("skipping queued ref for removed node {}", entry.node);
                continue;
            };
            let Some(attached) = node.worklet_refs.get_mut(&entry.slot) else {
                continue;
            };
            if attached.target != entry.target {
                continue;
            }
            attached.unmount = attach_worklet_ref(
                &entry.target,
                &entry.element,
                &mut self.values,
                self.runner.as_mut(),
            );
            applied += 1;
        }
        applied
    }

    /// Drops every node. Top-level elements are emptied so nothing stale
    /// stays on screen.
    pub fn reset(&mut self) -> Result<(), ApplyError> {
        let ids: Vec<NodeId> = self.registry.ids().collect();
        for id in &ids {
            self.unref(*id, false);
        }

        for id in ids {
            let Some(node) = self.registry.get(id) else {
                continue;
            };
            if node.parent.is_some() {
                continue;
            }
            let Some(root_element) = node.element.clone() else {
                continue;
            };
            let children: Vec<B::Element> = node
                .children
                .iter()
                .filter_map(|child| self.element(*child).cloned())
                .collect();
            for child in children {
                self.backend
                    .remove_child(&root_element, &child)
                    .map_err(ApplyError::Backend)?;
            }
        }

        self.registry.clear();
        self.ref_queue.clear();
        self.values.clear_first_screen();
        Ok(())
    }

    fn detach(&mut self, child: NodeId) {
        let Some(old_parent) = self
            .registry
            .get_mut(child)
            .and_then(|node| node.parent.take())
        else {
            return;
        };
        if let Some(parent) = self.registry.get_mut(old_parent) {
            parent.children.retain(|existing| *existing != child);
        }
    }
}

fn ref_attribute(id: NodeId, index: usize, value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(name) => Some(name.clone()),
        _ => Some(format!("react-ref-{id}-{index}")),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{ElementHandle, MemoryBackend};
    use crate::main_thread_value::Current;
    use crate::snapshot::SnapshotDefinition;
    use crate::worklet_ref::UnmountHandle;
    use crate::worklet_ref::tests::RecordingRunner;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct SharedRunner(pub(crate) Rc<RefCell<RecordingRunner<ElementHandle>>>);

    impl WorkletRunner<ElementHandle> for SharedRunner {
        fn run(
            &mut self,
            worklet: &Value,
            element: Option<&ElementHandle>,
        ) -> Option<UnmountHandle> {
            self.0.borrow_mut().run(worklet, element)
        }

        fn unmount(&mut self, handle: UnmountHandle) {
            self.0.borrow_mut().unmount(handle)
        }
    }

    pub(crate) fn definitions() -> SnapshotDefinitions {
        let mut definitions = SnapshotDefinitions::new();
        definitions.insert(
            "card",
            SnapshotDefinition::new(
                "view",
                vec![
                    DynamicPart::Attribute { key: "id".to_string() },
                    DynamicPart::Style,
                    DynamicPart::Ref,
                    DynamicPart::MainThreadRef,
                    DynamicPart::Gesture,
                    DynamicPart::Spread,
                ],
            ),
        );
        definitions
    }

    pub(crate) fn tree() -> (MainTree<MemoryBackend>, SharedRunner) {
        let runner = SharedRunner::default();
        let tree =
            MainTree::new(MemoryBackend::new(), runner.clone()).with_definitions(definitions());
        (tree, runner)
    }

    fn attached_card(tree: &mut MainTree<MemoryBackend>) -> (NodeId, ElementHandle) {
        tree.create(Some("page"), 1);
        tree.create(Some("card"), 2);
        tree.insert_before(1, 2, None).expect("insert");
        let element = *tree.element(2).expect("materialized");
        (2, element)
    }

    #[test]
    fn elements_are_created_on_attach_and_replay_slots() {
        let (mut tree, _) = tree();
        tree.create(Some("page"), 1);
        tree.create(Some("card"), 2);
        tree.set_attribute(2, AttributeKey::Index(0), json!("hero")).expect("set id");
        assert!(tree.element(2).is_none());

        tree.insert_before(1, 2, None).expect("insert");
        let element = tree.element(2).expect("materialized");
        assert_eq!(tree.backend().attribute(element, "id"), Some(&json!("hero")));
        assert_eq!(tree.backend().element(element).expect("element").tag, "view");
        assert_eq!(tree.get(1).expect("page").children(), &[2]);
    }

    #[test]
    fn insert_before_respects_sibling_order() {
        let (mut tree, _) = tree();
        tree.create(Some("page"), 1);
        for id in 2..=4 {
            tree.create(Some("text"), id);
        }
        tree.insert_before(1, 2, None).expect("2");
        tree.insert_before(1, 3, None).expect("3");
        tree.insert_before(1, 4, Some(3)).expect("4 before 3");
        tree.insert_before(1, 2, Some(404)).expect("2 to end");

        assert_eq!(tree.get(1).expect("page").children(), &[4, 3, 2]);
        let page = tree.element(1).expect("page element");
        let expected: Vec<ElementHandle> = [4, 3, 2]
            .iter()
            .map(|id| *tree.element(*id).expect("child element"))
            .collect();
        assert_eq!(tree.backend().element(page).expect("page").children, expected);
    }

    #[test]
    fn self_and_cyclic_inserts_leave_the_tree_untouched() {
        let (mut tree, _) = tree();
        tree.create(Some("view"), 1);
        tree.create(Some("view"), 2);

        assert!(!tree.insert_before(1, 1, None).expect("self insert"));
        assert_eq!(tree.get(1).expect("node").parent(), None);
        assert!(tree.get(1).expect("node").children().is_empty());
        assert!(tree.element(1).is_none());

        assert!(tree.insert_before(1, 2, None).expect("insert"));
        assert!(!tree.insert_before(2, 1, None).expect("cycle"));
        assert_eq!(tree.get(1).expect("root").parent(), None);
        assert!(tree.get(2).expect("child").children().is_empty());
        let root = tree.element(1).expect("root element");
        assert_eq!(tree.backend().element(root).expect("root").parent, None);
    }

    #[test]
    fn out_of_range_slot_index_is_ignored() {
        let (mut tree, _) = tree();
        let (id, _) = attached_card(&mut tree);
        let mutations = tree.backend().mutations();

        tree.set_attribute(id, AttributeKey::Index(4_000_000_000), json!("x"))
            .expect("ignored");
        assert!(tree.get(id).expect("card").values().is_empty());
        assert_eq!(tree.backend().mutations(), mutations);
    }

    #[test]
    fn identical_value_is_not_reapplied() {
        let (mut tree, _) = tree();
        let (id, _) = attached_card(&mut tree);
        tree.set_attribute(id, AttributeKey::Index(0), json!("a")).expect("first");
        let mutations = tree.backend().mutations();
        tree.set_attribute(id, AttributeKey::Index(0), json!("a")).expect("again");
        assert_eq!(tree.backend().mutations(), mutations);
    }

    #[test]
    fn style_objects_are_diffed() {
        let (mut tree, _) = tree();
        let (id, element) = attached_card(&mut tree);
        tree.set_attribute(id, AttributeKey::Index(1), json!({ "color": "red", "width": 10 }))
            .expect("style");
        tree.set_attribute(id, AttributeKey::Index(1), json!({ "color": "blue" }))
            .expect("restyle");

        let style = &tree.backend().element(&element).expect("element").style;
        assert_eq!(style.get("color"), Some(&json!("blue")));
        assert!(style.get("width").is_none());
    }

    #[test]
    fn background_ref_sets_selector_attribute() {
        let (mut tree, _) = tree();
        let (id, element) = attached_card(&mut tree);
        tree.set_attribute(id, AttributeKey::Index(2), json!(1)).expect("ref");
        assert_eq!(tree.backend().attribute(&element, "react-ref-2-2"), Some(&json!(1)));

        tree.set_attribute(id, AttributeKey::Index(2), json!("custom-ref")).expect("named ref");
        assert!(tree.backend().attribute(&element, "react-ref-2-2").is_none());
        assert_eq!(tree.backend().attribute(&element, "custom-ref"), Some(&json!(1)));

        tree.set_attribute(id, AttributeKey::Index(2), Value::Null).expect("clear");
        assert!(tree.backend().attribute(&element, "custom-ref").is_none());
    }

    #[test]
    fn worklet_refs_attach_after_queue_drain() {
        let (mut tree, runner) = tree();
        let (id, element) = attached_card(&mut tree);
        tree.set_attribute(
            id,
            AttributeKey::Index(3),
            json!({ "__MT_PERSIST__": true, "id": 5, "initValue": null, "type": "main-thread" }),
        )
        .expect("mtv ref");
        assert_eq!(tree.backend().attribute(&element, "has-react-ref"), Some(&json!(true)));
        assert_eq!(tree.queued_refs(), 1);
        assert!(tree.values().get(5).is_none());

        assert_eq!(tree.apply_ref_queue(), 1);
        assert_eq!(tree.values().get(5).expect("hydrated").current, Current::Element(element));

        tree.set_attribute(id, AttributeKey::Index(3), json!({ "_wkltId": "w:1", "unmount": true }))
            .expect("worklet ref");
        assert_eq!(tree.values().get(5).expect("released").current, Current::Value(Value::Null));
        tree.apply_ref_queue();
        assert_eq!(
            runner.0.borrow().runs,
            vec![(json!({ "_wkltId": "w:1", "unmount": true }), Some(element))]
        );
    }

    #[test]
    fn invalid_worklet_ref_is_fatal() {
        let (mut tree, _) = tree();
        let (id, _) = attached_card(&mut tree);
        let err = tree
            .set_attribute(id, AttributeKey::Index(3), json!({ "current": null }))
            .expect_err("plain object");
        assert!(matches!(err, ApplyError::Ref(_)));
    }

    #[test]
    fn remove_child_unrefs_subtree_once() {
        let (mut tree, runner) = tree();
        let (card, _) = attached_card(&mut tree);
        tree.create(Some("card"), 3);
        tree.insert_before(card, 3, None).expect("nested");
        tree.set_attribute(3, AttributeKey::Index(3), json!({ "_wkltId": "w:2", "unmount": true }))
            .expect("nested worklet");
        tree.apply_ref_queue();

        assert!(tree.remove_child(1, card).expect("remove"));
        assert!(!tree.contains(card));
        assert!(!tree.contains(3));
        assert_eq!(runner.0.borrow().unmounts, vec![UnmountHandle(1)]);
        assert!(!tree.remove_child(1, card).expect("second remove"));
        assert_eq!(runner.0.borrow().unmounts.len(), 1);

        let page = tree.element(1).expect("page element");
        assert!(tree.backend().element(page).expect("page").children.is_empty());
    }

    #[test]
    fn queued_ref_for_removed_node_is_skipped() {
        let (mut tree, runner) = tree();
        let (card, _) = attached_card(&mut tree);
        tree.set_attribute(card, AttributeKey::Index(3), json!({ "_wkltId": "w:3" }))
            .expect("worklet");
        tree.remove_child(1, card).expect("remove");

        assert_eq!(tree.apply_ref_queue(), 0);
        assert_eq!(runner.0.borrow().runs, vec![(json!({ "_wkltId": "w:3" }), None)]);
    }

    #[test]
    fn gesture_slot_marks_element() {
        let (mut tree, _) = tree();
        let (id, element) = attached_card(&mut tree);
        let payload = json!({ "type": 0, "id": 1, "__isSerialized": true });
        tree.set_attribute(id, AttributeKey::Index(4), payload.clone()).expect("gesture");

        let backend = tree.backend();
        assert_eq!(backend.attribute(&element, "has-react-gesture"), Some(&json!(true)));
        assert_eq!(backend.attribute(&element, "flatten"), Some(&json!(false)));
        assert_eq!(backend.attribute(&element, "gesture"), Some(&payload));
    }

    #[test]
    fn spread_applies_keys_and_resets_removed_ones() {
        let (mut tree, _) = tree();
        let (id, element) = attached_card(&mut tree);
        tree.set_attribute(
            id,
            AttributeKey::Index(5),
            json!({ "class": "a", "style": { "color": "red" }, "ref": 1 }),
        )
        .expect("spread");
        assert_eq!(tree.backend().attribute(&element, "class"), Some(&json!("a")));
        assert_eq!(tree.backend().attribute(&element, "react-ref-2-5"), Some(&json!(1)));

        tree.set_attribute(id, AttributeKey::Index(5), json!({ "title": "t" }))
            .expect("respread");
        let backend = tree.backend();
        assert!(backend.attribute(&element, "class").is_none());
        assert!(backend.attribute(&element, "react-ref-2-5").is_none());
        assert!(backend.element(&element).expect("element").style.is_empty());
        assert_eq!(backend.attribute(&element, "title"), Some(&json!("t")));
    }

    #[test]
    fn values_key_replaces_whole_record() {
        let (mut tree, _) = tree();
        let (id, element) = attached_card(&mut tree);
        tree.set_attribute(id, AttributeKey::Values, json!(["hero", { "color": "red" }]))
            .expect("values");
        tree.set_attribute(id, AttributeKey::Values, json!(["hero"])).expect("shrink");

        assert_eq!(tree.get(id).expect("card").values(), &[json!("hero")]);
        assert!(tree.backend().element(&element).expect("element").style.is_empty());

        tree.set_attribute(id, AttributeKey::Values, json!({ "not": "an array" }))
            .expect("ignored");
        assert_eq!(tree.get(id).expect("card").values(), &[json!("hero")]);
    }

    #[test]
    fn reset_empties_top_level_elements() {
        let (mut tree, runner) = tree();
        let (card, _) = attached_card(&mut tree);
        let worklet = json!({ "_wkltId": "w:4", "unmount": true });
        tree.set_attribute(card, AttributeKey::Index(3), worklet).expect("worklet");
        tree.apply_ref_queue();
        let page = *tree.element(1).expect("page");

        tree.reset().expect("reset");
        assert!(tree.is_empty());
        assert!(tree.backend().element(&page).expect("page").children.is_empty());
        assert_eq!(runner.0.borrow().unmounts, vec![UnmountHandle(1)]);
    }
}
