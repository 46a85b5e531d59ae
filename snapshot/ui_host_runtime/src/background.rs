//! Background side of the tree.
//!
//! Every mutation updates the lightweight instance tree and records the
//! matching instruction in the [`PatchEncoder`]. [`BackgroundRuntime`] packs
//! those instructions into `update_main_thread` envelopes and reacts to what
//! the main side reports back.

use crate::encoder::PatchEncoder;
use crate::error::TreeError;
use crate::gesture::{ExecIdAllocator, Gesture, prepare_gesture_for_commit};
use crate::main_thread_value::{MainThreadValueRecord, ThreadSide, ValueContext};
use crate::patch::{PatchList, PatchOptions, SnapshotPatch, SnapshotPatchEntry};
use crate::protocol::{BackgroundEnvelope, MainEnvelope};
use crate::refs::{Ref, RefAttachments, RefDispatcher, RefQueue, UiOps};
use crate::registry::{NodeId, NodeRegistry};
use crate::scheduler::CommitScheduler;
use serde_json::{Map, Value, json};
use std::rc::Rc;

/// Value held in one dynamic slot of a background instance.
#[derive(Debug, Clone)]
pub enum SlotValue {
    Json(Value),
    Ref(Ref),
    MainThreadValue(MainThreadValueRecord),
    Worklet(Value),
    Gesture(Gesture),
    /// Spread props; a `ref` entry is attached like a ref slot.
    Spread(Vec<(String, SlotValue)>),
}

impl SlotValue {
    fn ref_handle(&self) -> Option<&Ref> {
        match self {
            SlotValue::Ref(reference) => Some(reference),
            SlotValue::Spread(entries) => entries.iter().find_map(|(key, value)| match value {
                SlotValue::Ref(reference) if key == "ref" => Some(reference),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Wire form. Refs travel as a plain marker; the main side derives the
    /// selector attribute from the node id and slot.
    fn encode(&self, exec_ids: &mut ExecIdAllocator) -> Value {
        match self {
            SlotValue::Json(value) | SlotValue::Worklet(value) => value.clone(),
            SlotValue::Ref(_) => json!(1),
            SlotValue::MainThreadValue(record) => record.to_value(),
            SlotValue::Gesture(gesture) => prepare_gesture_for_commit(gesture, exec_ids).to_json(),
            SlotValue::Spread(entries) => {
                let mut object = Map::new();
                for (key, value) in entries {
                    object.insert(key.clone(), value.encode(exec_ids));
                }
                Value::Object(object)
            }
        }
    }
}

impl From<Value> for SlotValue {
    fn from(value: Value) -> Self {
        SlotValue::Json(value)
    }
}

impl From<Ref> for SlotValue {
    fn from(reference: Ref) -> Self {
        SlotValue::Ref(reference)
    }
}

impl From<Gesture> for SlotValue {
    fn from(gesture: Gesture) -> Self {
        SlotValue::Gesture(gesture)
    }
}

#[derive(Debug)]
pub struct BackgroundSnapshotInstance {
    id: NodeId,
    node_type: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    values: Vec<Option<SlotValue>>,
}

impl BackgroundSnapshotInstance {
    fn new(id: NodeId, node_type: Option<&str>) -> Self {
        Self {
            id,
            node_type: node_type.map(str::to_string),
            parent: None,
            children: Vec::new(),
            values: Vec::new(),
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

    pub fn value(&self, index: usize) -> Option<&SlotValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    /// Ref-bearing slots, spread `ref` entries included.
    pub fn refs(&self) -> Vec<(usize, Ref)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| {
                value
                    .as_ref()
                    .and_then(SlotValue::ref_handle)
                    .map(|reference| (index, reference.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct BackgroundTree {
    registry: NodeRegistry<BackgroundSnapshotInstance>,
    encoder: PatchEncoder,
    refs: RefQueue,
    exec_ids: ExecIdAllocator,
}

impl BackgroundTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, node_type: Option<&str>) -> NodeId {
        let id = self.registry.next_id();
        self.registry
            .register(id, BackgroundSnapshotInstance::new(id, node_type));
        self.encoder.create_element(node_type, id);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&BackgroundSnapshotInstance> {
        self.registry.get(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BackgroundSnapshotInstance> + '_ {
        self.registry.ids().filter_map(|id| self.registry.get(id))
    }

    /// Moves `child` under `parent`. An unknown `before` appends.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        before: Option<NodeId>,
    ) -> Result<(), TreeError> {
        if parent == child {
            return Err(TreeError::SelfInsertion(child));
        }
        self.require(parent)?;
        self.require(child)?;

        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            if current == child {
                return Err(TreeError::WouldCycle { parent, child });
            }
            ancestor = self.registry.get(current).and_then(|node| node.parent);
        }

        self.detach(child);

        let siblings = &self
            .registry
            .get(parent)
            .ok_or(TreeError::NodeNotFound(parent))?
            .children;
        let position =
            before.and_then(|before| siblings.iter().position(|existing| *existing == before));
        let before = position.map(|index| siblings[index]);

        self.encoder.insert_before(parent, child, before)?;

        let node = self
            .registry
            .get_mut(parent)
            .ok_or(TreeError::NodeNotFound(parent))?;
        let index = position.unwrap_or(node.children.len());
        node.children.insert(index, child);
        if let Some(node) = self.registry.get_mut(child) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Detaches `child` and tears its whole subtree down.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        self.require(parent)?;
        if self.registry.get(child).and_then(|node| node.parent) != Some(parent) {
            return Err(TreeError::NotAChild { parent, child });
        }

        self.encoder.remove_child(parent, child)?;
        self.detach(child);
        self.tear_down(child);
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        id: NodeId,
        index: usize,
        value: SlotValue,
    ) -> Result<(), TreeError> {
        self.require(id)?;
        if let SlotValue::Gesture(gesture) = &value {
            gesture.process_pan_distance();
        }
        let encoded = value.encode(&mut self.exec_ids);
        self.encoder.set_attribute(id, index, encoded)?;

        let node = self.registry.get_mut(id).ok_or(TreeError::NodeNotFound(id))?;
        if node.values.len() <= index {
            node.values.resize_with(index + 1, || None);
        }
        let old = node.values[index].replace(value);
        let new = node.values[index].as_ref();
        queue_ref_change(
            &mut self.refs,
            old.as_ref().and_then(SlotValue::ref_handle),
            new.and_then(SlotValue::ref_handle),
            id,
            index,
        );
        Ok(())
    }

    /// Replaces the whole slot record of a node.
    pub fn set_attributes(&mut self, id: NodeId, values: Vec<SlotValue>) -> Result<(), TreeError> {
        self.require(id)?;
        for value in &values {
            if let SlotValue::Gesture(gesture) = value {
                gesture.process_pan_distance();
            }
        }
        let encoded: Vec<Value> = values
            .iter()
            .map(|value| value.encode(&mut self.exec_ids))
            .collect();
        self.encoder.set_attributes(id, Value::Array(encoded))?;

        let node = self.registry.get_mut(id).ok_or(TreeError::NodeNotFound(id))?;
        let old = std::mem::replace(&mut node.values, values.into_iter().map(Some).collect());
        let slots = old.len().max(node.values.len());
        for index in 0..slots {
            let old_ref = old.get(index).and_then(Option::as_ref).and_then(SlotValue::ref_handle);
            let new_ref = node
                .values
                .get(index)
                .and_then(Option::as_ref)
                .and_then(SlotValue::ref_handle);
            queue_ref_change(&mut self.refs, old_ref, new_ref, id, index);
        }
        Ok(())
    }

    pub fn pending_instructions(&self) -> usize {
        self.encoder.pending()
    }

    pub fn take_patch(&mut self) -> SnapshotPatch {
        self.encoder.take_patch()
    }

    pub fn apply_queued_refs(&mut self, ui_ops: &UiOps) {
        self.refs.apply_queued_refs(ui_ops);
    }

    /// Drops every node and pending instruction; ids start over at 1.
    pub fn reset(&mut self) {
        self.registry.clear();
        self.encoder.reset();
        self.refs.clear();
    }

    fn require(&self, id: NodeId) -> Result<(), TreeError> {
        if self.registry.contains(id) {
            Ok(())
        } else {
            Err(TreeError::NodeNotFound(id))
        }
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

    fn tear_down(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.registry.unregister(id) else {
                continue;
            };
            for (index, reference) in node.refs() {
                self.refs.queue_ref_attr_update(Some(&reference), None, id, index);
            }
            stack.extend(node.children.iter().copied());
            self.encoder.forget(id);
        }
    }
}

fn queue_ref_change(
    queue: &mut RefQueue,
    old: Option<&Ref>,
    new: Option<&Ref>,
    id: NodeId,
    index: usize,
) {
    if old.is_some() || new.is_some() {
        queue.queue_ref_attr_update(old, new, id, index);
    }
}

/// One render root on the background side.
pub struct BackgroundRuntime {
    tree: BackgroundTree,
    ui_ops: UiOps,
    values: ValueContext,
    reload_version: u64,
    next_commit_task_id: u64,
    context_not_found: usize,
    needs_reload: bool,
}

impl BackgroundRuntime {
    pub fn new(dispatcher: Rc<dyn RefDispatcher>) -> Self {
        Self {
            tree: BackgroundTree::new(),
            ui_ops: UiOps::new(Rc::new(CommitScheduler::new()), dispatcher),
            values: ValueContext::new(ThreadSide::Background),
            reload_version: 0,
            next_commit_task_id: 1,
            context_not_found: 0,
            needs_reload: false,
        }
    }

    pub fn tree(&self) -> &BackgroundTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BackgroundTree {
        &mut self.tree
    }

    pub fn values(&self) -> &ValueContext {
        &self.values
    }

    pub fn ui_ops(&self) -> &UiOps {
        &self.ui_ops
    }

    pub fn scheduler(&self) -> &Rc<CommitScheduler> {
        self.ui_ops.scheduler()
    }

    pub fn reload_version(&self) -> u64 {
        self.reload_version
    }

    /// `context_not_found` reports received so far.
    pub fn context_not_found(&self) -> usize {
        self.context_not_found
    }

    /// Packs pending work into one envelope. `None` when there is nothing
    /// to send.
    pub fn commit(&mut self) -> Option<BackgroundEnvelope> {
        let envelope = self.pack(false)?;
        self.tree.apply_queued_refs(&self.ui_ops);
        Some(envelope)
    }

    /// First commit after the main side rendered on its own. Refs are
    /// attached straight from the live instances instead of the queue.
    pub fn commit_hydration(&mut self) -> Option<BackgroundEnvelope> {
        let envelope = self.pack(true)?;
        self.tree.refs.clear();

        let mut attachments = RefAttachments::default();
        for node in self.tree.nodes() {
            attachments.apply_refs(Some(node), &self.ui_ops);
        }
        log::debug!("hydration attached {} ref(s)", attachments.len());
        Some(envelope)
    }

    fn pack(&mut self, is_hydration: bool) -> Option<BackgroundEnvelope> {
        let patch = self.tree.take_patch();
        let init_values = self.values.take_init_values();
        if patch.is_empty() && init_values.is_empty() && !is_hydration {
            return None;
        }

        self.ui_ops.scheduler().begin_commit();
        let commit_task_id = self.next_commit_task_id;
        self.next_commit_task_id += 1;

        log::debug!(
            "commit task {commit_task_id}: {} instruction(s), {} init value(s)",
            patch.len(),
            init_values.len()
        );

        Some(BackgroundEnvelope::UpdateMainThread {
            data: PatchList {
                patch_list: vec![SnapshotPatchEntry {
                    snapshot_patch: patch,
                    id: Some(commit_task_id),
                }],
                worklet_ref_init_values: init_values,
                flush_options: Value::Object(Map::new()),
            },
            options: PatchOptions {
                reload_version: self.reload_version,
                is_hydration,
                commit_task_id: Some(commit_task_id),
            },
        })
    }

    /// Release events for main-thread values dropped since the last call.
    pub fn drain_releases(&mut self) -> Vec<BackgroundEnvelope> {
        self.values
            .take_released()
            .into_iter()
            .map(|id| BackgroundEnvelope::ReleaseMainThreadValue { id })
            .collect()
    }

    pub fn handle_main_envelope(&mut self, envelope: MainEnvelope) {
        match envelope {
            MainEnvelope::Committed { commit_task_id } => {
                let ran = self.ui_ops.scheduler().run_delayed_ui_ops();
                log::debug!("commit task {commit_task_id} acknowledged; flushed {ran} ui op(s)");
            }
            MainEnvelope::ContextNotFound { op, ids } => {
                self.context_not_found += 1;
                log::warn!("main side could not resolve {op} target(s) {ids:?}");
            }
            MainEnvelope::Ready { capabilities } => {
                log::info!("main side ready: {capabilities}");
            }
            MainEnvelope::Error { code, message } => {
                log::error!("main side error {code}: {message}");
                if should_reload_for_error(&code) {
                    self.needs_reload = true;
                }
            }
        }
    }

    /// Set when the main side reported an error it cannot recover from
    /// without a fresh tree. Cleared by [`BackgroundRuntime::reload`].
    pub fn needs_reload(&self) -> bool {
        self.needs_reload
    }

    /// Tears the tree down and starts a new reload generation.
    pub fn reload(&mut self) -> BackgroundEnvelope {
        let mut attached = RefAttachments::default();
        for node in self.tree.nodes() {
            attached.collect(node);
        }
        attached.apply_refs(None, &self.ui_ops);

        self.tree.reset();
        self.needs_reload = false;
        self.reload_version += 1;
        log::info!("reloading background tree, version {}", self.reload_version);
        BackgroundEnvelope::Reload {
            reload_version: self.reload_version,
        }
    }
}

fn should_reload_for_error(code: &str) -> bool {
    matches!(
        code,
        "decode_error" | "frame_too_large" | "patch_apply_error" | "invalid_main_thread_ref"
    )
}
