//! Main-side `main-thread:ref` slots.
//!
//! A slot holds either a main-thread value handle or a worklet. Both need the
//! real element, so attaching is deferred to a FIFO queue that is drained
//! after the patch that created the element has been applied.

use crate::error::RefError;
use crate::main_thread_value::{MainThreadValueRecord, MainThreadValueStore};
use crate::registry::NodeId;
use serde_json::Value;
use std::collections::VecDeque;

const WORKLET_ID_KEY: &str = "_wkltId";
const LEGACY_WORKLET_TYPE: &str = "__LEPUS__";
const LEGACY_WORKLET_HASH_KEY: &str = "_lepusWorkletHash";

/// Opaque token a [`WorkletRunner`] hands out to undo a worklet attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnmountHandle(pub u64);

/// Executes worklets against real elements.
pub trait WorkletRunner<E> {
    /// `element` is `None` when the worklet runs to detach.
    fn run(&mut self, worklet: &Value, element: Option<&E>) -> Option<UnmountHandle>;

    fn unmount(&mut self, handle: UnmountHandle);
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkletRef {
    MainThreadValue(MainThreadValueRecord),
    Worklet(Value),
}

impl WorkletRef {
    /// `Ok(None)` for empty slots and legacy placeholders, which are ignored.
    pub fn classify(value: &Value) -> Result<Option<WorkletRef>, RefError> {
        let object = match value {
            Value::Null | Value::Bool(false) => return Ok(None),
            Value::Object(object) => object,
            _ => return Err(RefError::InvalidMainThreadRef),
        };

        if let Some(record) = MainThreadValueRecord::from_value(value) {
            return Ok(Some(WorkletRef::MainThreadValue(record)));
        }
        if object.contains_key(WORKLET_ID_KEY) {
            return Ok(Some(WorkletRef::Worklet(value.clone())));
        }
        if object.get("_type").and_then(Value::as_str) == Some(LEGACY_WORKLET_TYPE)
            || object.contains_key(LEGACY_WORKLET_HASH_KEY)
        {
            return Ok(None);
        }
        Err(RefError::InvalidMainThreadRef)
    }
}

/// A ref currently held by a node slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedRef {
    pub target: WorkletRef,
    pub unmount: Option<UnmountHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRef<E> {
    pub node: NodeId,
    pub slot: usize,
    pub target: WorkletRef,
    pub element: E,
}

#[derive(Debug)]
pub struct WorkletRefQueue<E> {
    queue: VecDeque<QueuedRef<E>>,
}

impl<E> Default for WorkletRefQueue<E> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<E> WorkletRefQueue<E> {
    pub fn push(&mut self, entry: QueuedRef<E>) {
        self.queue.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedRef<E>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Binds a queued ref to its element. Returns the unmount handle a worklet
/// produced, if any.
pub fn attach_worklet_ref<E: Clone>(
    target: &WorkletRef,
    element: &E,
    store: &mut MainThreadValueStore<E>,
    runner: &mut dyn WorkletRunner<E>,
) -> Option<UnmountHandle> {
    match target {
        WorkletRef::MainThreadValue(record) => {
            store.get_or_hydrate(record).bind_element(Some(element.clone()));
            None
        }
        WorkletRef::Worklet(worklet) => runner.run(worklet, Some(element)),
    }
}

/// Undoes an attach: values lose their element, worklets are unmounted or
/// run once more without one.
pub fn release_worklet_ref<E>(
    attached: AttachedRef,
    store: &mut MainThreadValueStore<E>,
    runner: &mut dyn WorkletRunner<E>,
) {
    match attached.target {
        WorkletRef::MainThreadValue(record) => {
            if let Some(value) = store.get_mut(record.id) {
                value.bind_element(None);
            }
        }
        WorkletRef::Worklet(worklet) => match attached.unmount {
            Some(handle) => runner.unmount(handle),
            None => {
                runner.run(&worklet, None);
            }
        },
    }
}
