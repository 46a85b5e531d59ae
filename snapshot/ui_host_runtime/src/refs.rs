//! Background-side refs.
//!
//! A ref attached to a node never sees the real element. It receives a
//! [`RefProxy`] naming `(node id, slot)`; imperative calls made through the
//! proxy are routed through the [`CommitScheduler`] so they only reach the
//! main side once the element exists there.

use crate::background::BackgroundSnapshotInstance;
use crate::registry::NodeId;
use crate::scheduler::CommitScheduler;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type RefUnmount = Box<dyn FnOnce()>;
pub type RefTarget = (NodeId, usize);

type RefCallbackFn = Rc<RefCell<dyn FnMut(Option<RefProxy>) -> Option<RefUnmount>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RefTask {
    Invoke { method: String, params: Value },
    SetNativeProps(Value),
    Fields(Vec<String>),
    Path,
}

/// Receives element operations once they are allowed to run.
pub trait RefDispatcher {
    fn dispatch(&self, selector: &str, task: &RefTask);
}

/// Scheduler plus dispatcher shared by every proxy of one render root.
#[derive(Clone)]
pub struct UiOps {
    scheduler: Rc<CommitScheduler>,
    dispatcher: Rc<dyn RefDispatcher>,
}

impl fmt::Debug for UiOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiOps")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl UiOps {
    pub fn new(scheduler: Rc<CommitScheduler>, dispatcher: Rc<dyn RefDispatcher>) -> Self {
        Self {
            scheduler,
            dispatcher,
        }
    }

    pub fn scheduler(&self) -> &Rc<CommitScheduler> {
        &self.scheduler
    }
}

/// Lazy handle to the element behind `(node id, slot)`.
#[derive(Clone)]
pub struct RefProxy {
    node_id: NodeId,
    index: usize,
    tasks: Vec<RefTask>,
    ui_ops: UiOps,
}

impl fmt::Debug for RefProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefProxy")
            .field("node_id", &self.node_id)
            .field("index", &self.index)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl RefProxy {
    pub fn new(node_id: NodeId, index: usize, ui_ops: UiOps) -> Self {
        Self {
            node_id,
            index,
            tasks: Vec::new(),
            ui_ops,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tasks(&self) -> &[RefTask] {
        &self.tasks
    }

    /// Selector of the attribute the main side puts on the element.
    pub fn selector(&self) -> String {
        format!("[react-ref-{}-{}]", self.node_id, self.index)
    }

    pub fn invoke(&self, method: impl Into<String>, params: Value) -> RefProxy {
        self.with_task(RefTask::Invoke {
            method: method.into(),
            params,
        })
    }

    pub fn set_native_props(&self, props: Value) -> RefProxy {
        self.with_task(RefTask::SetNativeProps(props))
    }

    pub fn fields(&self, fields: &[&str]) -> RefProxy {
        self.with_task(RefTask::Fields(fields.iter().map(|field| field.to_string()).collect()))
    }

    pub fn path(&self) -> RefProxy {
        self.with_task(RefTask::Path)
    }

    fn with_task(&self, task: RefTask) -> RefProxy {
        let mut next = self.clone();
        next.tasks.push(task);
        next
    }

    /// Sends the recorded tasks now, or after the commit if it is still pending.
    pub fn exec(self) {
        let selector = self.selector();
        let dispatcher = self.ui_ops.dispatcher.clone();
        let tasks = self.tasks;
        self.ui_ops.scheduler.run_or_delay(move || {
            for task in &tasks {
                dispatcher.dispatch(&selector, task);
            }
        });
    }
}

enum RefKind {
    Callback(RefCallbackFn),
    Object(Option<RefProxy>),
}

struct RefState {
    kind: RefKind,
    unmount: Option<RefUnmount>,
}

/// A callback ref or an object ref with a `current` slot.
#[derive(Clone)]
pub struct Ref(Rc<RefCell<RefState>>);

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.borrow();
        match &state.kind {
            RefKind::Callback(_) => f
                .debug_struct("Ref::Callback")
                .field("has_unmount", &state.unmount.is_some())
                .finish(),
            RefKind::Object(current) => f
                .debug_struct("Ref::Object")
                .field("current", current)
                .finish(),
        }
    }
}

impl Ref {
    /// The callback may return a cleanup closure; it runs before the next call.
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnMut(Option<RefProxy>) -> Option<RefUnmount> + 'static,
    {
        Self::from_kind(RefKind::Callback(Rc::new(RefCell::new(callback))))
    }

    pub fn object() -> Self {
        Self::from_kind(RefKind::Object(None))
    }

    fn from_kind(kind: RefKind) -> Self {
        Self(Rc::new(RefCell::new(RefState { kind, unmount: None })))
    }

    /// `current` of an object ref; always `None` for callback refs.
    pub fn current(&self) -> Option<RefProxy> {
        match &self.0.borrow().kind {
            RefKind::Object(current) => current.clone(),
            RefKind::Callback(_) => None,
        }
    }

    pub fn ptr_eq(&self, other: &Ref) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Attaches `reference` to `target`, or detaches it when `target` is `None`.
pub fn apply_ref(reference: &Ref, target: Option<RefTarget>, ui_ops: &UiOps) {
    let proxy = target.map(|(node_id, index)| RefProxy::new(node_id, index, ui_ops.clone()));

    let (callback, unmount) = {
        let mut state = reference.0.borrow_mut();
        let state = &mut *state;
        match &mut state.kind {
            RefKind::Object(current) => {
                *current = proxy;
                return;
            }
            RefKind::Callback(callback) => (callback.clone(), state.unmount.take()),
        }
    };

    // User code runs with the ref state released so it may read its own ref.
    let had_unmount = unmount.is_some();
    if let Some(unmount) = unmount {
        unmount();
    }
    // A cleanup closure stands in for the null call on detach.
    if !had_unmount || proxy.is_some() {
        let next = {
            let mut callback = callback.borrow_mut();
            (&mut *callback)(proxy)
        };
        reference.0.borrow_mut().unmount = next;
    }
}

/// Ref changes recorded while building a patch, applied once it is sent.
#[derive(Default)]
pub struct RefQueue {
    to_clear: Vec<Ref>,
    to_apply: Vec<(Ref, RefTarget)>,
}

impl fmt::Debug for RefQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefQueue")
            .field("to_clear", &self.to_clear.len())
            .field("to_apply", &self.to_apply.len())
            .finish()
    }
}

impl RefQueue {
    pub fn queue_ref_attr_update(
        &mut self,
        old: Option<&Ref>,
        new: Option<&Ref>,
        node_id: NodeId,
        index: usize,
    ) {
        if let (Some(old), Some(new)) = (old, new) {
            if old.ptr_eq(new) {
                return;
            }
        }
        if let Some(old) = old {
            self.to_clear.push(old.clone());
        }
        if let Some(new) = new {
            self.to_apply.push((new.clone(), (node_id, index)));
        }
    }

    /// Detaches first, then attaches; the queue is empty afterwards.
    pub fn apply_queued_refs(&mut self, ui_ops: &UiOps) {
        let to_clear = std::mem::take(&mut self.to_clear);
        let to_apply = std::mem::take(&mut self.to_apply);

        for reference in &to_clear {
            apply_ref(reference, None, ui_ops);
        }
        for (reference, target) in to_apply {
            apply_ref(&reference, Some(target), ui_ops);
        }
    }

    pub fn clear(&mut self) {
        self.to_clear.clear();
        self.to_apply.clear();
    }

    pub fn len(&self) -> usize {
        self.to_clear.len() + self.to_apply.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Refs attached straight from instances, outside the per-commit queue.
#[derive(Default)]
pub struct RefAttachments {
    attached: Vec<Ref>,
}

impl RefAttachments {
    /// `None` detaches everything attached so far.
    pub fn apply_refs(&mut self, instance: Option<&BackgroundSnapshotInstance>, ui_ops: &UiOps) {
        match instance {
            None => {
                for reference in self.attached.drain(..) {
                    apply_ref(&reference, None, ui_ops);
                }
            }
            Some(instance) => {
                for (index, reference) in instance.refs() {
                    apply_ref(&reference, Some((instance.id(), index)), ui_ops);
                    self.attached.push(reference);
                }
            }
        }
    }

    /// Records the refs of `instance` as attached without calling them.
    pub fn collect(&mut self, instance: &BackgroundSnapshotInstance) {
        self.attached
            .extend(instance.refs().into_iter().map(|(_, reference)| reference));
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    pub(crate) struct RecordingDispatcher {
        pub(crate) calls: RefCell<Vec<(String, RefTask)>>,
    }

    impl RefDispatcher for RecordingDispatcher {
        fn dispatch(&self, selector: &str, task: &RefTask) {
            self.calls.borrow_mut().push((selector.to_string(), task.clone()));
        }
    }

    pub(crate) fn ui_ops() -> (UiOps, Rc<RecordingDispatcher>) {
        let dispatcher = Rc::new(RecordingDispatcher::default());
        let ops = UiOps::new(Rc::new(CommitScheduler::new()), dispatcher.clone());
        (ops, dispatcher)
    }

    type Seen = Rc<RefCell<Vec<Option<(NodeId, usize)>>>>;

    fn recording_callback(with_unmount: bool) -> (Ref, Seen, Rc<RefCell<usize>>) {
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let unmounts = Rc::new(RefCell::new(0));
        let seen_in = seen.clone();
        let unmounts_in = unmounts.clone();
        let reference = Ref::callback(move |proxy| {
            seen_in
                .borrow_mut()
                .push(proxy.map(|proxy| (proxy.node_id(), proxy.index())));
            if with_unmount {
                let unmounts = unmounts_in.clone();
                Some(Box::new(move || *unmounts.borrow_mut() += 1) as RefUnmount)
            } else {
                None
            }
        });
        (reference, seen, unmounts)
    }

    #[test]
    fn callback_ref_without_cleanup_receives_none_on_detach() {
        let (ops, _) = ui_ops();
        let (reference, seen, _) = recording_callback(false);

        apply_ref(&reference, Some((3, 0)), &ops);
        apply_ref(&reference, None, &ops);

        assert_eq!(*seen.borrow(), vec![Some((3, 0)), None]);
    }

    #[test]
    fn cleanup_runs_instead_of_null_call() {
        let (ops, _) = ui_ops();
        let (reference, seen, unmounts) = recording_callback(true);

        apply_ref(&reference, Some((3, 0)), &ops);
        apply_ref(&reference, Some((4, 1)), &ops);
        assert_eq!(*unmounts.borrow(), 1);

        apply_ref(&reference, None, &ops);
        assert_eq!(*unmounts.borrow(), 2);
        assert_eq!(*seen.borrow(), vec![Some((3, 0)), Some((4, 1))]);
    }

    #[test]
    fn callback_may_read_its_own_ref() {
        let (ops, _) = ui_ops();
        let own: Rc<RefCell<Option<Ref>>> = Rc::new(RefCell::new(None));
        let own_in = own.clone();
        let reads = Rc::new(RefCell::new(Vec::new()));
        let reads_in = reads.clone();
        let reference = Ref::callback(move |proxy| {
            let current = own_in.borrow().as_ref().map(|reference| reference.current());
            reads_in.borrow_mut().push((proxy.is_some(), current.is_some()));
            None
        });
        *own.borrow_mut() = Some(reference.clone());

        apply_ref(&reference, Some((1, 0)), &ops);
        apply_ref(&reference, None, &ops);

        assert_eq!(*reads.borrow(), vec![(true, true), (false, true)]);
        own.borrow_mut().take();
    }

    #[test]
    fn object_ref_tracks_current() {
        let (ops, _) = ui_ops();
        let reference = Ref::object();
        apply_ref(&reference, Some((5, 2)), &ops);
        let current = reference.current().expect("attached");
        assert_eq!((current.node_id(), current.index()), (5, 2));
        assert_eq!(current.selector(), "[react-ref-5-2]");

        apply_ref(&reference, None, &ops);
        assert!(reference.current().is_none());
    }

    #[test]
    fn queue_clears_before_applying_and_skips_same_ref() {
        let (ops, _) = ui_ops();
        let (old, old_seen, _) = recording_callback(false);
        let (new, new_seen, _) = recording_callback(false);
        let mut queue = RefQueue::default();

        queue.queue_ref_attr_update(Some(&old), Some(&old), 1, 0);
        assert!(queue.is_empty());

        queue.queue_ref_attr_update(None, Some(&old), 1, 0);
        queue.apply_queued_refs(&ops);
        queue.queue_ref_attr_update(Some(&old), Some(&new), 1, 0);
        assert_eq!(queue.len(), 2);
        queue.apply_queued_refs(&ops);

        assert!(queue.is_empty());
        assert_eq!(*old_seen.borrow(), vec![Some((1, 0)), None]);
        assert_eq!(*new_seen.borrow(), vec![Some((1, 0))]);
    }

    #[test]
    fn proxy_calls_wait_for_commit_flush() {
        let (ops, dispatcher) = ui_ops();
        let reference = Ref::object();
        apply_ref(&reference, Some((2, 0)), &ops);

        let proxy = reference.current().expect("attached");
        proxy.invoke("scrollTo", json!({ "offset": 10 })).exec();
        proxy.set_native_props(json!({ "opacity": 0.5 })).exec();
        assert!(dispatcher.calls.borrow().is_empty());

        ops.scheduler().run_delayed_ui_ops();
        let calls = dispatcher.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "[react-ref-2-0]");
        assert_eq!(
            calls[0].1,
            RefTask::Invoke {
                method: "scrollTo".to_string(),
                params: json!({ "offset": 10 })
            }
        );
        assert_eq!(calls[1].1, RefTask::SetNativeProps(json!({ "opacity": 0.5 })));
    }

    #[test]
    fn proxy_builders_do_not_mutate_the_source() {
        let (ops, _) = ui_ops();
        let proxy = RefProxy::new(1, 0, ops);
        let with_fields = proxy.fields(&["id", "dataset"]).path();
        assert!(proxy.tasks().is_empty());
        assert_eq!(
            with_fields.tasks(),
            &[
                RefTask::Fields(vec!["id".to_string(), "dataset".to_string()]),
                RefTask::Path
            ]
        );
    }
}
