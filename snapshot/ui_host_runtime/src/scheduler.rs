use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;

pub type UiTask = Box<dyn FnOnce()>;

/// Batches UI-affecting calls until the elements they target exist.
///
/// One scheduler per render root. While delaying, tasks are queued in call
/// order; [`CommitScheduler::run_delayed_ui_ops`] drains them once and turns
/// delaying off until the next [`CommitScheduler::begin_commit`].
pub struct CommitScheduler {
    delaying: Cell<bool>,
    queue: RefCell<VecDeque<UiTask>>,
}

impl Default for CommitScheduler {
    fn default() -> Self {
        Self {
            delaying: Cell::new(true),
            queue: RefCell::new(VecDeque::new()),
        }
    }
}

impl fmt::Debug for CommitScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitScheduler")
            .field("delaying", &self.delaying.get())
            .field("pending", &self.pending())
            .finish()
    }
}

impl CommitScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_delay_ui_ops(&self) -> bool {
        self.delaying.get()
    }

    pub fn begin_commit(&self) {
        self.delaying.set(true);
    }

    pub fn run_or_delay<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        if self.delaying.get() {
            self.queue.borrow_mut().push_back(Box::new(task));
        } else {
            task();
        }
    }

    /// Runs every queued task in FIFO order and returns how many ran.
    ///
    /// Tasks queued by a running task are drained in the same pass.
    pub fn run_delayed_ui_ops(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs; tasks may queue more work.
            let next = self.queue.borrow_mut().pop_front();
            let Some(task) = next else {
                break;
            };
            task();
            ran += 1;
        }
        self.delaying.set(false);
        ran
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn delayed_tasks_run_in_call_order_exactly_once() {
        let scheduler = CommitScheduler::new();
        let log = recorder();

        for name in ["t1", "t2", "t3"] {
            let log = log.clone();
            scheduler.run_or_delay(move || log.borrow_mut().push(name));
        }
        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.pending(), 3);

        assert_eq!(scheduler.run_delayed_ui_ops(), 3);
        assert_eq!(*log.borrow(), vec!["t1", "t2", "t3"]);

        assert_eq!(scheduler.run_delayed_ui_ops(), 0);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn runs_immediately_after_flush() {
        let scheduler = CommitScheduler::new();
        scheduler.run_delayed_ui_ops();
        assert!(!scheduler.should_delay_ui_ops());

        let log = recorder();
        let task_log = log.clone();
        scheduler.run_or_delay(move || task_log.borrow_mut().push("now"));
        assert_eq!(*log.borrow(), vec!["now"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn begin_commit_rearms_delaying() {
        let scheduler = CommitScheduler::new();
        scheduler.run_delayed_ui_ops();
        scheduler.begin_commit();

        let log = recorder();
        let task_log = log.clone();
        scheduler.run_or_delay(move || task_log.borrow_mut().push("later"));
        assert!(log.borrow().is_empty());

        scheduler.run_delayed_ui_ops();
        assert_eq!(*log.borrow(), vec!["later"]);
    }

    #[test]
    fn tasks_queued_while_draining_run_in_same_pass() {
        let scheduler = Rc::new(CommitScheduler::new());
        let log = recorder();

        let inner_scheduler = scheduler.clone();
        let outer_log = log.clone();
        scheduler.run_or_delay(move || {
            outer_log.borrow_mut().push("outer");
            let nested_log = outer_log.clone();
            inner_scheduler.run_or_delay(move || nested_log.borrow_mut().push("nested"));
        });
        let tail_log = log.clone();
        scheduler.run_or_delay(move || tail_log.borrow_mut().push("tail"));

        assert_eq!(scheduler.run_delayed_ui_ops(), 3);
        assert_eq!(*log.borrow(), vec!["outer", "tail", "nested"]);
    }
}
