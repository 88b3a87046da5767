//! Reaction tasks.

use std::any::Any;
use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::descriptor::{Group, Pool, Priority};
use crate::ids::{ReactionId, TaskId};
use crate::registry::Reaction;

/// The value captured by an emission, shared by all tasks it produced.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// The callable synthesized at bind time.
pub(crate) type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// A single scheduled execution of a reaction with a captured payload.
///
/// Tasks reference their reaction by id; the weak reference is only
/// used for completion bookkeeping and dies with the binding.
pub struct ReactionTask {
    pub id: TaskId,
    pub reaction_id: ReactionId,
    pub pool: Pool,
    pub group: Group,
    pub priority: Priority,
    /// Set for DIRECT emissions; the scheduler may run the task inline
    /// on the submitting thread.
    pub immediate: bool,
    pub(crate) callback: Callback,
    pub(crate) payload: Payload,
    pub(crate) reaction: Weak<Reaction>,
}

impl ReactionTask {
    pub(crate) fn new(reaction: &Arc<Reaction>, payload: Payload, immediate: bool) -> Self {
        Self {
            id: TaskId::next(),
            reaction_id: reaction.id,
            pool: reaction.options.pool,
            group: reaction.options.group,
            priority: reaction.options.priority,
            immediate,
            callback: reaction.callback.clone(),
            payload,
            reaction: Arc::downgrade(reaction),
        }
    }

    /// Queue position: higher priorities first, older tasks first
    /// within a priority.
    pub(crate) fn order(&self) -> (Reverse<Priority>, TaskId) {
        (Reverse(self.priority), self.id)
    }

    /// Execute the callback. A panic is contained here: the task is
    /// done either way and the worker survives.
    pub(crate) fn run(self) {
        if let Err(err) = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(&self.payload)))
        {
            log::error!(
                target: "scheduler",
                "Task {} of reaction {} failed: {}",
                self.id,
                self.reaction_id,
                panic_message(&err)
            );
        }
        if let Some(reaction) = self.reaction.upgrade() {
            reaction.run_postcondition();
        }
    }
}

impl std::fmt::Debug for ReactionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactionTask")
            .field("id", &self.id)
            .field("reaction", &self.reaction_id)
            .field("pool", &self.pool.id)
            .field("priority", &self.priority)
            .field("immediate", &self.immediate)
            .finish_non_exhaustive()
    }
}

impl Drop for ReactionTask {
    fn drop(&mut self) {
        // Runs whether the task executed or was dropped at shutdown;
        // either way it no longer occupies its reaction's active slot.
        if let Some(reaction) = self.reaction.upgrade() {
            reaction.task_done();
        }
    }
}

fn panic_message(err: &(dyn Any + Send)) -> &str {
    if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else if let Some(s) = err.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::registry::BindOptions;

    /// A free-standing task for scheduler tests.
    pub(crate) fn task(
        options: BindOptions,
        immediate: bool,
        f: impl Fn() + Send + Sync + 'static,
    ) -> ReactionTask {
        ReactionTask {
            id: TaskId::next(),
            reaction_id: ReactionId::next(),
            pool: options.pool,
            group: options.group,
            priority: options.priority,
            immediate,
            callback: Arc::new(move |_| f()),
            payload: Arc::new(()),
            reaction: Weak::new(),
        }
    }

    #[test]
    fn test_task_order() {
        let high = task(BindOptions::new().priority(Priority::High), false, || {});
        let normal = task(BindOptions::new(), false, || {});
        let old_normal_id = normal.id;

        assert!(high.order() < normal.order(), "high priority sorts first");

        let newer = task(BindOptions::new(), false, || {});
        assert!(old_normal_id < newer.id);
        assert!(normal.order() < newer.order(), "older task wins the tie");
    }
}
