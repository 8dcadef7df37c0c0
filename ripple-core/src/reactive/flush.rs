//! Flush Scheduling
//!
//! Marking a vertex dirty does not process the graph. Instead the engine
//! asks its [`Scheduler`] to run a [`FlushTask`] at some later point. The
//! scheduler decides when that is:
//!
//! - [`ManualScheduler`]: never; the owner calls [`Engine::flush`] itself.
//! - [`ImmediateScheduler`]: right away, before the write returns.
//! - [`LocalTaskScheduler`]: on the next turn of the current tokio
//!   `LocalSet`.
//!
//! Any `Fn(FlushTask)` closure is a scheduler too.
//!
//! At most one flush is pending at a time. Writes made while a flush is
//! running are picked up by that flush.
//!
//! [`Engine::flush`]: super::Engine::flush

use std::fmt;

/// A deferred call to `Engine::flush`. Holds the engine weakly.
pub struct FlushTask(Box<dyn FnOnce()>);

impl FlushTask {
    pub(crate) fn new<F>(run: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self(Box::new(run))
    }

    /// Flush now. Does nothing if the engine is gone.
    pub fn run(self) {
        (self.0)();
    }
}

impl fmt::Debug for FlushTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlushTask")
    }
}

/// Decides when a pending flush runs.
pub trait Scheduler {
    fn schedule(&self, task: FlushTask);
}

impl<F> Scheduler for F
where
    F: Fn(FlushTask),
{
    fn schedule(&self, task: FlushTask) {
        self(task);
    }
}

/// Drops the task; flushing is left to explicit `Engine::flush` calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualScheduler;

impl Scheduler for ManualScheduler {
    fn schedule(&self, _task: FlushTask) {
        tracing::trace!("flush left to the caller");
    }
}

/// Runs the flush synchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: FlushTask) {
        task.run();
    }
}

/// Spawns the flush onto the current `LocalSet`.
///
/// Must be used from inside `LocalSet::run_until` or a task spawned on a
/// `LocalSet`; `spawn_local` panics anywhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTaskScheduler;

impl Scheduler for LocalTaskScheduler {
    fn schedule(&self, task: FlushTask) {
        tokio::task::spawn_local(async move {
            task.run();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;

    fn counting_task(count: &Rc<Cell<u32>>) -> FlushTask {
        let count = count.clone();
        FlushTask::new(move || count.set(count.get() + 1))
    }

    #[test]
    fn immediate_runs_the_task() {
        let count = Rc::new(Cell::new(0));
        ImmediateScheduler.schedule(counting_task(&count));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn manual_drops_the_task() {
        let count = Rc::new(Cell::new(0));
        ManualScheduler.schedule(counting_task(&count));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn closures_are_schedulers() {
        let count = Rc::new(Cell::new(0));
        let queue: Rc<RefCell<Vec<FlushTask>>> = Rc::default();
        let queue_clone = queue.clone();
        let scheduler = move |task: FlushTask| queue_clone.borrow_mut().push(task);

        scheduler.schedule(counting_task(&count));
        assert_eq!(count.get(), 0);

        for task in queue.borrow_mut().drain(..) {
            task.run();
        }
        assert_eq!(count.get(), 1);
    }
}
