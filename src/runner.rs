//! The cooperative scheduler seam consumed by work chains.
//!
//! Chains never block a thread while waiting: they register completion
//! callbacks and yield. The [`Runner`] trait is the thin interface the
//! engine consumes for that: schedule a task for cooperative execution
//! (`call_soon`) and request a one-shot callback when a process terminates
//! (`call_on_process_finish`).
//!
//! [`LocalRunner`] is the deterministic single-threaded implementation used
//! by tests and embedders: tasks queue on a channel and run one at a time
//! when the owner drains the queue, which serializes every callback with
//! respect to the chains it touches.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

use crate::types::Pk;

/// A unit of cooperative work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Cooperative scheduler interface consumed by the engine.
pub trait Runner: Send + Sync {
    /// Register a one-shot callback invoked when the process identified by
    /// `pk` terminates.
    ///
    /// Must be idempotent with respect to already-terminated targets: if the
    /// process has already finished, the callback is scheduled immediately.
    fn call_on_process_finish(&self, pk: Pk, callback: Task);

    /// Schedule `task` for cooperative execution on the chain's executor.
    fn call_soon(&self, task: Task);
}

#[derive(Default)]
struct CallbackRegistry {
    finished: FxHashSet<Pk>,
    pending: FxHashMap<Pk, Vec<Task>>,
}

/// Deterministic single-threaded cooperative scheduler.
///
/// Tasks execute only inside [`run_until_idle`](Self::run_until_idle), one at
/// a time, on the calling thread. Completion notifications arrive through
/// [`notify_process_finished`](Self::notify_process_finished) and fire their
/// registered callbacks through the same queue, so no two tasks ever
/// interleave.
pub struct LocalRunner {
    tasks_tx: flume::Sender<Task>,
    tasks_rx: flume::Receiver<Task>,
    registry: Mutex<CallbackRegistry>,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    /// Create a runner with an empty task queue.
    #[must_use]
    pub fn new() -> Self {
        let (tasks_tx, tasks_rx) = flume::unbounded();
        Self {
            tasks_tx,
            tasks_rx,
            registry: Mutex::new(CallbackRegistry::default()),
        }
    }

    /// Record that the process `pk` has terminated and schedule every
    /// callback registered for it.
    ///
    /// Later registrations for the same `pk` are scheduled immediately.
    pub fn notify_process_finished(&self, pk: Pk) {
        let callbacks = {
            let mut registry = self.registry.lock().expect("runner registry poisoned");
            registry.finished.insert(pk);
            registry.pending.remove(&pk).unwrap_or_default()
        };
        for callback in callbacks {
            self.call_soon(callback);
        }
    }

    /// Run queued tasks until the queue is empty.
    ///
    /// Tasks scheduled by running tasks are executed in the same drain.
    pub fn run_until_idle(&self) {
        while let Ok(task) = self.tasks_rx.try_recv() {
            task();
        }
    }

    /// Number of tasks currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tasks_rx.len()
    }
}

impl Runner for LocalRunner {
    fn call_on_process_finish(&self, pk: Pk, callback: Task) {
        {
            let mut registry = self.registry.lock().expect("runner registry poisoned");
            if !registry.finished.contains(&pk) {
                registry.pending.entry(pk).or_default().push(callback);
                return;
            }
        }
        // Target already terminated: the store is the source of truth, so
        // the callback fires immediately through the queue.
        self.call_soon(callback);
    }

    fn call_soon(&self, task: Task) {
        self.tasks_tx
            .send(task)
            .expect("local runner task queue disconnected");
    }
}
