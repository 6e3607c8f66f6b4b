//! Cooperative run loop: named task queues drained in priority order.
//!
//! The store is single-threaded. Mutations enqueue follow-up work (commit
//! scheduling, change fan-out) instead of performing it inline, so several
//! mutations inside one turn coalesce and observers never see intermediate
//! state. Draining order is `Before`, `Middle`, `Render`, `After`; a task
//! may enqueue further tasks, including into earlier queues, and the drain
//! keeps going until every queue is empty.
//!
//! Delay-based scheduling is the host application's concern; this loop only
//! orders work within a turn.

/// The named queues, in draining order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Before,
    Middle,
    Render,
    After,
}

const QUEUE_COUNT: usize = 4;

impl Queue {
    fn index(self) -> usize {
        match self {
            Queue::Before => 0,
            Queue::Middle => 1,
            Queue::Render => 2,
            Queue::After => 3,
        }
    }
}

type Task<T> = Box<dyn FnOnce(&mut T)>;

/// Task queues for a host of type `T`.
///
/// The host owns its run loop and drains it by repeatedly taking
/// [`RunLoop::next_task`] and invoking the task on itself.
pub struct RunLoop<T> {
    queues: [Vec<Task<T>>; QUEUE_COUNT],
}

impl<T> Default for RunLoop<T> {
    fn default() -> Self {
        Self {
            queues: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

impl<T> RunLoop<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task on the given queue.
    pub fn invoke_in(&mut self, queue: Queue, task: impl FnOnce(&mut T) + 'static) {
        self.queues[queue.index()].push(Box::new(task));
    }

    /// Pop the next task: front of the first non-empty queue in order.
    pub fn next_task(&mut self) -> Option<Task<T>> {
        for queue in &mut self.queues {
            if !queue.is_empty() {
                return Some(queue.remove(0));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }
}

impl<T> std::fmt::Debug for RunLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("pending", &self.queues.iter().map(Vec::len).sum::<usize>())
            .finish()
    }
}
