//! Priority-ordered task queue
//!
//! Tasks are dequeued by priority, highest first, and in FIFO order within a
//! priority level.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::executor::Task;

/// Load priority levels
///
/// Higher variants are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Speculative work such as prefetching (lowest priority)
    Low = 0,

    /// Ordinary requests
    #[default]
    Normal = 1,

    /// Content the user is about to see
    High = 2,

    /// Content the user is waiting on right now (highest priority)
    Immediate = 3,
}

/// A queued task with its ordering metadata
struct QueuedTask {
    priority: Priority,

    /// Insertion order (used for FIFO within same priority)
    insertion_order: u64,

    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.insertion_order == other.insertion_order
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap, so earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// Priority queue of tasks
///
/// Not synchronized; owners guard it with their own lock.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_insertion_order: u64,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task
    pub fn push(&mut self, priority: Priority, task: Task) {
        let insertion_order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.heap.push(QueuedTask {
            priority,
            insertion_order,
            task,
        });
    }

    /// Remove the highest priority task
    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|queued| queued.task)
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no tasks are queued
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every queued task, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }
}
