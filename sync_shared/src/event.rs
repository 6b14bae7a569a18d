//! Event outbox.
//!
//! State machines never call back into their host. They push typed events
//! into an `EventQueue` they own, and the host drains it after each call.

use std::collections::VecDeque;

/// FIFO outbox of events of a single type.
#[derive(Debug)]
pub struct EventQueue<E> {
    queue: VecDeque<E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an event into the queue.
    pub fn push(&mut self, e: E) {
        self.queue.push_back(e);
    }

    /// Drains all queued events in emission order.
    pub fn drain(&mut self) -> Vec<E> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
