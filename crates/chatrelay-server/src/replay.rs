use std::collections::VecDeque;
use std::sync::Arc;

use chatrelay_shared::Message;

/// The most recent messages, oldest first, bounded by `capacity`.
#[derive(Debug)]
pub struct ReplayBuffer {
    messages: VecDeque<Arc<Message>>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `msg`, evicting and returning the oldest entry when full.
    pub fn push(&mut self, msg: Arc<Message>) -> Option<Arc<Message>> {
        let evicted = if self.messages.len() == self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(msg);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.messages.iter()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().map(|msg| Message::clone(msg)).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
