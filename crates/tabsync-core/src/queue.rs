//! Three-class priority FIFO
//!
//! Messages are served HIGH before NORMAL before LOW; order within a class is
//! never changed. The queue does not block: consumers re-poll.

use std::collections::VecDeque;

use crate::message::{Message, Priority};

/// Priority FIFO holding one lane per priority class
#[derive(Debug, Default)]
pub struct MessageQueue {
    lanes: [VecDeque<Message>; 3],
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the lane matching the message priority
    pub fn enqueue(&mut self, message: Message) {
        self.lanes[message.priority.index()].push_back(message);
    }

    /// Pop the head of the highest-priority non-empty lane
    pub fn dequeue(&mut self) -> Option<Message> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Look at the next message without removing it
    pub fn peek(&self) -> Option<&Message> {
        self.lanes.iter().find_map(|lane| lane.front())
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn size(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Number of messages waiting in one class
    pub fn size_of(&self, priority: Priority) -> usize {
        self.lanes[priority.index()].len()
    }

    /// Remove every message, returning them in service order
    pub fn drain(&mut self) -> Vec<Message> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    pub fn clear(&mut self) {
        self.lanes.iter_mut().for_each(VecDeque::clear);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
