//! FIFO admission queue with O(1) membership checks.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Stream already queued: {0}")]
    AlreadyQueued(String),
}

/// Stream ids waiting for a free execution slot, oldest first.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id`, returning its 1-based position.
    pub fn enqueue(&mut self, id: impl Into<String>) -> Result<usize, QueueError> {
        let id = id.into();
        if !self.members.insert(id.clone()) {
            return Err(QueueError::AlreadyQueued(id));
        }
        self.order.push_back(id);
        Ok(self.order.len())
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Option<String> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Remove `id` wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|queued| queued != id);
        true
    }

    /// 1-based position of `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.order.iter().position(|queued| queued == id).map(|i| i + 1)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued ids in promotion order.
    pub fn ids(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    /// Drop every entry, returning them in order.
    pub fn clear(&mut self) -> Vec<String> {
        self.members.clear();
        self.order.drain(..).collect()
    }
}
