//! Holding area for replicated updates that failed the causal gate.

use std::collections::VecDeque;

use crate::version::Version;

/// A replicated update parked until the gate admits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub key: String,
    pub value: String,
    /// Receipt-stamped version the update was last evaluated at.
    pub version: Version,
}

/// FIFO of delayed updates.
#[derive(Debug, Default)]
pub struct PendingQueue {
    updates: VecDeque<PendingUpdate>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: PendingUpdate) {
        self.updates.push_back(update);
    }

    /// Removes every queued update, oldest first.
    pub fn take_all(&mut self) -> Vec<PendingUpdate> {
        self.updates.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.updates.iter()
    }
}
