use bevy::prelude::*;
use std::collections::VecDeque;

use super::types::PATHFIND_QUEUE_LEN;

/// Bounded FIFO of units awaiting a path.
///
/// This queue is the core's sole mechanism for scheduling heavy work fairly
/// across a large unit population: each tick it drains in order until it is
/// empty or the tick's cell-allocation budget is spent. Entries are not
/// individually cancellable — a dead or re-ordered unit is discarded at
/// dequeue time when its lookup fails.
#[derive(Default)]
pub struct PathfindQueue {
    queue: VecDeque<Entity>,
}

impl PathfindQueue {
    pub fn new() -> Self {
        Self { queue: VecDeque::with_capacity(PATHFIND_QUEUE_LEN) }
    }

    /// Enqueue a unit. Returns false (and logs) when the queue is full; the
    /// caller should retry next tick.
    pub fn enqueue(&mut self, id: Entity) -> bool {
        if self.queue.len() >= PATHFIND_QUEUE_LEN {
            warn!("[PATHFIND] request queue full ({} entries)", PATHFIND_QUEUE_LEN);
            return false;
        }
        self.queue.push_back(id);
        true
    }

    pub fn pop(&mut self) -> Option<Entity> {
        self.queue.pop_front()
    }

    /// Put an entry back at the front, preserving its turn (used when the
    /// tick budget runs out mid-drain).
    pub fn push_front(&mut self, id: Entity) {
        self.queue.push_front(id);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.queue.iter()
    }
}
