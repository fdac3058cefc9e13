//! Earliest-deadline-first timer queue for reservations.
//!
//! Each reservation has at most one pending deadline. Scheduling a
//! reservation that is already queued moves it, so the queue can never
//! hold duplicates or cycles.

use alloc::collections::BTreeSet;
use hashbrown::HashMap;

use crate::time::Timestamp;
use crate::types::ReservationId;

/// Priority queue of reservation deadlines, earliest first.
#[derive(Debug, Default)]
pub struct TimerQueue {
    // Ordered by (deadline, id); the id disambiguates equal deadlines.
    queue: BTreeSet<(Timestamp, ReservationId)>,
    deadlines: HashMap<ReservationId, Timestamp>,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            queue: BTreeSet::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Number of queued reservations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Check whether a reservation is queued.
    pub fn contains(&self, id: ReservationId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Schedule a reservation, replacing any deadline it already has.
    pub fn schedule(&mut self, id: ReservationId, deadline: Timestamp) {
        if let Some(old) = self.deadlines.insert(id, deadline) {
            self.queue.remove(&(old, id));
        }
        self.queue.insert((deadline, id));
    }

    /// Remove a reservation from the queue. Returns true if it was
    /// queued.
    pub fn cancel(&mut self, id: ReservationId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                self.queue.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    /// Detach and return the next due reservation, if any.
    ///
    /// Call in a loop to drain everything due at `now`, in deadline
    /// order.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(Timestamp, ReservationId)> {
        let &(deadline, id) = self.queue.first()?;
        if deadline > now {
            return None;
        }
        self.queue.remove(&(deadline, id));
        self.deadlines.remove(&id);
        Some((deadline, id))
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue.first().map(|&(deadline, _)| deadline)
    }

    /// Iterate queued entries in deadline order.
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, ReservationId)> + '_ {
        self.queue.iter().copied()
    }
}
