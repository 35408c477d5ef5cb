//! "Just arrived" markers with a fixed time-to-live.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::types::BequestId;

/// Highlight set plus the expiry queue that clears it.
///
/// Membership here is independent of the feed itself: a highlight whose record
/// has already left the feed simply lingers until it expires.
#[derive(Debug, Clone)]
pub struct HighlightSchedule {
    ttl: Duration,
    deadlines: HashMap<BequestId, Duration>,
    queue: BinaryHeap<Reverse<(Duration, BequestId)>>,
}

impl HighlightSchedule {
    /// Create an empty schedule.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadlines: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    /// Configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mark `id` as new at `now`. Re-marking restarts its timer.
    pub fn insert(&mut self, id: BequestId, now: Duration) {
        let deadline = now.saturating_add(self.ttl);
        self.deadlines.insert(id.clone(), deadline);
        self.queue.push(Reverse((deadline, id)));
    }

    /// Drop the highlight for `id`. Returns whether one was present.
    pub fn remove(&mut self, id: &BequestId) -> bool {
        // The queue entry goes stale and is skipped by `expire_due`.
        self.deadlines.remove(id).is_some()
    }

    /// Whether `id` is highlighted and not yet past its deadline.
    pub fn contains(&self, id: &BequestId, now: Duration) -> bool {
        self.deadlines.get(id).is_some_and(|deadline| *deadline > now)
    }

    /// Remove every highlight whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Duration) -> Vec<BequestId> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _))) = self.queue.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, id))) = self.queue.pop() else {
                break;
            };
            // Only honor the entry if it is still the live deadline for this id.
            if self.deadlines.get(&id) == Some(&deadline) {
                self.deadlines.remove(&id);
                expired.push(id);
            }
        }
        expired
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.queue.peek() {
            if self.deadlines.get(id) == Some(deadline) {
                return Some(*deadline);
            }
            self.queue.pop();
        }
        None
    }

    /// Highlighted ids that are still live at `now`, sorted.
    pub fn active(&self, now: Duration) -> Vec<BequestId> {
        let mut ids: Vec<BequestId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.queue.clear();
    }

    /// Number of stored highlights, expired-but-unpurged included.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether no highlights are stored.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
