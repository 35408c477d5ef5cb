//! Unread notification counter.

use tracing::{debug, warn};

use crate::error::Result;
use crate::projection::LiveView;
use crate::types::{NotificationRecord, UserId};

/// Count of unread notifications for the signed-in viewer.
///
/// Seeded by one query and bumped by each live insert addressed to the
/// viewer. Nothing live ever decrements it; marking notifications read is a
/// bulk side effect handled elsewhere.
#[derive(Debug, Clone)]
pub struct UnreadCounter {
    viewer: Option<UserId>,
    count: u64,
    torn_down: bool,
}

impl UnreadCounter {
    /// Counter for `viewer`. `None` means signed out: the count stays at zero.
    pub fn new(viewer: Option<UserId>) -> Self {
        Self {
            viewer,
            count: 0,
            torn_down: false,
        }
    }

    /// Seed the count. Failure is logged and counts as zero.
    pub fn initialize(&mut self, count: Result<u64>) -> u64 {
        if self.torn_down || self.viewer.is_none() {
            return self.count;
        }
        self.count = count.unwrap_or_else(|e| {
            warn!(error = %e, "Unread count query failed");
            0
        });
        self.count
    }

    /// A notification row was inserted. Returns whether it counted.
    pub fn on_notification_created(&mut self, notification: &NotificationRecord) -> bool {
        if self.torn_down {
            return false;
        }
        match &self.viewer {
            Some(viewer) if *viewer == notification.user_id => {
                self.count = self.count.saturating_add(1);
                debug!(notification_id = %notification.id, count = self.count, "Unread count bumped");
                true
            }
            _ => false,
        }
    }

    /// Stop counting.
    pub fn teardown(&mut self) {
        self.torn_down = true;
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The viewer this counter belongs to.
    pub fn viewer(&self) -> Option<&UserId> {
        self.viewer.as_ref()
    }

    /// Bell badge text: hidden at zero, capped at "9+".
    pub fn badge_label(&self) -> Option<String> {
        match self.count {
            0 => None,
            n if n > 9 => Some("9+".to_string()),
            n => Some(n.to_string()),
        }
    }
}

impl LiveView for UnreadCounter {
    type Snapshot = u64;
    type Event = NotificationRecord;

    fn initialize(&mut self, snapshot: Result<u64>) {
        let _ = UnreadCounter::initialize(self, snapshot);
    }

    fn apply(&mut self, event: &NotificationRecord) {
        let _ = self.on_notification_created(event);
    }

    fn teardown(&mut self) {
        UnreadCounter::teardown(self);
    }
}
