//! Feed reconciliation engine.
//!
//! Keeps an ordered view of public wills consistent with the backing store
//! while change events arrive in whatever order the transport delivers them.
//!
//! Invariants held after every operation:
//!
//! - at most one entry per identifier;
//! - only records whose latest known state is public;
//! - newest first, except that records arriving live go to the head.

use std::collections::HashSet;
use std::time::Duration;

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::highlight::HighlightSchedule;
use crate::projection::LiveView;
use crate::types::{feed_order, BequestId, BequestRecord};

/// Lifecycle of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Mounted; the bulk load has not completed yet.
    Loading,
    /// Bulk load done (or failed); applying live events.
    Live,
    /// Unmounted; every operation is a no-op.
    TornDown,
}

/// Why an operation left the feed unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotPublic,
    Absent,
    TornDown,
}

/// Effect of one operation on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedChange {
    /// Placed at the head of the feed.
    Inserted { highlighted: bool },
    /// Fields replaced in place.
    Replaced,
    /// Taken out of the feed.
    Removed,
    /// Nothing happened.
    Ignored(IgnoreReason),
}

impl FeedChange {
    /// Whether the feed contents changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Ignored(_))
    }
}

/// One render-ready row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    #[serde(flatten)]
    pub record: BequestRecord,
    pub is_new: bool,
}

/// Ordered, deduplicated view of public wills.
pub struct FeedEngine<C: Clock> {
    clock: C,
    phase: Phase,
    records: Vec<BequestRecord>,
    highlights: HighlightSchedule,
    /// Ids removed while the bulk load was in flight; the snapshot may still list them.
    load_tombstones: HashSet<BequestId>,
}

impl<C: Clock> FeedEngine<C> {
    /// Create an engine in the `Loading` phase.
    pub fn new(clock: C, highlight_ttl: Duration) -> Self {
        Self {
            clock,
            phase: Phase::Loading,
            records: Vec::new(),
            highlights: HighlightSchedule::new(highlight_ttl),
            load_tombstones: HashSet::new(),
        }
    }

    /// Create an engine using the configured highlight lifetime.
    pub fn from_config(clock: C, config: &FeedConfig) -> Self {
        Self::new(clock, config.highlight_ttl)
    }

    /// Merge the bulk-load result and go live.
    ///
    /// A failed load is logged and treated as empty. Records that arrived live
    /// during the load keep their place at the head; snapshot rows follow in
    /// feed order. Nothing is highlighted.
    pub fn initialize(&mut self, snapshot: Result<Vec<BequestRecord>>) -> &[BequestRecord] {
        match self.phase {
            Phase::Loading => {}
            Phase::Live => {
                warn!("Feed already initialized; ignoring second snapshot");
                return &self.records;
            }
            Phase::TornDown => {
                debug!("Feed torn down; ignoring snapshot");
                return &self.records;
            }
        }

        let snapshot = snapshot.unwrap_or_else(|e| {
            warn!(error = %e, "Initial feed load failed; continuing with live events only");
            Vec::new()
        });
        let fetched = snapshot.len();

        let tombstones = std::mem::take(&mut self.load_tombstones);
        let mut seen: HashSet<BequestId> = self.records.iter().map(|r| r.id.clone()).collect();
        let mut rows: Vec<BequestRecord> = snapshot
            .into_iter()
            .filter(|r| r.is_public && !tombstones.contains(&r.id))
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        rows.sort_by(feed_order);

        let arrived_live = self.records.len();
        self.records.extend(rows);
        self.phase = Phase::Live;

        info!(
            fetched,
            arrived_live,
            total = self.records.len(),
            "Feed initialized"
        );
        &self.records
    }

    /// Replace the feed with a fresh snapshot, without highlights.
    ///
    /// Meant for callers that know the change stream dropped events (for
    /// example after a reconnect). A failed snapshot keeps the current view.
    pub fn resync(&mut self, snapshot: Result<Vec<BequestRecord>>) -> &[BequestRecord] {
        if self.phase != Phase::Live {
            debug!(phase = ?self.phase, "Resync outside live phase ignored");
            return &self.records;
        }
        let snapshot = match snapshot {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Feed resync failed; keeping current view");
                return &self.records;
            }
        };

        let rows: Vec<BequestRecord> = snapshot
            .into_iter()
            .filter(|r| r.is_public)
            .unique_by(|r| r.id.clone())
            .sorted_by(feed_order)
            .collect();
        self.expire_due();

        info!(before = self.records.len(), after = rows.len(), "Feed resynced");
        self.records = rows;
        &self.records
    }

    /// A record was inserted upstream.
    ///
    /// Private records are not shown (and a shown record with the same id is
    /// taken out). A record already in the feed is updated in place instead of
    /// being duplicated.
    pub fn on_created(&mut self, record: BequestRecord) -> FeedChange {
        if self.phase == Phase::TornDown {
            return FeedChange::Ignored(IgnoreReason::TornDown);
        }
        self.expire_due();

        if !record.is_public {
            debug!(bequest_id = %record.id, "Private creation");
            return self.made_private(&record.id);
        }
        if self.contains(&record.id) {
            debug!(bequest_id = %record.id, "Creation for known record; treating as update");
            return self.replace(record);
        }
        self.insert_at_head(record)
    }

    /// A record changed upstream.
    ///
    /// Going private removes it; a public record not yet in the feed is
    /// inserted exactly like a creation; otherwise fields are replaced in place.
    pub fn on_updated(&mut self, record: BequestRecord) -> FeedChange {
        if self.phase == Phase::TornDown {
            return FeedChange::Ignored(IgnoreReason::TornDown);
        }
        self.expire_due();

        if !record.is_public {
            return self.made_private(&record.id);
        }
        if self.contains(&record.id) {
            return self.replace(record);
        }
        debug!(bequest_id = %record.id, "Record made public; inserting");
        self.insert_at_head(record)
    }

    /// The update path for a record known only to have gone private.
    ///
    /// Change notices carry just the id and visibility in that case, which is
    /// all removal needs.
    pub fn on_made_private(&mut self, id: &BequestId) -> FeedChange {
        if self.phase == Phase::TornDown {
            return FeedChange::Ignored(IgnoreReason::TornDown);
        }
        self.expire_due();
        self.made_private(id)
    }

    /// A record was deleted upstream. Idempotent.
    pub fn on_deleted(&mut self, id: &BequestId) -> FeedChange {
        if self.phase == Phase::TornDown {
            return FeedChange::Ignored(IgnoreReason::TornDown);
        }
        self.expire_due();

        if self.phase == Phase::Loading {
            self.load_tombstones.insert(id.clone());
        }
        match self.remove(id) {
            Some(_) => {
                debug!(bequest_id = %id, "Record deleted");
                FeedChange::Removed
            }
            None => FeedChange::Ignored(IgnoreReason::Absent),
        }
    }

    /// Apply a resolved change event.
    pub fn apply_event(&mut self, event: ChangeEvent) -> FeedChange {
        match event {
            ChangeEvent::Created(record) => self.on_created(record),
            ChangeEvent::Updated(record) => self.on_updated(record),
            ChangeEvent::Deleted(id) => self.on_deleted(&id),
        }
    }

    /// Clear the "new" marker for `id`. Returns whether a live one was present.
    pub fn expire_highlight(&mut self, id: &BequestId) -> bool {
        self.expire_due();
        self.highlights.remove(id)
    }

    /// Clear every highlight whose deadline has passed.
    pub fn expire_due(&mut self) -> Vec<BequestId> {
        let now = self.clock.now();
        self.highlights.expire_due(now)
    }

    /// Stop processing. Later calls are no-ops.
    pub fn teardown(&mut self) {
        if self.phase == Phase::TornDown {
            return;
        }
        self.phase = Phase::TornDown;
        self.highlights.clear();
        self.load_tombstones.clear();
        info!(records = self.records.len(), "Feed torn down");
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Records in display order.
    pub fn records(&self) -> &[BequestRecord] {
        &self.records
    }

    /// Number of records in the feed.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the feed is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `id` is in the feed.
    pub fn contains(&self, id: &BequestId) -> bool {
        self.records.iter().any(|r| &r.id == id)
    }

    /// Look up a record.
    pub fn get(&self, id: &BequestId) -> Option<&BequestRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    /// Whether `id` currently carries a live "new" marker.
    pub fn is_highlighted(&self, id: &BequestId) -> bool {
        self.highlights.contains(id, self.clock.now())
    }

    /// Ids with a live "new" marker, sorted. May include ids no longer in the feed.
    pub fn highlighted(&self) -> Vec<BequestId> {
        self.highlights.active(self.clock.now())
    }

    /// When the next highlight is due to expire, in clock time.
    pub fn next_highlight_deadline(&mut self) -> Option<Duration> {
        self.highlights.next_deadline()
    }

    /// Render-ready rows.
    pub fn view(&self) -> Vec<FeedEntry> {
        let now = self.clock.now();
        self.records
            .iter()
            .map(|record| FeedEntry {
                record: record.clone(),
                is_new: self.highlights.contains(&record.id, now),
            })
            .collect()
    }

    /// The clock driving highlight expiry.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn insert_at_head(&mut self, record: BequestRecord) -> FeedChange {
        let highlighted = self.phase == Phase::Live;
        if highlighted {
            self.highlights.insert(record.id.clone(), self.clock.now());
        } else {
            self.load_tombstones.remove(&record.id);
        }
        debug!(bequest_id = %record.id, highlighted, "Inserted at head");
        self.records.insert(0, record);
        FeedChange::Inserted { highlighted }
    }

    fn replace(&mut self, record: BequestRecord) -> FeedChange {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                debug!(bequest_id = %record.id, "Replaced in place");
                *slot = record;
                FeedChange::Replaced
            }
            None => FeedChange::Ignored(IgnoreReason::Absent),
        }
    }

    fn made_private(&mut self, id: &BequestId) -> FeedChange {
        if self.phase == Phase::Loading {
            self.load_tombstones.insert(id.clone());
        }
        match self.remove(id) {
            Some(_) => {
                debug!(bequest_id = %id, "Record made private; removed");
                FeedChange::Removed
            }
            None => FeedChange::Ignored(IgnoreReason::NotPublic),
        }
    }

    fn remove(&mut self, id: &BequestId) -> Option<BequestRecord> {
        let pos = self.records.iter().position(|r| &r.id == id)?;
        Some(self.records.remove(pos))
    }
}

impl<C: Clock> LiveView for FeedEngine<C> {
    type Snapshot = Vec<BequestRecord>;
    type Event = ChangeEvent;

    fn initialize(&mut self, snapshot: Result<Self::Snapshot>) {
        let _ = FeedEngine::initialize(self, snapshot);
    }

    fn apply(&mut self, event: &Self::Event) {
        let _ = self.apply_event(event.clone());
    }

    fn teardown(&mut self) {
        FeedEngine::teardown(self);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn will(id: &str, created: i64) -> BequestRecord {
        BequestRecord::new(format!("item {id}"))
            .with_id(id)
            .with_created_at(at(created))
    }

    fn engine() -> (FeedEngine<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (FeedEngine::new(clock.clone(), Duration::from_secs(3)), clock)
    }

    fn ids<C: Clock>(engine: &FeedEngine<C>) -> Vec<&str> {
        engine.records().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_initialize_sorts_and_filters_snapshot() {
        let (mut feed, _) = engine();
        let rows = vec![
            will("b", 5),
            will("a", 10),
            will("hidden", 20).with_public(false),
            will("a", 10),
        ];
        feed.initialize(Ok(rows));

        assert_eq!(ids(&feed), vec!["a", "b"]);
        assert_eq!(feed.phase(), Phase::Live);
        assert!(feed.highlighted().is_empty());
    }

    #[test]
    fn test_failed_load_goes_live_empty() {
        let (mut feed, _) = engine();
        feed.initialize(Err(Error::source_failed("load_public", "offline")));
        assert!(feed.is_empty());

        let change = feed.on_created(will("a", 1));
        assert_eq!(change, FeedChange::Inserted { highlighted: true });
        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_second_initialize_is_ignored() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 1)]));
        feed.initialize(Ok(vec![will("b", 2)]));
        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_live_insert_goes_to_head() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10), will("b", 5)]));
        feed.on_created(will("c", 7));
        assert_eq!(ids(&feed), vec!["c", "a", "b"]);
        assert!(feed.is_highlighted(&BequestId::from("c")));
    }

    #[test]
    fn test_private_creation_ignored() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(Vec::new()));
        let change = feed.on_created(will("a", 1).with_public(false));
        assert_eq!(change, FeedChange::Ignored(IgnoreReason::NotPublic));
        assert!(feed.is_empty());
        assert!(feed.highlighted().is_empty());
    }

    #[test]
    fn test_private_creation_for_shown_record_removes_it() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        let change = feed.on_created(will("a", 10).with_public(false));
        assert_eq!(change, FeedChange::Removed);
        assert!(feed.is_empty());
    }

    #[test]
    fn test_duplicate_creation_is_upsert() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10), will("b", 5)]));
        let change = feed.on_created(will("b", 5).with_emoji("🔥"));

        assert_eq!(change, FeedChange::Replaced);
        assert_eq!(ids(&feed), vec!["a", "b"]);
        assert_eq!(
            feed.get(&BequestId::from("b")).and_then(|r| r.emoji.as_deref()),
            Some("🔥")
        );
        assert!(!feed.is_highlighted(&BequestId::from("b")));
    }

    #[test]
    fn test_update_keeps_position() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10), will("b", 5), will("c", 1)]));
        let change = feed.on_updated(will("b", 5).with_tag("heirloom"));

        assert_eq!(change, FeedChange::Replaced);
        assert_eq!(ids(&feed), vec!["a", "b", "c"]);
        assert_eq!(
            feed.get(&BequestId::from("b")).and_then(|r| r.tag.as_deref()),
            Some("heirloom")
        );
    }

    #[test]
    fn test_made_private_removes_without_highlight() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        let change = feed.on_updated(will("a", 10).with_public(false));

        assert_eq!(change, FeedChange::Removed);
        assert!(feed.is_empty());
        assert!(feed.highlighted().is_empty());
    }

    #[test]
    fn test_made_private_by_id() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10), will("b", 5)]));
        assert_eq!(feed.on_made_private(&BequestId::from("a")), FeedChange::Removed);
        assert_eq!(ids(&feed), vec!["b"]);
    }

    #[test]
    fn test_private_update_for_absent_record_is_noop() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        let change = feed.on_updated(will("z", 1).with_public(false));
        assert_eq!(change, FeedChange::Ignored(IgnoreReason::NotPublic));
        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_made_public_inserts_with_highlight() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("b", 50)]));
        let change = feed.on_updated(will("a", 1));

        assert_eq!(change, FeedChange::Inserted { highlighted: true });
        assert_eq!(ids(&feed), vec!["a", "b"]);
        assert!(feed.is_highlighted(&BequestId::from("a")));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10), will("b", 5)]));

        assert_eq!(feed.on_deleted(&BequestId::from("a")), FeedChange::Removed);
        let before = feed.records().to_vec();
        assert_eq!(
            feed.on_deleted(&BequestId::from("a")),
            FeedChange::Ignored(IgnoreReason::Absent)
        );
        assert_eq!(feed.records(), before.as_slice());
    }

    #[test]
    fn test_highlight_expires_with_clock() {
        let (mut feed, clock) = engine();
        feed.initialize(Ok(Vec::new()));
        let id = BequestId::from("a");
        feed.on_created(will("a", 1));

        clock.advance_secs(2);
        assert!(feed.is_highlighted(&id));
        clock.advance_secs(1);
        assert!(!feed.is_highlighted(&id));
        assert_eq!(feed.expire_due(), vec![id.clone()]);
        assert!(feed.contains(&id));
    }

    #[test]
    fn test_expire_highlight_is_noop_when_absent() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(Vec::new()));
        assert!(!feed.expire_highlight(&BequestId::from("ghost")));
    }

    #[test]
    fn test_events_during_load_are_not_highlighted() {
        let (mut feed, _) = engine();
        let change = feed.on_created(will("live", 100));
        assert_eq!(change, FeedChange::Inserted { highlighted: false });

        feed.initialize(Ok(vec![will("a", 10), will("live", 100)]));
        assert_eq!(ids(&feed), vec!["live", "a"]);
        assert!(feed.highlighted().is_empty());
    }

    #[test]
    fn test_removals_during_load_survive_snapshot() {
        let (mut feed, _) = engine();
        feed.on_deleted(&BequestId::from("gone"));
        feed.on_updated(will("hidden", 3).with_public(false));

        feed.initialize(Ok(vec![will("gone", 5), will("hidden", 3), will("kept", 1)]));
        assert_eq!(ids(&feed), vec!["kept"]);
    }

    #[test]
    fn test_republished_during_load_is_kept() {
        let (mut feed, _) = engine();
        feed.on_updated(will("a", 3).with_public(false));
        feed.on_updated(will("a", 3));
        feed.initialize(Ok(vec![will("a", 3)]));
        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_teardown_ignores_everything() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        feed.on_created(will("b", 11));
        feed.teardown();

        assert_eq!(feed.phase(), Phase::TornDown);
        assert!(feed.highlighted().is_empty());
        assert_eq!(
            feed.on_created(will("c", 12)),
            FeedChange::Ignored(IgnoreReason::TornDown)
        );
        assert_eq!(
            feed.on_deleted(&BequestId::from("a")),
            FeedChange::Ignored(IgnoreReason::TornDown)
        );
        assert!(!feed.expire_highlight(&BequestId::from("b")));
        assert_eq!(ids(&feed), vec!["b", "a"]);
    }

    #[test]
    fn test_resync_rebuilds_in_feed_order() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        feed.on_created(will("stale", 1));

        feed.resync(Ok(vec![will("b", 20), will("a", 10), will("x", 30).with_public(false)]));
        assert_eq!(ids(&feed), vec!["b", "a"]);
    }

    #[test]
    fn test_failed_resync_keeps_view() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        feed.resync(Err(Error::source_failed("load_public", "timeout")));
        assert_eq!(ids(&feed), vec!["a"]);
    }

    #[test]
    fn test_view_marks_new_entries() {
        let (mut feed, _) = engine();
        feed.initialize(Ok(vec![will("a", 10)]));
        feed.on_created(will("b", 11));

        let view = feed.view();
        let flags: Vec<(&str, bool)> = view
            .iter()
            .map(|e| (e.record.id.as_str(), e.is_new))
            .collect();
        assert_eq!(flags, vec![("b", true), ("a", false)]);
    }
}
