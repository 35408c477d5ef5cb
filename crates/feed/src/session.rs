//! Sessions: the drain loops that feed change notices into the engines.
//!
//! A session owns one subscription and one engine. It handles exactly one
//! unit of work per [`FeedSession::next`] call, so engine operations never
//! interleave. Refetches are in-flight futures polled alongside the
//! subscription; whichever finishes last wins.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::bus::{ChangeBus, ChangeFilter, Subscription};
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::counter::UnreadCounter;
use crate::engine::{FeedChange, FeedEngine, FeedEntry, Phase};
use crate::error::Result;
use crate::event::{ChangeNotice, ChangeOperation, RawChange};
use crate::source::{BequestSource, NotificationSource};
use crate::types::{BequestId, BequestRecord, UserId};

/// Outcome of one unit of session work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStep {
    /// A change was applied to the feed (possibly as a no-op).
    Applied {
        id: BequestId,
        operation: ChangeOperation,
        change: FeedChange,
    },
    /// Highlights ran out.
    Expired(Vec<BequestId>),
}

struct Refetched {
    operation: ChangeOperation,
    id: BequestId,
    result: Result<Option<BequestRecord>>,
}

/// Drives a [`FeedEngine`] from the public feed channel.
pub struct FeedSession<S, C: Clock> {
    source: Arc<S>,
    engine: FeedEngine<C>,
    subscription: Subscription,
    pending: FuturesUnordered<BoxFuture<'static, Refetched>>,
    page_size: usize,
}

impl<S, C> FeedSession<S, C>
where
    S: BequestSource + 'static,
    C: Clock,
{
    /// Subscribe to the feed channel and create a loading engine.
    ///
    /// The subscription is opened before anything is loaded so that no
    /// change made during the load is missed.
    pub async fn mount(source: Arc<S>, bus: &ChangeBus, config: &FeedConfig, clock: C) -> Self {
        let subscription = bus.subscribe(&config.feed_channel, ChangeFilter::All).await;
        info!(channel = %config.feed_channel, page_size = config.page_size, "Feed session mounted");
        Self {
            source,
            engine: FeedEngine::from_config(clock, config),
            subscription,
            pending: FuturesUnordered::new(),
            page_size: config.page_size,
        }
    }

    /// Run the bulk load, applying notices that arrive while it is in flight.
    pub async fn initialize(&mut self) -> &[BequestRecord] {
        if self.engine.phase() != Phase::Loading {
            return self.engine.records();
        }

        let source = Arc::clone(&self.source);
        let limit = self.page_size;
        let load = async move { source.load_public(limit).await };
        tokio::pin!(load);

        loop {
            tokio::select! {
                biased;
                snapshot = &mut load => {
                    self.engine.initialize(snapshot);
                    break;
                }
                Some(done) = self.pending.next(), if !self.pending.is_empty() => {
                    let _ = self.apply_refetch(done);
                }
                change = self.subscription.recv(), if self.subscription.is_open() => {
                    if let Some(raw) = change {
                        let _ = self.handle_notice(raw);
                    }
                }
            }
        }
        self.engine.records()
    }

    /// Process one unit of work.
    ///
    /// Returns `None` when the session is torn down, or when the channel is
    /// closed with no refetch or highlight left to wait for.
    ///
    /// Highlight deadlines are slept on with tokio time. A clock that does not
    /// follow tokio time (a [`ManualClock`](crate::clock::ManualClock) nobody
    /// advances) leaves its highlights in place once the channel is closed:
    /// the sleep finds nothing due and the session ends instead of waiting.
    pub async fn next(&mut self) -> Option<SessionStep> {
        loop {
            if self.engine.phase() == Phase::TornDown {
                return None;
            }
            let wait = self
                .engine
                .next_highlight_deadline()
                .map(|deadline| deadline.saturating_sub(self.engine.clock().now()));
            if !self.subscription.is_open() && self.pending.is_empty() && wait.is_none() {
                return None;
            }
            let wake_at = tokio::time::Instant::now() + wait.unwrap_or(Duration::ZERO);

            tokio::select! {
                Some(done) = self.pending.next(), if !self.pending.is_empty() => {
                    if let Some(step) = self.apply_refetch(done) {
                        return Some(step);
                    }
                }
                change = self.subscription.recv(), if self.subscription.is_open() => {
                    match change {
                        Some(raw) => {
                            if let Some(step) = self.handle_notice(raw) {
                                return Some(step);
                            }
                        }
                        None => info!(channel = %self.subscription.channel(), "Feed channel closed"),
                    }
                }
                () = tokio::time::sleep_until(wake_at), if wait.is_some() => {
                    let expired = self.engine.expire_due();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "Highlights expired");
                        return Some(SessionStep::Expired(expired));
                    }
                    if !self.subscription.is_open() && self.pending.is_empty() {
                        debug!("Clock did not reach the highlight deadline; nothing left to wait for");
                        return None;
                    }
                }
                else => return None,
            }
        }
    }

    /// Drain until [`FeedSession::next`] runs out of work.
    pub async fn run(&mut self) {
        while self.next().await.is_some() {}
    }

    /// Refetch the first page and replace the view with it, without highlights.
    ///
    /// Nothing calls this on its own; callers that know notices were lost
    /// (a lagged subscription, a reconnect) decide when to.
    pub async fn resync(&mut self) -> usize {
        let snapshot = self.source.load_public(self.page_size).await;
        self.engine.resync(snapshot).len()
    }

    /// Unsubscribe, abandon pending refetches and stop the engine.
    pub fn teardown(&mut self) {
        self.subscription.close();
        self.pending = FuturesUnordered::new();
        self.engine.teardown();
    }

    /// The engine being driven.
    pub fn engine(&self) -> &FeedEngine<C> {
        &self.engine
    }

    /// Render-ready rows.
    pub fn view(&self) -> Vec<FeedEntry> {
        self.engine.view()
    }

    /// Refetches still in flight.
    pub fn pending_refetches(&self) -> usize {
        self.pending.len()
    }

    /// Notices lost to subscription lag.
    pub fn missed(&self) -> u64 {
        self.subscription.missed()
    }

    fn handle_notice(&mut self, raw: RawChange) -> Option<SessionStep> {
        let notice = match raw.decode() {
            Ok(notice) => notice,
            Err(e) => {
                debug!(error = %e, "Dropping malformed change notice");
                return None;
            }
        };
        let ChangeNotice {
            operation,
            id,
            is_public,
            ..
        } = notice;

        let change = match (operation, is_public) {
            (ChangeOperation::Deleted, _) => self.engine.on_deleted(&id),
            (_, Some(false)) => self.engine.on_made_private(&id),
            _ => {
                self.start_refetch(operation, id);
                return None;
            }
        };
        Some(SessionStep::Applied {
            id,
            operation,
            change,
        })
    }

    fn start_refetch(&mut self, operation: ChangeOperation, id: BequestId) {
        debug!(bequest_id = %id, %operation, "Refetching row");
        let source = Arc::clone(&self.source);
        self.pending.push(Box::pin(async move {
            let result = source.fetch(&id).await;
            Refetched {
                operation,
                id,
                result,
            }
        }));
    }

    fn apply_refetch(&mut self, done: Refetched) -> Option<SessionStep> {
        let Refetched {
            operation,
            id,
            result,
        } = done;
        let record = match result {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(bequest_id = %id, "Row gone before refetch; dropping notice");
                return None;
            }
            Err(e) => {
                warn!(bequest_id = %id, error = %e, "Refetch failed; dropping notice");
                return None;
            }
        };
        let change = match operation {
            ChangeOperation::Created => self.engine.on_created(record),
            _ => self.engine.on_updated(record),
        };
        Some(SessionStep::Applied {
            id,
            operation,
            change,
        })
    }
}

/// Drives an [`UnreadCounter`] from the notifications channel.
pub struct CounterSession<N> {
    source: Arc<N>,
    counter: UnreadCounter,
    subscription: Option<Subscription>,
}

impl<N: NotificationSource> CounterSession<N> {
    /// Subscribe to the viewer's notifications. A signed-out session
    /// subscribes to nothing.
    pub async fn mount(
        source: Arc<N>,
        bus: &ChangeBus,
        config: &FeedConfig,
        viewer: Option<UserId>,
    ) -> Self {
        let subscription = match &viewer {
            Some(user) => Some(
                bus.subscribe(
                    &config.notifications_channel,
                    ChangeFilter::eq("user_id", user.as_str()),
                )
                .await,
            ),
            None => None,
        };
        info!(signed_in = viewer.is_some(), "Counter session mounted");
        Self {
            source,
            counter: UnreadCounter::new(viewer),
            subscription,
        }
    }

    /// Query the unread count.
    pub async fn initialize(&mut self) -> u64 {
        let Some(viewer) = self.counter.viewer().cloned() else {
            return 0;
        };
        let count = self.source.unread_count(&viewer).await;
        self.counter.initialize(count)
    }

    /// Wait for the next notification that bumps the count and return the
    /// new count. `None` once unsubscribed or the channel closes.
    pub async fn next(&mut self) -> Option<u64> {
        loop {
            let raw = self.subscription.as_mut()?.recv().await?;
            if raw.operation != ChangeOperation::Created {
                continue;
            }
            let notification = match raw.decode().and_then(ChangeNotice::into_notification) {
                Ok(notification) => notification,
                Err(e) => {
                    debug!(error = %e, "Dropping malformed notification notice");
                    continue;
                }
            };
            if self.counter.on_notification_created(&notification) {
                return Some(self.counter.count());
            }
        }
    }

    /// Drain until the channel closes.
    pub async fn run(&mut self) {
        while self.next().await.is_some() {}
    }

    /// Unsubscribe and stop counting.
    pub fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        self.counter.teardown();
        info!(count = self.counter.count(), "Counter session torn down");
    }

    /// The counter being driven.
    pub fn counter(&self) -> &UnreadCounter {
        &self.counter
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::IgnoreReason;
    use crate::source::InMemoryStore;
    use crate::types::{NotificationKind, NotificationRecord};

    async fn mounted() -> (FeedSession<InMemoryStore, ManualClock>, Arc<InMemoryStore>, Arc<ChangeBus>) {
        let bus = Arc::new(ChangeBus::default());
        let config = FeedConfig::default();
        let store = Arc::new(InMemoryStore::new(bus.clone(), &config));
        let session = FeedSession::mount(store.clone(), &bus, &config, ManualClock::new()).await;
        (session, store, bus)
    }

    #[tokio::test]
    async fn test_malformed_notice_is_dropped() {
        let (mut session, _, bus) = mounted().await;
        session.initialize().await;

        bus.publish("public-wills", RawChange::created(serde_json::json!({"is_public": true})))
            .await;
        bus.publish("public-wills", RawChange::deleted("x")).await;

        let step = session.next().await.unwrap();
        assert_eq!(
            step,
            SessionStep::Applied {
                id: BequestId::from("x"),
                operation: ChangeOperation::Deleted,
                change: FeedChange::Ignored(IgnoreReason::Absent),
            }
        );
    }

    #[tokio::test]
    async fn test_private_creation_skips_refetch() {
        let (mut session, store, _) = mounted().await;
        session.initialize().await;

        store
            .create_bequest(BequestRecord::new("diary").with_id("d").with_public(false))
            .await;
        let step = session.next().await.unwrap();
        assert!(matches!(
            step,
            SessionStep::Applied {
                change: FeedChange::Ignored(IgnoreReason::NotPublic),
                ..
            }
        ));
        assert_eq!(session.pending_refetches(), 0);
    }

    #[tokio::test]
    async fn test_vanished_row_is_dropped() {
        let (mut session, store, bus) = mounted().await;
        session.initialize().await;

        let id = store.create_bequest(BequestRecord::new("lamp")).await;
        // The delete notice goes nowhere, so only the refetch sees it.
        bus.close_channel("public-wills").await;
        store.delete_bequest(&id).await;

        assert_eq!(session.next().await, None);
        assert!(session.engine().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_ends_when_manual_clock_stands_still() {
        let bus = Arc::new(ChangeBus::default());
        let config = FeedConfig::default();
        let store = Arc::new(InMemoryStore::new(bus.clone(), &config));
        let clock = ManualClock::new();
        let mut session = FeedSession::mount(store.clone(), &bus, &config, clock.clone()).await;
        session.initialize().await;

        let id = store.create_bequest(BequestRecord::new("clock")).await;
        assert!(matches!(
            session.next().await,
            Some(SessionStep::Applied {
                change: FeedChange::Inserted { highlighted: true },
                ..
            })
        ));
        bus.close_channel("public-wills").await;

        session.run().await;
        assert!(session.engine().is_highlighted(&id));

        clock.advance_secs(3);
        assert!(!session.engine().is_highlighted(&id));
    }

    #[tokio::test]
    async fn test_teardown_ends_session() {
        let (mut session, _, _) = mounted().await;
        session.initialize().await;
        session.teardown();
        assert_eq!(session.engine().phase(), Phase::TornDown);
        assert_eq!(session.next().await, None);
    }

    #[tokio::test]
    async fn test_counter_session_counts_viewer_inserts() {
        let bus = Arc::new(ChangeBus::default());
        let config = FeedConfig::default();
        let store = Arc::new(InMemoryStore::new(bus.clone(), &config));
        store
            .notify(NotificationRecord::new("me", "a", NotificationKind::WillReceived))
            .await
            .unwrap();

        let mut session =
            CounterSession::mount(store.clone(), &bus, &config, Some(UserId::from("me"))).await;
        assert_eq!(session.initialize().await, 1);

        store
            .notify(NotificationRecord::new("you", "a", NotificationKind::Reaction))
            .await
            .unwrap();
        store
            .notify(NotificationRecord::new("me", "b", NotificationKind::Reaction))
            .await
            .unwrap();

        assert_eq!(session.next().await, Some(2));
        assert_eq!(session.counter().badge_label().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_signed_out_counter_session_is_inert() {
        let bus = Arc::new(ChangeBus::default());
        let config = FeedConfig::default();
        let store = Arc::new(InMemoryStore::new(bus.clone(), &config));
        let mut session = CounterSession::mount(store, &bus, &config, None).await;

        assert_eq!(session.initialize().await, 0);
        assert_eq!(bus.subscriber_count("notifications").await, 0);
        assert_eq!(session.next().await, None);
    }
}
