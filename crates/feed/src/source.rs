//! Backing-store collaborators.
//!
//! The feed reads through [`BequestSource`] and [`NotificationSource`]; it
//! never writes. [`InMemoryStore`] is an authoritative store for tests and the
//! CLI whose mutation API publishes change notices the way the hosted
//! database's replication feed would.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use itertools::Itertools;
use serde_json::json;
use tokio::sync::RwLock;

use crate::bus::ChangeBus;
use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::event::RawChange;
use crate::types::{feed_order, BequestId, BequestRecord, NotificationRecord, UserId};

/// Read access to will rows.
#[async_trait]
pub trait BequestSource: Send + Sync {
    /// Public wills, newest first, at most `limit` of them.
    async fn load_public(&self, limit: usize) -> Result<Vec<BequestRecord>>;

    /// Current state of one row, or `None` if it no longer exists.
    async fn fetch(&self, id: &BequestId) -> Result<Option<BequestRecord>>;
}

/// Read access to notification rows.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Unread notifications addressed to `user`.
    async fn unread_count(&self, user: &UserId) -> Result<u64>;
}

#[async_trait]
impl<S: BequestSource + ?Sized> BequestSource for Arc<S> {
    async fn load_public(&self, limit: usize) -> Result<Vec<BequestRecord>> {
        (**self).load_public(limit).await
    }

    async fn fetch(&self, id: &BequestId) -> Result<Option<BequestRecord>> {
        (**self).fetch(id).await
    }
}

#[async_trait]
impl<S: NotificationSource + ?Sized> NotificationSource for Arc<S> {
    async fn unread_count(&self, user: &UserId) -> Result<u64> {
        (**self).unread_count(user).await
    }
}

/// In-memory wills and notifications that announce their own mutations.
pub struct InMemoryStore {
    bus: Arc<ChangeBus>,
    feed_channel: String,
    notifications_channel: String,
    wills: RwLock<HashMap<BequestId, BequestRecord>>,
    notifications: RwLock<Vec<NotificationRecord>>,
    fail_reads: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store publishing on the configured channels.
    pub fn new(bus: Arc<ChangeBus>, config: &FeedConfig) -> Self {
        Self {
            bus,
            feed_channel: config.feed_channel.clone(),
            notifications_channel: config.notifications_channel.clone(),
            wills: RwLock::new(HashMap::new()),
            notifications: RwLock::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every read fail until switched back, to simulate an outage.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Seed rows without publishing anything.
    pub async fn seed(&self, records: impl IntoIterator<Item = BequestRecord>) {
        let mut wills = self.wills.write().await;
        for record in records {
            wills.insert(record.id.clone(), record);
        }
    }

    /// Insert a will and announce it.
    pub async fn create_bequest(&self, record: BequestRecord) -> BequestId {
        let id = record.id.clone();
        let notice = RawChange::created(partial_row(&record));
        self.wills.write().await.insert(id.clone(), record);
        self.bus.publish(&self.feed_channel, notice).await;
        id
    }

    /// Overwrite a will and announce the change.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if the will does not exist.
    pub async fn update_bequest(&self, record: BequestRecord) -> Result<()> {
        let notice = RawChange::updated(partial_row(&record));
        {
            let mut wills = self.wills.write().await;
            let slot = wills
                .get_mut(&record.id)
                .ok_or_else(|| Error::record_not_found(record.id.as_str()))?;
            *slot = record;
        }
        self.bus.publish(&self.feed_channel, notice).await;
        Ok(())
    }

    /// Flip a will's visibility and announce the change.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if the will does not exist.
    pub async fn set_visibility(&self, id: &BequestId, is_public: bool) -> Result<()> {
        let notice = {
            let mut wills = self.wills.write().await;
            let record = wills
                .get_mut(id)
                .ok_or_else(|| Error::record_not_found(id.as_str()))?;
            record.is_public = is_public;
            RawChange::updated(partial_row(record))
        };
        self.bus.publish(&self.feed_channel, notice).await;
        Ok(())
    }

    /// Delete a will and announce it. Deleting a missing row announces nothing.
    pub async fn delete_bequest(&self, id: &BequestId) -> bool {
        let removed = self.wills.write().await.remove(id).is_some();
        if removed {
            self.bus
                .publish(&self.feed_channel, RawChange::deleted(id.as_str()))
                .await;
        }
        removed
    }

    /// Store a notification and announce it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the row cannot be encoded.
    pub async fn notify(&self, notification: NotificationRecord) -> Result<()> {
        let notice = RawChange::created(serde_json::to_value(&notification)?);
        self.notifications.write().await.push(notification);
        self.bus.publish(&self.notifications_channel, notice).await;
        Ok(())
    }

    /// Mark every notification for `user` read. No notice is published.
    pub async fn mark_all_read(&self, user: &UserId) -> usize {
        let mut notifications = self.notifications.write().await;
        let mut marked = 0;
        for n in notifications.iter_mut().filter(|n| &n.user_id == user && !n.read) {
            n.read = true;
            marked += 1;
        }
        marked
    }

    fn check_reads(&self, operation: &str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(Error::source_failed(operation, "store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BequestSource for InMemoryStore {
    async fn load_public(&self, limit: usize) -> Result<Vec<BequestRecord>> {
        self.check_reads("load_public")?;
        let wills = self.wills.read().await;
        Ok(wills
            .values()
            .filter(|r| r.is_public)
            .sorted_by(|a, b| feed_order(a, b))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch(&self, id: &BequestId) -> Result<Option<BequestRecord>> {
        self.check_reads("fetch")?;
        Ok(self.wills.read().await.get(id).cloned())
    }
}

#[async_trait]
impl NotificationSource for InMemoryStore {
    async fn unread_count(&self, user: &UserId) -> Result<u64> {
        self.check_reads("unread_count")?;
        let notifications = self.notifications.read().await;
        let count = notifications
            .iter()
            .filter(|n| &n.user_id == user && !n.read)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

/// The slice of a row the replication feed carries.
fn partial_row(record: &BequestRecord) -> serde_json::Value {
    json!({
        "id": record.id,
        "is_public": record.is_public,
        "created_at": record.created_at,
    })
}

/// A wrapper that adds tracing to a source.
pub struct TracingSource<S> {
    inner: S,
}

impl<S> TracingSource<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Unwrap.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: BequestSource> BequestSource for TracingSource<S> {
    async fn load_public(&self, limit: usize) -> Result<Vec<BequestRecord>> {
        tracing::debug!(limit, "Loading public wills");
        let result = self.inner.load_public(limit).await;
        match &result {
            Ok(rows) => tracing::trace!(rows = rows.len(), "Public wills loaded"),
            Err(e) => tracing::debug!(error = %e, "Public will load failed"),
        }
        result
    }

    async fn fetch(&self, id: &BequestId) -> Result<Option<BequestRecord>> {
        tracing::debug!(bequest_id = %id, "Fetching will");
        self.inner.fetch(id).await
    }
}

#[async_trait]
impl<S: NotificationSource> NotificationSource for TracingSource<S> {
    async fn unread_count(&self, user: &UserId) -> Result<u64> {
        tracing::debug!(user_id = %user, "Counting unread notifications");
        self.inner.unread_count(user).await
    }
}
