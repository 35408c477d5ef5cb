//! Live reconciliation of the public will feed.
//!
//! The feed shows the newest public wills and stays current as rows are
//! created, edited, hidden and deleted elsewhere. This crate provides:
//!
//! - **Engine**: the ordered, deduplicated feed and its "new" highlights
//! - **Unread counter**: the notification bell's count
//! - **Change bus**: named pub/sub channels carrying row-level change notices
//! - **Sources**: read traits for the backing store, plus an in-memory store
//! - **Sessions**: drain loops tying a subscription, a source and an engine together
//!
//! # Example
//!
//! ```ignore
//! use iwill_feed::{BequestRecord, ChangeBus, FeedConfig, FeedSession, InMemoryStore, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = FeedConfig::default();
//!     let bus = Arc::new(ChangeBus::from_config(&config));
//!     let store = Arc::new(InMemoryStore::new(bus.clone(), &config));
//!
//!     let mut feed = FeedSession::mount(store.clone(), &bus, &config, SystemClock::new()).await;
//!     feed.initialize().await;
//!
//!     store.create_bequest(BequestRecord::new("Grandpa's pocket watch")).await;
//!     let step = feed.next().await;
//!     println!("{step:?}");
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod clock;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod event;
pub mod highlight;
pub mod projection;
pub mod session;
pub mod source;
pub mod types;

// Re-export main types
pub use bus::{ChangeBus, ChangeFilter, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FeedConfig, DEFAULT_FEED_CHANNEL, DEFAULT_NOTIFICATIONS_CHANNEL};
pub use counter::UnreadCounter;
pub use engine::{FeedChange, FeedEngine, FeedEntry, IgnoreReason, Phase};
pub use error::{Error, Result};
pub use event::{ChangeEvent, ChangeNotice, ChangeOperation, RawChange};
pub use highlight::HighlightSchedule;
pub use projection::{replay, LiveView};
pub use session::{CounterSession, FeedSession, SessionStep};
pub use source::{BequestSource, InMemoryStore, NotificationSource, TracingSource};
pub use types::{
    feed_order, BequestId, BequestRecord, BequestStatus, NotificationKind, NotificationRecord,
    UserId,
};
