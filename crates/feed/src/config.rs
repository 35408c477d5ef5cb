//! Configuration for feed sessions.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Channel the public feed listens on.
pub const DEFAULT_FEED_CHANNEL: &str = "public-wills";

/// Channel carrying notification inserts.
pub const DEFAULT_NOTIFICATIONS_CHANNEL: &str = "notifications";

/// Settings shared by the feed and the unread counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum rows fetched by the initial load.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How long a live arrival stays marked as new.
    #[serde(with = "duration_secs", default = "default_highlight_ttl")]
    pub highlight_ttl: Duration,

    /// Change channel for the wills table.
    #[serde(default = "default_feed_channel")]
    pub feed_channel: String,

    /// Change channel for the notifications table.
    #[serde(default = "default_notifications_channel")]
    pub notifications_channel: String,

    /// Buffered notices per channel before slow subscribers start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            highlight_ttl: default_highlight_ttl(),
            feed_channel: default_feed_channel(),
            notifications_channel: default_notifications_channel(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl FeedConfig {
    /// Set the page size.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the highlight lifetime.
    #[must_use]
    pub fn highlight_ttl(mut self, ttl: Duration) -> Self {
        self.highlight_ttl = ttl;
        self
    }

    /// Set the channel capacity.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Apply `IWILL_*` environment overrides. Unparsable values are ignored.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(size) = env_parse::<usize>("IWILL_PAGE_SIZE") {
            self.page_size = size;
        }
        if let Some(secs) = env_parse::<u64>("IWILL_HIGHLIGHT_TTL_SECS") {
            self.highlight_ttl = Duration::from_secs(secs);
        }
        if let Ok(channel) = std::env::var("IWILL_FEED_CHANNEL") {
            self.feed_channel = channel;
        }
        if let Ok(channel) = std::env::var("IWILL_NOTIFICATIONS_CHANNEL") {
            self.notifications_channel = channel;
        }
        if let Some(capacity) = env_parse::<usize>("IWILL_CHANNEL_CAPACITY") {
            self.channel_capacity = capacity;
        }
        self
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Load configuration from a TOML file, or JSON when the extension is `.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// [`FeedConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero page size, a zero channel
    /// capacity, or an empty channel name.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::config("page_size must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::config("channel_capacity must be at least 1"));
        }
        if self.feed_channel.is_empty() || self.notifications_channel.is_empty() {
            return Err(Error::config("channel names must not be empty"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

const fn default_page_size() -> usize {
    50
}

const fn default_highlight_ttl() -> Duration {
    Duration::from_secs(3)
}

fn default_feed_channel() -> String {
    DEFAULT_FEED_CHANNEL.to_string()
}

fn default_notifications_channel() -> String {
    DEFAULT_NOTIFICATIONS_CHANNEL.to_string()
}

const fn default_channel_capacity() -> usize {
    1000
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
