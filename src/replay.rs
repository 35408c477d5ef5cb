//! Offline replay of change scripts.
//!
//! A script is JSON lines, one step per line: either a change notice
//! (`{"change": {...}}`) or a clock step (`{"advance_secs": 3}`). Blank lines
//! and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use iwill_feed::{
    BequestRecord, ChangeNotice, ChangeOperation, Clock, Error, FeedChange, FeedConfig,
    FeedEngine, FeedEntry, ManualClock, RawChange, UnreadCounter, UserId,
};

/// One line of a change script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Change { change: RawChange },
    Advance { advance_secs: u64 },
}

/// Parse a JSON-lines script.
///
/// # Errors
///
/// Fails on the first line that is not a valid step, naming its line number.
pub fn parse_script(text: &str) -> Result<Vec<ScriptStep>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid script step on line {}", n + 1))
        })
        .collect()
}

/// Parse a snapshot file: a JSON array of will records.
///
/// # Errors
///
/// Fails if the text is not a JSON array of records.
pub fn parse_snapshot(text: &str) -> Result<Vec<BequestRecord>> {
    serde_json::from_str(text).context("snapshot is not a JSON array of will records")
}

/// The snapshot stand-in for a failed initial load.
pub fn failed_load() -> iwill_feed::Result<Vec<BequestRecord>> {
    Err(Error::source_failed("load_public", "snapshot unavailable"))
}

/// What a feed replay did.
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub feed: Vec<FeedEntry>,
    pub applied: usize,
    pub ignored: usize,
    pub malformed: usize,
}

impl FeedReport {
    /// One record per line, `*` marking highlighted ones.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.feed {
            let marker = if entry.is_new { '*' } else { ' ' };
            out.push_str(&format!(
                "{marker} {}  {}  {}\n",
                entry.record.id,
                entry.record.created_at.to_rfc3339(),
                entry.record.item_description
            ));
        }
        out.push_str(&format!(
            "{} shown, {} applied, {} ignored, {} malformed\n",
            self.feed.len(),
            self.applied,
            self.ignored,
            self.malformed
        ));
        out
    }
}

/// Run a script through a fresh feed engine driven by a manual clock.
///
/// Notices carry full rows here, so there is no refetch: a complete row is
/// applied as is and a made-private notice needs only its id.
pub fn replay_feed(
    config: &FeedConfig,
    snapshot: iwill_feed::Result<Vec<BequestRecord>>,
    steps: &[ScriptStep],
) -> FeedReport {
    let clock = ManualClock::new();
    let mut engine = FeedEngine::from_config(clock.clone(), config);
    engine.initialize(snapshot);

    let mut report = FeedReport {
        feed: Vec::new(),
        applied: 0,
        ignored: 0,
        malformed: 0,
    };
    for step in steps {
        match step {
            ScriptStep::Advance { advance_secs } => {
                clock.advance_secs(*advance_secs);
                let expired = engine.expire_due();
                debug!(now = ?clock.now(), expired = expired.len(), "Clock advanced");
            }
            ScriptStep::Change { change } => match apply_change(&mut engine, change.clone()) {
                Ok(outcome) if outcome.is_change() => report.applied += 1,
                Ok(_) => report.ignored += 1,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed notice");
                    report.malformed += 1;
                }
            },
        }
    }
    report.feed = engine.view();
    report
}

fn apply_change(engine: &mut FeedEngine<ManualClock>, change: RawChange) -> iwill_feed::Result<FeedChange> {
    let notice = change.decode()?;
    if notice.operation != ChangeOperation::Deleted && notice.is_public == Some(false) {
        return Ok(engine.on_made_private(&notice.id));
    }
    Ok(engine.apply_event(notice.into_event()?))
}

/// Run a script's notification notices through an unread counter.
///
/// Clock steps and non-insert notices are skipped.
pub fn replay_unread(viewer: &str, initial: u64, steps: &[ScriptStep]) -> UnreadCounter {
    let mut counter = UnreadCounter::new(Some(UserId::from(viewer)));
    counter.initialize(Ok(initial));
    for step in steps {
        let ScriptStep::Change { change } = step else {
            continue;
        };
        if change.operation != ChangeOperation::Created {
            continue;
        }
        match change.clone().decode().and_then(ChangeNotice::into_notification) {
            Ok(notification) => {
                counter.on_notification_created(&notification);
            }
            Err(e) => debug!(error = %e, "Skipping malformed notification"),
        }
    }
    counter
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_skips_comments_and_blanks() {
        let steps = parse_script(
            "# seed\n\n{\"change\": {\"operation\": \"deleted\", \"record_id\": \"a\"}}\n{\"advance_secs\": 3}\n",
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], ScriptStep::Advance { advance_secs: 3 });
    }

    #[test]
    fn test_parse_script_reports_line() {
        let err = parse_script("{\"advance_secs\": 1}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_made_private_notice_needs_only_id() {
        let snapshot = parse_snapshot(
            r#"[{"id": "a", "is_public": true, "created_at": "2024-01-01T00:00:00Z", "item_description": "quilt"}]"#,
        )
        .unwrap();
        let steps = parse_script(
            r#"{"change": {"operation": "UPDATE", "record": {"id": "a", "is_public": false}}}"#,
        )
        .unwrap();
        let report = replay_feed(&FeedConfig::default(), Ok(snapshot), &steps);
        assert!(report.feed.is_empty());
        assert_eq!(report.applied, 1);
    }
}
