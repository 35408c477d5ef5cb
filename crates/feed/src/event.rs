//! Change stream events.
//!
//! The realtime service pushes [`RawChange`] values: an operation, the row id
//! and whatever part of the row it chose to include. [`RawChange::decode`]
//! validates that into a [`ChangeNotice`], and a notice with a complete row can
//! be turned into a typed [`ChangeEvent`] for the engine.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BequestId, BequestRecord, NotificationRecord};

/// Row-level operation reported by the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    #[serde(alias = "INSERT", alias = "insert")]
    Created,
    #[serde(alias = "UPDATE", alias = "update")]
    Updated,
    #[serde(alias = "DELETE", alias = "delete")]
    Deleted,
}

impl ChangeOperation {
    /// Get the operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notice exactly as the transport delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub operation: ChangeOperation,
    #[serde(default, alias = "recordId")]
    pub record_id: Option<String>,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

impl RawChange {
    /// Notice for a newly inserted row.
    pub fn created(record: serde_json::Value) -> Self {
        Self {
            operation: ChangeOperation::Created,
            record_id: None,
            record: Some(record),
        }
    }

    /// Notice for an updated row.
    pub fn updated(record: serde_json::Value) -> Self {
        Self {
            operation: ChangeOperation::Updated,
            record_id: None,
            record: Some(record),
        }
    }

    /// Notice for a deleted row.
    pub fn deleted(id: impl Into<String>) -> Self {
        Self {
            operation: ChangeOperation::Deleted,
            record_id: Some(id.into()),
            record: None,
        }
    }

    /// Read a string column from the attached row, if any.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.record
            .as_ref()
            .and_then(|row| row.get(name))
            .and_then(serde_json::Value::as_str)
    }

    /// Validate the notice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] when no identifier can be found, or
    /// when a create/update notice carries no row.
    pub fn decode(self) -> Result<ChangeNotice> {
        let id = self
            .record_id
            .clone()
            .or_else(|| self.column("id").map(str::to_owned))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::malformed(format!("{} notice without record id", self.operation)))?;

        if self.operation != ChangeOperation::Deleted && self.record.is_none() {
            return Err(Error::malformed(format!(
                "{} notice for '{id}' without record payload",
                self.operation
            )));
        }

        let is_public = self
            .record
            .as_ref()
            .and_then(|row| row.get("is_public"))
            .and_then(serde_json::Value::as_bool);

        Ok(ChangeNotice {
            operation: self.operation,
            id: BequestId::from_string(id),
            is_public,
            record: self.record,
        })
    }
}

/// A validated change notice; the row may still be partial.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub operation: ChangeOperation,
    pub id: BequestId,
    pub is_public: Option<bool>,
    pub record: Option<serde_json::Value>,
}

impl ChangeNotice {
    /// Build a typed event from the attached row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] when the row is not a complete
    /// bequest record.
    pub fn into_event(self) -> Result<ChangeEvent> {
        match self.operation {
            ChangeOperation::Deleted => Ok(ChangeEvent::Deleted(self.id)),
            operation => {
                let row = self
                    .record
                    .ok_or_else(|| Error::malformed(format!("{operation} notice without row")))?;
                let record: BequestRecord = serde_json::from_value(row)
                    .map_err(|e| Error::malformed(format!("incomplete row for '{}': {e}", self.id)))?;
                Ok(match operation {
                    ChangeOperation::Created => ChangeEvent::Created(record),
                    _ => ChangeEvent::Updated(record),
                })
            }
        }
    }

    /// Decode the attached row as a notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] when the row is missing or is not a
    /// notification.
    pub fn into_notification(self) -> Result<NotificationRecord> {
        let row = self
            .record
            .ok_or_else(|| Error::malformed("notification notice without row"))?;
        serde_json::from_value(row)
            .map_err(|e| Error::malformed(format!("incomplete notification '{}': {e}", self.id)))
    }
}

/// A fully resolved change, ready to apply to the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Created(BequestRecord),
    Updated(BequestRecord),
    Deleted(BequestId),
}

impl ChangeEvent {
    /// Identifier the event refers to.
    pub fn id(&self) -> &BequestId {
        match self {
            Self::Created(record) | Self::Updated(record) => &record.id,
            Self::Deleted(id) => id,
        }
    }

    /// Operation kind.
    pub fn operation(&self) -> ChangeOperation {
        match self {
            Self::Created(_) => ChangeOperation::Created,
            Self::Updated(_) => ChangeOperation::Updated,
            Self::Deleted(_) => ChangeOperation::Deleted,
        }
    }

    /// Render as the notice the transport would have sent for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the record cannot be encoded.
    pub fn to_raw(&self) -> Result<RawChange> {
        Ok(match self {
            Self::Created(record) => RawChange::created(serde_json::to_value(record)?),
            Self::Updated(record) => RawChange::updated(serde_json::to_value(record)?),
            Self::Deleted(id) => RawChange::deleted(id.as_str()),
        })
    }
}
