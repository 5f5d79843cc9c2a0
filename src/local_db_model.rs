//! Record contract shared by every collection.
//!
//! A [`Record`] is the unit of persisted domain data. The storage layer only
//! cares about the identifier, the two timestamps and the optional `kind`
//! discriminator; everything else is carried through untouched as JSON
//! fields flattened next to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// A uniquely identified, timestamped unit of persisted domain data.
///
/// # Wire format
///
/// Records serialize with camelCase timestamps and their domain fields
/// flattened at the top level, which is also the format exchanged with the
/// remote sync service:
///
/// ```json
/// {
///   "id": "t1",
///   "kind": "task",
///   "createdAt": "2024-01-15T10:30:00Z",
///   "updatedAt": "2024-01-15T14:22:00Z",
///   "title": "Buy milk",
///   "done": false
/// }
/// ```
///
/// # Examples
///
/// ```rust
/// use offline_first_sync::local_db_model::Record;
/// use serde_json::json;
///
/// let record = Record::new()
///     .with_kind("task")
///     .with_field("title", json!("Buy milk"));
///
/// assert!(!record.id.is_empty());
/// assert_eq!(record.field("title"), Some(&json!("Buy milk")));
/// assert!(record.created_at.is_none());
/// ```
///
/// # Field constraints
///
/// - `id` must be non-empty and unique within its collection. It is assigned
///   once and never reassigned.
/// - `created_at` is stamped by the local store on first persistence and is
///   immutable afterwards.
/// - `updated_at` is stamped on every successful write and never moves
///   backwards for a given id on one device.
/// - `kind` tags records when one collection holds several record shapes
///   (for example workouts and body measurements in a fitness collection).
///   Consumers branch on it instead of probing for field presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within the collection, used as the database key.
    pub id: String,

    /// Explicit record shape discriminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// First persistence time. `None` until the record is saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Last successful write time. `None` until the record is saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Domain fields, stored and synced as opaque JSON.
    #[serde(flatten)]
    pub data: Map<String, JsonValue>,
}

impl Record {
    /// Creates an empty record with a freshly generated UUID v4 identifier.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates an empty record with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            created_at: None,
            updated_at: None,
            data: Map::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Returns true when the record carries the given `kind` tag.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of every remote sync request and response: `{ "items": [...] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordEnvelope {
    #[serde(default)]
    pub items: Vec<Record>,
}
