use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind};

/// An appointment in a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "bookId")]
    pub book_id: String,
    pub name: String,
    #[serde(rename = "recordNumber", default)]
    pub record_number: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime", default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "isRemoved", default)]
    pub is_removed: bool,
    #[serde(rename = "removalReason", default)]
    pub removal_reason: Option<String>,
    // Maintained by the server; clients never edit these
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "hasNote", default)]
    pub has_note: bool,
}

impl Entity for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn cache_id(&self) -> String {
        self.id.clone()
    }

    fn scope(&self) -> Option<String> {
        Some(self.book_id.clone())
    }

    fn rebase(&self, server: &Self) -> Self {
        Self {
            created_at: server.created_at,
            has_note: server.has_note,
            ..self.clone()
        }
    }
}
