use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Kinds of content the server versions independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    Note,
    Drawing,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::Note => "note",
            EntityKind::Drawing => "drawing",
        }
    }

    /// Collection name used in REST routes
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Event => "events",
            EntityKind::Note => "notes",
            EntityKind::Drawing => "drawings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => Ok(EntityKind::Event),
            "note" | "notes" => Ok(EntityKind::Note),
            "drawing" | "drawings" => Ok(EntityKind::Drawing),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Composite cache identifier: entity kind plus entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn event(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Event, id)
    }

    /// Notes are keyed by the event they belong to
    pub fn note(event_id: impl Into<String>) -> Self {
        Self::new(EntityKind::Note, event_id)
    }

    pub fn drawing(key: &DrawingKey) -> Self {
        Self::new(EntityKind::Drawing, key.to_id())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for CacheKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("cache key must look like kind:id, got {}", s))?;
        if id.is_empty() {
            return Err(format!("cache key has an empty id: {}", s));
        }
        Ok(CacheKey::new(kind.parse()?, id))
    }
}

/// Calendar layouts a drawing can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    Day,
    ThreeDay,
    Week,
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Day => "day",
            ViewMode::ThreeDay => "three_day",
            ViewMode::Week => "week",
        }
    }
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(ViewMode::Day),
            "three_day" | "3day" => Ok(ViewMode::ThreeDay),
            "week" => Ok(ViewMode::Week),
            other => Err(format!("unknown view mode: {}", other)),
        }
    }
}

/// Identity of a drawing: one per book, date and view mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DrawingKey {
    pub book_id: String,
    pub date: NaiveDate,
    pub view_mode: ViewMode,
}

impl DrawingKey {
    pub fn new(book_id: impl Into<String>, date: NaiveDate, view_mode: ViewMode) -> Self {
        Self {
            book_id: book_id.into(),
            date,
            view_mode,
        }
    }

    /// Flatten into the single id string the server and cache use
    pub fn to_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.book_id,
            self.date.format("%Y-%m-%d"),
            self.view_mode.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_display_and_parse() {
        let key = CacheKey::note("42");
        assert_eq!(key.to_string(), "note:42");
        assert_eq!("note:42".parse::<CacheKey>().unwrap(), key);
        assert_eq!("Events:7".parse::<CacheKey>().unwrap(), CacheKey::event("7"));
    }

    #[test]
    fn test_cache_key_parse_rejects_garbage() {
        assert!("note".parse::<CacheKey>().is_err());
        assert!("note:".parse::<CacheKey>().is_err());
        assert!("sticker:1".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_drawing_key_keeps_slashes_in_book_id() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let key = DrawingKey::new("books/alpha", date, ViewMode::ThreeDay);
        assert_eq!(key.to_id(), "books/alpha/2026-10-18/three_day");

        let cache_key = CacheKey::drawing(&key);
        assert_eq!(cache_key.kind, EntityKind::Drawing);
        assert_eq!(cache_key.to_string().parse::<CacheKey>().unwrap(), cache_key);
    }
}
