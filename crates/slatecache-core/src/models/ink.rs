use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{DrawingKey, Entity, EntityKind, ViewMode};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokePoint {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub pressure: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<StrokePoint>,
    #[serde(rename = "strokeWidth")]
    pub width: f32,
    /// ARGB
    pub color: u32,
    #[serde(rename = "isEraser", default)]
    pub eraser: bool,
}

/// Handwritten note attached to a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "bookId")]
    pub book_id: String,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn cache_id(&self) -> String {
        self.event_id.clone()
    }

    fn scope(&self) -> Option<String> {
        Some(self.book_id.clone())
    }
}

/// Freehand drawing layered over a calendar view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    #[serde(rename = "bookId")]
    pub book_id: String,
    pub date: NaiveDate,
    #[serde(rename = "viewMode")]
    pub view_mode: ViewMode,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
}

impl Drawing {
    pub fn key(&self) -> DrawingKey {
        DrawingKey::new(self.book_id.clone(), self.date, self.view_mode)
    }
}

impl Entity for Drawing {
    const KIND: EntityKind = EntityKind::Drawing;

    fn cache_id(&self) -> String {
        self.key().to_id()
    }

    fn scope(&self) -> Option<String> {
        Some(self.book_id.clone())
    }
}
