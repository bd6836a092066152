//! Data models for cached calendar content.
//!
//! This module contains the entities the cache stores on behalf of the
//! calendar client:
//!
//! - `Event`: Appointment records inside a book
//! - `Note`: Handwritten note attached to an event
//! - `Drawing`: Freehand overlay for a book, date and view mode
//! - `CacheKey`, `EntityKind`: Composite identifiers used by the cache

pub mod entity;
pub mod event;
pub mod ink;
pub mod key;

pub use entity::{decode, encode, Entity};
pub use event::Event;
pub use ink::{Drawing, Note, Stroke, StrokePoint};
pub use key::{CacheKey, DrawingKey, EntityKind, ViewMode};
