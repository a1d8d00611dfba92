//! # Repository Module
//!
//! Database repositories for Doorwatch.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EventLog (engine)                                                      │
//! │       │  db.events().insert_with_statistics(...)                        │
//! │       ▼                                                                 │
//! │  EventRepository                                                        │
//! │  ├── insert_with_statistics(type, description, at)                      │
//! │  ├── since(after_id, min_occurred_ms, limit)                            │
//! │  ├── statistics() / latest() / max_id()                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`EventRepository`](event::EventRepository) - Event append and catch-up reads
//! - [`SettingsRepository`](setting::SettingsRepository) - Escalation duration

pub mod event;
pub mod setting;
