//! Data layer
//!
//! SQLite persistence via sqlx. The persisted rows double as the only
//! cache: remote actors are refreshed opportunistically, never held in a
//! separate in-memory store.

mod database;
mod models;

pub use database::Database;
pub use models::*;
