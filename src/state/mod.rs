//! Custodian State Module
//!
//! SQLite-backed persistent state: suggestions, modification attempts,
//! and the safety/healing audit trails.

mod database;
mod schema;

pub use database::Database;
pub use schema::{CREATE_TABLES, SCHEMA_VERSION};
