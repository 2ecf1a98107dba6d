//! Mutation Module
//!
//! Atomic file writes with backups, diffs, and rollback. Every attempt is
//! recorded in the audit trail whether it succeeded or not.

pub mod backup;
pub mod diff;
pub mod mutator;

pub use backup::BackupStore;
pub use mutator::{CodeMutator, ModifyOptions, ALWAYS_PROTECTED, BLOCKED_DIRECTORY_PATTERNS};
