//! Version Control Module
//!
//! Branch-per-suggestion workflow over the external `git` binary, invoked
//! through the command-runner boundary with timeouts.

mod manager;

pub use manager::{sanitize_branch_slug, VcsManager};
