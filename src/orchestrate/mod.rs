//! Orchestration Module
//!
//! Suggestion intake parsing and the lifecycle orchestrator that drives a
//! suggestion from pending to a terminal state.

pub mod intake;
mod orchestrator;

pub use intake::{parse_suggestions, strip_fences};
pub use orchestrator::{prepare_content, resolve_target, Orchestrator, StatusReport};
