//! Safety Module
//!
//! Policy gatekeeping for self-modification: the safety guard's ordered
//! checks and the configurable dangerous-pattern set.

pub mod guard;
pub mod patterns;

pub use guard::{SafetyGuard, SafetyStats};
pub use patterns::{PatternSet, DEFAULT_PATTERNS_YAML};
