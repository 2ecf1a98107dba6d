//! Custodian -- Self-Modification Gatekeeper
//!
//! Lets an autonomous agent propose and safely apply changes to its own
//! source tree: every suggestion passes a safety guard, a validation
//! pipeline, and an atomic backed-up write before it is committed on its
//! own branch.

pub mod types;
pub mod config;
pub mod exec;
pub mod hashing;
pub mod state;
pub mod safety;
pub mod validate;
pub mod mutate;
pub mod vcs;
pub mod heal;
pub mod orchestrate;
pub mod daemon;
