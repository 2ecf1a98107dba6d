//! Custodian - Type Definitions
//!
//! All shared types for the self-modification gatekeeper: the suggestion
//! lifecycle, modification attempts, validation reports, branch records,
//! safety/healing audit events, and the process-execution boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Suggestions ─────────────────────────────────────────────────

/// A proposed single-file code change, owned by the orchestrator as it
/// moves through the lifecycle state machine. Never deleted, only
/// terminal-stated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: String,
    pub file_path: String,
    pub description: String,
    pub priority: Priority,
    /// Generator confidence in the range 0.0..=1.0.
    pub confidence: f64,
    /// Snippet of the code to be replaced, if the generator provided one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
    /// Proposed content. Either a full file or a replacement for
    /// `current_code`; the orchestrator prepares the final content.
    pub improved_code: String,
    pub status: SuggestionStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The modification attempt that applied this suggestion, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    /// The feature branch created for this suggestion, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Lifecycle states. Transitions are monotonic: the only backward move is
/// an explicit rollback.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Validating,
    Applying,
    Committed,
    Merged,
    Rejected,
    Failed,
    RolledBack,
}

impl SuggestionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SuggestionStatus::Merged
                | SuggestionStatus::Rejected
                | SuggestionStatus::Failed
                | SuggestionStatus::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Validating => "validating",
            SuggestionStatus::Applying => "applying",
            SuggestionStatus::Committed => "committed",
            SuggestionStatus::Merged => "merged",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Failed => "failed",
            SuggestionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "approved" => Some(SuggestionStatus::Approved),
            "validating" => Some(SuggestionStatus::Validating),
            "applying" => Some(SuggestionStatus::Applying),
            "committed" => Some(SuggestionStatus::Committed),
            "merged" => Some(SuggestionStatus::Merged),
            "rejected" => Some(SuggestionStatus::Rejected),
            "failed" => Some(SuggestionStatus::Failed),
            "rolled_back" => Some(SuggestionStatus::RolledBack),
            _ => None,
        }
    }
}

// ─── Modification attempts ───────────────────────────────────────

/// One concrete try at writing a suggestion's content to disk. Immutable
/// after creation; referenced by the suggestion for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationAttempt {
    pub id: String,
    pub file_path: String,
    /// Content hash before the write; `None` when the file did not exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_before: Option<String>,
    pub hash_after: String,
    pub timestamp: String,
    pub result: ModResult,
    /// Unified-style diff, truncated for the audit log.
    pub diff: String,
    /// Invariant: `Success` implies `Some` unless `hash_before` is `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModificationAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.result, ModResult::Success | ModResult::NoChange)
    }
}

/// Typed result code for a modification attempt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModResult {
    Success,
    NoChange,
    CriticalPathBlocked,
    SizeLimitExceeded,
    SyntaxError,
    BackupFailed,
    WriteFailed,
    RollbackSucceeded,
    RollbackFailed,
}

impl ModResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModResult::Success => "success",
            ModResult::NoChange => "no_change",
            ModResult::CriticalPathBlocked => "critical_path_blocked",
            ModResult::SizeLimitExceeded => "size_limit_exceeded",
            ModResult::SyntaxError => "syntax_error",
            ModResult::BackupFailed => "backup_failed",
            ModResult::WriteFailed => "write_failed",
            ModResult::RollbackSucceeded => "rollback_succeeded",
            ModResult::RollbackFailed => "rollback_failed",
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Report produced by the validation pipeline for one proposed change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub id: String,
    pub file_path: String,
    pub timestamp: String,
    pub overall: CheckStatus,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// A report gates mutation: only PASSED or WARNING may be applied.
    pub fn can_apply_safely(&self) -> bool {
        self.overall != CheckStatus::Failed
    }

    pub fn failing_checks(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Failed)
            .collect()
    }
}

// ─── Version control ─────────────────────────────────────────────

/// A feature branch created for one suggestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationBranch {
    pub branch_name: String,
    pub suggestion_id: String,
    pub base_branch: String,
    pub created_at: String,
    pub files: Vec<String>,
    pub commits: Vec<String>,
    pub merged: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsStatus {
    pub branch: String,
    pub clean: bool,
    pub uncommitted: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsLogEntry {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
}

/// Outcome of a merge-to-default-branch request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict,
    Unavailable,
}

// ─── Safety ──────────────────────────────────────────────────────

/// Global posture scaling how aggressively changes are blocked.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Permissive,
    Normal,
    Restrictive,
    Lockdown,
}

impl SafetyLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "permissive" => Some(SafetyLevel::Permissive),
            "normal" => Some(SafetyLevel::Normal),
            "restrictive" => Some(SafetyLevel::Restrictive),
            "lockdown" => Some(SafetyLevel::Lockdown),
            _ => None,
        }
    }
}

/// Typed reason a proposed change was blocked.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SafetyViolation {
    EmergencyStopActive,
    Lockdown,
    CriticalPathBlocked,
    RateLimitExceeded,
    QuotaExhausted,
    CooldownActive,
    ConsecutiveFailures,
    SuspiciousPattern,
    CircularModification,
    SizeLimitExceeded,
}

impl SafetyViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyViolation::EmergencyStopActive => "emergency_stop_active",
            SafetyViolation::Lockdown => "lockdown",
            SafetyViolation::CriticalPathBlocked => "critical_path_blocked",
            SafetyViolation::RateLimitExceeded => "rate_limit_exceeded",
            SafetyViolation::QuotaExhausted => "quota_exhausted",
            SafetyViolation::CooldownActive => "cooldown_active",
            SafetyViolation::ConsecutiveFailures => "consecutive_failures",
            SafetyViolation::SuspiciousPattern => "suspicious_pattern",
            SafetyViolation::CircularModification => "circular_modification",
            SafetyViolation::SizeLimitExceeded => "size_limit_exceeded",
        }
    }
}

/// The guard's answer for one proposed change.
#[derive(Clone, Debug)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub violation: Option<SafetyViolation>,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn allow() -> Self {
        SafetyVerdict {
            allowed: true,
            violation: None,
            reason: String::new(),
        }
    }

    pub fn block(violation: SafetyViolation, reason: impl Into<String>) -> Self {
        SafetyVerdict {
            allowed: false,
            violation: Some(violation),
            reason: reason.into(),
        }
    }
}

/// Append-only audit record of a blocked action.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyEvent {
    pub id: String,
    pub timestamp: String,
    pub file_path: String,
    pub violation: SafetyViolation,
    pub detail: String,
}

// ─── Healing ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub severity: Severity,
    pub detail: String,
    /// File the check concerns, when recovery should target one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Append-only audit record of one recovery attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    pub id: String,
    pub timestamp: String,
    pub trigger: String,
    pub actions: Vec<String>,
    pub healed: bool,
    pub detail: String,
}

// ─── Errors ──────────────────────────────────────────────────────

/// Typed failures that cross component boundaries. Expected policy
/// outcomes (safety blocks, validation failures) are carried in result
/// structs instead, never as errors.
#[derive(Debug, thiserror::Error)]
pub enum CustodianError {
    #[error("version control is not available: {0}")]
    VcsUnavailable(String),
    #[error("merge conflict on branch {0}")]
    MergeConflict(String),
    #[error("path escapes the project root: {0}")]
    PathEscapesRoot(String),
    #[error("suggestion not found: {0}")]
    SuggestionNotFound(String),
}

// ─── Process execution boundary ──────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Set when the process was killed by the timeout.
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Abstraction over subprocess execution so the validator and the VCS
/// manager can be exercised with fakes in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `cwd`, killing it after `timeout_ms`.
    /// A timeout is reported in the result, not as an `Err`.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<ExecResult>;
}

// ─── Suggestion generator boundary ───────────────────────────────

/// The LLM-backed reviewer that proposes changes. Out of scope beyond this
/// boundary: the daemon calls it and feeds its free-text output to the
/// intake parser.
#[async_trait]
pub trait SuggestionSource: Send + Sync {
    /// Review the project and return free-text suggestion records in the
    /// intake format (`FILE:` / `PRIORITY:` / ... headers).
    async fn review(&self, project_root: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_roundtrip() {
        for p in ["low", "medium", "high", "critical"] {
            let parsed = Priority::parse(p).unwrap();
            assert_eq!(parsed.as_str(), p);
        }
        assert!(Priority::parse("urgent").is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_status_terminal_states() {
        assert!(SuggestionStatus::Failed.is_terminal());
        assert!(SuggestionStatus::RolledBack.is_terminal());
        assert!(!SuggestionStatus::Committed.is_terminal());
        assert!(!SuggestionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        let all = [
            SuggestionStatus::Pending,
            SuggestionStatus::Approved,
            SuggestionStatus::Validating,
            SuggestionStatus::Applying,
            SuggestionStatus::Committed,
            SuggestionStatus::Merged,
            SuggestionStatus::Rejected,
            SuggestionStatus::Failed,
            SuggestionStatus::RolledBack,
        ];
        for s in all {
            assert_eq!(SuggestionStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_report_can_apply_safely() {
        let mut report = ValidationReport {
            id: "r1".into(),
            file_path: "a.py".into(),
            timestamp: "t".into(),
            overall: CheckStatus::Warning,
            checks: Vec::new(),
        };
        assert!(report.can_apply_safely());
        report.overall = CheckStatus::Failed;
        assert!(!report.can_apply_safely());
    }
}
