//! Code Mutator
//!
//! Atomic, backed-up file writes with rollback. Defense in depth: the
//! mutator re-checks protected paths and size ceilings on its own,
//! independent of the safety guard, so a bug upstream can never bypass
//! them. A write is never observable half-done: content goes to a sibling
//! temp file which is renamed over the target.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CustodianConfig;
use crate::hashing::{content_hash, short_hash};
use crate::state::Database;
use crate::types::{CommandRunner, ExecResult, ModResult, ModificationAttempt};

use super::backup::BackupStore;
use super::diff::{truncate_diff, unified_diff};

/// Files that must never be modified, matched by file name. Independent of
/// the guard's configurable critical set.
pub static ALWAYS_PROTECTED: &[&str] = &[
    ".env",
    ".env.local",
    "wallet.json",
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
];

/// Directory patterns that are off-limits for modification.
pub static BLOCKED_DIRECTORY_PATTERNS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "__pycache__",
    ".custodian/backups",
    "/etc",
    "/usr",
    "/var",
    "/sys",
    "/proc",
];

/// Suffix of the sibling temp file used for atomic writes.
const TMP_SUFFIX: &str = ".custodian-tmp";

/// Per-call options for [`CodeMutator::modify`].
#[derive(Clone, Copy, Debug)]
pub struct ModifyOptions {
    /// Run a language syntax check before writing.
    pub validate_syntax: bool,
    /// Restore the just-created backup if anything fails after it exists.
    pub auto_rollback: bool,
}

impl Default for ModifyOptions {
    fn default() -> Self {
        ModifyOptions {
            validate_syntax: true,
            auto_rollback: true,
        }
    }
}

pub struct CodeMutator {
    config: CustodianConfig,
    backups: BackupStore,
    db: Arc<Database>,
    runner: Arc<dyn CommandRunner>,
}

impl CodeMutator {
    pub fn new(
        config: CustodianConfig,
        db: Arc<Database>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let backups = BackupStore::new(config.backup_dir());
        CodeMutator {
            config,
            backups,
            db,
            runner,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Apply `new_content` to the project-relative path `rel`. Each step
    /// short-circuits on failure; the returned attempt is always persisted
    /// for audit.
    pub async fn modify(
        &self,
        rel: &str,
        new_content: &str,
        opts: ModifyOptions,
    ) -> Result<ModificationAttempt> {
        let target = Path::new(&self.config.project_root).join(rel);
        let old_content = fs::read_to_string(&target).ok();
        let existed = old_content.is_some();
        let old = old_content.unwrap_or_default();

        let hash_before = existed.then(|| content_hash(old.as_bytes()));
        let hash_after = content_hash(new_content.as_bytes());

        // 1. Byte-identical content is a no-op success.
        if existed && old == new_content {
            debug!("No-op modification of {}", rel);
            return self.finish(attempt(
                rel,
                hash_before,
                hash_after,
                ModResult::NoChange,
                String::new(),
                None,
                None,
            ));
        }

        // 2. Always-protected set, defense in depth.
        if let Some(reason) = protected_reason(rel) {
            return self.finish(attempt(
                rel,
                hash_before,
                hash_after,
                ModResult::CriticalPathBlocked,
                String::new(),
                None,
                Some(reason),
            ));
        }

        // 3. Size and delta ceilings.
        let max = self.config.max_change_bytes;
        if new_content.len() > max || old.len().abs_diff(new_content.len()) > max {
            return self.finish(attempt(
                rel,
                hash_before,
                hash_after,
                ModResult::SizeLimitExceeded,
                String::new(),
                None,
                Some(format!(
                    "content size {} (delta {}) exceeds {} bytes",
                    new_content.len(),
                    old.len().abs_diff(new_content.len()),
                    max
                )),
            ));
        }

        // 4. Language syntax validation, defense in depth.
        if opts.validate_syntax && rel.ends_with(".py") {
            if let Some(err) = self.python_syntax_error(new_content).await? {
                return self.finish(attempt(
                    rel,
                    hash_before,
                    hash_after,
                    ModResult::SyntaxError,
                    String::new(),
                    None,
                    Some(err),
                ));
            }
        }

        // 5. Backup before any write. New files have nothing to back up.
        let backup_path = if existed {
            match self
                .backups
                .create(&target, rel, &short_hash(old.as_bytes()))
            {
                Ok(p) => Some(p),
                Err(e) => {
                    return self.finish(attempt(
                        rel,
                        hash_before,
                        hash_after,
                        ModResult::BackupFailed,
                        String::new(),
                        None,
                        Some(format!("{:#}", e)),
                    ));
                }
            }
        } else {
            None
        };

        // 6. Diff for the audit trail.
        let diff = truncate_diff(&unified_diff(rel, &old, new_content));

        // 7. Atomic write: sibling temp file, then rename over the target.
        if let Err(e) = atomic_write(&target, new_content) {
            if opts.auto_rollback {
                if let Some(ref backup) = backup_path {
                    return self.finish(self.rollback_after_failure(
                        rel,
                        hash_before,
                        hash_after,
                        diff,
                        backup,
                        &target,
                        format!("write failed: {:#}", e),
                    ));
                }
            }
            return self.finish(attempt(
                rel,
                hash_before,
                hash_after,
                ModResult::WriteFailed,
                diff,
                backup_path.map(path_str),
                Some(format!("{:#}", e)),
            ));
        }

        info!("Modified {} ({} bytes)", rel, new_content.len());
        self.finish(attempt(
            rel,
            hash_before,
            hash_after,
            ModResult::Success,
            diff,
            backup_path.map(path_str),
            None,
        ))
    }

    /// Restore the backup recorded on a specific attempt.
    pub fn rollback(&self, attempt_id: &str) -> Result<ModificationAttempt> {
        let prior = self
            .db
            .get_attempt(attempt_id)?
            .with_context(|| format!("unknown attempt {}", attempt_id))?;

        let backup = prior
            .backup_path
            .as_deref()
            .with_context(|| format!("attempt {} has no backup", attempt_id))?;

        self.restore_backup(&prior.file_path, Path::new(backup))
    }

    /// Restore the most recent backup for a project-relative path.
    pub fn rollback_latest(&self, rel: &str) -> Result<ModificationAttempt> {
        let backup = self
            .backups
            .latest_for(rel)
            .with_context(|| format!("no backups exist for {}", rel))?;
        self.restore_backup(rel, &backup)
    }

    /// Delete backups past the configured retention.
    pub fn prune_backups(&self) -> Result<u32> {
        self.backups.prune(self.config.backup_retention_days)
    }

    fn restore_backup(&self, rel: &str, backup: &Path) -> Result<ModificationAttempt> {
        let target = Path::new(&self.config.project_root).join(rel);
        let hash_before = fs::read(&target).ok().map(|b| content_hash(&b));

        let result = match self.backups.restore(backup, &target) {
            Ok(()) => ModResult::RollbackSucceeded,
            Err(e) => {
                warn!("Rollback of {} failed: {:#}", rel, e);
                return self.finish(attempt(
                    rel,
                    hash_before,
                    String::new(),
                    ModResult::RollbackFailed,
                    String::new(),
                    Some(backup.to_string_lossy().to_string()),
                    Some(format!("{:#}", e)),
                ));
            }
        };

        let restored = fs::read(&target).unwrap_or_default();
        info!("Rolled back {} from {}", rel, backup.display());
        self.finish(attempt(
            rel,
            hash_before,
            content_hash(&restored),
            result,
            String::new(),
            Some(backup.to_string_lossy().to_string()),
            None,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn rollback_after_failure(
        &self,
        rel: &str,
        hash_before: Option<String>,
        hash_after: String,
        diff: String,
        backup: &Path,
        target: &Path,
        error: String,
    ) -> ModificationAttempt {
        match self.backups.restore(backup, target) {
            Ok(()) => {
                info!("Auto-rollback of {} succeeded after: {}", rel, error);
                attempt(
                    rel,
                    hash_before,
                    hash_after,
                    ModResult::RollbackSucceeded,
                    diff,
                    Some(backup.to_string_lossy().to_string()),
                    Some(error),
                )
            }
            Err(e) => {
                warn!("Auto-rollback of {} FAILED: {:#}", rel, e);
                attempt(
                    rel,
                    hash_before,
                    hash_after,
                    ModResult::RollbackFailed,
                    diff,
                    Some(backup.to_string_lossy().to_string()),
                    Some(format!("{}; rollback failed: {:#}", error, e)),
                )
            }
        }
    }

    /// Compile-check Python content via the configured interpreter.
    /// Returns `Ok(Some(message))` on a syntax error.
    async fn python_syntax_error(&self, content: &str) -> Result<Option<String>> {
        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let snippet = dir.path().join("snippet.py");
        fs::write(&snippet, content).context("Failed to write temp file")?;

        let result: ExecResult = self
            .runner
            .run(
                &self.config.python_bin,
                &["-m", "py_compile", &snippet.to_string_lossy()],
                &self.config.project_root,
                self.config.validation_timeout_secs * 1000,
            )
            .await?;

        if result.success() {
            Ok(None)
        } else if result.timed_out {
            Ok(Some("syntax check timed out".to_string()))
        } else {
            let msg = if result.stderr.is_empty() {
                result.stdout
            } else {
                result.stderr
            };
            Ok(Some(msg.trim().to_string()))
        }
    }

    /// Persist the attempt record, then hand it back.
    fn finish(&self, a: ModificationAttempt) -> Result<ModificationAttempt> {
        self.db
            .insert_attempt(&a)
            .context("Failed to persist modification attempt")?;
        Ok(a)
    }
}

fn path_str(p: PathBuf) -> String {
    p.to_string_lossy().to_string()
}

fn attempt(
    rel: &str,
    hash_before: Option<String>,
    hash_after: impl Into<String>,
    result: ModResult,
    diff: String,
    backup_path: Option<String>,
    error: Option<String>,
) -> ModificationAttempt {
    ModificationAttempt {
        id: Uuid::new_v4().to_string(),
        file_path: rel.to_string(),
        hash_before,
        hash_after: hash_after.into(),
        timestamp: Utc::now().to_rfc3339(),
        result,
        diff,
        backup_path,
        error,
    }
}

/// Why a path is off-limits for the mutator, if it is.
fn protected_reason(rel: &str) -> Option<String> {
    let file_name = Path::new(rel)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if ALWAYS_PROTECTED.iter().any(|&p| file_name == p) {
        return Some(format!("protected file: {}", file_name));
    }

    for pattern in BLOCKED_DIRECTORY_PATTERNS {
        if rel.contains(pattern) {
            return Some(format!("blocked directory pattern: {}", pattern));
        }
    }
    None
}

/// Write `content` to a sibling temp file and rename it over `target`.
fn atomic_write(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent dirs for {}", target.display()))?;
    }

    let tmp_name = format!(
        "{}{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        TMP_SUFFIX
    );
    let tmp = target.with_file_name(tmp_name);

    fs::write(&tmp, content)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to rename over {}", target.display()));
    }
    Ok(())
}
