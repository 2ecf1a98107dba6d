//! Orchestrator
//!
//! Sequences guard, validator, mutator, and VCS into the end-to-end apply
//! pipeline and owns the suggestion lifecycle. Apply calls are serialized
//! behind one async mutex: the working tree and VCS state are not safe
//! for concurrent mutation. A suggestion is always left in a terminal
//! state when `apply_suggestion` returns an outcome for it.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CustodianConfig;
use crate::mutate::{CodeMutator, ModifyOptions};
use crate::orchestrate::intake::{parse_suggestions, strip_fences};
use crate::safety::{SafetyGuard, SafetyStats};
use crate::state::Database;
use crate::types::{
    CustodianError, MergeOutcome, ModResult, Priority, Suggestion, SuggestionStatus, VcsStatus,
};
use crate::validate::Validator;
use crate::vcs::VcsManager;

/// Snapshot for the status query interface.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub counts: Vec<(String, u32)>,
    pub pending: Vec<Suggestion>,
    pub safety: SafetyStats,
    pub vcs: Option<VcsStatus>,
}

pub struct Orchestrator {
    config: CustodianConfig,
    guard: Arc<SafetyGuard>,
    validator: Arc<Validator>,
    mutator: Arc<CodeMutator>,
    vcs: Arc<VcsManager>,
    db: Arc<Database>,
    /// Single-writer discipline for the working tree and VCS state.
    apply_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: CustodianConfig,
        guard: Arc<SafetyGuard>,
        validator: Arc<Validator>,
        mutator: Arc<CodeMutator>,
        vcs: Arc<VcsManager>,
        db: Arc<Database>,
    ) -> Self {
        Orchestrator {
            config,
            guard,
            validator,
            mutator,
            vcs,
            db,
            apply_lock: Mutex::new(()),
        }
    }

    /// Parse a generator's review output and persist the resulting
    /// suggestions as pending.
    pub fn submit(&self, text: &str) -> Result<Vec<Suggestion>> {
        let suggestions = parse_suggestions(text);
        for s in &suggestions {
            self.db.upsert_suggestion(s)?;
            info!(
                "Queued suggestion {} for {} ({})",
                s.id,
                s.file_path,
                s.priority.as_str()
            );
        }
        Ok(suggestions)
    }

    /// Human approval gate: pending -> approved.
    pub fn approve(&self, id: &str) -> Result<Suggestion> {
        let mut s = self.load(id)?;
        if s.status != SuggestionStatus::Pending {
            bail!("suggestion {} is {}, not pending", id, s.status.as_str());
        }
        s.status = SuggestionStatus::Approved;
        self.db.upsert_suggestion(&s)?;
        Ok(s)
    }

    /// Reject a pending suggestion; terminal.
    pub fn reject(&self, id: &str, reason: &str) -> Result<Suggestion> {
        let mut s = self.load(id)?;
        if s.status.is_terminal() {
            bail!("suggestion {} is already {}", id, s.status.as_str());
        }
        s.status = SuggestionStatus::Rejected;
        s.error = Some(reason.to_string());
        self.db.upsert_suggestion(&s)?;
        info!("Rejected suggestion {}: {}", id, reason);
        Ok(s)
    }

    /// Whether a pending suggestion may bypass the human approval queue.
    pub fn auto_eligible(&self, s: &Suggestion) -> bool {
        if !self.config.require_human_approval {
            return true;
        }
        self.config.auto_apply_low_risk
            && s.priority == Priority::Low
            && s.confidence >= self.config.auto_apply_confidence
    }

    /// Apply every approved suggestion, plus pending ones that pass the
    /// auto-apply rules. Returns the suggestions that reached a terminal
    /// or committed state this pass.
    pub async fn process_queue(&self) -> Result<Vec<Suggestion>> {
        let mut processed = Vec::new();

        let approved = self.db.suggestions_by_status(SuggestionStatus::Approved)?;
        let auto: Vec<Suggestion> = self
            .db
            .suggestions_by_status(SuggestionStatus::Pending)?
            .into_iter()
            .filter(|s| self.auto_eligible(s))
            .collect();

        for s in approved.into_iter().chain(auto) {
            processed.push(self.apply_suggestion(&s.id, false).await?);
        }
        Ok(processed)
    }

    /// Run the full apply pipeline for one suggestion. Never leaves the
    /// suggestion in a non-terminal pre-committed state.
    pub async fn apply_suggestion(&self, id: &str, force: bool) -> Result<Suggestion> {
        if !self.config.enabled {
            bail!("self-modification is disabled by configuration");
        }

        let _serialized = self.apply_lock.lock().await;

        let mut s = self.load(id)?;
        if s.status.is_terminal() {
            bail!("suggestion {} is already {}", id, s.status.as_str());
        }

        // Unexpected internal errors are mapped to FAILED here so the
        // host process never crashes on a malformed suggestion.
        if let Err(e) = self.run_pipeline(&mut s, force).await {
            warn!("Pipeline error for {}: {:#}", s.id, e);
            if !s.status.is_terminal() {
                s.status = SuggestionStatus::Failed;
                s.error = Some(format!("{:#}", e));
            }
        }

        self.db.upsert_suggestion(&s)?;
        Ok(s)
    }

    /// Status query interface: suggestion counts, approval queue, safety
    /// counters, VCS posture.
    pub async fn status_report(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            counts: self.db.suggestion_counts()?,
            pending: self.db.suggestions_by_status(SuggestionStatus::Pending)?,
            safety: self.guard.stats(),
            vcs: self.vcs.status().await.unwrap_or(None),
        })
    }

    pub fn emergency_stop(&self, active: bool) {
        self.guard.set_emergency_stop(active);
    }

    // The pipeline proper. Policy blocks set a terminal status and return
    // Ok; Err is reserved for unexpected failures.
    async fn run_pipeline(&self, s: &mut Suggestion, force: bool) -> Result<()> {
        // Final perimeter check, independent of every component's own
        // guards: the target must resolve inside the project root.
        let rel = match resolve_target(Path::new(&self.config.project_root), &s.file_path) {
            Some(rel) => rel,
            None => {
                let err = CustodianError::PathEscapesRoot(s.file_path.clone());
                return self.fail(s, err.to_string());
            }
        };
        s.file_path = rel.clone();

        let old_content = fs::read_to_string(Path::new(&self.config.project_root).join(&rel)).ok();
        let content = prepare_content(&s.improved_code, s.current_code.as_deref(), old_content.as_deref());

        // 1. Safety gate.
        if !force {
            let verdict = self.guard.evaluate(&rel, &content);
            if !verdict.allowed {
                return self.fail(s, verdict.reason);
            }
        }

        // 2. Identical content is a benign no-op: record the attempt for
        // the audit trail, but never branch, commit, or touch the guard's
        // quota counters.
        if old_content.as_deref() == Some(content.as_str()) {
            let attempt = self
                .mutator
                .modify(&rel, &content, ModifyOptions::default())
                .await?;
            s.attempt_id = Some(attempt.id.clone());
            s.status = SuggestionStatus::Committed;
            s.applied_at = Some(Utc::now().to_rfc3339());
            info!("Suggestion {} is a no-op for {}; nothing to change", s.id, rel);
            return Ok(());
        }

        // 3. Correctness gate.
        if self.config.validation_enabled {
            s.status = SuggestionStatus::Validating;
            self.db.upsert_suggestion(s)?;

            let report = self
                .validator
                .validate(&rel, &content, old_content.as_deref())
                .await
                .context("validation pipeline error")?;
            if !report.can_apply_safely() {
                let failing: Vec<String> = report
                    .failing_checks()
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.message))
                    .collect();
                return self.fail(s, format!("validation failed [{}]", failing.join("; ")));
            }
        }

        // 4. Isolate the change on its own branch when VCS is available.
        let branch = self
            .vcs
            .create_branch(&s.id, &s.description)
            .await
            .context("branch creation failed")?;
        s.branch = branch.as_ref().map(|b| b.branch_name.clone());

        // 5. The write itself.
        s.status = SuggestionStatus::Applying;
        self.db.upsert_suggestion(s)?;

        let attempt = self
            .mutator
            .modify(&rel, &content, ModifyOptions::default())
            .await?;
        s.attempt_id = Some(attempt.id.clone());

        match attempt.result {
            ModResult::Success => {}
            // The file changed under us between the read and the write and
            // now matches: still a benign no-op, nothing to commit.
            ModResult::NoChange => {
                s.status = SuggestionStatus::Committed;
                s.applied_at = Some(Utc::now().to_rfc3339());
                return Ok(());
            }
            ModResult::RollbackSucceeded => {
                self.guard.record_outcome(&rel, &content, false);
                s.status = SuggestionStatus::RolledBack;
                s.error = attempt.error.clone();
                return Ok(());
            }
            other => {
                self.guard.record_outcome(&rel, &content, false);
                return self.fail(
                    s,
                    format!(
                        "modification failed ({:?}): {}",
                        other,
                        attempt.error.as_deref().unwrap_or("no detail")
                    ),
                );
            }
        }

        // 6. Commit on the feature branch. A failure after the write is a
        // downstream error: restore pre-mutation content.
        if self.config.auto_commit && s.branch.is_some() {
            let message = format!("custodian: {}", short_summary(&s.description, &rel));
            match self.vcs.commit(&message, &[rel.clone()], &s.description).await {
                Ok(_) => {}
                Err(e) => {
                    warn!("Commit failed after write; rolling back {}: {:#}", rel, e);
                    let rollback = self.mutator.rollback(&attempt.id)?;
                    self.guard.record_outcome(&rel, &content, false);
                    if rollback.result == ModResult::RollbackSucceeded {
                        s.status = SuggestionStatus::RolledBack;
                        s.error = Some(format!("commit failed, rolled back: {:#}", e));
                        return Ok(());
                    }
                    return self.fail(
                        s,
                        format!("commit failed and rollback failed: {:#}", e),
                    );
                }
            }
        }

        s.status = SuggestionStatus::Committed;
        s.applied_at = Some(Utc::now().to_rfc3339());
        self.guard.record_outcome(&rel, &content, true);
        info!("Suggestion {} committed ({})", s.id, rel);

        // 7. Optional, separately opted-in merge to the default branch.
        if self.config.auto_merge {
            if let Some(branch_name) = s.branch.clone() {
                let message = format!("Merge {} ({})", branch_name, short_summary(&s.description, &rel));
                match self.vcs.merge_to_main(&branch_name, &message).await? {
                    MergeOutcome::Merged => s.status = SuggestionStatus::Merged,
                    MergeOutcome::Conflict => {
                        warn!("Merge of {} conflicted; left committed on branch", branch_name);
                        s.error = Some(format!("merge conflict on {}", branch_name));
                    }
                    MergeOutcome::Unavailable => {}
                }
            }
        }

        Ok(())
    }

    fn fail(&self, s: &mut Suggestion, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        warn!("Suggestion {} failed: {}", s.id, reason);
        s.status = SuggestionStatus::Failed;
        s.error = Some(reason);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Suggestion> {
        Ok(self
            .db
            .get_suggestion(id)?
            .ok_or_else(|| CustodianError::SuggestionNotFound(id.to_string()))?)
    }
}

/// Lexically resolve a suggestion's target to a project-relative path.
/// Absolute paths must sit under the root; parent traversal is rejected
/// outright. Returns `None` on escape.
pub fn resolve_target(root: &Path, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let p = Path::new(trimmed);
    let rel: PathBuf = if p.is_absolute() {
        p.strip_prefix(root).ok()?.to_path_buf()
    } else {
        p.to_path_buf()
    };

    let mut out = PathBuf::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out.to_string_lossy().replace('\\', "/"))
}

/// Produce the full-file replacement the mutator will write. Generator
/// output may be the whole file, or just a replacement for the
/// `current_code` span; when that span is found verbatim in the existing
/// file, substitute only it.
pub fn prepare_content(improved: &str, current: Option<&str>, old_file: Option<&str>) -> String {
    let improved = strip_fences(improved);

    if let (Some(snippet), Some(old)) = (current, old_file) {
        let snippet = snippet.trim_matches('\n');
        if !snippet.is_empty() && old.contains(snippet) {
            return old.replacen(snippet, improved.trim_matches('\n'), 1);
        }
    }
    improved
}

fn short_summary(description: &str, rel: &str) -> String {
    let text = if description.is_empty() { rel } else { description };
    let mut summary: String = text.chars().take(60).collect();
    if text.chars().count() > 60 {
        summary.push_str("...");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::PatternSet;
    use crate::types::{CommandRunner, ExecResult};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Simulates both a healthy python toolchain and a small git repo.
    struct TestRunner {
        git_available: bool,
        fail_commit: bool,
        branch: StdMutex<String>,
        commits: StdMutex<Vec<String>>,
        branches_created: StdMutex<Vec<String>>,
    }

    impl TestRunner {
        fn new(git_available: bool) -> Self {
            TestRunner {
                git_available,
                fail_commit: false,
                branch: StdMutex::new("main".to_string()),
                commits: StdMutex::new(Vec::new()),
                branches_created: StdMutex::new(Vec::new()),
            }
        }

        fn ok(stdout: &str) -> ExecResult {
            ExecResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            }
        }

        fn err(code: i32, stderr: &str) -> ExecResult {
            ExecResult {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code: code,
                timed_out: false,
            }
        }
    }

    #[async_trait]
    impl CommandRunner for TestRunner {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            _cwd: &str,
            _timeout_ms: u64,
        ) -> Result<ExecResult> {
            if program != "git" {
                // python: compile/import/smoke all succeed
                return Ok(Self::ok(""));
            }
            if !self.git_available {
                return Ok(Self::err(128, "fatal: not a git repository"));
            }

            match args {
                ["rev-parse", "--is-inside-work-tree"] => Ok(Self::ok("true")),
                ["rev-parse", "--abbrev-ref", "HEAD"] => {
                    Ok(Self::ok(&self.branch.lock().unwrap().clone()))
                }
                ["rev-parse", "HEAD"] => Ok(Self::ok("deadbeefcafe")),
                ["status", "--porcelain", "-b"] => {
                    Ok(Self::ok(&format!("## {}", self.branch.lock().unwrap())))
                }
                ["checkout", "-b", name] => {
                    self.branches_created.lock().unwrap().push(name.to_string());
                    *self.branch.lock().unwrap() = name.to_string();
                    Ok(Self::ok(""))
                }
                ["checkout", name] => {
                    *self.branch.lock().unwrap() = name.to_string();
                    Ok(Self::ok(""))
                }
                ["commit", "-m", msg] => {
                    if self.fail_commit {
                        return Ok(Self::err(1, "simulated commit failure"));
                    }
                    self.commits.lock().unwrap().push(msg.to_string());
                    Ok(Self::ok(""))
                }
                _ => Ok(Self::ok("")),
            }
        }
    }

    fn orchestrator_in(root: &Path, runner: Arc<TestRunner>) -> Orchestrator {
        let config = CustodianConfig {
            project_root: root.to_string_lossy().to_string(),
            require_human_approval: false,
            cooldown_secs: 0,
            ..Default::default()
        };
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runner_dyn: Arc<dyn CommandRunner> = runner;
        let guard = Arc::new(SafetyGuard::new(
            config.clone(),
            PatternSet::defaults(),
            Arc::clone(&db),
        ));
        let validator = Arc::new(Validator::new(config.clone(), Arc::clone(&runner_dyn)));
        let mutator = Arc::new(CodeMutator::new(
            config.clone(),
            Arc::clone(&db),
            Arc::clone(&runner_dyn),
        ));
        let vcs = Arc::new(VcsManager::new(config.clone(), Arc::clone(&runner_dyn)));
        Orchestrator::new(config, guard, validator, mutator, vcs, db)
    }

    fn submit_one(orch: &Orchestrator, file: &str, code: &str) -> Suggestion {
        let text = format!("FILE: {}\nPRIORITY: medium\nDESCRIPTION: test change\nIMPROVED_CODE:\n{}\n", file, code);
        orch.submit(&text).unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_critical_file_fails_with_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));

        let s = submit_one(&orch, "src/api/auth.py", "x = 1");
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        assert_eq!(done.status, SuggestionStatus::Failed);
        assert!(done.error.unwrap().contains("Critical file blocked"));
    }

    #[tokio::test]
    async fn test_dangerous_pattern_fails_naming_it() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));

        let s = submit_one(&orch, "src/util.py", "exec(user_input)");
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        assert_eq!(done.status, SuggestionStatus::Failed);
        assert!(done.error.unwrap().contains("exec"));
    }

    #[tokio::test]
    async fn test_new_file_reaches_committed_with_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(TestRunner::new(true));
        let orch = orchestrator_in(tmp.path(), Arc::clone(&runner));

        let s = submit_one(&orch, "src/fresh.py", "value = 42");
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        assert_eq!(done.status, SuggestionStatus::Committed);
        assert!(done.applied_at.is_some());
        assert!(done.branch.as_ref().unwrap().starts_with("custodian/"));
        assert_eq!(runner.branches_created.lock().unwrap().len(), 1);
        assert_eq!(runner.commits.lock().unwrap().len(), 1);
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/fresh.py")).unwrap(),
            "value = 42"
        );
        // New file: no backup was taken.
        let attempt = orch.db.get_attempt(&done.attempt_id.unwrap()).unwrap().unwrap();
        assert!(attempt.backup_path.is_none());
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_to_pre_mutation_content() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/mod.py"), "original = True\n").unwrap();

        let mut runner = TestRunner::new(true);
        runner.fail_commit = true;
        let orch = orchestrator_in(tmp.path(), Arc::new(runner));

        let s = submit_one(&orch, "src/mod.py", "replaced = True");
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        assert_eq!(done.status, SuggestionStatus::RolledBack);
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/mod.py")).unwrap(),
            "original = True\n"
        );
    }

    #[tokio::test]
    async fn test_identical_content_is_benign_noop() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("same.py"), "x = 1").unwrap();

        let runner = Arc::new(TestRunner::new(true));
        let orch = orchestrator_in(tmp.path(), Arc::clone(&runner));

        let s = submit_one(&orch, "same.py", "x = 1");
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        // auto_commit is on and git is available, yet a no-op must end
        // benign: no feature branch, no commit, no error.
        assert_eq!(done.status, SuggestionStatus::Committed);
        assert!(done.error.is_none());
        assert!(done.branch.is_none());
        assert!(runner.branches_created.lock().unwrap().is_empty());
        assert!(runner.commits.lock().unwrap().is_empty());

        let attempt = orch.db.get_attempt(&done.attempt_id.unwrap()).unwrap().unwrap();
        assert_eq!(attempt.result, ModResult::NoChange);
        assert!(attempt.backup_path.is_none());
        assert_eq!(fs::read_to_string(tmp.path().join("same.py")).unwrap(), "x = 1");
    }

    #[tokio::test]
    async fn test_current_code_span_is_substituted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("m.py"),
            "def keep():\n    pass\n\ndef slow():\n    return 1\n",
        )
        .unwrap();
        let orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));

        let text = "\
FILE: m.py
DESCRIPTION: speed up slow()
CURRENT_CODE:
def slow():
    return 1
IMPROVED_CODE:
def slow():
    return 2
CONFIDENCE: 0.9
";
        let s = orch.submit(text).unwrap().remove(0);
        let done = orch.apply_suggestion(&s.id, false).await.unwrap();

        assert_eq!(done.status, SuggestionStatus::Committed);
        let written = fs::read_to_string(tmp.path().join("m.py")).unwrap();
        assert!(written.contains("def keep():"));
        assert!(written.contains("return 2"));
        assert!(!written.contains("return 1"));
    }

    #[tokio::test]
    async fn test_path_escape_rejected_before_anything_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));

        for path in ["/etc/passwd", "../../outside.py"] {
            let s = submit_one(&orch, path, "x = 1");
            let done = orch.apply_suggestion(&s.id, false).await.unwrap();
            assert_eq!(done.status, SuggestionStatus::Failed);
            assert!(done.error.unwrap().contains("escapes the project root"));
        }
        // Nothing was written anywhere.
        assert!(!tmp.path().join("outside.py").exists());
    }

    #[tokio::test]
    async fn test_approval_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(TestRunner::new(false));
        let config_root = tmp.path();
        let mut orch = orchestrator_in(config_root, Arc::clone(&runner));
        orch.config.require_human_approval = true;

        let s = submit_one(&orch, "a.py", "x = 1");
        assert!(!orch.auto_eligible(&s));

        let approved = orch.approve(&s.id).unwrap();
        assert_eq!(approved.status, SuggestionStatus::Approved);

        let processed = orch.process_queue().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].status, SuggestionStatus::Committed);
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));

        let s = submit_one(&orch, "a.py", "x = 1");
        let rejected = orch.reject(&s.id, "not wanted").unwrap();
        assert_eq!(rejected.status, SuggestionStatus::Rejected);

        assert!(orch.apply_suggestion(&s.id, false).await.is_err());
    }

    #[tokio::test]
    async fn test_low_risk_auto_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(TestRunner::new(false));
        let mut orch = orchestrator_in(tmp.path(), Arc::clone(&runner));
        orch.config.require_human_approval = true;
        orch.config.auto_apply_low_risk = true;

        let text = "FILE: a.py\nPRIORITY: low\nIMPROVED_CODE:\nx = 1\nCONFIDENCE: 0.95\n";
        let s = orch.submit(text).unwrap().remove(0);
        assert!(orch.auto_eligible(&s));

        let text = "FILE: b.py\nPRIORITY: high\nIMPROVED_CODE:\ny = 2\nCONFIDENCE: 0.95\n";
        let s = orch.submit(text).unwrap().remove(0);
        assert!(!orch.auto_eligible(&s));
    }

    #[tokio::test]
    async fn test_status_report_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orch = orchestrator_in(tmp.path(), Arc::new(TestRunner::new(false)));
        orch.config.require_human_approval = true;

        submit_one(&orch, "a.py", "x = 1");
        submit_one(&orch, "b.py", "y = 2");

        let report = orch.status_report().await.unwrap();
        assert_eq!(report.pending.len(), 2);
        assert!(report.counts.iter().any(|(k, n)| k == "pending" && *n == 2));
        assert!(report.vcs.is_none());
    }

    #[test]
    fn test_resolve_target_lexical() {
        let root = Path::new("/srv/project");
        assert_eq!(resolve_target(root, "src/a.py").as_deref(), Some("src/a.py"));
        assert_eq!(
            resolve_target(root, "/srv/project/src/a.py").as_deref(),
            Some("src/a.py")
        );
        assert_eq!(resolve_target(root, "./src/./a.py").as_deref(), Some("src/a.py"));
        assert!(resolve_target(root, "/etc/passwd").is_none());
        assert!(resolve_target(root, "../other/a.py").is_none());
        assert!(resolve_target(root, "src/../../a.py").is_none());
        assert!(resolve_target(root, "").is_none());
    }

    #[test]
    fn test_prepare_content_whole_file_when_no_snippet() {
        let out = prepare_content("```python\nx = 1\n```", None, Some("old"));
        assert_eq!(out, "x = 1");
    }

    #[test]
    fn test_prepare_content_snippet_not_found_uses_improved() {
        let out = prepare_content("x = 2", Some("not present"), Some("x = 1\n"));
        assert_eq!(out, "x = 2");
    }
}
