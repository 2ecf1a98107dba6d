//! VCS Manager
//!
//! Git operations for the gatekeeper: isolate every suggestion on its own
//! branch, commit only the files it touched, and merge back with a
//! no-fast-forward merge commit. Every operation degrades to a
//! "not available" outcome when the git binary or repository is absent;
//! callers treat that as a disabled feature, not an error.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::CustodianConfig;
use crate::types::{
    CommandRunner, ExecResult, MergeOutcome, ModificationBranch, VcsLogEntry, VcsStatus,
};

/// Prefix for suggestion feature branches.
const BRANCH_PREFIX: &str = "custodian/";

/// Author name recorded in commit footers and used for log filtering.
pub const COMMIT_AUTHOR: &str = "custodian";

const GIT_TIMEOUT_MS: u64 = 10_000;
const GIT_SLOW_TIMEOUT_MS: u64 = 30_000;

/// Turn a free-text description into a branch-name slug.
pub fn sanitize_branch_slug(description: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in description.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 30 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "change".to_string()
    } else {
        slug
    }
}

pub struct VcsManager {
    config: CustodianConfig,
    runner: Arc<dyn CommandRunner>,
}

impl VcsManager {
    pub fn new(config: CustodianConfig, runner: Arc<dyn CommandRunner>) -> Self {
        VcsManager { config, runner }
    }

    async fn git(&self, args: &[&str], timeout_ms: u64) -> Result<ExecResult> {
        self.runner
            .run("git", args, &self.config.project_root, timeout_ms)
            .await
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))
    }

    /// Probe whether git and a work tree are present. All public
    /// operations re-check this and degrade gracefully.
    pub async fn available(&self) -> bool {
        match self.git(&["rev-parse", "--is-inside-work-tree"], GIT_TIMEOUT_MS).await {
            Ok(result) => result.success() && result.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    /// Current branch name, or `None` when unavailable.
    pub async fn current_branch(&self) -> Option<String> {
        let result = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"], GIT_TIMEOUT_MS)
            .await
            .ok()?;
        if result.success() {
            Some(result.stdout.trim().to_string())
        } else {
            None
        }
    }

    /// Working-tree status from `git status --porcelain -b`.
    pub async fn status(&self) -> Result<Option<VcsStatus>> {
        if !self.available().await {
            return Ok(None);
        }

        let result = self
            .git(&["status", "--porcelain", "-b"], GIT_TIMEOUT_MS)
            .await?;
        if !result.success() {
            return Ok(None);
        }

        let mut branch = "unknown".to_string();
        let mut uncommitted = 0u32;
        for line in result.stdout.lines().filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("## ") {
                branch = rest.split("...").next().unwrap_or("unknown").to_string();
            } else {
                uncommitted += 1;
            }
        }

        Ok(Some(VcsStatus {
            branch,
            clean: uncommitted == 0,
            uncommitted,
        }))
    }

    /// Create a feature branch for a suggestion, stashing uncommitted
    /// changes first if the tree is dirty. Returns `None` when VCS is
    /// unavailable.
    pub async fn create_branch(
        &self,
        suggestion_id: &str,
        description: &str,
    ) -> Result<Option<ModificationBranch>> {
        let status = match self.status().await? {
            Some(s) => s,
            None => {
                debug!("VCS unavailable; skipping branch creation");
                return Ok(None);
            }
        };

        if !status.clean {
            info!("Working tree dirty ({} entries); stashing", status.uncommitted);
            self.stash().await?;
        }

        let id8: String = suggestion_id.chars().take(8).collect();
        let branch_name = format!("{}{}-{}", BRANCH_PREFIX, sanitize_branch_slug(description), id8);

        let result = self
            .git(&["checkout", "-b", &branch_name], GIT_TIMEOUT_MS)
            .await?;
        if !result.success() {
            bail!("Failed to create branch {}: {}", branch_name, err_text(&result));
        }

        info!("Created branch {} from {}", branch_name, status.branch);
        Ok(Some(ModificationBranch {
            branch_name,
            suggestion_id: suggestion_id.to_string(),
            base_branch: status.branch,
            created_at: Utc::now().to_rfc3339(),
            files: Vec::new(),
            commits: Vec::new(),
            merged: false,
        }))
    }

    /// Stage `files` and commit them with an attributed message. Refuses
    /// to commit directly on a protected branch. Returns the commit id,
    /// or `None` when VCS is unavailable.
    pub async fn commit(
        &self,
        message: &str,
        files: &[String],
        description: &str,
    ) -> Result<Option<String>> {
        if !self.available().await {
            return Ok(None);
        }

        let branch = self.current_branch().await.unwrap_or_default();
        if self.config.protected_branches.iter().any(|b| *b == branch) {
            bail!("Refusing to commit directly on protected branch '{}'", branch);
        }

        for file in files {
            let result = self.git(&["add", "--", file], GIT_TIMEOUT_MS).await?;
            if !result.success() {
                bail!("Failed to stage {}: {}", file, err_text(&result));
            }
        }

        let full_message = build_commit_message(message, description);
        let result = self
            .git(&["commit", "-m", &full_message], GIT_TIMEOUT_MS)
            .await?;
        if !result.success() {
            bail!("git commit failed: {}", err_text(&result));
        }

        let rev = self.git(&["rev-parse", "HEAD"], GIT_TIMEOUT_MS).await?;
        let commit_id = rev.stdout.trim().to_string();
        info!("Committed {} file(s) as {}", files.len(), &commit_id);
        Ok(Some(commit_id))
    }

    /// Merge a feature branch into the default branch with a no-ff merge
    /// commit. On conflict the merge is aborted and the original branch
    /// restored. On success the feature branch is deleted.
    pub async fn merge_to_main(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        if !self.available().await {
            return Ok(MergeOutcome::Unavailable);
        }

        let original = self.current_branch().await.unwrap_or_default();
        let default_branch = self.default_branch().await;

        let result = self
            .git(&["checkout", &default_branch], GIT_TIMEOUT_MS)
            .await?;
        if !result.success() {
            bail!("Failed to checkout {}: {}", default_branch, err_text(&result));
        }

        // Best-effort pull; no remote is fine.
        let pull = self.git(&["pull", "--ff-only"], GIT_SLOW_TIMEOUT_MS).await;
        if let Ok(ref p) = pull {
            if !p.success() {
                debug!("Pull skipped: {}", err_text(p));
            }
        }

        let result = self
            .git(&["merge", "--no-ff", branch, "-m", message], GIT_SLOW_TIMEOUT_MS)
            .await?;
        if !result.success() {
            warn!("Merge of {} conflicted; aborting", branch);
            let _ = self.git(&["merge", "--abort"], GIT_TIMEOUT_MS).await;
            if !original.is_empty() {
                let _ = self.git(&["checkout", &original], GIT_TIMEOUT_MS).await;
            }
            return Ok(MergeOutcome::Conflict);
        }

        let _ = self.git(&["branch", "-d", branch], GIT_TIMEOUT_MS).await;
        info!("Merged {} into {}", branch, default_branch);
        Ok(MergeOutcome::Merged)
    }

    /// Commit history filtered to the custodian's own commits.
    pub async fn log(&self, limit: u32) -> Result<Vec<VcsLogEntry>> {
        if !self.available().await {
            return Ok(Vec::new());
        }

        let limit_arg = format!("-n{}", limit);
        let grep = format!("--grep=Authored-by: {}", COMMIT_AUTHOR);
        let result = self
            .git(
                &["log", "--format=%H|%s|%an|%aI", &limit_arg, &grep],
                GIT_TIMEOUT_MS,
            )
            .await?;

        let entries = result
            .stdout
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.splitn(4, '|').collect();
                if parts.len() == 4 {
                    Some(VcsLogEntry {
                        hash: parts[0].to_string(),
                        message: parts[1].to_string(),
                        author: parts[2].to_string(),
                        date: parts[3].to_string(),
                    })
                } else {
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    /// Diff of the working tree (or the index with `staged`).
    pub async fn diff(&self, staged: bool) -> Result<String> {
        if !self.available().await {
            return Ok(String::new());
        }
        let args: &[&str] = if staged {
            &["diff", "--cached"]
        } else {
            &["diff"]
        };
        let result = self.git(args, GIT_TIMEOUT_MS).await?;
        Ok(result.stdout)
    }

    pub async fn stash(&self) -> Result<bool> {
        let result = self
            .git(&["stash", "push", "-u", "-m", "custodian-autostash"], GIT_TIMEOUT_MS)
            .await?;
        Ok(result.success())
    }

    pub async fn stash_pop(&self) -> Result<bool> {
        let result = self.git(&["stash", "pop"], GIT_TIMEOUT_MS).await?;
        Ok(result.success())
    }

    /// Hard-discard local changes to one file.
    pub async fn discard_file(&self, rel: &str) -> Result<bool> {
        if !self.available().await {
            return Ok(false);
        }
        let result = self.git(&["checkout", "--", rel], GIT_TIMEOUT_MS).await?;
        Ok(result.success())
    }

    /// Hard-discard all local changes.
    pub async fn discard_all(&self) -> Result<bool> {
        if !self.available().await {
            return Ok(false);
        }
        let result = self.git(&["checkout", "--", "."], GIT_TIMEOUT_MS).await?;
        Ok(result.success())
    }

    /// Stash everything and hard-checkout the default branch, pulling
    /// latest best-effort. Used by the healer for broken VCS state.
    pub async fn reset_to_default_branch(&self) -> Result<bool> {
        if !self.available().await {
            return Ok(false);
        }
        let _ = self.stash().await;
        let default_branch = self.default_branch().await;
        let result = self
            .git(&["checkout", "-f", &default_branch], GIT_TIMEOUT_MS)
            .await?;
        if !result.success() {
            return Ok(false);
        }
        let _ = self.git(&["pull", "--ff-only"], GIT_SLOW_TIMEOUT_MS).await;
        Ok(true)
    }

    /// The first protected branch that exists, falling back to "main".
    async fn default_branch(&self) -> String {
        for candidate in &self.config.protected_branches {
            let arg = format!("refs/heads/{}", candidate);
            if let Ok(result) = self
                .git(&["show-ref", "--verify", "--quiet", &arg], GIT_TIMEOUT_MS)
                .await
            {
                if result.success() {
                    return candidate.clone();
                }
            }
        }
        "main".to_string()
    }
}

fn err_text(result: &ExecResult) -> String {
    let text = if result.stderr.trim().is_empty() {
        result.stdout.trim()
    } else {
        result.stderr.trim()
    };
    text.to_string()
}

/// Multi-line commit message with an attribution footer and ISO-8601
/// timestamp.
fn build_commit_message(subject: &str, description: &str) -> String {
    let mut message = subject.to_string();
    if !description.is_empty() && description != subject {
        message.push_str("\n\n");
        message.push_str(description);
    }
    message.push_str(&format!(
        "\n\nAuthored-by: {} <automated>\nTimestamp: {}",
        COMMIT_AUTHOR,
        Utc::now().to_rfc3339()
    ));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn ok_with(stdout: &str) -> ExecResult {
        ExecResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        }
    }

    fn failed(stderr: &str) -> ExecResult {
        ExecResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
            timed_out: false,
        }
    }

    /// Fake git that records invocations and answers by subcommand.
    struct FakeGit {
        calls: Mutex<Vec<Vec<String>>>,
        branch: String,
        dirty: bool,
        repo_present: bool,
        merge_conflicts: bool,
    }

    impl FakeGit {
        fn new() -> Self {
            FakeGit {
                calls: Mutex::new(Vec::new()),
                branch: "main".to_string(),
                dirty: false,
                repo_present: true,
                merge_conflicts: false,
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn called(&self, prefix: &[&str]) -> bool {
            self.calls()
                .iter()
                .any(|c| c.len() >= prefix.len() && c[..prefix.len()] == *prefix)
        }
    }

    #[async_trait]
    impl CommandRunner for FakeGit {
        async fn run(
            &self,
            _program: &str,
            args: &[&str],
            _cwd: &str,
            _timeout_ms: u64,
        ) -> Result<ExecResult> {
            let call: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            self.calls.lock().unwrap().push(call);

            if !self.repo_present {
                return Ok(failed("fatal: not a git repository"));
            }

            Ok(match args {
                ["rev-parse", "--is-inside-work-tree"] => ok_with("true\n"),
                ["rev-parse", "--abbrev-ref", "HEAD"] => ok_with(&format!("{}\n", self.branch)),
                ["rev-parse", "HEAD"] => ok_with("abc123def456\n"),
                ["status", "--porcelain", "-b"] => {
                    if self.dirty {
                        ok_with(&format!("## {}\n M src/a.py\n", self.branch))
                    } else {
                        ok_with(&format!("## {}\n", self.branch))
                    }
                }
                ["merge", "--no-ff", ..] => {
                    if self.merge_conflicts {
                        failed("CONFLICT (content): merge conflict")
                    } else {
                        ok_with("Merge made by the 'ort' strategy.\n")
                    }
                }
                ["show-ref", ..] => ok_with(""),
                _ => ok_with(""),
            })
        }
    }

    fn manager_over(fake: Arc<FakeGit>) -> VcsManager {
        VcsManager::new(CustodianConfig::default(), fake)
    }

    #[test]
    fn test_sanitize_branch_slug() {
        assert_eq!(sanitize_branch_slug("Fix the parser!"), "fix-the-parser");
        assert_eq!(sanitize_branch_slug("___"), "change");
        assert!(sanitize_branch_slug(&"very long description ".repeat(5)).len() <= 30);
    }

    #[test]
    fn test_commit_message_has_footer() {
        let message = build_commit_message("Improve util", "Tidy the helpers");
        assert!(message.starts_with("Improve util\n\nTidy the helpers"));
        assert!(message.contains("Authored-by: custodian <automated>"));
        assert!(message.contains("Timestamp: "));
    }

    #[tokio::test]
    async fn test_create_branch_names_and_base() {
        let fake = Arc::new(FakeGit::new());
        let manager = manager_over(Arc::clone(&fake));

        let branch = manager
            .create_branch("0f9a8b7c-dead-beef", "Refactor utils")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(branch.branch_name, "custodian/refactor-utils-0f9a8b7c");
        assert_eq!(branch.base_branch, "main");
        assert!(fake.called(&["checkout", "-b"]));
        // Tree was clean, so no stash happened.
        assert!(!fake.called(&["stash", "push"]));
    }

    #[tokio::test]
    async fn test_create_branch_stashes_dirty_tree() {
        let mut fake = FakeGit::new();
        fake.dirty = true;
        let fake = Arc::new(fake);
        let manager = manager_over(Arc::clone(&fake));

        manager.create_branch("12345678", "x").await.unwrap().unwrap();
        assert!(fake.called(&["stash", "push"]));
    }

    #[tokio::test]
    async fn test_commit_refused_on_protected_branch() {
        let fake = Arc::new(FakeGit::new()); // branch = main
        let manager = manager_over(fake);

        let err = manager
            .commit("msg", &["src/a.py".to_string()], "desc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("protected branch"));
    }

    #[tokio::test]
    async fn test_commit_stages_only_given_files() {
        let mut fake = FakeGit::new();
        fake.branch = "custodian/x-123".to_string();
        let fake = Arc::new(fake);
        let manager = manager_over(Arc::clone(&fake));

        let commit_id = manager
            .commit("msg", &["src/a.py".to_string()], "desc")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(commit_id, "abc123def456");
        assert!(fake.called(&["add", "--", "src/a.py"]));
        assert!(!fake.called(&["add", "-A"]));
    }

    #[tokio::test]
    async fn test_merge_conflict_aborts_and_restores() {
        let mut fake = FakeGit::new();
        fake.branch = "custodian/x-123".to_string();
        fake.merge_conflicts = true;
        let fake = Arc::new(fake);
        let manager = manager_over(Arc::clone(&fake));

        let outcome = manager.merge_to_main("custodian/x-123", "merge msg").await.unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict);
        assert!(fake.called(&["merge", "--abort"]));
        assert!(fake.called(&["checkout", "custodian/x-123"]));
    }

    #[tokio::test]
    async fn test_merge_success_deletes_branch() {
        let fake = Arc::new(FakeGit::new());
        let manager = manager_over(Arc::clone(&fake));

        let outcome = manager.merge_to_main("custodian/x-123", "merge msg").await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(fake.called(&["branch", "-d", "custodian/x-123"]));
    }

    #[tokio::test]
    async fn test_everything_degrades_without_repo() {
        let mut fake = FakeGit::new();
        fake.repo_present = false;
        let fake = Arc::new(fake);
        let manager = manager_over(fake);

        assert!(!manager.available().await);
        assert!(manager.status().await.unwrap().is_none());
        assert!(manager.create_branch("id", "d").await.unwrap().is_none());
        assert!(manager.commit("m", &[], "d").await.unwrap().is_none());
        assert_eq!(
            manager.merge_to_main("b", "m").await.unwrap(),
            MergeOutcome::Unavailable
        );
        assert!(manager.log(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_counts_uncommitted() {
        let mut fake = FakeGit::new();
        fake.dirty = true;
        let manager = manager_over(Arc::new(fake));

        let status = manager.status().await.unwrap().unwrap();
        assert_eq!(status.branch, "main");
        assert!(!status.clean);
        assert_eq!(status.uncommitted, 1);
    }
}
