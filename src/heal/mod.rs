//! Emergency Healer
//!
//! Health checks plus automated recovery. Recovery only acts on checks
//! marked critical unless forced, is rate-limited by its own cooldown and
//! daily cap (separate from the safety guard's counters), and re-checks
//! health after acting so the event records healed vs still broken.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CustodianConfig;
use crate::mutate::CodeMutator;
use crate::state::Database;
use crate::types::{CommandRunner, HealingEvent, HealthCheck, Severity};
use crate::vcs::VcsManager;

/// How many recently modified files the parse-sanity check covers.
const RECENT_FILE_CHECKS: usize = 5;

/// Maximum directory depth when clearing compiled-artifact caches.
const PYCACHE_MAX_DEPTH: usize = 6;

/// Python one-liner that executes a module file in place. Any failure
/// marks the module unhealthy; unlike validation there is no sandbox, so
/// missing imports are real faults here.
const LOAD_SNIPPET: &str = r#"
import importlib.util, sys
path = sys.argv[1]
spec = importlib.util.spec_from_file_location("candidate", path)
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)
"#;

/// Caller-registered health probe.
pub type RegisteredCheck = Box<dyn Fn() -> HealthCheck + Send + Sync>;

struct HealState {
    last_heal: Option<DateTime<Utc>>,
}

/// Snapshot of healing activity for status reporting.
#[derive(Clone, Debug)]
pub struct HealingStats {
    pub attempts_today: u32,
    pub daily_cap: u32,
    pub last_heal: Option<String>,
    pub recent_events: Vec<HealingEvent>,
}

pub struct EmergencyHealer {
    config: CustodianConfig,
    mutator: Arc<CodeMutator>,
    vcs: Arc<VcsManager>,
    db: Arc<Database>,
    runner: Arc<dyn CommandRunner>,
    registered: Mutex<Vec<RegisteredCheck>>,
    state: Mutex<HealState>,
}

impl EmergencyHealer {
    pub fn new(
        config: CustodianConfig,
        mutator: Arc<CodeMutator>,
        vcs: Arc<VcsManager>,
        db: Arc<Database>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        EmergencyHealer {
            config,
            mutator,
            vcs,
            db,
            runner,
            registered: Mutex::new(Vec::new()),
            state: Mutex::new(HealState { last_heal: None }),
        }
    }

    /// Add a caller-supplied health probe (e.g. "too many recent
    /// failures").
    pub fn register_check(&self, check: RegisteredCheck) {
        self.registered.lock().unwrap().push(check);
    }

    /// Run every health probe and return the findings.
    pub async fn check_health(&self) -> Vec<HealthCheck> {
        let mut checks = Vec::new();

        // VCS cleanliness. Unavailable VCS is not a fault.
        match self.vcs.status().await {
            Ok(Some(status)) => checks.push(HealthCheck {
                name: "vcs_clean".to_string(),
                healthy: status.clean,
                severity: Severity::Warning,
                detail: if status.clean {
                    format!("working tree clean on {}", status.branch)
                } else {
                    format!("{} uncommitted entries on {}", status.uncommitted, status.branch)
                },
                file_path: None,
            }),
            Ok(None) => checks.push(HealthCheck {
                name: "vcs_clean".to_string(),
                healthy: true,
                severity: Severity::Info,
                detail: "version control not available".to_string(),
                file_path: None,
            }),
            Err(e) => checks.push(HealthCheck {
                name: "vcs_clean".to_string(),
                healthy: false,
                severity: Severity::Warning,
                detail: format!("status query failed: {:#}", e),
                file_path: None,
            }),
        }

        // Parse sanity of recently modified files: a corrupted write here
        // is exactly what healing exists for.
        for rel in self.recently_modified_files() {
            checks.push(self.parse_check(&rel).await);
        }

        // Load sanity of the configured key modules. Stale compiled
        // artifacts are the usual culprit, so recovery clears caches
        // rather than touching the file.
        for rel in self.key_modules() {
            checks.push(self.load_check(&rel).await);
        }

        // Caller-registered probes.
        {
            let registered = self.registered.lock().unwrap();
            for probe in registered.iter() {
                checks.push(probe());
            }
        }

        checks
    }

    /// Attempt recovery for the failing checks. Only critical findings are
    /// acted on unless `force` is set.
    pub async fn heal(&self, checks: &[HealthCheck], force: bool) -> Result<HealingEvent> {
        let now = Utc::now();
        let broken: Vec<&HealthCheck> = checks
            .iter()
            .filter(|c| !c.healthy && (force || c.severity == Severity::Critical))
            .collect();

        let trigger = broken
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        if broken.is_empty() {
            return self.record(HealingEvent {
                id: Uuid::new_v4().to_string(),
                timestamp: now.to_rfc3339(),
                trigger: "none".to_string(),
                actions: Vec::new(),
                healed: true,
                detail: "nothing to heal".to_string(),
            });
        }

        // Cooldown between healing attempts.
        if !force {
            let state = self.state.lock().unwrap();
            if let Some(last) = state.last_heal {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                if elapsed < self.config.healing_cooldown_secs {
                    return self.record(HealingEvent {
                        id: Uuid::new_v4().to_string(),
                        timestamp: now.to_rfc3339(),
                        trigger,
                        actions: Vec::new(),
                        healed: false,
                        detail: format!(
                            "healing cooldown active ({}s remaining)",
                            self.config.healing_cooldown_secs - elapsed
                        ),
                    });
                }
            }
        }

        // Daily attempt cap, counted from the persisted event log.
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_default();
        let today = self.db.healing_events_since(&midnight).unwrap_or(0);
        if !force && today >= self.config.max_healing_per_day {
            return self.record(HealingEvent {
                id: Uuid::new_v4().to_string(),
                timestamp: now.to_rfc3339(),
                trigger,
                actions: Vec::new(),
                healed: false,
                detail: format!("daily healing cap reached ({})", today),
            });
        }

        let mut actions = Vec::new();
        for check in &broken {
            self.heal_one(check, &mut actions).await;
        }

        self.state.lock().unwrap().last_heal = Some(now);

        // Re-check: did the actions actually fix things?
        let after = self.check_health().await;
        let still_broken: Vec<&HealthCheck> = after
            .iter()
            .filter(|c| !c.healthy && (force || c.severity == Severity::Critical))
            .collect();
        let healed = still_broken.is_empty();

        let detail = if healed {
            "healed".to_string()
        } else {
            format!(
                "still_broken: {}",
                still_broken
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            )
        };

        if healed {
            info!("Healing succeeded: {}", trigger);
        } else {
            warn!("Healing incomplete: {}", detail);
        }

        self.record(HealingEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: now.to_rfc3339(),
            trigger,
            actions,
            healed,
            detail,
        })
    }

    pub fn stats(&self) -> HealingStats {
        let now = Utc::now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_default();

        HealingStats {
            attempts_today: self.db.healing_events_since(&midnight).unwrap_or(0),
            daily_cap: self.config.max_healing_per_day,
            last_heal: self
                .state
                .lock()
                .unwrap()
                .last_heal
                .map(|t| t.to_rfc3339()),
            recent_events: self.db.recent_healing_events(20).unwrap_or_default(),
        }
    }

    async fn heal_one(&self, check: &HealthCheck, actions: &mut Vec<String>) {
        // Corrupted file: restore from backup, else hard-discard via VCS.
        if let Some(rel) = &check.file_path {
            match self.mutator.rollback_latest(rel) {
                Ok(attempt) if attempt.result == crate::types::ModResult::RollbackSucceeded => {
                    actions.push(format!("restored {} from backup", rel));
                    return;
                }
                _ => {}
            }
            match self.vcs.discard_file(rel).await {
                Ok(true) => actions.push(format!("discarded local changes to {}", rel)),
                _ => actions.push(format!("no recovery path for {}", rel)),
            }
            return;
        }

        if check.name.starts_with("vcs") {
            match self.vcs.reset_to_default_branch().await {
                Ok(true) => actions.push("reset to default branch".to_string()),
                _ => actions.push("vcs reset failed".to_string()),
            }
            return;
        }

        if check.name.contains("import") || check.name.contains("load") {
            let cleared = clear_pycache(Path::new(&self.config.project_root), 0);
            actions.push(format!("cleared {} __pycache__ dirs", cleared));
            return;
        }

        actions.push(format!("no automated recovery for {}", check.name));
    }

    async fn parse_check(&self, rel: &str) -> HealthCheck {
        let target = Path::new(&self.config.project_root).join(rel);
        if !target.exists() || !rel.ends_with(".py") {
            return HealthCheck {
                name: format!("parse:{}", rel),
                healthy: true,
                severity: Severity::Info,
                detail: "not applicable".to_string(),
                file_path: Some(rel.to_string()),
            };
        }

        let target_str = target.to_string_lossy().to_string();
        let result = self
            .runner
            .run(
                &self.config.python_bin,
                &["-m", "py_compile", &target_str],
                &self.config.project_root,
                self.config.validation_timeout_secs * 1000,
            )
            .await;

        match result {
            Ok(r) if r.success() => HealthCheck {
                name: format!("parse:{}", rel),
                healthy: true,
                severity: Severity::Critical,
                detail: "parses cleanly".to_string(),
                file_path: Some(rel.to_string()),
            },
            Ok(r) => HealthCheck {
                name: format!("parse:{}", rel),
                healthy: false,
                severity: Severity::Critical,
                detail: format!("parse failed: {}", r.stderr.trim()),
                file_path: Some(rel.to_string()),
            },
            Err(e) => HealthCheck {
                name: format!("parse:{}", rel),
                healthy: false,
                severity: Severity::Critical,
                detail: format!("parse check error: {:#}", e),
                file_path: Some(rel.to_string()),
            },
        }
    }

    async fn load_check(&self, rel: &str) -> HealthCheck {
        let target = Path::new(&self.config.project_root).join(rel);
        let target_str = target.to_string_lossy().to_string();
        let name = format!("load:{}", rel);

        let result = self
            .runner
            .run(
                &self.config.python_bin,
                &["-c", LOAD_SNIPPET, &target_str],
                &self.config.project_root,
                self.config.validation_timeout_secs * 1000,
            )
            .await;

        match result {
            Ok(r) if r.success() => HealthCheck {
                name,
                healthy: true,
                severity: Severity::Critical,
                detail: "loads cleanly".to_string(),
                file_path: None,
            },
            Ok(r) => HealthCheck {
                name,
                healthy: false,
                severity: Severity::Critical,
                detail: format!("load failed: {}", r.stderr.trim()),
                file_path: None,
            },
            Err(e) => HealthCheck {
                name,
                healthy: false,
                severity: Severity::Critical,
                detail: format!("load check error: {:#}", e),
                file_path: None,
            },
        }
    }

    /// The python files from the critical set that exist on disk.
    fn key_modules(&self) -> Vec<String> {
        self.config
            .critical_files
            .iter()
            .filter(|f| f.ends_with(".py"))
            .filter(|f| Path::new(&self.config.project_root).join(f.as_str()).exists())
            .cloned()
            .collect()
    }

    /// Distinct paths from the latest successful attempts, newest first.
    fn recently_modified_files(&self) -> Vec<String> {
        let mut seen = Vec::new();
        if let Ok(attempts) = self.db.recent_attempts(20) {
            for attempt in attempts {
                if !attempt.succeeded() {
                    continue;
                }
                if !seen.contains(&attempt.file_path) {
                    seen.push(attempt.file_path);
                }
                if seen.len() >= RECENT_FILE_CHECKS {
                    break;
                }
            }
        }
        seen
    }

    fn record(&self, event: HealingEvent) -> Result<HealingEvent> {
        // Only attempts that acted count toward the daily cap; benign
        // "nothing to heal" and cooldown outcomes stay unpersisted.
        if !event.actions.is_empty() {
            if let Err(e) = self.db.insert_healing_event(&event) {
                warn!("Failed to persist healing event: {:#}", e);
            }
        }
        Ok(event)
    }
}

/// Remove `__pycache__` directories under `dir`, bounded in depth.
fn clear_pycache(dir: &Path, depth: usize) -> u32 {
    if depth > PYCACHE_MAX_DEPTH {
        return 0;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    let mut cleared = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name().map(|n| n == "__pycache__").unwrap_or(false) {
            if fs::remove_dir_all(&path).is_ok() {
                cleared += 1;
            }
        } else {
            cleared += clear_pycache(&path, depth + 1);
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecResult, ModResult, ModificationAttempt};
    use async_trait::async_trait;

    struct OkRunner;

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(
            &self,
            _program: &str,
            _args: &[&str],
            _cwd: &str,
            _timeout_ms: u64,
        ) -> Result<ExecResult> {
            Ok(ExecResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                timed_out: false,
            })
        }
    }

    /// Runner where python parse checks fail but git is absent.
    struct ParseFailRunner;

    #[async_trait]
    impl CommandRunner for ParseFailRunner {
        async fn run(
            &self,
            program: &str,
            _args: &[&str],
            _cwd: &str,
            _timeout_ms: u64,
        ) -> Result<ExecResult> {
            if program == "git" {
                return Ok(ExecResult {
                    stdout: String::new(),
                    stderr: "fatal: not a git repository".to_string(),
                    exit_code: 128,
                    timed_out: false,
                });
            }
            Ok(ExecResult {
                stdout: String::new(),
                stderr: "SyntaxError: invalid syntax".to_string(),
                exit_code: 1,
                timed_out: false,
            })
        }
    }

    fn healer_in(root: &Path, runner: Arc<dyn CommandRunner>) -> (EmergencyHealer, Arc<Database>) {
        let config = CustodianConfig {
            project_root: root.to_string_lossy().to_string(),
            ..Default::default()
        };
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mutator = Arc::new(CodeMutator::new(
            config.clone(),
            Arc::clone(&db),
            Arc::clone(&runner),
        ));
        let vcs = Arc::new(VcsManager::new(config.clone(), Arc::clone(&runner)));
        let healer = EmergencyHealer::new(config, mutator, vcs, Arc::clone(&db), runner);
        (healer, db)
    }

    fn record_success(db: &Database, rel: &str) {
        db.insert_attempt(&ModificationAttempt {
            id: Uuid::new_v4().to_string(),
            file_path: rel.to_string(),
            hash_before: None,
            hash_after: "h".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            result: ModResult::Success,
            diff: String::new(),
            backup_path: None,
            error: None,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_healthy_when_nothing_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        let checks = healer.check_health().await;
        assert!(checks.iter().all(|c| c.healthy));
    }

    #[tokio::test]
    async fn test_corrupt_recent_file_is_critical() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("broken.py"), "def oops(:\n").unwrap();
        let (healer, db) = healer_in(tmp.path(), Arc::new(ParseFailRunner));
        record_success(&db, "broken.py");

        let checks = healer.check_health().await;
        let parse = checks.iter().find(|c| c.name == "parse:broken.py").unwrap();
        assert!(!parse.healthy);
        assert_eq!(parse.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_registered_checks_are_included() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        healer.register_check(Box::new(|| HealthCheck {
            name: "too_many_failures".to_string(),
            healthy: false,
            severity: Severity::Critical,
            detail: "5 failures in a row".to_string(),
            file_path: None,
        }));

        let checks = healer.check_health().await;
        assert!(checks.iter().any(|c| c.name == "too_many_failures"));
    }

    #[tokio::test]
    async fn test_heal_nothing_to_do() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        let checks = healer.check_health().await;
        let event = healer.heal(&checks, false).await.unwrap();
        assert!(event.healed);
        assert!(event.actions.is_empty());
    }

    #[tokio::test]
    async fn test_heal_restores_file_from_backup() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f.py"), "good = 1\n").unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        // Mutate once so a backup of the good content exists, then
        // corrupt the file behind the mutator's back.
        healer
            .mutator
            .modify("f.py", "better = 2\n", crate::mutate::ModifyOptions::default())
            .await
            .unwrap();
        fs::write(tmp.path().join("f.py"), "def broken(:\n").unwrap();

        let broken = vec![HealthCheck {
            name: "parse:f.py".to_string(),
            healthy: false,
            severity: Severity::Critical,
            detail: "parse failed".to_string(),
            file_path: Some("f.py".to_string()),
        }];
        let event = healer.heal(&broken, false).await.unwrap();

        assert!(event.actions.iter().any(|a| a.contains("restored f.py")));
        assert_eq!(
            fs::read_to_string(tmp.path().join("f.py")).unwrap(),
            "good = 1\n"
        );
    }

    #[tokio::test]
    async fn test_warning_checks_need_force() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        let warning = vec![HealthCheck {
            name: "vcs_clean".to_string(),
            healthy: false,
            severity: Severity::Warning,
            detail: "dirty".to_string(),
            file_path: None,
        }];

        // Not critical, not forced: nothing happens.
        let event = healer.heal(&warning, false).await.unwrap();
        assert!(event.actions.is_empty());

        // Forced: the vcs recovery path runs (and fails gracefully here
        // since no repo exists).
        let event = healer.heal(&warning, true).await.unwrap();
        assert!(!event.actions.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_heal() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        let broken = vec![HealthCheck {
            name: "custom".to_string(),
            healthy: false,
            severity: Severity::Critical,
            detail: "broken".to_string(),
            file_path: None,
        }];

        let _ = healer.heal(&broken, false).await.unwrap();
        let second = healer.heal(&broken, false).await.unwrap();
        assert!(!second.healed);
        assert!(second.detail.contains("cooldown"));
    }

    #[tokio::test]
    async fn test_stats_counts_todays_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        let broken = vec![HealthCheck {
            name: "custom".to_string(),
            healthy: false,
            severity: Severity::Critical,
            detail: "broken".to_string(),
            file_path: None,
        }];
        let _ = healer.heal(&broken, false).await.unwrap();

        let stats = healer.stats();
        assert_eq!(stats.attempts_today, 1);
        assert_eq!(stats.daily_cap, 10);
    }

    #[tokio::test]
    async fn test_benign_heals_do_not_consume_daily_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let (healer, _db) = healer_in(tmp.path(), Arc::new(OkRunner));

        // Repeated "nothing to heal" invocations leave the cap untouched.
        let healthy = healer.check_health().await;
        for _ in 0..3 {
            let event = healer.heal(&healthy, false).await.unwrap();
            assert!(event.healed);
            assert!(event.actions.is_empty());
        }
        assert_eq!(healer.stats().attempts_today, 0);

        // An acting heal counts once; the cooldown-blocked retry does not.
        let broken = vec![HealthCheck {
            name: "custom".to_string(),
            healthy: false,
            severity: Severity::Critical,
            detail: "broken".to_string(),
            file_path: None,
        }];
        let _ = healer.heal(&broken, false).await.unwrap();
        let blocked = healer.heal(&broken, false).await.unwrap();
        assert!(blocked.detail.contains("cooldown"));
        assert_eq!(healer.stats().attempts_today, 1);
    }

    #[tokio::test]
    async fn test_key_module_load_failure_clears_caches() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src/api")).unwrap();
        fs::write(tmp.path().join("src/api/auth.py"), "ok = True\n").unwrap();
        fs::create_dir_all(tmp.path().join("src/__pycache__")).unwrap();
        fs::write(tmp.path().join("src/__pycache__/auth.cpython-311.pyc"), b"x").unwrap();

        let (healer, _db) = healer_in(tmp.path(), Arc::new(ParseFailRunner));

        let checks = healer.check_health().await;
        let load = checks
            .iter()
            .find(|c| c.name == "load:src/api/auth.py")
            .unwrap();
        assert!(!load.healthy);
        assert_eq!(load.severity, Severity::Critical);

        let event = healer.heal(&checks, false).await.unwrap();
        assert!(event.actions.iter().any(|a| a.contains("__pycache__")));
        assert!(!tmp.path().join("src/__pycache__").exists());
    }
}
