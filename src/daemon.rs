//! Custodian Daemon
//!
//! Background loop that checks cron schedules and runs due maintenance
//! tasks: periodic health checks, periodic code review via the suggestion
//! source, and backup pruning. Uses `tokio::time::interval` for the tick
//! loop and `Arc<AtomicBool>` for graceful shutdown signaling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::heal::EmergencyHealer;
use crate::mutate::CodeMutator;
use crate::orchestrate::Orchestrator;
use crate::types::{Severity, SuggestionSource};

pub const TASK_HEALTH_CHECK: &str = "health_check";
pub const TASK_CODE_REVIEW: &str = "code_review";
pub const TASK_BACKUP_PRUNE: &str = "backup_prune";

/// One scheduled daemon task.
#[derive(Clone, Debug)]
pub struct DaemonEntry {
    pub name: String,
    pub task: String,
    /// Six-field cron expression (with seconds).
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<String>,
}

/// Default schedule: health every 30 minutes, review every 6 hours,
/// backup pruning nightly.
pub fn default_entries() -> Vec<DaemonEntry> {
    vec![
        DaemonEntry {
            name: "health-check".to_string(),
            task: TASK_HEALTH_CHECK.to_string(),
            schedule: "0 */30 * * * *".to_string(),
            enabled: true,
            last_run: None,
        },
        DaemonEntry {
            name: "code-review".to_string(),
            task: TASK_CODE_REVIEW.to_string(),
            schedule: "0 0 */6 * * *".to_string(),
            enabled: true,
            last_run: None,
        },
        DaemonEntry {
            name: "backup-prune".to_string(),
            task: TASK_BACKUP_PRUNE.to_string(),
            schedule: "0 0 3 * * *".to_string(),
            enabled: true,
            last_run: None,
        },
    ]
}

/// Shared service handles the tasks operate on.
#[derive(Clone)]
pub struct TaskContext {
    pub orchestrator: Arc<Orchestrator>,
    pub healer: Arc<EmergencyHealer>,
    pub mutator: Arc<CodeMutator>,
    pub source: Option<Arc<dyn SuggestionSource>>,
    pub project_root: String,
}

pub struct DaemonOptions {
    /// Tick interval in seconds. Defaults to 30.
    pub tick_interval_secs: u64,
    pub entries: Vec<DaemonEntry>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            entries: default_entries(),
        }
    }
}

/// The custodian daemon. Runs a background tokio task that periodically
/// checks all registered entries and executes those that are due.
pub struct CustodianDaemon {
    running: Arc<AtomicBool>,
    interval_handle: Option<JoinHandle<()>>,
    tick_interval_secs: u64,
    entries: Arc<tokio::sync::RwLock<Vec<DaemonEntry>>>,
}

pub fn create_daemon(options: DaemonOptions) -> CustodianDaemon {
    CustodianDaemon {
        running: Arc::new(AtomicBool::new(false)),
        interval_handle: None,
        tick_interval_secs: options.tick_interval_secs,
        entries: Arc::new(tokio::sync::RwLock::new(options.entries)),
    }
}

impl CustodianDaemon {
    /// Start the background loop. Spawns a tokio task that ticks at the
    /// configured interval and executes due entries.
    pub fn start(&mut self, ctx: TaskContext) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Custodian daemon is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting custodian daemon with {}s tick interval",
            self.tick_interval_secs
        );

        let running = Arc::clone(&self.running);
        let entries = Arc::clone(&self.entries);
        let tick_secs = self.tick_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));

            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    info!("Custodian daemon stopping");
                    break;
                }

                if let Err(e) = tick(&entries, &ctx).await {
                    error!("Daemon tick error: {:#}", e);
                }
            }
        });

        self.interval_handle = Some(handle);
    }

    /// Stop the daemon gracefully. In-flight subprocesses die with their
    /// aborted task; partial writes cannot occur past the mutator's
    /// atomic rename.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("Custodian daemon is not running");
            return;
        }

        info!("Stopping custodian daemon");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.interval_handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a specific task regardless of its schedule. Accepts either the
    /// entry name ("health-check") or the task key (`TASK_HEALTH_CHECK`).
    pub async fn force_run(&self, task_name: &str, ctx: &TaskContext) -> Result<()> {
        let entries = self.entries.read().await;
        let entry = entries
            .iter()
            .find(|e| e.name == task_name || e.task == task_name)
            .cloned()
            .with_context(|| format!("No daemon entry found with name '{}'", task_name))?;
        drop(entries);

        info!("Force-running daemon task: {}", task_name);
        execute_task(&entry, ctx).await
    }
}

/// Whether an entry is due based on its cron schedule and last run.
pub fn is_due(entry: &DaemonEntry) -> bool {
    if !entry.enabled {
        return false;
    }

    let schedule: Schedule = match entry.schedule.parse() {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "Invalid cron schedule '{}' for entry '{}': {}",
                entry.schedule, entry.name, e
            );
            return false;
        }
    };

    let now = Utc::now();

    if let Some(ref last_run_str) = entry.last_run {
        if let Ok(last_run) = last_run_str.parse::<chrono::DateTime<Utc>>() {
            if let Some(next) = schedule.after(&last_run).next() {
                return now >= next;
            }
        }
    }

    // No last_run recorded; the task is due immediately.
    true
}

/// Execute a single daemon task entry.
pub async fn execute_task(entry: &DaemonEntry, ctx: &TaskContext) -> Result<()> {
    info!("Executing daemon task: {} (task={})", entry.name, entry.task);
    match entry.task.as_str() {
        TASK_HEALTH_CHECK => run_health_check(ctx).await,
        TASK_CODE_REVIEW => run_code_review(ctx).await,
        TASK_BACKUP_PRUNE => {
            let pruned = ctx.mutator.prune_backups()?;
            if pruned > 0 {
                info!("Pruned {} expired backup(s)", pruned);
            }
            Ok(())
        }
        other => bail!("No task function found for task '{}'", other),
    }
}

async fn run_health_check(ctx: &TaskContext) -> Result<()> {
    let checks = ctx.healer.check_health().await;
    let critical = checks
        .iter()
        .filter(|c| !c.healthy && c.severity == Severity::Critical)
        .count();

    if critical == 0 {
        debug!("Health check passed ({} checks)", checks.len());
        return Ok(());
    }

    warn!("Health check found {} critical problem(s); healing", critical);
    let event = ctx.healer.heal(&checks, false).await?;
    if !event.healed {
        error!("Healing incomplete: {}", event.detail);
    }
    Ok(())
}

async fn run_code_review(ctx: &TaskContext) -> Result<()> {
    let source = match &ctx.source {
        Some(s) => s,
        None => {
            debug!("No suggestion source configured; skipping review");
            return Ok(());
        }
    };

    let text = source.review(&ctx.project_root).await?;
    let queued = ctx.orchestrator.submit(&text)?;
    info!("Review produced {} suggestion(s)", queued.len());

    let processed = ctx.orchestrator.process_queue().await?;
    for s in &processed {
        info!("Processed {} -> {}", s.id, s.status.as_str());
    }
    Ok(())
}

/// One tick: run every due entry, then stamp last_run for those that ran.
async fn tick(entries: &tokio::sync::RwLock<Vec<DaemonEntry>>, ctx: &TaskContext) -> Result<()> {
    let current_entries = entries.read().await.clone();
    let mut executed: HashMap<String, String> = HashMap::new();

    for entry in &current_entries {
        if is_due(entry) {
            match execute_task(entry, ctx).await {
                Ok(()) => {
                    executed.insert(entry.name.clone(), Utc::now().to_rfc3339());
                }
                Err(e) => {
                    error!("Failed to execute daemon task '{}': {:#}", entry.name, e);
                }
            }
        }
    }

    if !executed.is_empty() {
        let mut writable = entries.write().await;
        for entry in writable.iter_mut() {
            if let Some(timestamp) = executed.get(&entry.name) {
                entry.last_run = Some(timestamp.clone());
            }
        }
    }

    Ok(())
}
