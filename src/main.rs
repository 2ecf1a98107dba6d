//! Custodian Runtime
//!
//! Entry point for the self-modification gatekeeper. Handles CLI args,
//! wires the services together, and runs the daemon loop that performs
//! periodic health checks and code review.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::Confirm;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use custodian::config::{self, CustodianConfig};
use custodian::daemon::{create_daemon, DaemonOptions, TaskContext};
use custodian::exec::LocalRunner;
use custodian::heal::EmergencyHealer;
use custodian::mutate::CodeMutator;
use custodian::orchestrate::Orchestrator;
use custodian::safety::{PatternSet, SafetyGuard, DEFAULT_PATTERNS_YAML};
use custodian::state::Database;
use custodian::types::CommandRunner;
use custodian::validate::Validator;
use custodian::vcs::VcsManager;

const VERSION: &str = "0.1.0";

/// Custodian -- Self-Modification Gatekeeper
#[derive(Parser, Debug)]
#[command(
    name = "custodian",
    version = VERSION,
    about = "Custodian -- Self-Modification Gatekeeper",
    long_about = "Gatekeeps and applies single-file source edits: safety checks, \
                  validation, atomic backed-up writes, branch-per-change version control."
)]
struct Cli {
    /// Project root to guard (defaults to the current directory)
    #[arg(long, default_value = ".")]
    root: String,

    /// Start the daemon loop (periodic health checks + code review)
    #[arg(long)]
    run: bool,

    /// Write a default config and safety pattern file
    #[arg(long)]
    init: bool,

    /// Show current custodian status
    #[arg(long)]
    status: bool,

    /// Submit suggestions from a review file in the intake format
    #[arg(long, value_name = "FILE")]
    review: Option<String>,

    /// Apply a suggestion by id
    #[arg(long, value_name = "ID")]
    apply: Option<String>,

    /// Bypass the safety guard for --apply (use with care)
    #[arg(long)]
    force: bool,

    /// Approve a pending suggestion by id (prompts for confirmation)
    #[arg(long, value_name = "ID")]
    approve: Option<String>,

    /// Skip the interactive confirmation for --approve
    #[arg(long)]
    yes: bool,

    /// Reject a suggestion by id
    #[arg(long, value_name = "ID")]
    reject: Option<String>,

    /// Reason recorded with --reject
    #[arg(long, default_value = "rejected by operator")]
    reason: String,

    /// Restore the most recent backup for a project-relative path
    #[arg(long, value_name = "PATH")]
    rollback: Option<String>,

    /// Run the health checks and print the findings
    #[arg(long)]
    health: bool,

    /// Run the health checks and attempt recovery
    #[arg(long)]
    heal: bool,

    /// Activate the emergency stop (blocks all modifications)
    #[arg(long)]
    emergency_stop: bool,

    /// Clear the emergency stop
    #[arg(long)]
    resume: bool,
}

// ---- Service Wiring ---------------------------------------------------------

struct Services {
    config: CustodianConfig,
    orchestrator: Arc<Orchestrator>,
    mutator: Arc<CodeMutator>,
    healer: Arc<EmergencyHealer>,
    vcs: Arc<VcsManager>,
}

fn build_services(root: &str) -> Result<Services> {
    let cfg = config::load_config(root)?;
    fs::create_dir_all(cfg.custodian_dir()).context("Failed to create custodian directory")?;

    let db = Arc::new(Database::open(&cfg.db_path())?);
    let runner: Arc<dyn CommandRunner> = Arc::new(LocalRunner);
    let patterns = PatternSet::load(&cfg.safety_file());

    let guard = Arc::new(SafetyGuard::new(cfg.clone(), patterns, Arc::clone(&db)));
    let validator = Arc::new(Validator::new(cfg.clone(), Arc::clone(&runner)));
    let mutator = Arc::new(CodeMutator::new(cfg.clone(), Arc::clone(&db), Arc::clone(&runner)));
    let vcs = Arc::new(VcsManager::new(cfg.clone(), Arc::clone(&runner)));
    let healer = Arc::new(EmergencyHealer::new(
        cfg.clone(),
        Arc::clone(&mutator),
        Arc::clone(&vcs),
        Arc::clone(&db),
        Arc::clone(&runner),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        cfg.clone(),
        Arc::clone(&guard),
        validator,
        Arc::clone(&mutator),
        Arc::clone(&vcs),
        db,
    ));

    Ok(Services {
        config: cfg,
        orchestrator,
        mutator,
        healer,
        vcs,
    })
}

// ---- Commands ---------------------------------------------------------------

fn init_project(root: &str) -> Result<()> {
    let cfg = config::load_config(root)?;
    config::save_config(&cfg)?;

    let safety_file = cfg.safety_file();
    if !safety_file.exists() {
        fs::write(&safety_file, DEFAULT_PATTERNS_YAML)
            .with_context(|| format!("Failed to write {}", safety_file.display()))?;
    }

    println!("{}", "Custodian initialized.".green());
    println!("  config:   {}", config::config_path(&cfg.project_root).display());
    println!("  patterns: {}", safety_file.display());
    println!("  backups:  {}", cfg.backup_dir().display());
    Ok(())
}

async fn show_status(services: &Services) -> Result<()> {
    let report = services.orchestrator.status_report().await?;
    let healing = services.healer.stats();

    println!("\n{}", "=== CUSTODIAN STATUS ===".bold());
    println!("Project:  {}", services.config.project_root);
    println!("Level:    {:?}", report.safety.level);
    if report.safety.emergency_stop {
        println!("{}", "EMERGENCY STOP ACTIVE".red().bold());
    }

    println!("\n{}", "Suggestions".bold());
    if report.counts.is_empty() {
        println!("  (none)");
    }
    for (status, n) in &report.counts {
        println!("  {:12} {}", status, n);
    }
    for s in &report.pending {
        println!(
            "  {} {} {} ({}, confidence {:.2})",
            "pending".yellow(),
            s.id,
            s.file_path,
            s.priority.as_str(),
            s.confidence
        );
    }

    println!("\n{}", "Safety".bold());
    println!(
        "  hour quota  {}/{}   day quota {}/{}",
        report.safety.hour_quota_used,
        report.safety.hour_quota_max,
        report.safety.day_quota_used,
        report.safety.day_quota_max
    );
    println!(
        "  last hour   {}   cooldown {}s   failure streak {}",
        report.safety.mods_last_hour,
        report.safety.cooldown_remaining_secs,
        report.safety.consecutive_failures
    );
    for e in report.safety.recent_events.iter().rev().take(5) {
        println!("  {} {} {:?} {}", "blocked".red(), e.timestamp, e.violation, e.file_path);
    }

    println!("\n{}", "Healing".bold());
    println!("  attempts today {}/{}", healing.attempts_today, healing.daily_cap);
    if let Some(last) = &healing.last_heal {
        println!("  last heal      {}", last);
    }

    println!("\n{}", "Version control".bold());
    match &report.vcs {
        Some(v) => println!(
            "  branch {}  {}",
            v.branch,
            if v.clean {
                "clean".green().to_string()
            } else {
                format!("{} uncommitted", v.uncommitted).yellow().to_string()
            }
        ),
        None => println!("  not available"),
    }
    println!();
    Ok(())
}

async fn submit_review(services: &Services, path: &str) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let queued = services.orchestrator.submit(&text)?;
    println!("Queued {} suggestion(s):", queued.len());
    for s in &queued {
        println!("  {} {} ({})", s.id, s.file_path, s.priority.as_str());
    }

    let processed = services.orchestrator.process_queue().await?;
    for s in &processed {
        print_outcome(s);
    }
    Ok(())
}

async fn approve_suggestion(services: &Services, id: &str, yes: bool) -> Result<()> {
    let report = services.orchestrator.status_report().await?;
    let pending = report
        .pending
        .iter()
        .find(|s| s.id == id)
        .with_context(|| format!("No pending suggestion with id {}", id))?;

    println!("File:        {}", pending.file_path);
    println!("Priority:    {}", pending.priority.as_str());
    println!("Confidence:  {:.2}", pending.confidence);
    println!("Description: {}", pending.description);

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Approve and apply this suggestion?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Left pending.");
            return Ok(());
        }
    }

    services.orchestrator.approve(id)?;
    let done = services.orchestrator.apply_suggestion(id, false).await?;
    print_outcome(&done);
    Ok(())
}

async fn run_health(services: &Services, heal: bool) -> Result<()> {
    let checks = services.healer.check_health().await;
    for c in &checks {
        let marker = if c.healthy {
            "ok".green()
        } else {
            format!("{:?}", c.severity).to_lowercase().red()
        };
        println!("  [{}] {}: {}", marker, c.name, c.detail);
    }

    if heal {
        let event = services.healer.heal(&checks, false).await?;
        println!(
            "\nHealing: {} ({})",
            if event.healed { "ok".green() } else { "incomplete".red() },
            event.detail
        );
        for action in &event.actions {
            println!("  - {}", action);
        }
    }
    Ok(())
}

fn print_outcome(s: &custodian::types::Suggestion) {
    let status = s.status.as_str();
    let colored_status = match s.status {
        custodian::types::SuggestionStatus::Committed
        | custodian::types::SuggestionStatus::Merged => status.green(),
        custodian::types::SuggestionStatus::Failed
        | custodian::types::SuggestionStatus::RolledBack => status.red(),
        _ => status.yellow(),
    };
    print!("  {} {} -> {}", s.id, s.file_path, colored_status);
    if let Some(err) = &s.error {
        print!(" ({})", err);
    }
    println!();
}

// ---- Daemon Run -------------------------------------------------------------

/// Start the daemon loop and block until a shutdown signal arrives.
async fn run_daemon(services: Services) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    println!("[{}] Custodian v{} starting...", now, VERSION);
    println!("[{}] Guarding {}", now, services.config.project_root);

    if services.vcs.available().await {
        if let Ok(Some(status)) = services.vcs.status().await {
            println!("[{}] VCS: branch {} ({} uncommitted)", now, status.branch, status.uncommitted);
        }
    } else {
        println!("[{}] VCS: not available, running without branches", now);
    }

    let ctx = TaskContext {
        orchestrator: Arc::clone(&services.orchestrator),
        healer: Arc::clone(&services.healer),
        mutator: Arc::clone(&services.mutator),
        source: None,
        project_root: services.config.project_root.clone(),
    };

    let mut daemon = create_daemon(DaemonOptions::default());
    daemon.start(ctx);

    shutdown_signal().await;
    let now = chrono::Utc::now().to_rfc3339();
    println!("[{}] Shutting down gracefully...", now);
    daemon.stop();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                let now = chrono::Utc::now().to_rfc3339();
                println!("\n[{}] Received SIGINT, shutting down...", now);
            }
            _ = sigterm.recv() => {
                let now = chrono::Utc::now().to_rfc3339();
                println!("\n[{}] Received SIGTERM, shutting down...", now);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        let now = chrono::Utc::now().to_rfc3339();
        println!("\n[{}] Received shutdown signal...", now);
    }
}

// ---- Entry Point ------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("custodian=info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.init {
        if let Err(e) = init_project(&cli.root) {
            eprintln!("Init failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let services = match build_services(&cli.root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = dispatch(&cli, services).await;
    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red(), e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli, services: Services) -> Result<()> {
    if cli.emergency_stop {
        services.orchestrator.emergency_stop(true);
        println!("{}", "Emergency stop activated. All modifications blocked.".red());
        return Ok(());
    }

    if cli.resume {
        services.orchestrator.emergency_stop(false);
        println!("{}", "Emergency stop cleared.".green());
        return Ok(());
    }

    if cli.status {
        return show_status(&services).await;
    }

    if let Some(path) = &cli.review {
        return submit_review(&services, path).await;
    }

    if let Some(id) = &cli.apply {
        let done = services.orchestrator.apply_suggestion(id, cli.force).await?;
        print_outcome(&done);
        return Ok(());
    }

    if let Some(id) = &cli.approve {
        return approve_suggestion(&services, id, cli.yes).await;
    }

    if let Some(id) = &cli.reject {
        let done = services.orchestrator.reject(id, &cli.reason)?;
        print_outcome(&done);
        return Ok(());
    }

    if let Some(path) = &cli.rollback {
        let attempt = services.mutator.rollback_latest(path)?;
        println!("Rollback of {}: {:?}", path, attempt.result);
        return Ok(());
    }

    if cli.health || cli.heal {
        return run_health(&services, cli.heal).await;
    }

    if cli.run {
        return run_daemon(services).await;
    }

    println!("Run \"custodian --help\" for usage information.");
    println!("Run \"custodian --init\" to set up a project, then \"custodian --run\".");
    Ok(())
}
