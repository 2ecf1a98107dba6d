//! Custodian Configuration
//!
//! Loads and saves the gatekeeper's configuration from
//! `<project>/.custodian/custodian.json`. Every field is explicit and
//! individually env-overridable via `CUSTODIAN_*` variables; there is no
//! reflection-based merging.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::SafetyLevel;

/// Directory under the project root holding all custodian state.
pub const CUSTODIAN_DIR: &str = ".custodian";

/// Config file name within the custodian directory.
const CONFIG_FILENAME: &str = "custodian.json";

/// Subdirectory of [`CUSTODIAN_DIR`] holding file backups.
pub const BACKUP_DIR: &str = "backups";

/// Database file name within the custodian directory.
pub const DB_FILENAME: &str = "state.db";

/// Safety pattern / daemon schedule file within the custodian directory.
pub const SAFETY_FILENAME: &str = "safety.yml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustodianConfig {
    /// Master switch; when false the orchestrator refuses all applies.
    pub enabled: bool,
    /// Queue suggestions for explicit approval instead of auto-applying.
    pub require_human_approval: bool,
    /// Auto-approve low priority suggestions above the confidence
    /// threshold even when approval is otherwise required.
    pub auto_apply_low_risk: bool,
    /// Minimum confidence for any auto-approval rule to fire.
    pub auto_apply_confidence: f64,
    pub auto_commit: bool,
    /// Merge feature branches back to the default branch automatically.
    /// Dangerous; its own explicit opt-in, never inferred from
    /// `auto_commit`.
    pub auto_merge: bool,
    pub safety_level: SafetyLevel,
    pub max_mods_per_hour: u32,
    pub max_mods_per_day: u32,
    pub cooldown_secs: u64,
    pub max_consecutive_failures: u32,
    /// Absolute ceiling on proposed content size, in bytes.
    pub max_change_bytes: usize,
    /// Prefix length used for circular-modification content hashing.
    /// 0 hashes the full content.
    pub circular_hash_prefix_bytes: usize,
    pub validation_enabled: bool,
    pub validation_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub healing_cooldown_secs: u64,
    pub max_healing_per_day: u32,
    pub backup_retention_days: u32,
    /// Exact-match file set the guard never allows to change.
    pub critical_files: Vec<String>,
    /// Directory prefixes added to the blocked set in RESTRICTIVE level.
    pub sensitive_dirs: Vec<String>,
    /// Branches the VCS manager refuses to commit to directly.
    pub protected_branches: Vec<String>,
    pub project_root: String,
    /// Interpreter used for syntax/import/test/smoke checks.
    pub python_bin: String,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        CustodianConfig {
            enabled: true,
            require_human_approval: true,
            auto_apply_low_risk: false,
            auto_apply_confidence: 0.8,
            auto_commit: true,
            auto_merge: false,
            safety_level: SafetyLevel::Normal,
            max_mods_per_hour: 10,
            max_mods_per_day: 50,
            cooldown_secs: 60,
            max_consecutive_failures: 3,
            max_change_bytes: 100_000,
            circular_hash_prefix_bytes: 2000,
            validation_enabled: true,
            validation_timeout_secs: 30,
            test_timeout_secs: 120,
            healing_cooldown_secs: 300,
            max_healing_per_day: 10,
            backup_retention_days: 14,
            critical_files: vec![
                "src/api/auth.py".to_string(),
                "src/api/security.py".to_string(),
                "config/secrets.py".to_string(),
                ".env".to_string(),
                "wallet.json".to_string(),
            ],
            sensitive_dirs: vec![
                "src/api".to_string(),
                "config".to_string(),
                "migrations".to_string(),
            ],
            protected_branches: vec![
                "main".to_string(),
                "master".to_string(),
                "production".to_string(),
                "release".to_string(),
            ],
            project_root: ".".to_string(),
            python_bin: "python3".to_string(),
        }
    }
}

impl CustodianConfig {
    pub fn custodian_dir(&self) -> PathBuf {
        Path::new(&self.project_root).join(CUSTODIAN_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.custodian_dir().join(BACKUP_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.custodian_dir().join(DB_FILENAME)
    }

    pub fn safety_file(&self) -> PathBuf {
        self.custodian_dir().join(SAFETY_FILENAME)
    }
}

/// Returns the config file path for a project root.
pub fn config_path(project_root: &str) -> PathBuf {
    Path::new(project_root).join(CUSTODIAN_DIR).join(CONFIG_FILENAME)
}

/// Load the config for `project_root`: defaults, overlaid by the JSON file
/// if present, overlaid by `CUSTODIAN_*` env vars.
pub fn load_config(project_root: &str) -> Result<CustodianConfig> {
    let path = config_path(project_root);

    let mut config = if path.exists() {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?
    } else {
        CustodianConfig::default()
    };

    config.project_root = resolve_path(project_root);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Save the config to `<project>/.custodian/custodian.json`, creating the
/// directory if needed.
pub fn save_config(config: &CustodianConfig) -> Result<()> {
    let dir = config.custodian_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create custodian directory")?;
    }

    let path = config_path(&config.project_root);
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&path, &json)
        .with_context(|| format!("Failed to write config {}", path.display()))?;
    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

// ─── Env overrides ───────────────────────────────────────────────

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Apply `CUSTODIAN_*` environment overrides, field by field.
pub fn apply_env_overrides(config: &mut CustodianConfig) {
    if let Some(v) = env_bool("CUSTODIAN_ENABLED") {
        config.enabled = v;
    }
    if let Some(v) = env_bool("CUSTODIAN_REQUIRE_APPROVAL") {
        config.require_human_approval = v;
    }
    if let Some(v) = env_bool("CUSTODIAN_AUTO_APPLY_LOW_RISK") {
        config.auto_apply_low_risk = v;
    }
    if let Some(v) = env_f64("CUSTODIAN_AUTO_APPLY_CONFIDENCE") {
        config.auto_apply_confidence = v;
    }
    if let Some(v) = env_bool("CUSTODIAN_AUTO_COMMIT") {
        config.auto_commit = v;
    }
    if let Some(v) = env_bool("CUSTODIAN_AUTO_MERGE") {
        config.auto_merge = v;
    }
    if let Some(v) = std::env::var("CUSTODIAN_SAFETY_LEVEL")
        .ok()
        .and_then(|s| SafetyLevel::parse(&s))
    {
        config.safety_level = v;
    }
    if let Some(v) = env_u32("CUSTODIAN_MAX_MODS_PER_HOUR") {
        config.max_mods_per_hour = v;
    }
    if let Some(v) = env_u32("CUSTODIAN_MAX_MODS_PER_DAY") {
        config.max_mods_per_day = v;
    }
    if let Some(v) = env_u64("CUSTODIAN_COOLDOWN_SECS") {
        config.cooldown_secs = v;
    }
    if let Some(v) = env_u32("CUSTODIAN_MAX_CONSECUTIVE_FAILURES") {
        config.max_consecutive_failures = v;
    }
    if let Some(v) = env_usize("CUSTODIAN_MAX_CHANGE_BYTES") {
        config.max_change_bytes = v;
    }
    if let Some(v) = env_usize("CUSTODIAN_CIRCULAR_HASH_PREFIX_BYTES") {
        config.circular_hash_prefix_bytes = v;
    }
    if let Some(v) = env_bool("CUSTODIAN_VALIDATION_ENABLED") {
        config.validation_enabled = v;
    }
    if let Some(v) = env_u64("CUSTODIAN_VALIDATION_TIMEOUT_SECS") {
        config.validation_timeout_secs = v;
    }
    if let Some(v) = env_u64("CUSTODIAN_TEST_TIMEOUT_SECS") {
        config.test_timeout_secs = v;
    }
    if let Some(v) = env_u64("CUSTODIAN_HEALING_COOLDOWN_SECS") {
        config.healing_cooldown_secs = v;
    }
    if let Some(v) = env_u32("CUSTODIAN_MAX_HEALING_PER_DAY") {
        config.max_healing_per_day = v;
    }
    if let Some(v) = env_u32("CUSTODIAN_BACKUP_RETENTION_DAYS") {
        config.backup_retention_days = v;
    }
    if let Ok(v) = std::env::var("CUSTODIAN_PYTHON_BIN") {
        if !v.is_empty() {
            config.python_bin = v;
        }
    }
}
