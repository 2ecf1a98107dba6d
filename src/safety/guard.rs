//! Safety Guard
//!
//! Pure policy evaluation over a proposed change plus mutable counters.
//! Checks run in a fixed order and the first failure wins. Every block is
//! appended to the safety audit trail. Callers must report accepted
//! attempts back via [`SafetyGuard::record_outcome`] so the rate, cooldown,
//! and failure-streak state stays current.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CustodianConfig;
use crate::hashing::prefix_hash;
use crate::state::Database;
use crate::types::{SafetyEvent, SafetyLevel, SafetyVerdict, SafetyViolation};

use super::patterns::PatternSet;

/// How many recent attempts the circular-modification check looks at.
const CIRCULAR_ATTEMPT_WINDOW: usize = 5;

/// Same-path repeats within the window that count as circular.
const CIRCULAR_REPEAT_THRESHOLD: usize = 3;

/// Applied content hashes remembered per guard.
const RECENT_HASH_WINDOW: usize = 10;

/// In-memory safety event ring size.
const EVENT_RING_SIZE: usize = 100;

/// Which checks a safety level enables. Emergency stop and lockdown are
/// never toggleable; the critical-file set is always enforced.
#[derive(Clone, Copy, Debug)]
struct LevelPolicy {
    sensitive_prefixes: bool,
    rate_limit: bool,
    quotas: bool,
    cooldown: bool,
    failure_streak: bool,
    patterns: bool,
    circular: bool,
    size_limit: bool,
}

impl LevelPolicy {
    fn for_level(level: SafetyLevel) -> Self {
        match level {
            // Permissive drops the pattern scan and the cooldown; the
            // quota, streak, and circular breakers stay on.
            SafetyLevel::Permissive => LevelPolicy {
                sensitive_prefixes: false,
                rate_limit: true,
                quotas: true,
                cooldown: false,
                failure_streak: true,
                patterns: false,
                circular: true,
                size_limit: true,
            },
            SafetyLevel::Normal => LevelPolicy {
                sensitive_prefixes: false,
                rate_limit: true,
                quotas: true,
                cooldown: true,
                failure_streak: true,
                patterns: true,
                circular: true,
                size_limit: true,
            },
            // Restrictive only adds protection, never removes it.
            SafetyLevel::Restrictive | SafetyLevel::Lockdown => LevelPolicy {
                sensitive_prefixes: true,
                rate_limit: true,
                quotas: true,
                cooldown: true,
                failure_streak: true,
                patterns: true,
                circular: true,
                size_limit: true,
            },
        }
    }
}

/// Mutable counters shared between the apply path and status reporting.
/// All reads and writes go through one mutex so snapshots are consistent.
struct GuardState {
    emergency_stop: bool,
    /// Instants of accepted modifications within the rolling window.
    window: VecDeque<DateTime<Utc>>,
    hour_anchor: DateTime<Utc>,
    hour_count: u32,
    day_anchor: DateTime<Utc>,
    day_count: u32,
    last_accepted: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    /// Paths of the last few tracked attempts, success or failure.
    recent_attempts: VecDeque<String>,
    /// (path, prefix hash) of recently applied content.
    recent_hashes: VecDeque<(String, String)>,
    recent_events: VecDeque<SafetyEvent>,
}

impl GuardState {
    fn new() -> Self {
        let now = Utc::now();
        GuardState {
            emergency_stop: false,
            window: VecDeque::new(),
            hour_anchor: now,
            hour_count: 0,
            day_anchor: now,
            day_count: 0,
            last_accepted: None,
            consecutive_failures: 0,
            recent_attempts: VecDeque::new(),
            recent_hashes: VecDeque::new(),
            recent_events: VecDeque::new(),
        }
    }

    fn same_hour(&self, now: DateTime<Utc>) -> bool {
        self.hour_anchor.date_naive() == now.date_naive()
            && self.hour_anchor.hour() == now.hour()
    }

    fn same_day(&self, now: DateTime<Utc>) -> bool {
        self.day_anchor.date_naive() == now.date_naive()
    }

    /// Quota counters reset on wall-clock boundaries, unlike the rolling
    /// window.
    fn roll_quotas(&mut self, now: DateTime<Utc>) {
        if !self.same_hour(now) {
            self.hour_anchor = now;
            self.hour_count = 0;
        }
        if !self.same_day(now) {
            self.day_anchor = now;
            self.day_count = 0;
        }
    }

    fn prune_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        while let Some(front) = self.window.front() {
            if *front < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Consistent snapshot of the guard's counters for status reporting.
#[derive(Clone, Debug)]
pub struct SafetyStats {
    pub level: SafetyLevel,
    pub emergency_stop: bool,
    pub mods_last_hour: u32,
    pub hour_quota_used: u32,
    pub hour_quota_max: u32,
    pub day_quota_used: u32,
    pub day_quota_max: u32,
    pub cooldown_remaining_secs: u64,
    pub consecutive_failures: u32,
    pub recent_events: Vec<SafetyEvent>,
}

/// The code-mutation gatekeeper's first line of defense.
pub struct SafetyGuard {
    config: CustodianConfig,
    patterns: PatternSet,
    db: Arc<Database>,
    state: Mutex<GuardState>,
}

/// Meta key under which the emergency stop survives restarts.
const EMERGENCY_STOP_KEY: &str = "emergency_stop";

impl SafetyGuard {
    pub fn new(config: CustodianConfig, patterns: PatternSet, db: Arc<Database>) -> Self {
        let mut state = GuardState::new();
        // The kill switch must hold across process restarts, so it lives
        // in the state store, not just this guard's counters.
        state.emergency_stop = matches!(
            db.get_meta(EMERGENCY_STOP_KEY),
            Ok(Some(v)) if v == "1"
        );
        if state.emergency_stop {
            warn!("Emergency stop is active (persisted); all modifications halted");
        }

        SafetyGuard {
            config,
            patterns,
            db,
            state: Mutex::new(state),
        }
    }

    /// Evaluate a proposed change. Fixed check order, first failure wins.
    pub fn evaluate(&self, path: &str, proposed_content: &str) -> SafetyVerdict {
        let level = self.config.safety_level;
        let policy = LevelPolicy::for_level(level);
        let now = Utc::now();

        let mut state = self.state.lock().unwrap();

        // 1. Emergency stop. The persisted flag wins so a stop raised or
        // cleared by another process (the CLI against a running daemon)
        // takes effect without a restart.
        state.emergency_stop = self.read_persisted_stop(state.emergency_stop);
        if state.emergency_stop {
            return self.block(&mut state, path, SafetyViolation::EmergencyStopActive,
                "Emergency stop is active; all modifications are halted".to_string());
        }

        // 2. Lockdown blocks unconditionally.
        if level == SafetyLevel::Lockdown {
            return self.block(&mut state, path, SafetyViolation::Lockdown,
                "Safety level is lockdown; all modifications are blocked".to_string());
        }

        // 3. Critical file set, enforced at every level.
        if self.is_critical_path(path, policy.sensitive_prefixes) {
            return self.block(&mut state, path, SafetyViolation::CriticalPathBlocked,
                format!("Critical file blocked: {}", path));
        }

        // 4. Sliding-window rate limit (rolling hour, not calendar hour).
        if policy.rate_limit {
            state.prune_window(now);
            let count = state.window.len() as u32;
            if count >= self.config.max_mods_per_hour {
                return self.block(&mut state, path, SafetyViolation::RateLimitExceeded,
                    format!(
                        "Rate limit exceeded: {} modifications in the last hour (max {})",
                        count, self.config.max_mods_per_hour
                    ));
            }
        }

        // 5. Hourly/daily quotas with wall-clock resets.
        if policy.quotas {
            state.roll_quotas(now);
            if state.hour_count >= self.config.max_mods_per_hour {
                let reason = format!("Hourly quota exhausted ({} used)", state.hour_count);
                return self.block(&mut state, path, SafetyViolation::QuotaExhausted, reason);
            }
            if state.day_count >= self.config.max_mods_per_day {
                let reason = format!("Daily quota exhausted ({} used)", state.day_count);
                return self.block(&mut state, path, SafetyViolation::QuotaExhausted, reason);
            }
        }

        // 6. Cooldown since the last accepted modification.
        if policy.cooldown {
            if let Some(last) = state.last_accepted {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                if elapsed < self.config.cooldown_secs {
                    let remaining = self.config.cooldown_secs - elapsed;
                    return self.block(&mut state, path, SafetyViolation::CooldownActive,
                        format!("Cooldown active: {}s remaining", remaining));
                }
            }
        }

        // 7. Consecutive-failure circuit breaker.
        if policy.failure_streak
            && state.consecutive_failures >= self.config.max_consecutive_failures
        {
            let reason = format!(
                "{} consecutive failures (max {}); blocked until a success",
                state.consecutive_failures, self.config.max_consecutive_failures
            );
            return self.block(&mut state, path, SafetyViolation::ConsecutiveFailures, reason);
        }

        // 8. Dangerous-pattern scan, naming every match.
        if policy.patterns {
            let hits = self.patterns.scan(proposed_content);
            if !hits.is_empty() {
                return self.block(&mut state, path, SafetyViolation::SuspiciousPattern,
                    format!("Suspicious patterns detected: {}", hits.join(", ")));
            }
        }

        // 9. Circular modification: same path hammered repeatedly, or
        // content identical to a recently applied version.
        if policy.circular {
            let repeats = state
                .recent_attempts
                .iter()
                .filter(|p| p.as_str() == path)
                .count();
            if repeats >= CIRCULAR_REPEAT_THRESHOLD {
                return self.block(&mut state, path, SafetyViolation::CircularModification,
                    format!(
                        "Circular modification: {} of the last {} attempts targeted {}",
                        repeats, CIRCULAR_ATTEMPT_WINDOW, path
                    ));
            }

            let hash = prefix_hash(
                proposed_content.as_bytes(),
                self.config.circular_hash_prefix_bytes,
            );
            let replay = state
                .recent_hashes
                .iter()
                .any(|(p, h)| p == path && *h == hash);
            if replay {
                return self.block(&mut state, path, SafetyViolation::CircularModification,
                    format!("Circular modification: content was recently applied to {}", path));
            }
        }

        // 10. Absolute change size ceiling.
        if policy.size_limit && proposed_content.len() > self.config.max_change_bytes {
            return self.block(&mut state, path, SafetyViolation::SizeLimitExceeded,
                format!(
                    "Change size {} exceeds ceiling of {} bytes",
                    proposed_content.len(),
                    self.config.max_change_bytes
                ));
        }

        SafetyVerdict::allow()
    }

    /// Report the outcome of an accepted attempt so counters stay current.
    pub fn record_outcome(&self, path: &str, content: &str, success: bool) {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();

        state.recent_attempts.push_back(path.to_string());
        while state.recent_attempts.len() > CIRCULAR_ATTEMPT_WINDOW {
            state.recent_attempts.pop_front();
        }

        if success {
            state.prune_window(now);
            state.window.push_back(now);
            state.roll_quotas(now);
            state.hour_count += 1;
            state.day_count += 1;
            state.last_accepted = Some(now);
            state.consecutive_failures = 0;

            let hash = prefix_hash(content.as_bytes(), self.config.circular_hash_prefix_bytes);
            state.recent_hashes.push_back((path.to_string(), hash));
            while state.recent_hashes.len() > RECENT_HASH_WINDOW {
                state.recent_hashes.pop_front();
            }
        } else {
            state.consecutive_failures += 1;
            warn!(
                "Modification of {} failed ({} consecutive)",
                path, state.consecutive_failures
            );
        }
    }

    /// Halt all further mutations until explicitly cleared. The flag is
    /// persisted so it survives process restarts.
    pub fn set_emergency_stop(&self, active: bool) {
        let mut state = self.state.lock().unwrap();
        state.emergency_stop = active;
        if let Err(e) = self
            .db
            .set_meta(EMERGENCY_STOP_KEY, if active { "1" } else { "0" })
        {
            warn!("Failed to persist emergency stop flag: {:#}", e);
        }
        if active {
            warn!("Emergency stop ACTIVATED");
        } else {
            info!("Emergency stop cleared");
        }
    }

    pub fn emergency_stop_active(&self) -> bool {
        let cached = self.state.lock().unwrap().emergency_stop;
        self.read_persisted_stop(cached)
    }

    /// Current persisted flag, falling back to the in-memory value when
    /// the store cannot answer.
    fn read_persisted_stop(&self, fallback: bool) -> bool {
        match self.db.get_meta(EMERGENCY_STOP_KEY) {
            Ok(Some(v)) => v == "1",
            Ok(None) => fallback,
            Err(_) => fallback,
        }
    }

    /// Snapshot of the counters, taken under a single lock.
    pub fn stats(&self) -> SafetyStats {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        state.prune_window(now);
        state.roll_quotas(now);

        let cooldown_remaining = state
            .last_accepted
            .map(|last| {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                self.config.cooldown_secs.saturating_sub(elapsed)
            })
            .unwrap_or(0);

        SafetyStats {
            level: self.config.safety_level,
            emergency_stop: state.emergency_stop,
            mods_last_hour: state.window.len() as u32,
            hour_quota_used: state.hour_count,
            hour_quota_max: self.config.max_mods_per_hour,
            day_quota_used: state.day_count,
            day_quota_max: self.config.max_mods_per_day,
            cooldown_remaining_secs: cooldown_remaining,
            consecutive_failures: state.consecutive_failures,
            recent_events: state.recent_events.iter().cloned().collect(),
        }
    }

    fn is_critical_path(&self, path: &str, include_prefixes: bool) -> bool {
        let normalized = path.trim_start_matches("./");
        let exact = self
            .config
            .critical_files
            .iter()
            .any(|f| normalized == f || path == f);
        if exact {
            return true;
        }

        if include_prefixes {
            return self.config.sensitive_dirs.iter().any(|dir| {
                Path::new(normalized).starts_with(dir)
            });
        }
        false
    }

    fn block(
        &self,
        state: &mut GuardState,
        path: &str,
        violation: SafetyViolation,
        reason: String,
    ) -> SafetyVerdict {
        let event = SafetyEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            file_path: path.to_string(),
            violation,
            detail: reason.clone(),
        };

        state.recent_events.push_back(event.clone());
        while state.recent_events.len() > EVENT_RING_SIZE {
            state.recent_events.pop_front();
        }

        if let Err(e) = self.db.insert_safety_event(&event) {
            warn!("Failed to persist safety event: {:#}", e);
        }

        warn!("Blocked modification of {}: {}", path, reason);
        SafetyVerdict::block(violation, reason)
    }

    /// Test hook: shift every time anchor back by `secs`, simulating the
    /// passage of time.
    #[cfg(test)]
    pub(crate) fn backdate_window(&self, secs: i64) {
        let mut state = self.state.lock().unwrap();
        for entry in state.window.iter_mut() {
            *entry = *entry - Duration::seconds(secs);
        }
        state.hour_anchor = state.hour_anchor - Duration::seconds(secs);
        state.day_anchor = state.day_anchor - Duration::seconds(secs);
        if let Some(last) = state.last_accepted.as_mut() {
            *last = *last - Duration::seconds(secs);
        }
    }
}
