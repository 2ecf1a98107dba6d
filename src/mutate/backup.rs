//! Backup Storage
//!
//! Timestamped, content-hash-suffixed copies of files about to be
//! modified, organized under `.custodian/backups/<sanitized relative
//! path>/`. Backups are pruned after a configurable number of days.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

/// Replace path separators so a relative path becomes one directory name.
pub fn sanitize_rel_path(rel: &str) -> String {
    rel.trim_start_matches("./")
        .replace(['/', '\\'], "__")
        .replace("..", "_")
}

/// Store of backup copies for one project.
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: PathBuf) -> Self {
        BackupStore { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source` into the store before it is overwritten. `rel` is the
    /// project-relative path used for organization; `content_hash8` is the
    /// 8-character hash of the current content.
    pub fn create(&self, source: &Path, rel: &str, content_hash8: &str) -> Result<PathBuf> {
        let dir = self.root.join(sanitize_rel_path(rel));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create backup dir {}", dir.display()))?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        // Nanosecond precision keeps names unique under rapid re-edits.
        let stamp = Utc::now().format("%Y%m%d%H%M%S%9f");
        let backup_path = dir.join(format!("{}.{}.{}.bak", name, stamp, content_hash8));

        fs::copy(source, &backup_path).with_context(|| {
            format!(
                "Failed to back up {} to {}",
                source.display(),
                backup_path.display()
            )
        })?;

        debug!("Backed up {} -> {}", source.display(), backup_path.display());
        Ok(backup_path)
    }

    /// Most recent backup for a project-relative path, if any.
    pub fn latest_for(&self, rel: &str) -> Option<PathBuf> {
        let dir = self.root.join(sanitize_rel_path(rel));
        let entries = fs::read_dir(&dir).ok()?;

        let mut backups: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "bak").unwrap_or(false))
            .collect();

        // Timestamps sort lexicographically.
        backups.sort();
        backups.pop()
    }

    /// Restore `backup` over `target`, byte for byte.
    pub fn restore(&self, backup: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::copy(backup, target).with_context(|| {
            format!(
                "Failed to restore {} from {}",
                target.display(),
                backup.display()
            )
        })?;
        Ok(())
    }

    /// Delete backups older than `max_age_days`. Returns how many were
    /// removed.
    pub fn prune(&self, max_age_days: u32) -> Result<u32> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(max_age_days) * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        if !self.root.exists() {
            return Ok(0);
        }

        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.path().is_dir() {
                continue;
            }
            for file in fs::read_dir(dir_entry.path())? {
                let file = file?;
                let meta = match file.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if modified < cutoff {
                    if let Err(e) = fs::remove_file(file.path()) {
                        warn!("Failed to prune backup {}: {}", file.path().display(), e);
                    } else {
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            debug!("Pruned {} expired backups", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_rel_path() {
        assert_eq!(sanitize_rel_path("src/api/auth.py"), "src__api__auth.py");
        assert_eq!(sanitize_rel_path("./src/a.py"), "src__a.py");
        assert_eq!(sanitize_rel_path("../evil.py"), "___evil.py");
    }

    #[test]
    fn test_create_and_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));

        let src = tmp.path().join("a.py");
        fs::write(&src, "v1\n").unwrap();
        let b1 = store.create(&src, "a.py", "11111111").unwrap();
        fs::write(&src, "v2\n").unwrap();
        let b2 = store.create(&src, "a.py", "22222222").unwrap();

        assert!(b1.exists() && b2.exists());
        assert_eq!(store.latest_for("a.py").unwrap(), b2);
        assert!(store.latest_for("missing.py").is_none());
    }

    #[test]
    fn test_restore_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));

        let src = tmp.path().join("a.py");
        fs::write(&src, "original content\n").unwrap();
        let backup = store.create(&src, "a.py", "abcd1234").unwrap();

        fs::write(&src, "clobbered\n").unwrap();
        store.restore(&backup, &src).unwrap();
        assert_eq!(fs::read_to_string(&src).unwrap(), "original content\n");
    }

    #[test]
    fn test_prune_respects_age() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));

        let src = tmp.path().join("a.py");
        fs::write(&src, "v1\n").unwrap();
        store.create(&src, "a.py", "11111111").unwrap();

        // Everything is fresh, so nothing should be removed.
        assert_eq!(store.prune(1).unwrap(), 0);
        // A zero-day retention removes all existing backups.
        assert_eq!(store.prune(0).unwrap(), 1);
        assert!(store.latest_for("a.py").is_none());
    }
}
