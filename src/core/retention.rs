//! Age-based pruning of archive directories at local destinations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::models::Destination;

static EPOCH_DIR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{10}$").expect("valid regex"));

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub struct RetentionCleaner {
    window: Option<Duration>,
}

impl RetentionCleaner {
    /// `days == 0` disables pruning.
    pub fn new(days: u32) -> Self {
        let window = (days > 0).then(|| Duration::from_secs(u64::from(days) * SECS_PER_DAY));
        Self { window }
    }

    /// Prune every local destination in `destinations`; other classes are
    /// skipped. Returns the directories removed.
    pub fn prune_all(&self, destinations: &[Destination]) -> Vec<PathBuf> {
        let Some(window) = self.window else {
            info!("Retention disabled, nothing pruned");
            return Vec::new();
        };

        let now = SystemTime::now();
        destinations
            .iter()
            .filter_map(|d| match d {
                Destination::Local(root) => Some(root),
                _ => None,
            })
            .flat_map(|root| prune_destination(root, window, now))
            .collect()
    }
}

/// Remove archive directories under `root` last modified before `now - window`.
///
/// Only immediate subdirectories named like an epoch are considered. Nothing
/// is kept back: if every archive is old enough, every archive goes.
pub fn prune_destination(root: &Path, window: Duration, now: SystemTime) -> Vec<PathBuf> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(destination = %root.display(), error = %e, "Cannot list destination for pruning");
            return Vec::new();
        }
    };

    let mut archives = 0usize;
    let mut candidates = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        let is_archive = entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && entry.file_name().to_str().is_some_and(|name| EPOCH_DIR.is_match(name));
        if !is_archive {
            continue;
        }
        archives += 1;

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| now.duration_since(modified).unwrap_or_default());
        match age {
            Ok(age) if age > window => candidates.push(path),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read modification time"),
        }
    }

    if archives > 0 && candidates.len() == archives {
        warn!(
            destination = %root.display(),
            archives,
            "Every archive at this destination is past retention and will be removed"
        );
    }

    candidates.sort();
    let mut removed = Vec::with_capacity(candidates.len());
    for path in candidates {
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Pruned archive");
                removed.push(path);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune archive"),
        }
    }

    debug!(destination = %root.display(), archives, removed = removed.len(), "Retention pass done");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::tempdir;

    fn age_dir(path: &Path, days: u64) {
        let when = SystemTime::now() - Duration::from_secs(days * SECS_PER_DAY);
        filetime::set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
    }

    #[test]
    fn removes_only_old_epoch_directories() {
        let dest = tempdir().unwrap();
        let old = dest.path().join("1000000000");
        let fresh = dest.path().join("9999999999");
        let old_other = dest.path().join("photos");
        let short = dest.path().join("12345");
        for dir in [&old, &fresh, &old_other, &short] {
            fs::create_dir(dir).unwrap();
        }
        fs::write(old.join("1000000000.tar.xz.enc"), b"x").unwrap();
        age_dir(&old, 40);
        age_dir(&old_other, 40);
        age_dir(&short, 40);

        let removed = RetentionCleaner::new(30).prune_all(&[Destination::Local(dest.path().to_path_buf())]);

        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(old_other.exists());
        assert!(short.exists());
    }

    #[test]
    fn epoch_named_files_are_ignored() {
        let dest = tempdir().unwrap();
        let file = dest.path().join("1000000000");
        fs::write(&file, b"x").unwrap();
        age_dir(&file, 40);

        let removed = prune_destination(dest.path(), Duration::from_secs(SECS_PER_DAY), SystemTime::now());
        assert!(removed.is_empty());
        assert!(file.exists());
    }

    #[test]
    fn all_old_archives_are_removed() {
        let dest = tempdir().unwrap();
        for name in ["1000000000", "1000000001"] {
            let dir = dest.path().join(name);
            fs::create_dir(&dir).unwrap();
            age_dir(&dir, 90);
        }

        let removed = RetentionCleaner::new(30).prune_all(&[Destination::Local(dest.path().to_path_buf())]);
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn zero_days_disables_pruning() {
        let dest = tempdir().unwrap();
        let dir = dest.path().join("1000000000");
        fs::create_dir(&dir).unwrap();
        age_dir(&dir, 400);

        let removed = RetentionCleaner::new(0).prune_all(&[Destination::Local(dest.path().to_path_buf())]);
        assert!(removed.is_empty());
        assert!(dir.exists());
    }

    #[test]
    fn missing_destination_is_skipped() {
        let removed = RetentionCleaner::new(30).prune_all(&[
            Destination::Local(PathBuf::from("/nonexistent/bkpipe-dest")),
            Destination::CloudCopy("b2:".to_string()),
        ]);
        assert!(removed.is_empty());
    }
}
