//! Private working set for one run.
//!
//! Layout under the configured temp directory:
//!
//! ```text
//! bkpipe.<uuid>/            mode 0700, unique per run
//!   exclude.lst             compiled exclude patterns
//!   <epoch>.tar.<ext>       compressed archive, removed after encryption
//!   <epoch>/                epoch directory, replicated as-is
//!     <epoch>.tar.<ext>.enc
//!     <epoch>.tar.<ext>.enc*.par2
//!     <self copy>
//! ```
//!
//! The tree is torn down by [`Workspace::release`], which also runs on drop,
//! so every exit path leaves nothing behind.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::exec::{Invocation, run_logged_blocking};
use crate::core::models::Epoch;
use crate::error::{BackupError, Result};

const ROOT_PREFIX: &str = "bkpipe.";
const EXCLUDE_FILE: &str = "exclude.lst";
/// Teardown walks this many levels below the root.
const RELEASE_DEPTH: usize = 2;

/// How temporary files are deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    Plain,
    /// Overwrite with the given shred program before unlinking.
    Secure { shred: String },
}

pub struct Workspace {
    root: PathBuf,
    epoch: Epoch,
    epoch_dir: PathBuf,
    cleanup: Cleanup,
    released: bool,
}

impl Workspace {
    pub fn acquire(base: &Path, epoch: Epoch, cleanup: Cleanup) -> Result<Self> {
        let root = base.join(format!("{}{}", ROOT_PREFIX, Uuid::now_v7()));

        DirBuilder::new()
            .mode(0o700)
            .create(&root)
            .map_err(|source| BackupError::TempCreation {
                path: base.to_path_buf(),
                source,
            })?;

        let workspace = Self {
            epoch_dir: root.join(epoch.to_string()),
            root,
            epoch,
            cleanup,
            released: false,
        };

        // On failure the partially built workspace is released by drop.
        fs::create_dir(&workspace.epoch_dir).map_err(|source| BackupError::TempCreation {
            path: workspace.epoch_dir.clone(),
            source,
        })?;

        info!(root = %workspace.root.display(), epoch = %epoch, "Working set acquired");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn epoch_dir(&self) -> &Path {
        &self.epoch_dir
    }

    pub fn exclude_file(&self) -> PathBuf {
        self.root.join(EXCLUDE_FILE)
    }

    /// Path of the compressed archive before encryption.
    pub fn compressed_path(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.tar.{}", self.epoch, extension))
    }

    /// Path of the encrypted archive inside the epoch directory.
    pub fn artifact_path(&self, extension: &str) -> PathBuf {
        self.epoch_dir
            .join(format!("{}.tar.{}.enc", self.epoch, extension))
    }

    /// Delete one file from the working set using the configured cleanup.
    pub fn remove_file(&self, path: &Path) {
        remove_file(path, &self.cleanup);
    }

    /// Tear down the working set. Failures are logged and never returned;
    /// calling this again after it ran is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.root.exists() {
            debug!(root = %self.root.display(), "Working set already removed");
            return;
        }

        let mut files = Vec::new();
        let mut dirs = Vec::new();
        collect_tree(&self.root, 1, &mut files, &mut dirs);

        for file in &files {
            remove_file(file, &self.cleanup);
        }

        // Children were pushed before their parents.
        dirs.push(self.root.clone());
        for dir in &dirs {
            if let Err(e) = fs::remove_dir(dir) {
                warn!(path = %dir.display(), error = %e, "Failed to remove directory");
            }
        }

        if self.root.exists() {
            warn!(root = %self.root.display(), "Working set not fully removed");
        } else {
            info!(root = %self.root.display(), "Working set released");
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

fn collect_tree(dir: &Path, depth: usize, files: &mut Vec<PathBuf>, dirs: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Failed to read directory during teardown");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        // Do not follow symlinks out of the working set.
        match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => {
                if depth < RELEASE_DEPTH {
                    collect_tree(&path, depth + 1, files, dirs);
                }
                dirs.push(path);
            }
            Ok(_) => files.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
        }
    }
}

fn remove_file(path: &Path, cleanup: &Cleanup) {
    if let Cleanup::Secure { shred } = cleanup {
        let is_regular = path
            .symlink_metadata()
            .map(|m| m.file_type().is_file())
            .unwrap_or(false);
        if is_regular {
            let cmd = Invocation::new(shred.as_str())
                .args(["-n", "3", "-z", "--"])
                .arg(path);
            if !run_logged_blocking(&cmd) {
                warn!(path = %path.display(), "Secure overwrite failed, removing anyway");
            }
        }
    }

    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn populate(ws: &Workspace) {
        fs::write(ws.exclude_file(), "*.tmp\n").unwrap();
        fs::write(ws.compressed_path("xz"), b"compressed").unwrap();
        fs::write(ws.artifact_path("xz"), b"encrypted").unwrap();
        fs::write(ws.epoch_dir().join("bkpipe"), b"binary").unwrap();
    }

    #[test]
    fn acquire_creates_private_tree() {
        let temp = tempdir().unwrap();
        let epoch = Epoch::from_secs(1_700_000_000);
        let ws = Workspace::acquire(temp.path(), epoch, Cleanup::Plain).unwrap();

        assert!(ws.root().starts_with(temp.path()));
        assert!(ws.root().file_name().unwrap().to_string_lossy().starts_with("bkpipe."));
        assert_eq!(ws.epoch_dir(), ws.root().join("1700000000"));
        assert!(ws.epoch_dir().is_dir());

        let mode = fs::metadata(ws.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn acquire_names_are_unique() {
        let temp = tempdir().unwrap();
        let epoch = Epoch::from_secs(1_700_000_000);
        let a = Workspace::acquire(temp.path(), epoch, Cleanup::Plain).unwrap();
        let b = Workspace::acquire(temp.path(), epoch, Cleanup::Plain).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn acquire_fails_without_base() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing");
        let result = Workspace::acquire(&missing, Epoch::now(), Cleanup::Plain);
        assert!(matches!(result, Err(BackupError::TempCreation { .. })));
    }

    #[test]
    fn release_removes_everything() {
        let temp = tempdir().unwrap();
        let mut ws = Workspace::acquire(temp.path(), Epoch::now(), Cleanup::Plain).unwrap();
        populate(&ws);
        let root = ws.root().to_path_buf();

        ws.release();

        assert!(!root.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_twice_is_a_noop() {
        let temp = tempdir().unwrap();
        let mut ws = Workspace::acquire(temp.path(), Epoch::now(), Cleanup::Plain).unwrap();
        populate(&ws);

        ws.release();
        ws.release();
        drop(ws);

        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn drop_releases() {
        let temp = tempdir().unwrap();
        {
            let ws = Workspace::acquire(temp.path(), Epoch::now(), Cleanup::Plain).unwrap();
            populate(&ws);
        }
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn release_tolerates_externally_removed_root() {
        let temp = tempdir().unwrap();
        let mut ws = Workspace::acquire(temp.path(), Epoch::now(), Cleanup::Plain).unwrap();
        fs::remove_dir_all(ws.root()).unwrap();
        ws.release();
    }

    #[test]
    fn secure_release_shreds_then_removes() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("base");
        fs::create_dir(&base).unwrap();

        // Stub shred that records each file it was asked to overwrite.
        let log = temp.path().join("shredded.log");
        let shred = temp.path().join("shred");
        fs::write(
            &shred,
            format!(
                "#!/bin/sh\nfor last; do :; done\necho \"$last\" >> {}\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&shred, fs::Permissions::from_mode(0o755)).unwrap();

        let cleanup = Cleanup::Secure {
            shred: shred.display().to_string(),
        };
        let mut ws = Workspace::acquire(&base, Epoch::now(), cleanup).unwrap();
        populate(&ws);
        ws.release();

        assert_eq!(fs::read_dir(&base).unwrap().count(), 0);
        let shredded = fs::read_to_string(&log).unwrap();
        assert_eq!(shredded.lines().count(), 4);
        assert!(shredded.contains("exclude.lst"));
    }

    #[test]
    fn secure_release_without_shred_still_removes() {
        let temp = tempdir().unwrap();
        let cleanup = Cleanup::Secure {
            shred: "definitely-not-a-real-tool-7f3a".to_string(),
        };
        let mut ws = Workspace::acquire(temp.path(), Epoch::now(), cleanup).unwrap();
        populate(&ws);
        ws.release();
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
