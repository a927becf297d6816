use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::tools::Tool;
use crate::core::transfer_engine::{TransferEngine, as_directory};
use crate::core::verifier::compare_copy;
use crate::error::Result;
use async_trait::async_trait;
use nix::unistd::{AccessFlags, access};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{Instrument, debug, info, info_span};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

const STEP: &str = "local-copy";
const STEP_VERIFY: &str = "local-verify";

/// Copies the epoch directory onto a locally mounted path.
///
/// Uses rsync when it is available: one content pass, then a `--checksum`
/// pass as verification. Otherwise falls back to a native per-file copy:
/// - Large buffered I/O
/// - Per-file fsync for durability
/// - Timestamp and permission preservation
/// - BLAKE3 comparison of every copied file
/// - Detection of a removed block device
pub struct LocalEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

#[async_trait]
impl TransferEngine for LocalEngine {
    async fn transfer(&self, ctx: &RunContext, artifact: &ArchiveArtifact, address: &str) -> Result<Outcome> {
        let root = PathBuf::from(address);

        if !root.is_dir() {
            return exec::fail(
                ctx,
                STEP,
                Tier::Escalate,
                format!("destination path {} does not exist", root.display()),
            )
            .await;
        }

        if access(root.as_path(), AccessFlags::W_OK).is_err() {
            return exec::fail(
                ctx,
                STEP,
                Tier::Escalate,
                format!("destination path {} is not writable", root.display()),
            )
            .await;
        }

        let span = info_span!("local_copy", destination = %root.display());

        async {
            if ctx.tools.has(Tool::Rsync) {
                rsync_copy(ctx, artifact, &root).await
            } else {
                native_copy(ctx, artifact, &root, self.sync_files).await
            }
        }
        .instrument(span)
        .await
    }
}

async fn rsync_copy(ctx: &RunContext, artifact: &ArchiveArtifact, root: &Path) -> Result<Outcome> {
    let target = as_directory(&root.to_string_lossy());
    let rsync = ctx.tools.program(Tool::Rsync);

    // No trailing slash on the source: rsync creates <root>/<epoch>.
    let copy = Invocation::new(rsync)
        .args(["-a", "--"])
        .arg(&artifact.dir)
        .arg(&target);
    let outcome = exec::invoke(ctx, STEP, &copy, Tier::Escalate).await?;
    if !outcome.is_success() {
        return Ok(outcome);
    }

    let verify = Invocation::new(rsync)
        .args(["-a", "--checksum", "--"])
        .arg(&artifact.dir)
        .arg(&target);
    exec::invoke(ctx, STEP_VERIFY, &verify, Tier::LogOnly).await?;

    Ok(Outcome::Success)
}

async fn native_copy(
    ctx: &RunContext,
    artifact: &ArchiveArtifact,
    root: &Path,
    sync_files: bool,
) -> Result<Outcome> {
    let target = root.join(artifact.epoch.to_string());

    if let Err(e) = fs::create_dir_all(&target) {
        return exec::fail(ctx, STEP, Tier::Escalate, describe_io_error("cannot create", &target, &e)).await;
    }

    info!(target = %target.display(), "Starting native copy");

    let mut outcome = Outcome::Success;
    for source in artifact.files() {
        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = target.join(name);

        if !source.is_file() {
            exec::fail(
                ctx,
                STEP,
                Tier::Escalate,
                format!("source file {} is missing", source.display()),
            )
            .await?;
            outcome = Outcome::Failed;
            continue;
        }

        let (src, dst) = (source.to_path_buf(), dest.clone());
        let copied = tokio::task::spawn_blocking(move || copy_and_verify(&src, &dst, sync_files))
            .await
            .unwrap_or_else(|e| Err(format!("copy task failed: {}", e)));

        if let Err(detail) = copied {
            exec::fail(ctx, STEP, Tier::Escalate, detail).await?;
            outcome = Outcome::Failed;
        }
    }

    if outcome.is_success() {
        info!(target = %target.display(), files = artifact.files().len(), "Native copy complete");
    }
    Ok(outcome)
}

/// Copy one file and compare the result against the source.
fn copy_and_verify(source: &Path, dest: &Path, sync_file: bool) -> std::result::Result<u64, String> {
    let bytes = copy_single_file(source, dest, sync_file)?;

    match compare_copy(source, dest) {
        Ok(None) => Ok(bytes),
        Ok(Some(reason)) => Err(format!("{} failed verification: {}", dest.display(), reason)),
        Err(e) => Err(format!("cannot verify {}: {:#}", dest.display(), e)),
    }
}

/// Copy a single file with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> std::result::Result<u64, String> {
    let source_metadata =
        fs::metadata(source).map_err(|e| describe_io_error("cannot read metadata of", source, &e))?;

    let source_file = File::open(source).map_err(|e| describe_io_error("cannot open", source, &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(dest).map_err(|e| describe_io_error("cannot create", dest, &e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| describe_io_error("cannot read", source, &e))?;

        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| describe_io_error("cannot write", dest, &e))?;

        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| describe_io_error("cannot flush", dest, &e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| describe_io_error("cannot flush", dest, e.error()))?;

        inner
            .sync_all()
            .map_err(|e| describe_io_error("cannot sync", dest, &e))?;
    }

    // Log but don't fail - permission errors might happen on some filesystems
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    if let Err(e) = preserve_timestamps(&source_metadata, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    debug!(dest = %dest.display(), bytes = bytes_written, "Copied file");
    Ok(bytes_written)
}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source_metadata: &fs::Metadata, dest: &Path) -> io::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);

    filetime::set_file_times(dest, atime, mtime)
}

fn describe_io_error(action: &str, path: &Path, error: &io::Error) -> String {
    if is_device_removed_error(error) {
        format!(
            "{} {}: {} (device appears to have been removed)",
            action,
            path.display(),
            error
        )
    } else {
        format!("{} {}: {}", action, path.display(), error)
    }
}

/// Check if an I/O error indicates the device has been removed
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected => true,
        _ => {
            // Check for specific errno values that indicate device issues
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO       // I/O error
                    | libc::ENODEV  // No such device
                    | libc::ENXIO   // No such device or address
                    | libc::ENOMEDIUM // No medium found
                    | libc::EMEDIUMTYPE // Wrong medium type
                )
            } else {
                false
            }
        }
    }
}
