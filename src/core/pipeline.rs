//! Builds the encrypted archive inside the working set.
//!
//! Steps run strictly in order and each one needs the previous to succeed:
//! validate sources, compile the exclude list, `tar | compressor`, encrypt,
//! then the optional redundancy and self-replication stages.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::redundancy;
use crate::core::tools::Tool;
use crate::core::verifier::compare_copy;
use crate::core::workspace::Workspace;
use crate::error::{BackupError, Result};

const STEP_ARCHIVE: &str = "archive";
const STEP_ENCRYPT: &str = "encrypt";
const STEP_SELF_COPY: &str = "self-replicate";

/// Run the whole pipeline and return the finished artifact.
pub async fn build(ctx: &RunContext, workspace: &Workspace) -> Result<ArchiveArtifact> {
    validate_sources(&ctx.config.sources)?;
    compile_excludes(&ctx.config.exclude, &workspace.exclude_file())?;

    let compressed = archive(ctx, workspace).await?;
    let encrypted = encrypt(ctx, workspace, &compressed).await?;
    workspace.remove_file(&compressed);

    let mut artifact = ArchiveArtifact::new(
        workspace.epoch(),
        workspace.epoch_dir().to_path_buf(),
        encrypted,
    );

    if ctx.config.redundancy_percent > 0 {
        redundancy::protect(ctx, &mut artifact).await?;
    }

    if ctx.config.self_replicate {
        self_replicate(ctx, &mut artifact).await?;
    }

    info!(artifact = %artifact.file.display(), files = artifact.files().len(), "Artifact ready");
    Ok(artifact)
}

/// Every source must be an existing directory. A backup that silently
/// drops a source is worse than no backup.
pub fn validate_sources(sources: &[PathBuf]) -> Result<()> {
    for source in sources {
        if !source.is_dir() {
            error!(source = %source.display(), "Source path missing");
            return Err(BackupError::SourceMissing(source.clone()));
        }
    }
    Ok(())
}

fn compile_excludes(patterns: &[String], file: &Path) -> Result<()> {
    let mut contents = patterns.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    fs::write(file, contents)
        .map_err(|e| BackupError::io(format!("failed to write {}", file.display()), e))?;
    info!(patterns = patterns.len(), file = %file.display(), "Exclude list compiled");
    Ok(())
}

async fn archive(ctx: &RunContext, workspace: &Workspace) -> Result<PathBuf> {
    let compressor = ctx.tools.compressor();
    let output = workspace.compressed_path(compressor.extension());

    let mut exclude_arg = std::ffi::OsString::from("--exclude-from=");
    exclude_arg.push(workspace.exclude_file());

    let tar = Invocation::new(ctx.tools.program(Tool::Tar))
        .args(["-c", "-f", "-"])
        .arg(exclude_arg)
        .arg("--")
        .args(&ctx.config.sources);
    let compress =
        Invocation::new(ctx.tools.program(Tool::Compressor)).args(compressor.args());

    exec::invoke_pipeline(ctx, STEP_ARCHIVE, &[tar, compress], &output, Tier::Abort).await?;
    Ok(output)
}

async fn encrypt(ctx: &RunContext, workspace: &Workspace, input: &Path) -> Result<PathBuf> {
    let enc = &ctx.config.encryption;
    let output = workspace.artifact_path(ctx.tools.compressor().extension());

    let cmd = Invocation::new(ctx.tools.program(Tool::Openssl))
        .args(["enc", "-e"])
        .arg(format!("-{}", enc.cipher))
        .args(["-md", enc.digest.as_str()])
        .arg("-pbkdf2")
        .arg("-iter")
        .arg(enc.kdf_iterations.to_string())
        .arg("-salt")
        .arg("-in")
        .arg(input)
        .arg("-out")
        .arg(&output)
        .arg("-pass")
        .arg(enc.pass_arg());

    exec::invoke(ctx, STEP_ENCRYPT, &cmd, Tier::Abort).await?;
    Ok(output)
}

/// Copy the orchestrator itself next to the artifact so a restore never
/// depends on having the tool around.
async fn self_replicate(ctx: &RunContext, artifact: &mut ArchiveArtifact) -> Result<Outcome> {
    let source = match &ctx.config.self_copy_source {
        Some(path) => path.clone(),
        None => match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                return exec::fail(
                    ctx,
                    STEP_SELF_COPY,
                    Tier::Escalate,
                    format!("cannot locate own executable: {}", e),
                )
                .await;
            }
        },
    };

    let Some(name) = source.file_name() else {
        return exec::fail(
            ctx,
            STEP_SELF_COPY,
            Tier::Escalate,
            format!("{} has no file name", source.display()),
        )
        .await;
    };
    let dest = artifact.dir.join(name);

    let copy_source = source.clone();
    let copy_dest = dest.clone();
    let copied = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        fs::copy(&copy_source, &copy_dest)?;
        compare_copy(&copy_source, &copy_dest)
    })
    .await;

    let detail = match copied {
        Ok(Ok(None)) => {
            info!(source = %source.display(), "Self-replicated");
            artifact.self_copy = Some(dest);
            return Ok(Outcome::Success);
        }
        Ok(Ok(Some(reason))) => format!("copy of {} failed verification: {}", source.display(), reason),
        Ok(Err(e)) => format!("cannot copy {}: {:#}", source.display(), e),
        Err(e) => format!("copy task failed: {}", e),
    };

    exec::fail(ctx, STEP_SELF_COPY, Tier::Escalate, detail).await
}
