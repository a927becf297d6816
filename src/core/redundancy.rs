//! Optional forward-error-correction sidecars for the encrypted artifact.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::tools::Tool;
use crate::error::Result;

const STEP: &str = "redundancy";
const SIDECAR_EXT: &str = "par2";

/// Create FEC sidecars next to the artifact and record them on it.
///
/// A missing tool or a failing encoder is escalated, never fatal by itself.
pub async fn protect(ctx: &RunContext, artifact: &mut ArchiveArtifact) -> Result<Outcome> {
    let percent = ctx.config.redundancy_percent;
    if percent == 0 {
        return Ok(Outcome::Success);
    }

    let program = ctx.tools.program(Tool::Par2);
    if !ctx.tools.has(Tool::Par2) {
        return exec::fail(
            ctx,
            STEP,
            Tier::Escalate,
            format!("`{}` is not available, artifact will have no redundancy", program),
        )
        .await;
    }

    let index = sidecar_index(&artifact.file);
    let cmd = Invocation::new(program)
        .arg("create")
        .arg("-q")
        .arg(format!("-r{}", percent))
        .arg("-n1")
        .arg("--")
        .arg(&index)
        .arg(&artifact.file);

    let outcome = exec::invoke(ctx, STEP, &cmd, Tier::Escalate).await?;
    if outcome.is_success() {
        artifact.sidecars = find_sidecars(&artifact.dir, &artifact.file);
        info!(percent, sidecars = artifact.sidecars.len(), "Redundancy created");
    }
    Ok(outcome)
}

fn sidecar_index(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

/// Sidecars are every `<artifact name>*.par2` file in the epoch directory.
fn find_sidecars(dir: &Path, artifact: &Path) -> Vec<PathBuf> {
    let Some(stem) = artifact.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Vec::new();
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list redundancy sidecars");
            return Vec::new();
        }
    };

    let mut sidecars: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.starts_with(&stem) && name.ends_with(&format!(".{}", SIDECAR_EXT))
        })
        .collect();
    sidecars.sort();
    sidecars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ToolsConfig};
    use crate::context::test_support::with_tools;
    use crate::core::models::Epoch;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn artifact_in(dir: &Path) -> ArchiveArtifact {
        let epoch = Epoch::from_secs(1_700_000_000);
        let file = dir.join("1700000000.tar.xz.enc");
        fs::write(&file, b"ciphertext").unwrap();
        ArchiveArtifact::new(epoch, dir.to_path_buf(), file)
    }

    fn context(percent: u8, par2: Option<&Path>) -> RunContext {
        let tools = ToolsConfig {
            par2: par2
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "par2".to_string()),
            ..Default::default()
        };
        let available: &[Tool] = if par2.is_some() { &[Tool::Par2] } else { &[] };
        with_tools(
            AppConfig {
                redundancy_percent: percent,
                non_interactive: true,
                tools,
                ..Default::default()
            },
            available,
        )
    }

    #[test]
    fn sidecar_index_appends_extension() {
        assert_eq!(
            sidecar_index(Path::new("/w/1/1.tar.xz.enc")),
            PathBuf::from("/w/1/1.tar.xz.enc.par2")
        );
    }

    #[tokio::test]
    async fn disabled_redundancy_does_nothing() {
        let temp = tempdir().unwrap();
        let mut artifact = artifact_in(temp.path());
        let ctx = context(0, None);

        let outcome = protect(&ctx, &mut artifact).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert!(artifact.sidecars.is_empty());
        assert_eq!(ctx.ledger().count(), 0);
    }

    #[tokio::test]
    async fn missing_tool_is_escalated() {
        let temp = tempdir().unwrap();
        let mut artifact = artifact_in(temp.path());
        let ctx = context(10, None);

        let outcome = protect(&ctx, &mut artifact).await.unwrap();
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(ctx.ledger().count(), 1);
    }

    #[tokio::test]
    async fn sidecars_are_recorded() {
        let temp = tempdir().unwrap();
        let bin = tempdir().unwrap();
        let par2 = bin.path().join("par2");
        fs::write(
            &par2,
            "#!/bin/sh\nfor a; do prev=$cur; cur=$a; done\n: > \"$prev\"\n: > \"${prev%.par2}.vol00+01.par2\"\n",
        )
        .unwrap();
        fs::set_permissions(&par2, fs::Permissions::from_mode(0o755)).unwrap();

        let mut artifact = artifact_in(temp.path());
        let ctx = context(10, Some(&par2));

        let outcome = protect(&ctx, &mut artifact).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(artifact.sidecars.len(), 2);
        assert!(artifact.sidecars.iter().all(|p| p.starts_with(temp.path())));
    }
}
