use async_trait::async_trait;

use crate::context::RunContext;
use crate::core::exec::{self, Invocation, Outcome, Tier};
use crate::core::models::ArchiveArtifact;
use crate::core::tools::Tool;
use crate::core::transfer_engine::{TransferEngine, as_directory};
use crate::error::Result;

const STEP: &str = "sync-copy";
const STEP_VERIFY: &str = "sync-verify";

/// Pushes the epoch directory to `host:path` with rsync over ssh, then runs
/// a `--checksum` pass as a best-effort verification.
pub struct SyncCopyEngine;

#[async_trait]
impl TransferEngine for SyncCopyEngine {
    async fn transfer(&self, ctx: &RunContext, artifact: &ArchiveArtifact, address: &str) -> Result<Outcome> {
        let rsync = ctx.tools.program(Tool::Rsync);
        let ssh = ctx.tools.program(Tool::Ssh);
        let target = as_directory(address);

        let copy = Invocation::new(rsync)
            .args(["-a", "--partial", "-e", ssh, "--"])
            .arg(&artifact.dir)
            .arg(&target);
        let outcome = exec::invoke(ctx, STEP, &copy, Tier::Escalate).await?;
        if !outcome.is_success() {
            return Ok(outcome);
        }

        let verify = Invocation::new(rsync)
            .args(["-a", "--checksum", "-e", ssh, "--"])
            .arg(&artifact.dir)
            .arg(&target);
        exec::invoke(ctx, STEP_VERIFY, &verify, Tier::LogOnly).await?;

        Ok(Outcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ToolsConfig};
    use crate::context::test_support::{stub_tool, with_tools};
    use crate::core::models::Epoch;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn artifact() -> ArchiveArtifact {
        ArchiveArtifact::new(
            Epoch::from_secs(1_700_000_000),
            PathBuf::from("/w/1700000000"),
            PathBuf::from("/w/1700000000/1700000000.tar.xz.enc"),
        )
    }

    fn context(rsync: String) -> RunContext {
        with_tools(
            AppConfig {
                non_interactive: true,
                tools: ToolsConfig {
                    rsync,
                    ..Default::default()
                },
                ..Default::default()
            },
            &[Tool::Rsync, Tool::Ssh],
        )
    }

    #[tokio::test]
    async fn runs_transfer_then_checksum_pass() {
        let bin = tempdir().unwrap();
        let log = bin.path().join("rsync.log");
        let rsync = stub_tool(bin.path(), "rsync", &format!("echo \"$*\" >> {}", log.display()));
        let ctx = context(rsync);

        let outcome = SyncCopyEngine
            .transfer(&ctx, &artifact(), "nas:/srv/backups")
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "-a --partial -e ssh -- /w/1700000000 nas:/srv/backups/",
                "-a --checksum -e ssh -- /w/1700000000 nas:/srv/backups/",
            ]
        );
    }

    #[tokio::test]
    async fn failed_checksum_pass_is_not_counted() {
        let bin = tempdir().unwrap();
        // Succeeds on the transfer pass, fails on the checksum pass.
        let rsync = stub_tool(
            bin.path(),
            "rsync",
            "case \"$*\" in *--checksum*) exit 23;; esac\nexit 0",
        );
        let ctx = context(rsync);

        let outcome = SyncCopyEngine
            .transfer(&ctx, &artifact(), "nas:/srv/backups")
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(ctx.ledger().count(), 0);
    }

    #[tokio::test]
    async fn failed_transfer_skips_verification() {
        let bin = tempdir().unwrap();
        let log = bin.path().join("rsync.log");
        let rsync = stub_tool(
            bin.path(),
            "rsync",
            &format!("echo \"$*\" >> {}\nexit 12", log.display()),
        );
        let ctx = context(rsync);

        let outcome = SyncCopyEngine
            .transfer(&ctx, &artifact(), "nas:/srv/backups")
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(ctx.ledger().count(), 1);
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
    }
}
