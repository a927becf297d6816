use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::core::dispatcher::{DispatchReport, TargetDispatcher};
use crate::core::models::{Destination, Epoch};
use crate::core::pipeline;
use crate::core::planner;
use crate::core::retention::RetentionCleaner;
use crate::core::tools::{Tool, Toolbox};
use crate::core::transfer_engine::EngineSet;
use crate::core::workspace::{Cleanup, Workspace};
use crate::error::{BackupError, Result};

/// Programs without which no artifact can be built.
const PIPELINE_TOOLS: [Tool; 3] = [Tool::Tar, Tool::Compressor, Tool::Openssl];

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub epoch: Epoch,
    pub planned: usize,
    pub dispatch: DispatchReport,
    pub pruned: usize,
    /// Recoverable failures recorded by the escalation policy.
    pub errors: u64,
}

impl RunSummary {
    /// 0 for a clean run, 2 when recoverable failures were let through.
    pub fn exit_code(&self) -> u8 {
        if self.errors == 0 { 0 } else { 2 }
    }
}

/// Drives one backup run from preflight to teardown.
pub struct Orchestrator {
    ctx: RunContext,
    dispatcher: TargetDispatcher,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, engines: EngineSet) -> Self {
        Self {
            ctx,
            dispatcher: TargetDispatcher::new(engines),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Everything that can fail before the first side effect: config
    /// invariants, sources, pipeline tools, and the destination plan.
    pub async fn preflight(&self) -> Result<Vec<Destination>> {
        self.ctx.config.validate()?;
        pipeline::validate_sources(&self.ctx.config.sources)?;
        require_tools(&self.ctx.tools)?;
        planner::plan(&self.ctx).await
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let ctx = &self.ctx;
        info!(epoch = %ctx.epoch, sources = ctx.config.sources.len(), "Backup run starting");

        let plan = self.preflight().await?;

        let mut workspace = Workspace::acquire(&ctx.config.temp_dir, ctx.epoch, self.cleanup())?;
        let outcome = self.replicate(&workspace, &plan).await;

        // Release off the runtime; `Drop` covers a panic or a cancelled future.
        let root = workspace.root().to_path_buf();
        if let Err(e) = tokio::task::spawn_blocking(move || workspace.release()).await {
            error!(root = %root.display(), error = %e, "Workspace teardown task failed");
        }

        let (dispatch, pruned) = match outcome {
            Ok(done) => done,
            Err(e) => {
                error!(epoch = %ctx.epoch, error = %e, errors = ctx.ledger().count(), "Backup run failed");
                return Err(e);
            }
        };

        let summary = RunSummary {
            epoch: ctx.epoch,
            planned: plan.len(),
            dispatch,
            pruned,
            errors: ctx.ledger().count(),
        };

        if summary.errors == 0 {
            info!(
                epoch = %summary.epoch,
                destinations = summary.dispatch.attempted,
                pruned = summary.pruned,
                "Backup run complete"
            );
        } else {
            warn!(
                epoch = %summary.epoch,
                destinations = summary.dispatch.attempted,
                pruned = summary.pruned,
                errors = summary.errors,
                "Backup run complete with errors"
            );
        }
        Ok(summary)
    }

    /// Prune local destinations without building anything.
    pub async fn prune(&self) -> Result<usize> {
        self.ctx.config.validate_destinations()?;
        let retention_days = self.ctx.config.retention_days;
        let destinations = self.ctx.config.destinations.to_destinations();
        let removed = tokio::task::spawn_blocking(move || {
            RetentionCleaner::new(retention_days).prune_all(&destinations)
        })
        .await
        .map_err(|e| BackupError::StepFailed {
            step: "retention".to_string(),
            detail: e.to_string(),
        })?;
        info!(pruned = removed.len(), "Retention pass complete");
        Ok(removed.len())
    }

    async fn replicate(&self, workspace: &Workspace, plan: &[Destination]) -> Result<(DispatchReport, usize)> {
        let artifact = pipeline::build(&self.ctx, workspace).await?;
        let report = self.dispatcher.dispatch(&self.ctx, &artifact, plan).await?;

        if self.ctx.is_interrupted() {
            return Err(BackupError::Interrupted);
        }

        let retention_days = self.ctx.config.retention_days;
        let plan = plan.to_vec();
        let removed = tokio::task::spawn_blocking(move || RetentionCleaner::new(retention_days).prune_all(&plan))
            .await
            .map_err(|e| BackupError::StepFailed {
                step: "retention".to_string(),
                detail: e.to_string(),
            })?;

        Ok((report, removed.len()))
    }

    fn cleanup(&self) -> Cleanup {
        if !self.ctx.config.secure_delete {
            return Cleanup::Plain;
        }
        if !self.ctx.tools.has(Tool::Shred) {
            warn!(
                program = self.ctx.tools.program(Tool::Shred),
                "Secure delete requested but overwrite tool is missing, removing files plainly"
            );
            return Cleanup::Plain;
        }
        Cleanup::Secure {
            shred: self.ctx.tools.program(Tool::Shred).to_string(),
        }
    }
}

fn require_tools(tools: &Toolbox) -> Result<()> {
    for tool in PIPELINE_TOOLS {
        if !tools.has(tool) {
            error!(program = tools.program(tool), "Required program missing");
            return Err(BackupError::ToolMissing(tools.program(tool).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DestinationsConfig};
    use crate::config::ConfigError;
    use crate::context::test_support::with_tools;
    use tempfile::tempdir;

    #[test]
    fn exit_code_reflects_recoverable_errors() {
        let mut summary = RunSummary {
            epoch: Epoch::from_secs(1),
            planned: 1,
            dispatch: DispatchReport::default(),
            pruned: 0,
            errors: 0,
        };
        assert_eq!(summary.exit_code(), 0);
        summary.errors = 3;
        assert_eq!(summary.exit_code(), 2);
    }

    #[tokio::test]
    async fn preflight_rejects_missing_pipeline_tool_before_side_effects() {
        let source = tempdir().unwrap();
        let temp = tempdir().unwrap();
        let ctx = with_tools(
            AppConfig {
                sources: vec![source.path().to_path_buf()],
                temp_dir: temp.path().to_path_buf(),
                non_interactive: true,
                destinations: DestinationsConfig {
                    local: vec![temp.path().join("dest")],
                    ..Default::default()
                },
                ..Default::default()
            },
            &[Tool::Tar, Tool::Compressor],
        );

        let err = Orchestrator::new(ctx, EngineSet::default()).run().await.unwrap_err();
        assert!(matches!(err, BackupError::ToolMissing(ref p) if p == "openssl"));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn preflight_rejects_empty_destinations() {
        let source = tempdir().unwrap();
        let ctx = with_tools(
            AppConfig {
                sources: vec![source.path().to_path_buf()],
                non_interactive: true,
                ..Default::default()
            },
            &PIPELINE_TOOLS,
        );

        let err = Orchestrator::new(ctx, EngineSet::default()).preflight().await.unwrap_err();
        assert!(matches!(err, BackupError::Config(ConfigError::NoDestinations)));
    }

    #[tokio::test]
    async fn cleanup_falls_back_to_plain_without_shred() {
        let ctx = with_tools(AppConfig::default(), &[]);
        let orchestrator = Orchestrator::new(ctx, EngineSet::default());
        assert!(matches!(orchestrator.cleanup(), Cleanup::Plain));
    }

    #[tokio::test]
    async fn prune_needs_no_sources() {
        let dest = tempdir().unwrap();
        let old = dest.path().join("1000000000");
        std::fs::create_dir(&old).unwrap();
        let forty_days_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(40 * 24 * 60 * 60);
        filetime::set_file_mtime(&old, filetime::FileTime::from_system_time(forty_days_ago)).unwrap();

        let ctx = with_tools(
            AppConfig {
                non_interactive: true,
                destinations: DestinationsConfig {
                    local: vec![dest.path().to_path_buf()],
                    ..Default::default()
                },
                ..Default::default()
            },
            &[],
        );

        let pruned = Orchestrator::new(ctx, EngineSet::default()).prune().await.unwrap();
        assert_eq!(pruned, 1);
        assert!(!old.exists());
    }
}
