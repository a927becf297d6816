//! Replicates the finished artifact to every planned destination.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use crate::context::RunContext;
use crate::core::exec::Outcome;
use crate::core::models::{ArchiveArtifact, Destination, DestinationClass};
use crate::core::transfer_engine::EngineSet;
use crate::error::{BackupError, Result};

/// What a dispatch attempted and how it went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: Outcome) {
        self.attempted += 1;
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

pub struct TargetDispatcher {
    engines: EngineSet,
}

impl TargetDispatcher {
    pub fn new(engines: EngineSet) -> Self {
        Self { engines }
    }

    /// Local, remote and sync destinations go one at a time in plan order.
    /// Cloud destinations then run concurrently, at most `cloud_tasks` at
    /// once, and all of them finish before this returns.
    pub async fn dispatch(
        &self,
        ctx: &RunContext,
        artifact: &ArchiveArtifact,
        plan: &[Destination],
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for destination in plan.iter().filter(|d| d.class() != DestinationClass::CloudCopy) {
            if ctx.is_interrupted() {
                warn!(destination = %destination, "Interrupted, not starting further destinations");
                return Err(BackupError::Interrupted);
            }

            let engine = self.engines.for_class(destination.class());
            let span = info_span!("transfer", destination = %destination);
            let outcome = engine
                .transfer(ctx, artifact, &destination.address())
                .instrument(span)
                .await?;
            report.record(outcome);
        }

        let cloud: Vec<&Destination> = plan
            .iter()
            .filter(|d| d.class() == DestinationClass::CloudCopy)
            .collect();
        if !cloud.is_empty() {
            self.dispatch_cloud(ctx, artifact, &cloud, &mut report).await?;
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Dispatch finished"
        );
        Ok(report)
    }

    async fn dispatch_cloud(
        &self,
        ctx: &RunContext,
        artifact: &ArchiveArtifact,
        destinations: &[&Destination],
        report: &mut DispatchReport,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(ctx.config.cloud_tasks.max(1)));
        let engine = self.engines.for_class(DestinationClass::CloudCopy);
        let mut tasks = JoinSet::new();
        let mut first_error: Option<BackupError> = None;

        info!(
            destinations = destinations.len(),
            limit = ctx.config.cloud_tasks,
            "Starting cloud transfers"
        );

        // Tripped by the first worker whose transfer ends the run, and by
        // interruption through the parent token.
        let halt = ctx.shutdown.child_token();

        for destination in destinations {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Cloud worker pool closed");
                    break;
                }
            };

            // The permit may have been freed by a worker that just aborted.
            while let Some(joined) = tasks.try_join_next() {
                settle(joined, report, &mut first_error);
            }
            if ctx.is_interrupted() {
                warn!(destination = %destination, "Interrupted, not starting further destinations");
                first_error.get_or_insert(BackupError::Interrupted);
                break;
            }
            if first_error.is_some() || halt.is_cancelled() {
                warn!(destination = %destination, "Run aborted, not starting further destinations");
                break;
            }

            let ctx = ctx.clone();
            let halt = halt.clone();
            let engine = Arc::clone(&engine);
            let artifact = artifact.clone();
            let address = destination.address();
            let span = info_span!("transfer", destination = %destination);

            tasks.spawn(
                async move {
                    let outcome = engine.transfer(&ctx, &artifact, &address).await;
                    if outcome.is_err() {
                        halt.cancel();
                    }
                    drop(permit);
                    outcome
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            settle(joined, report, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn settle(
    joined: std::result::Result<Result<Outcome>, tokio::task::JoinError>,
    report: &mut DispatchReport,
    first_error: &mut Option<BackupError>,
) {
    match joined {
        Ok(Ok(outcome)) => report.record(outcome),
        Ok(Err(e)) => {
            report.attempted += 1;
            report.failed += 1;
            first_error.get_or_insert(e);
        }
        Err(e) => {
            error!(error = %e, "Cloud transfer task panicked");
            report.attempted += 1;
            report.failed += 1;
        }
    }
}
