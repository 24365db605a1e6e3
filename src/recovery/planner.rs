//! Decide, at process start, what to do about a batch that may
//! already be partly processed.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::config::ProbeConfig;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::pipeline::PipelineOutput;
use crate::pipeline::StageKind;
use crate::record::BatchId;

use super::ArtifactName;
use super::BatchState;
use super::CheckpointStore;
use super::Checkpointer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// No artifacts: run every stage.
    Fresh,
    /// An output artifact already exists.
    Delivered,
    /// The next artifact appeared during the probe, so another
    /// process is still working this batch.
    Alive { reached: ArtifactName },
    /// The next artifact never appeared; resume after `from`.
    TakeOver { from: StageKind },
}

impl RecoveryPlan {
    pub fn decision(&self) -> &'static str {
        match self {
            RecoveryPlan::Fresh => "fresh",
            RecoveryPlan::Delivered => "delivered",
            RecoveryPlan::Alive { .. } => "alive",
            RecoveryPlan::TakeOver { .. } => "take_over",
        }
    }
}

pub struct RecoveryPlanner {
    store: Arc<dyn CheckpointStore>,
    probe: ProbeConfig,
    metrics: Arc<Metrics>,
}

impl RecoveryPlanner {
    pub fn new(store: Arc<dyn CheckpointStore>, probe: ProbeConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            probe,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Inspect the artifacts of `batch` and, if it is mid-pipeline,
    /// probe once for the next one.
    #[tracing::instrument(name = "recovery_plan", skip(self), fields(batch = %batch))]
    pub fn plan(&self, batch: BatchId) -> Result<RecoveryPlan> {
        let plan = match BatchState::inspect(self.store.as_ref(), batch)? {
            BatchState::NotStarted => RecoveryPlan::Fresh,
            BatchState::Delivered => RecoveryPlan::Delivered,
            // Never persisted.
            BatchState::Recovered(_) => RecoveryPlan::Delivered,
            BatchState::StageDone(done) => {
                let awaited = ArtifactName::Stage(done)
                    .successor()
                    .unwrap_or(ArtifactName::Output);
                tracing::info!(
                    "Batch has {} but not {awaited}; probing for up to {:?}",
                    ArtifactName::Stage(done),
                    self.probe.window
                );
                if self.probe(awaited, batch)? {
                    RecoveryPlan::Alive { reached: awaited }
                } else if awaited == ArtifactName::Output
                    && self.store.exists(ArtifactName::RecoveredOutput, batch)?
                {
                    RecoveryPlan::Delivered
                } else {
                    RecoveryPlan::TakeOver { from: done }
                }
            }
        };
        tracing::info!(decision = plan.decision(), "Recovery plan: {plan:?}");
        self.metrics
            .recoveries
            .with_label_values(&[plan.decision()])
            .inc();
        Ok(plan)
    }

    /// Poll for an artifact every interval until the window closes.
    ///
    /// Looks once at the start and once at the deadline, so the
    /// window is never cut short by the polling cadence.
    pub fn probe(&self, name: ArtifactName, batch: BatchId) -> Result<bool> {
        let deadline = Instant::now() + self.probe.window;
        loop {
            if self.store.exists(name, batch)? {
                tracing::debug!("{name} appeared");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(self.probe.interval.min(deadline - now));
        }
    }

    /// Load the artifact for `from`, run the remaining stages and
    /// write the recovered output.
    ///
    /// A corrupt artifact stops the takeover; nothing is written.
    #[tracing::instrument(name = "take_over", skip(self, pipeline), fields(batch = %batch))]
    pub fn take_over(
        &self,
        batch: BatchId,
        from: StageKind,
        pipeline: &Pipeline,
    ) -> Result<PipelineOutput> {
        let artifact = ArtifactName::Stage(from);
        let contents = self.store.read(artifact, batch).map_err(|err| {
            tracing::error!("Can't resume from {artifact}: {err}");
            err
        })?;
        tracing::info!(
            records = contents.len(),
            "Taking over batch after {from}; the producer of the next artifact looks dead"
        );
        let ckpt = Checkpointer::resuming(self.store.clone(), batch, from);
        pipeline.resume(&ckpt, from, contents)
    }
}

#[cfg(test)]
fn planner(store: Arc<dyn CheckpointStore>, window_ms: u64, interval_ms: u64) -> RecoveryPlanner {
    use std::time::Duration;

    let probe = ProbeConfig::new(
        Duration::from_millis(window_ms),
        Duration::from_millis(interval_ms),
    )
    .unwrap();
    RecoveryPlanner::new(store, probe, Metrics::new().unwrap())
}

#[test]
fn empty_store_plans_fresh_run() {
    let store = Arc::new(super::store::InMemStore::new());
    let plan = planner(store, 20, 10)
        .plan(BatchId::from_payload(b"new"))
        .unwrap();
    assert_eq!(plan, RecoveryPlan::Fresh);
}

#[test]
fn delivered_batch_is_left_alone() {
    let store = Arc::new(super::store::InMemStore::new());
    let batch = BatchId::from_payload(b"done");
    store
        .write(ArtifactName::Output, batch, &Default::default())
        .unwrap();
    assert_eq!(
        planner(store, 20, 10).plan(batch).unwrap(),
        RecoveryPlan::Delivered
    );
}

#[test]
fn stalled_stage_is_taken_over() {
    let store = Arc::new(super::store::InMemStore::new());
    let batch = BatchId::from_payload(b"stalled");
    store
        .write(
            ArtifactName::Stage(StageKind::Validation),
            batch,
            &Default::default(),
        )
        .unwrap();
    let started = Instant::now();
    let plan = planner(store, 60, 20).plan(batch).unwrap();
    assert_eq!(
        plan,
        RecoveryPlan::TakeOver {
            from: StageKind::Validation
        }
    );
    assert!(started.elapsed() >= std::time::Duration::from_millis(60));
}

#[test]
fn artifact_appearing_mid_probe_means_alive() {
    use std::time::Duration;

    let store = Arc::new(super::store::InMemStore::new());
    let batch = BatchId::from_payload(b"alive");
    store
        .write(
            ArtifactName::Stage(StageKind::Validation),
            batch,
            &Default::default(),
        )
        .unwrap();
    store
        .schedule(
            ArtifactName::Stage(StageKind::Normalization),
            batch,
            &Default::default(),
            Duration::from_millis(50),
        )
        .unwrap();
    let plan = planner(store, 500, 10).plan(batch).unwrap();
    assert_eq!(
        plan,
        RecoveryPlan::Alive {
            reached: ArtifactName::Stage(StageKind::Normalization)
        }
    );
}

#[test]
fn last_stage_probes_for_output() {
    let store = Arc::new(super::store::InMemStore::new());
    let batch = BatchId::from_payload(b"last");
    for kind in StageKind::ALL {
        store
            .write(ArtifactName::Stage(kind), batch, &Default::default())
            .unwrap();
    }
    assert_eq!(
        planner(store, 20, 10).plan(batch).unwrap(),
        RecoveryPlan::TakeOver {
            from: StageKind::Transformation
        }
    );
}
