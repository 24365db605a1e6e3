//! A processing unit.
//!
//! On start it takes over any batch a dead predecessor left stalled in
//! the checkpoint store. It then connects to the dispatcher, takes
//! whatever share it is pushed, and runs it through the pipeline. The batch identity is derived from
//! the received bytes, so a share delivered again after a crash is
//! recognized and handed to the recovery planner instead of being
//! processed from scratch next to a live producer.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::UnitConfig;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::pipeline::PipelineOutput;
use crate::pipeline::WorkerPool;
use crate::record::Batch;
use crate::record::BatchId;
use crate::recovery::store;
use crate::recovery::CheckpointStore;
use crate::recovery::Checkpointer;
use crate::recovery::RecoveryPlan;
use crate::recovery::RecoveryPlanner;
use crate::wire;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Sent the failure signal instead of taking work.
    SignalledBreakdown,
    /// The dispatcher closed the connection without pushing a share.
    NothingAssigned,
    /// An output artifact was written for the batch.
    Delivered {
        batch: BatchId,
        records: usize,
        rejected: usize,
        anomalies: usize,
        artifact: String,
    },
    /// Another process owns the batch, or it was already finished.
    Skipped {
        batch: BatchId,
        decision: &'static str,
    },
}

impl UnitOutcome {
    fn delivered(batch: BatchId, out: &PipelineOutput) -> Self {
        UnitOutcome::Delivered {
            batch,
            records: out.batch.len(),
            rejected: out.rejections.len(),
            anomalies: out.anomalies,
            artifact: out.artifact.file_name(),
        }
    }
}

/// Everything one start of a unit did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    /// Batches found in the store before connecting.
    pub recovered: Vec<UnitOutcome>,
    pub cycle: UnitOutcome,
}

pub struct Unit {
    config: UnitConfig,
    store: Arc<dyn CheckpointStore>,
    planner: RecoveryPlanner,
    pipeline: Pipeline,
}

impl Unit {
    /// Open the configured checkpoint store and build the standard
    /// pipeline.
    pub fn new(config: UnitConfig, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        let store = store::open(config.backend, &config.checkpoint_dir)?;
        Self::with_store(config, store, metrics)
    }

    pub fn with_store(
        config: UnitConfig,
        store: Arc<dyn CheckpointStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let pool = WorkerPool::new(config.workers)?;
        let pipeline = Pipeline::standard(pool, metrics.clone())?;
        let planner = RecoveryPlanner::new(store.clone(), config.probe, metrics);
        Ok(Self {
            config,
            store,
            planner,
            pipeline,
        })
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Recover stalled batches, then take part in one dispatch cycle.
    ///
    /// A corrupt artifact stops the unit before it connects.
    #[tracing::instrument(name = "unit", skip(self), fields(dispatcher = %self.config.dispatcher))]
    pub fn run(&self) -> Result<UnitReport> {
        let recovered = self.recover_all()?;
        for outcome in &recovered {
            tracing::info!(?outcome, "Startup recovery");
        }
        let cycle = self.cycle()?;
        Ok(UnitReport { recovered, cycle })
    }

    fn cycle(&self) -> Result<UnitOutcome> {
        let mut stream = TcpStream::connect(self.config.dispatcher)?;
        tracing::info!("Connected to dispatcher from {}", stream.local_addr()?);

        if self.config.simulate_breakdown {
            wire::send_failure_signal(&mut stream)?;
            tracing::warn!("Signalled breakdown; leaving the cycle");
            return Ok(UnitOutcome::SignalledBreakdown);
        }

        let Some((payload, batch)) = wire::recv_batch(&mut stream)? else {
            tracing::info!("Dispatcher closed the connection; nothing to do this cycle");
            return Ok(UnitOutcome::NothingAssigned);
        };
        let id = BatchId::from_payload(&payload);
        tracing::info!(batch = %id, records = batch.len(), "Received share");
        self.process(id, batch)
    }

    /// Process a received batch, resuming or skipping it if the store
    /// already knows it.
    pub fn process(&self, id: BatchId, batch: Batch) -> Result<UnitOutcome> {
        let plan = self.planner.plan(id)?;
        let out = match plan {
            RecoveryPlan::Fresh => {
                let ckpt = Checkpointer::new(self.store.clone(), id);
                self.pipeline.run(&ckpt, batch)?
            }
            RecoveryPlan::TakeOver { from } => self.planner.take_over(id, from, &self.pipeline)?,
            RecoveryPlan::Alive { .. } | RecoveryPlan::Delivered => {
                return Ok(UnitOutcome::Skipped {
                    batch: id,
                    decision: plan.decision(),
                });
            }
        };
        self.report(&out);
        self.export(&out.batch)?;
        Ok(UnitOutcome::delivered(id, &out))
    }

    /// Plan every batch in the store, taking over the stalled ones.
    ///
    /// Stops at the first error, such as a corrupt artifact.
    pub fn recover_all(&self) -> Result<Vec<UnitOutcome>> {
        let mut outcomes = Vec::new();
        for id in self.store.batches()? {
            let plan = self.planner.plan(id)?;
            let outcome = match plan {
                RecoveryPlan::TakeOver { from } => {
                    let out = self.planner.take_over(id, from, &self.pipeline)?;
                    self.report(&out);
                    self.export(&out.batch)?;
                    UnitOutcome::delivered(id, &out)
                }
                // Known to the store but with no artifact; the input
                // is gone, so there is nothing to resume.
                RecoveryPlan::Fresh | RecoveryPlan::Alive { .. } | RecoveryPlan::Delivered => {
                    UnitOutcome::Skipped {
                        batch: id,
                        decision: plan.decision(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn report(&self, out: &PipelineOutput) {
        for rejection in &out.rejections {
            tracing::warn!(
                row = rejection.row,
                meter = rejection.meter.as_deref().unwrap_or("?"),
                "Dropped: {}",
                rejection.errors.join("; ")
            );
        }
        tracing::info!(
            records = out.batch.len(),
            rejected = out.rejections.len(),
            anomalies = out.anomalies,
            "Wrote {}",
            out.artifact
        );
    }

    fn export(&self, batch: &Batch) -> Result<()> {
        if let Some(path) = &self.config.export {
            export_csv(path, batch)?;
            tracing::info!("Exported {} records to {path:?}", batch.len());
        }
        Ok(())
    }
}

fn export_csv(path: &Path, batch: &Batch) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, batch.to_csv()?)?;
    Ok(())
}

#[cfg(test)]
use crate::recovery::store::InMemStore;
#[cfg(test)]
use crate::recovery::ArtifactName;
#[cfg(test)]
use crate::pipeline::StageKind;

#[cfg(test)]
fn test_unit(store: Arc<InMemStore>) -> Unit {
    let config = UnitConfig {
        probe: crate::config::ProbeConfig::new(
            std::time::Duration::from_millis(40),
            std::time::Duration::from_millis(10),
        )
        .unwrap(),
        ..Default::default()
    };
    Unit::with_store(config, store, Metrics::new().unwrap()).unwrap()
}

#[cfg(test)]
fn sample() -> (BatchId, Batch) {
    let batch = Batch::new(vec![
        crate::record::reading("100001", "1500 wh"),
        crate::record::reading("bad", "3 kWh"),
        crate::record::reading("100003", "4.2 kWh"),
    ]);
    let id = BatchId::from_payload(&batch.to_csv().unwrap());
    (id, batch)
}

#[test]
fn fresh_batch_is_processed() {
    let store = Arc::new(InMemStore::new());
    let unit = test_unit(store.clone());
    let (id, batch) = sample();
    let outcome = unit.process(id, batch).unwrap();
    assert_eq!(
        outcome,
        UnitOutcome::Delivered {
            batch: id,
            records: 2,
            rejected: 1,
            anomalies: 0,
            artifact: "output.csv".to_string(),
        }
    );
    assert!(store.exists(ArtifactName::Output, id).unwrap());
}

#[test]
fn redelivered_batch_is_skipped() {
    let store = Arc::new(InMemStore::new());
    let unit = test_unit(store);
    let (id, batch) = sample();
    unit.process(id, batch.clone()).unwrap();
    assert_eq!(
        unit.process(id, batch).unwrap(),
        UnitOutcome::Skipped {
            batch: id,
            decision: "delivered"
        }
    );
}

#[test]
fn recover_all_takes_over_stalled_batches() {
    let store = Arc::new(InMemStore::new());
    let unit = test_unit(store.clone());
    let (id, batch) = sample();
    store
        .write(ArtifactName::Stage(StageKind::Validation), id, &batch.slice(0..1))
        .unwrap();

    let outcomes = unit.recover_all().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        &outcomes[0],
        UnitOutcome::Delivered { artifact, records: 1, .. } if artifact == "output_recovered.csv"
    ));
    assert!(store.exists(ArtifactName::RecoveredOutput, id).unwrap());
}

#[cfg(test)]
fn closing_dispatcher() -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        drop(conn);
    });
    (addr, handle)
}

#[test]
fn run_recovers_stalled_batch_before_connecting() {
    let store = Arc::new(InMemStore::new());
    let (dispatcher, closer) = closing_dispatcher();
    let config = UnitConfig {
        dispatcher,
        probe: crate::config::ProbeConfig::new(
            std::time::Duration::from_millis(40),
            std::time::Duration::from_millis(10),
        )
        .unwrap(),
        ..Default::default()
    };
    let unit = Unit::with_store(config, store.clone(), Metrics::new().unwrap()).unwrap();
    let (id, batch) = sample();
    store
        .write(ArtifactName::Stage(StageKind::Validation), id, &batch)
        .unwrap();

    let report = unit.run().unwrap();
    closer.join().unwrap();
    assert_eq!(report.cycle, UnitOutcome::NothingAssigned);
    assert_eq!(report.recovered.len(), 1);
    assert!(matches!(
        &report.recovered[0],
        UnitOutcome::Delivered { batch, artifact, .. } if *batch == id && artifact == "output_recovered.csv"
    ));
    assert!(store.exists(ArtifactName::RecoveredOutput, id).unwrap());
}

#[test]
fn run_stops_on_corrupt_artifact_without_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let fs = crate::recovery::store::FsStore::new(dir.path());
    let (id, _) = sample();
    let path = fs.artifact_path(ArtifactName::Stage(StageKind::Validation), id);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "compteur_id,timestamp\n100001\n").unwrap();

    // Nothing listens here; connecting would fail with an I/O error.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dispatcher = unused.local_addr().unwrap();
    drop(unused);
    let config = UnitConfig {
        dispatcher,
        probe: crate::config::ProbeConfig::new(
            std::time::Duration::from_millis(40),
            std::time::Duration::from_millis(10),
        )
        .unwrap(),
        ..Default::default()
    };
    let unit = Unit::with_store(config, Arc::new(fs), Metrics::new().unwrap()).unwrap();
    let err = unit.run().unwrap_err();
    assert!(matches!(err, crate::errors::Error::CorruptArtifact { .. }), "got: {err}");
}

#[test]
fn export_writes_final_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("dataset_traite.csv");
    let batch = Batch::new(vec![crate::record::reading("100001", "2 kWh")]);
    export_csv(&path, &batch).unwrap();
    let back = Batch::from_csv(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(back.records(), batch.records());
}
