//! Runs a batch through the stages, checkpointing between them.

use std::sync::Arc;

use crate::errors::Error;
use crate::errors::Result;
use crate::filters;
use crate::metrics::Metrics;
use crate::record::Batch;
use crate::record::Record;
use crate::recovery::ArtifactName;
use crate::recovery::Checkpointer;

use super::Rejection;
use super::Stage;
use super::StageKind;
use super::WorkerPool;

/// What one stage did to a batch.
#[derive(Debug, Clone, Default)]
struct StageOutput {
    batch: Batch,
    rejections: Vec<Rejection>,
    anomalies: usize,
}

/// Result of running a batch to completion.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Records that made it through every stage, in input order.
    pub batch: Batch,
    pub rejections: Vec<Rejection>,
    pub anomalies: usize,
    /// Which output artifact was written.
    pub artifact: ArtifactName,
}

pub struct Pipeline {
    stages: Vec<Stage>,
    pool: WorkerPool,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    /// The stages must be exactly one of each [`StageKind`], in
    /// order.
    pub fn new(stages: Vec<Stage>, pool: WorkerPool, metrics: Arc<Metrics>) -> Result<Self> {
        let kinds: Vec<StageKind> = stages.iter().map(Stage::kind).collect();
        if kinds != StageKind::ALL {
            return Err(Error::config(format!(
                "pipeline stages must be {:?}, got {kinds:?}",
                StageKind::ALL
            )));
        }
        Ok(Self {
            stages,
            pool,
            metrics,
        })
    }

    /// The meter-reading stages from [`crate::filters`].
    pub fn standard(pool: WorkerPool, metrics: Arc<Metrics>) -> Result<Self> {
        Ok(Self {
            stages: vec![
                Stage::Validation(Arc::new(filters::MeterValidator::new()?)),
                Stage::Normalization(Arc::new(filters::MeterNormalizer)),
                Stage::Transformation(Arc::new(filters::MeterTransformer)),
            ],
            pool,
            metrics,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage, checkpointing after each, then deliver the
    /// output.
    #[tracing::instrument(name = "pipeline_run", skip_all, fields(batch = %ckpt.batch(), records = batch.len()))]
    pub fn run(&self, ckpt: &Checkpointer, batch: Batch) -> Result<PipelineOutput> {
        let mut acc = StageOutput {
            batch,
            ..Default::default()
        };
        for stage in &self.stages {
            acc = self.step(stage, acc)?;
            ckpt.checkpoint(stage.kind(), &acc.batch)?;
        }
        self.finish(ckpt, acc)
    }

    /// Run only the stages after `after` on a batch loaded from its
    /// artifact, then deliver.
    ///
    /// No intermediate artifacts are written: if the original
    /// producer is merely slow, its checkpoints are not confused with
    /// ours.
    #[tracing::instrument(name = "pipeline_resume", skip_all, fields(batch = %ckpt.batch(), after = %after))]
    pub fn resume(
        &self,
        ckpt: &Checkpointer,
        after: StageKind,
        batch: Batch,
    ) -> Result<PipelineOutput> {
        let mut acc = StageOutput {
            batch,
            ..Default::default()
        };
        for stage in self.stages.iter().filter(|s| s.kind() > after) {
            acc = self.step(stage, acc)?;
        }
        self.finish(ckpt, acc)
    }

    fn finish(&self, ckpt: &Checkpointer, acc: StageOutput) -> Result<PipelineOutput> {
        let artifact = ckpt.deliver(&acc.batch)?;
        Ok(PipelineOutput {
            batch: acc.batch,
            rejections: acc.rejections,
            anomalies: acc.anomalies,
            artifact,
        })
    }

    fn step(&self, stage: &Stage, mut acc: StageOutput) -> Result<StageOutput> {
        let out = self.apply(stage, acc.batch)?;
        acc.rejections.extend(out.rejections);
        acc.anomalies += out.anomalies;
        acc.batch = out.batch;
        Ok(acc)
    }

    /// Apply one stage batch-wide across the worker pool.
    fn apply(&self, stage: &Stage, batch: Batch) -> Result<StageOutput> {
        let kind = stage.kind();
        let span = tracing::info_span!("stage", stage = %kind, records = batch.len());
        let _guard = span.enter();

        let out = with_timer!(self.metrics.stage_duration, &[kind.name()], {
            match stage {
                Stage::Validation(validator) => self.validate(validator.as_ref(), batch)?,
                Stage::Normalization(filter) | Stage::Transformation(filter) => {
                    let template = batch.replace_records(Vec::new());
                    let chunks = self.pool.map(batch.into_records(), |_, chunk| {
                        chunk
                            .into_iter()
                            .map(|record| filter.apply(record))
                            .collect::<Vec<Record>>()
                    })?;
                    StageOutput {
                        batch: template.replace_records(chunks.into_iter().flatten().collect()),
                        ..Default::default()
                    }
                }
            }
        });
        tracing::debug!(
            kept = out.batch.len(),
            rejected = out.rejections.len(),
            "Stage complete"
        );
        Ok(out)
    }

    fn validate(&self, validator: &dyn super::Validator, batch: Batch) -> Result<StageOutput> {
        let template = batch.replace_records(Vec::new());
        let chunks = self.pool.map(batch.into_records(), |offset, chunk| {
            let mut kept = Vec::with_capacity(chunk.len());
            let mut rejections = Vec::new();
            let mut anomalies = 0;
            for (i, record) in chunk.into_iter().enumerate() {
                let row = offset + i;
                let verdict = validator.validate(&record);
                let meter = record.get(filters::fields::METER_ID).map(str::to_owned);
                for anomaly in &verdict.anomalies {
                    tracing::warn!(row, meter = ?meter, %anomaly, "Suspicious input");
                }
                anomalies += verdict.anomalies.len();
                if verdict.is_valid() {
                    kept.push(record);
                } else {
                    tracing::warn!(row, meter = ?meter, errors = ?verdict.errors, "Rejected record");
                    rejections.push(Rejection {
                        row,
                        meter,
                        errors: verdict.errors,
                    });
                }
            }
            (kept, rejections, anomalies)
        })?;

        let mut out = StageOutput::default();
        let mut records = Vec::new();
        for (kept, rejections, anomalies) in chunks {
            records.extend(kept);
            out.rejections.extend(rejections);
            out.anomalies += anomalies;
        }
        out.batch = template.replace_records(records);

        self.metrics
            .records_rejected
            .inc_by(out.rejections.len() as u64);
        self.metrics.record_anomalies.inc_by(out.anomalies as u64);
        Ok(out)
    }
}

#[cfg(test)]
use crate::pipeline::Verdict;
#[cfg(test)]
use crate::record::reading;
#[cfg(test)]
use crate::recovery::store::InMemStore;
#[cfg(test)]
use crate::recovery::CheckpointStore;
#[cfg(test)]
use crate::record::BatchId;

#[cfg(test)]
fn tagging_pipeline(workers: usize) -> Pipeline {
    let tag = |name: &'static str| {
        move |mut record: Record| {
            record.set(name, "yes");
            record
        }
    };
    Pipeline::new(
        vec![
            Stage::Validation(Arc::new(|record: &Record| Verdict {
                errors: match record.get("consommation") {
                    Some(c) if c.starts_with('-') => vec!["negative".to_string()],
                    _ => Vec::new(),
                },
                anomalies: Vec::new(),
            })),
            Stage::Normalization(Arc::new(tag("normalized"))),
            Stage::Transformation(Arc::new(tag("transformed"))),
        ],
        WorkerPool::new(workers).unwrap(),
        Metrics::new().unwrap(),
    )
    .unwrap()
}

#[test]
fn stages_must_be_in_order() {
    let noop = |record: Record| record;
    let res = Pipeline::new(
        vec![
            Stage::Normalization(Arc::new(noop)),
            Stage::Transformation(Arc::new(noop)),
        ],
        WorkerPool::new(2).unwrap(),
        Metrics::new().unwrap(),
    );
    assert!(matches!(res, Err(Error::Config(_))));
}

#[test]
fn invalid_records_are_dropped_without_affecting_others() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemStore::new());
    let batch = Batch::new(vec![
        reading("000001", "1 kWh"),
        reading("000002", "-4 kWh"),
        reading("000003", "3 kWh"),
        reading("000004", "-1 kWh"),
        reading("000005", "5 kWh"),
    ]);
    let id = BatchId::from_payload(b"drop");
    let ckpt = Checkpointer::new(store.clone(), id);
    let out = tagging_pipeline(2).run(&ckpt, batch).unwrap();

    let meters: Vec<_> = out
        .batch
        .records()
        .iter()
        .map(|r| r.get("compteur_id").unwrap())
        .collect();
    assert_eq!(meters, vec!["000001", "000003", "000005"]);
    assert!(out
        .batch
        .records()
        .iter()
        .all(|r| r.get("transformed") == Some("yes")));
    let rows: Vec<_> = out.rejections.iter().map(|r| r.row).collect();
    assert_eq!(rows, vec![1, 3]);
    assert_eq!(out.rejections[0].meter.as_deref(), Some("000002"));
    assert_eq!(out.artifact, ArtifactName::Output);
}

#[test]
fn run_checkpoints_every_stage() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemStore::new());
    let id = BatchId::from_payload(b"every");
    let ckpt = Checkpointer::new(store.clone(), id);
    tagging_pipeline(3)
        .run(&ckpt, Batch::new(vec![reading("000001", "1 kWh")]))
        .unwrap();
    for kind in StageKind::ALL {
        assert!(store.exists(ArtifactName::Stage(kind), id).unwrap());
    }
    let normalized = store
        .read(ArtifactName::Stage(StageKind::Normalization), id)
        .unwrap();
    assert_eq!(normalized.records()[0].get("normalized"), Some("yes"));
    assert_eq!(normalized.records()[0].get("transformed"), None);
}

#[test]
fn resume_matches_full_run() {
    let input = Batch::new(vec![
        reading("000001", "1 kWh"),
        reading("000002", "-2 kWh"),
        reading("000003", "3 kWh"),
    ]);
    let pipeline = tagging_pipeline(2);

    let store: Arc<dyn CheckpointStore> = Arc::new(InMemStore::new());
    let id = BatchId::from_payload(b"resume");
    let full = pipeline
        .run(&Checkpointer::new(store.clone(), id), input)
        .unwrap();

    let validated = store
        .read(ArtifactName::Stage(StageKind::Validation), id)
        .unwrap();
    let resumed = pipeline
        .resume(
            &Checkpointer::resuming(store.clone(), id, StageKind::Validation),
            StageKind::Validation,
            validated,
        )
        .unwrap();
    assert_eq!(resumed.batch.records(), full.batch.records());
    assert_eq!(resumed.artifact, ArtifactName::RecoveredOutput);
}

#[test]
fn empty_batch_runs_through() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemStore::new());
    let id = BatchId::from_payload(b"");
    let out = tagging_pipeline(2)
        .run(&Checkpointer::new(store, id), Batch::default())
        .unwrap();
    assert!(out.batch.is_empty());
    assert!(out.rejections.is_empty());
}
