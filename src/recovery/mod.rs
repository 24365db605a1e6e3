//! Checkpointing and crash recovery.
//!
//! Recovery state is nothing but checkpoint artifacts: one per
//! completed stage per batch, plus a final output artifact. No
//! in-memory state survives a restart, and there is no companion
//! metadata; whether an artifact with a given [`ArtifactName`] exists
//! is the whole signal.
//!
//! The lifecycle of a batch is
//!
//! ```text
//! NotStarted -> StageDone(validation) -> StageDone(normalization)
//!            -> StageDone(transformation) -> Delivered
//! ```
//!
//! with a side transition `StageDone(k) -> Recovered(k)` taken by
//! [`RecoveryPlanner`] when the producer of the next artifact looks
//! dead, and `Recovered(k) -> Delivered` once the remaining stages ran
//! locally. See [`BatchState`].
//!
//! Stores
//! ------
//!
//! Anything implementing [`CheckpointStore`] can back recovery. There
//! are three in [`store`]: files with write-then-rename, SQLite, and
//! an in-memory one whose artifacts can be scheduled to appear later,
//! for exercising the probe without filesystem timing races.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use crate::errors::Error;
use crate::errors::Result;
use crate::pipeline::StageKind;
use crate::record::Batch;
use crate::record::BatchId;

pub(crate) mod planner;
pub mod store;

pub use planner::RecoveryPlan;
pub use planner::RecoveryPlanner;

/// Deterministic name of one artifact of a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactName {
    /// The batch right after this stage completed.
    Stage(StageKind),
    /// Final output of an uninterrupted run.
    Output,
    /// Final output written by a process that took over a stalled
    /// batch.
    RecoveredOutput,
}

impl ArtifactName {
    pub fn file_name(&self) -> String {
        match self {
            ArtifactName::Stage(kind) => format!("stage_{}_{}.csv", kind.index(), kind.name()),
            ArtifactName::Output => "output.csv".to_string(),
            ArtifactName::RecoveredOutput => "output_recovered.csv".to_string(),
        }
    }

    pub fn parse(file_name: &str) -> Option<ArtifactName> {
        match file_name {
            "output.csv" => return Some(ArtifactName::Output),
            "output_recovered.csv" => return Some(ArtifactName::RecoveredOutput),
            _ => {}
        }
        let rest = file_name.strip_prefix("stage_")?.strip_suffix(".csv")?;
        let (index, name) = rest.split_once('_')?;
        let kind = StageKind::from_index(index.parse().ok()?)?;
        (kind.name() == name).then_some(ArtifactName::Stage(kind))
    }

    /// The artifact a healthy producer writes after this one.
    pub fn successor(&self) -> Option<ArtifactName> {
        match self {
            ArtifactName::Stage(kind) => Some(
                kind.next()
                    .map(ArtifactName::Stage)
                    .unwrap_or(ArtifactName::Output),
            ),
            ArtifactName::Output | ArtifactName::RecoveredOutput => None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ArtifactName::Output | ArtifactName::RecoveredOutput)
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Durable artifact storage.
///
/// Implementations must make a write visible atomically: a concurrent
/// [`CheckpointStore::exists`] or [`CheckpointStore::read`] sees
/// either nothing or the whole artifact.
pub trait CheckpointStore: Send + Sync {
    fn write(&self, name: ArtifactName, batch: BatchId, contents: &Batch) -> Result<()>;

    fn exists(&self, name: ArtifactName, batch: BatchId) -> Result<bool>;

    /// Fails with [`Error::CorruptArtifact`] if the artifact can't be
    /// decoded.
    fn read(&self, name: ArtifactName, batch: BatchId) -> Result<Batch>;

    /// Every batch identity with at least one artifact.
    fn batches(&self) -> Result<Vec<BatchId>>;
}

/// Decode stored bytes, tagging failures with which artifact it was.
pub(crate) fn decode_artifact(name: ArtifactName, batch: BatchId, bytes: &[u8]) -> Result<Batch> {
    Batch::from_csv(bytes).map_err(|err| Error::CorruptArtifact {
        name: name.file_name(),
        batch,
        reason: err.to_string(),
    })
}

/// Where a batch is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BatchState {
    NotStarted,
    StageDone(StageKind),
    Recovered(StageKind),
    Delivered,
}

impl BatchState {
    /// Reconstruct the persisted state of a batch from its artifacts.
    ///
    /// [`BatchState::Recovered`] only exists inside the process doing
    /// the takeover, so it is never returned here.
    pub fn inspect(store: &dyn CheckpointStore, batch: BatchId) -> Result<BatchState> {
        if store.exists(ArtifactName::Output, batch)?
            || store.exists(ArtifactName::RecoveredOutput, batch)?
        {
            return Ok(BatchState::Delivered);
        }
        for kind in StageKind::ALL.iter().rev() {
            if store.exists(ArtifactName::Stage(*kind), batch)? {
                return Ok(BatchState::StageDone(*kind));
            }
        }
        Ok(BatchState::NotStarted)
    }

    pub fn can_advance_to(&self, next: BatchState) -> bool {
        use BatchState::*;
        match (*self, next) {
            (NotStarted, StageDone(StageKind::Validation)) => true,
            (StageDone(done), StageDone(kind)) => done.next() == Some(kind),
            (StageDone(done), Recovered(kind)) => done == kind,
            (StageDone(done), Delivered) => done.is_last(),
            (Recovered(_), Delivered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::NotStarted => f.write_str("not started"),
            BatchState::StageDone(kind) => write!(f, "{kind} done"),
            BatchState::Recovered(kind) => write!(f, "recovered after {kind}"),
            BatchState::Delivered => f.write_str("delivered"),
        }
    }
}

/// Writes one batch's artifacts in lifecycle order.
///
/// Refuses to write a stage artifact unless the previous stage's
/// artifact is already in the store, so stage `k + 1` never exists
/// without stage `k`.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    batch: BatchId,
    state: Cell<BatchState>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, batch: BatchId) -> Self {
        Self {
            store,
            batch,
            state: Cell::new(BatchState::NotStarted),
        }
    }

    /// For a process taking over a batch whose last artifact is
    /// `from`.
    pub fn resuming(store: Arc<dyn CheckpointStore>, batch: BatchId, from: StageKind) -> Self {
        Self {
            store,
            batch,
            state: Cell::new(BatchState::Recovered(from)),
        }
    }

    pub fn batch(&self) -> BatchId {
        self.batch
    }

    pub fn state(&self) -> BatchState {
        self.state.get()
    }

    fn check_advance(&self, next: BatchState) -> Result<()> {
        let current = self.state.get();
        if !current.can_advance_to(next) {
            return Err(Error::protocol(format!(
                "batch {} can't go from {current} to {next}",
                self.batch
            )));
        }
        Ok(())
    }

    fn advance(&self, next: BatchState) -> Result<()> {
        self.check_advance(next)?;
        self.state.set(next);
        Ok(())
    }

    pub fn checkpoint(&self, stage: StageKind, contents: &Batch) -> Result<()> {
        if !self.state.get().can_advance_to(BatchState::StageDone(stage)) {
            return Err(Error::StageOrder {
                stage,
                batch: self.batch,
            });
        }
        if let Some(prev) = stage.prev() {
            if !self.store.exists(ArtifactName::Stage(prev), self.batch)? {
                return Err(Error::StageOrder {
                    stage,
                    batch: self.batch,
                });
            }
        }
        let name = ArtifactName::Stage(stage);
        self.store.write(name, self.batch, contents)?;
        self.advance(BatchState::StageDone(stage))?;
        tracing::debug!(batch = %self.batch, artifact = %name, records = contents.len(), "Checkpoint written");
        Ok(())
    }

    /// Write the final output. Its name records whether this process
    /// produced it by takeover.
    pub fn deliver(&self, contents: &Batch) -> Result<ArtifactName> {
        let name = match self.state.get() {
            BatchState::Recovered(_) => ArtifactName::RecoveredOutput,
            _ => ArtifactName::Output,
        };
        self.check_advance(BatchState::Delivered)?;
        self.store.write(name, self.batch, contents)?;
        self.advance(BatchState::Delivered)?;
        tracing::info!(batch = %self.batch, artifact = %name, records = contents.len(), "Batch delivered");
        Ok(name)
    }
}

#[test]
fn artifact_names_round_trip() {
    for name in [
        ArtifactName::Stage(StageKind::Validation),
        ArtifactName::Stage(StageKind::Normalization),
        ArtifactName::Stage(StageKind::Transformation),
        ArtifactName::Output,
        ArtifactName::RecoveredOutput,
    ] {
        assert_eq!(ArtifactName::parse(&name.file_name()), Some(name));
    }
    assert_eq!(
        ArtifactName::Stage(StageKind::Normalization).file_name(),
        "stage_2_normalization.csv"
    );
    assert_eq!(ArtifactName::parse("stage_2_validation.csv"), None);
    assert_eq!(ArtifactName::parse("stage_9_validation.csv"), None);
    assert_eq!(ArtifactName::parse(".stage_1_validation.csv.tmp"), None);
}

#[test]
fn successor_ends_at_output() {
    assert_eq!(
        ArtifactName::Stage(StageKind::Validation).successor(),
        Some(ArtifactName::Stage(StageKind::Normalization))
    );
    assert_eq!(
        ArtifactName::Stage(StageKind::Transformation).successor(),
        Some(ArtifactName::Output)
    );
    assert_eq!(ArtifactName::Output.successor(), None);
}

#[test]
fn lifecycle_transitions() {
    use BatchState::*;
    assert!(NotStarted.can_advance_to(StageDone(StageKind::Validation)));
    assert!(!NotStarted.can_advance_to(StageDone(StageKind::Normalization)));
    assert!(StageDone(StageKind::Validation).can_advance_to(StageDone(StageKind::Normalization)));
    assert!(StageDone(StageKind::Validation).can_advance_to(Recovered(StageKind::Validation)));
    assert!(!StageDone(StageKind::Validation).can_advance_to(Delivered));
    assert!(StageDone(StageKind::Transformation).can_advance_to(Delivered));
    assert!(Recovered(StageKind::Normalization).can_advance_to(Delivered));
    assert!(!Delivered.can_advance_to(NotStarted));
}

#[test]
fn checkpointer_refuses_out_of_order_stage() {
    let store: Arc<dyn CheckpointStore> = Arc::new(store::InMemStore::new());
    let batch = BatchId::from_payload(b"x");
    let ckpt = Checkpointer::new(store.clone(), batch);

    let err = ckpt
        .checkpoint(StageKind::Normalization, &Batch::default())
        .unwrap_err();
    assert!(matches!(err, Error::StageOrder { .. }));
    assert!(!store
        .exists(ArtifactName::Stage(StageKind::Normalization), batch)
        .unwrap());

    ckpt.checkpoint(StageKind::Validation, &Batch::default())
        .unwrap();
    ckpt.checkpoint(StageKind::Normalization, &Batch::default())
        .unwrap();
    assert_eq!(ckpt.state(), BatchState::StageDone(StageKind::Normalization));
    assert!(ckpt.deliver(&Batch::default()).is_err());
}

#[test]
fn checkpointer_checks_predecessor_in_store() {
    let store: Arc<dyn CheckpointStore> = Arc::new(store::InMemStore::new());
    let batch = BatchId::from_payload(b"y");
    // Another process says it resumed after normalization, but nothing
    // is in the store.
    let ckpt = Checkpointer {
        store: store.clone(),
        batch,
        state: Cell::new(BatchState::StageDone(StageKind::Validation)),
    };
    let err = ckpt
        .checkpoint(StageKind::Normalization, &Batch::default())
        .unwrap_err();
    assert!(matches!(err, Error::StageOrder { .. }));
}

#[test]
fn resumed_batch_delivers_recovered_output() {
    let store: Arc<dyn CheckpointStore> = Arc::new(store::InMemStore::new());
    let batch = BatchId::from_payload(b"z");
    let ckpt = Checkpointer::resuming(store.clone(), batch, StageKind::Validation);
    assert_eq!(
        ckpt.deliver(&Batch::default()).unwrap(),
        ArtifactName::RecoveredOutput
    );
    assert_eq!(
        BatchState::inspect(store.as_ref(), batch).unwrap(),
        BatchState::Delivered
    );
}

#[cfg(test)]
struct ReadOnlyStore(store::InMemStore);

#[cfg(test)]
impl CheckpointStore for ReadOnlyStore {
    fn write(&self, name: ArtifactName, batch: BatchId, _contents: &Batch) -> Result<()> {
        Err(Error::protocol(format!("refusing to write {name} for {batch}")))
    }

    fn exists(&self, name: ArtifactName, batch: BatchId) -> Result<bool> {
        self.0.exists(name, batch)
    }

    fn read(&self, name: ArtifactName, batch: BatchId) -> Result<Batch> {
        self.0.read(name, batch)
    }

    fn batches(&self) -> Result<Vec<BatchId>> {
        self.0.batches()
    }
}

#[test]
fn failed_output_write_leaves_batch_undelivered() {
    let store: Arc<dyn CheckpointStore> = Arc::new(ReadOnlyStore(store::InMemStore::new()));
    let batch = BatchId::from_payload(b"w");
    let ckpt = Checkpointer::resuming(store.clone(), batch, StageKind::Transformation);

    assert!(ckpt.deliver(&Batch::default()).is_err());
    assert_eq!(ckpt.state(), BatchState::Recovered(StageKind::Transformation));
    assert!(!store.exists(ArtifactName::RecoveredOutput, batch).unwrap());
}
