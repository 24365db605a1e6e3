//! Ordered record-processing stages.
//!
//! A pipeline is always the three stages of [`StageKind`] in order.
//! Each [`Stage`] is a tagged variant wrapping the capability it
//! needs: a [`Validator`] for the validation stage, a [`RecordFilter`]
//! for the other two. The executor branches on the tag, so adding a
//! stage kind is a compile error everywhere it has to be handled.
//!
//! Architecture
//! ------------
//!
//! [`Pipeline`] fans each stage out across a [`WorkerPool`], joins,
//! then hands the whole batch to a [`crate::recovery::Checkpointer`]
//! before starting the next stage. That write is the recovery
//! boundary: after a crash, a new process resumes from the last
//! artifact written.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::record::Record;

pub(crate) mod executor;
pub(crate) mod pool;

pub use executor::Pipeline;
pub use executor::PipelineOutput;
pub use pool::WorkerPool;

/// The fixed pipeline steps, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Validation,
    Normalization,
    Transformation,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::Validation,
        StageKind::Normalization,
        StageKind::Transformation,
    ];

    /// 1-based position in the pipeline.
    pub fn index(&self) -> usize {
        match self {
            StageKind::Validation => 1,
            StageKind::Normalization => 2,
            StageKind::Transformation => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Validation => "validation",
            StageKind::Normalization => "normalization",
            StageKind::Transformation => "transformation",
        }
    }

    pub fn from_index(index: usize) -> Option<StageKind> {
        Self::ALL.get(index.checked_sub(1)?).copied()
    }

    pub fn next(&self) -> Option<StageKind> {
        Self::from_index(self.index() + 1)
    }

    pub fn prev(&self) -> Option<StageKind> {
        Self::from_index(self.index() - 1)
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a [`Validator`] found wrong with one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Any entry here excludes the record from further stages.
    pub errors: Vec<String>,
    /// Suspected malicious input. Logged, never blocks processing.
    pub anomalies: Vec<String>,
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks one record. Must be pure.
pub trait Validator: Send + Sync {
    fn validate(&self, record: &Record) -> Verdict;
}

impl<F> Validator for F
where
    F: Fn(&Record) -> Verdict + Send + Sync,
{
    fn validate(&self, record: &Record) -> Verdict {
        self(record)
    }
}

/// Rewrites one record that already passed validation.
///
/// Must be total over valid records: there is no error path after
/// validation.
pub trait RecordFilter: Send + Sync {
    fn apply(&self, record: Record) -> Record;
}

impl<F> RecordFilter for F
where
    F: Fn(Record) -> Record + Send + Sync,
{
    fn apply(&self, record: Record) -> Record {
        self(record)
    }
}

/// One named step applied batch-wide.
#[derive(Clone)]
pub enum Stage {
    Validation(Arc<dyn Validator>),
    Normalization(Arc<dyn RecordFilter>),
    Transformation(Arc<dyn RecordFilter>),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Validation(_) => StageKind::Validation,
            Stage::Normalization(_) => StageKind::Normalization,
            Stage::Transformation(_) => StageKind::Transformation,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stage").field(&self.kind()).finish()
    }
}

/// A record dropped by the validation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Position in the batch the stage ran over.
    pub row: usize,
    pub meter: Option<String>,
    pub errors: Vec<String>,
}

#[test]
fn stage_kinds_walk_in_order() {
    assert_eq!(StageKind::Validation.next(), Some(StageKind::Normalization));
    assert_eq!(StageKind::Transformation.next(), None);
    assert_eq!(StageKind::Validation.prev(), None);
    assert_eq!(StageKind::from_index(3), Some(StageKind::Transformation));
    assert_eq!(StageKind::from_index(0), None);
    assert!(StageKind::Validation < StageKind::Transformation);
}

#[test]
fn stage_kind_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &StageKind::Normalization,
        &[Token::UnitVariant {
            name: "StageKind",
            variant: "normalization",
        }],
    );
}
