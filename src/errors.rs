//! Error types shared across the crate.
//!
//! Record-level validation failures are *not* errors: they are data
//! (see [`crate::pipeline::Rejection`]) and never abort a batch. The
//! variants here are for things that stop an operation: I/O, corrupt
//! checkpoint artifacts, protocol violations.

use std::panic::Location;

use crate::pipeline::StageKind;
use crate::record::BatchId;

/// Result alias used in the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A length-prefixed frame could not be read or written.
    #[error("framing error: {0}")]
    Frame(String),

    /// Peer did something the dispatch protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An artifact exists but can't be decoded into a batch.
    ///
    /// Resuming from it would process phantom data, so this is fatal
    /// for the recovery attempt.
    #[error("corrupt artifact {name} for batch {batch}: {reason}")]
    CorruptArtifact {
        name: String,
        batch: BatchId,
        reason: String,
    },

    #[error("missing artifact {name} for batch {batch}")]
    MissingArtifact { name: String, batch: BatchId },

    /// Attempted to checkpoint a stage whose predecessor has no
    /// artifact.
    #[error("stage {stage} checkpointed for batch {batch} before its predecessor")]
    StageOrder { stage: StageKind, batch: BatchId },

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl Error {
    /// Build a [`Error::Config`] tagged with the caller's location.
    #[track_caller]
    pub fn config(msg: impl AsRef<str>) -> Self {
        Self::Config(prepend_caller(Location::caller(), msg.as_ref()))
    }

    /// Build a [`Error::Protocol`] tagged with the caller's location.
    #[track_caller]
    pub fn protocol(msg: impl AsRef<str>) -> Self {
        Self::Protocol(prepend_caller(Location::caller(), msg.as_ref()))
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Turn a panic payload from a joined thread into an error.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> Error {
    let msg = if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "unknown panic".to_string()
    };
    Error::WorkerPanicked(prepend_tname(msg).trim_end().to_string())
}

#[test]
fn config_error_carries_location() {
    let err = Error::config("split fraction must be in (0, 1)");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "got: {msg}");
    assert!(msg.ends_with("split fraction must be in (0, 1)"));
}

#[test]
fn corrupt_artifact_displays_context() {
    let err = Error::CorruptArtifact {
        name: "stage_1_validation.csv".into(),
        batch: BatchId::from_hex("00000000000000ff").unwrap(),
        reason: "found record with 3 fields, but the previous record has 13 fields".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("stage_1_validation.csv"), "got: {msg}");
    assert!(msg.contains("00000000000000ff"), "got: {msg}");
}

#[test]
fn panic_message_extracts_str_payload() {
    let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
    match panic_message(payload) {
        Error::WorkerPanicked(msg) => assert!(msg.ends_with("boom"), "got: {msg}"),
        other => panic!("unexpected {other:?}"),
    }
}
