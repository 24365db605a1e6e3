//! In-memory artifacts, for tests and benchmarks.
//!
//! Artifacts can be [scheduled](InMemStore::schedule) to become
//! visible after a delay, standing in for a producer in another
//! process that is still running a stage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use crate::errors::Error;
use crate::errors::Result;
use crate::record::Batch;
use crate::record::BatchId;
use crate::recovery::decode_artifact;
use crate::recovery::ArtifactName;
use crate::recovery::CheckpointStore;

struct Entry {
    bytes: Vec<u8>,
    visible_at: Instant,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

#[derive(Default)]
pub struct InMemStore {
    entries: Mutex<HashMap<(BatchId, ArtifactName), Entry>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(BatchId, ArtifactName), Entry>>> {
        self.entries.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Make an artifact appear `after` from now.
    pub fn schedule(
        &self,
        name: ArtifactName,
        batch: BatchId,
        contents: &Batch,
        after: Duration,
    ) -> Result<()> {
        let bytes = contents.to_csv()?;
        self.insert_raw(name, batch, bytes, after)
    }

    /// Store bytes as-is, without encoding a batch.
    pub fn insert_raw(
        &self,
        name: ArtifactName,
        batch: BatchId,
        bytes: Vec<u8>,
        after: Duration,
    ) -> Result<()> {
        let entry = Entry {
            bytes,
            visible_at: Instant::now() + after,
        };
        self.lock()?.insert((batch, name), entry);
        Ok(())
    }
}

impl CheckpointStore for InMemStore {
    fn write(&self, name: ArtifactName, batch: BatchId, contents: &Batch) -> Result<()> {
        self.schedule(name, batch, contents, Duration::ZERO)
    }

    fn exists(&self, name: ArtifactName, batch: BatchId) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .get(&(batch, name))
            .map_or(false, |entry| entry.is_visible(now)))
    }

    fn read(&self, name: ArtifactName, batch: BatchId) -> Result<Batch> {
        let now = Instant::now();
        let entries = self.lock()?;
        match entries.get(&(batch, name)) {
            Some(entry) if entry.is_visible(now) => decode_artifact(name, batch, &entry.bytes),
            _ => Err(Error::MissingArtifact {
                name: name.file_name(),
                batch,
            }),
        }
    }

    fn batches(&self) -> Result<Vec<BatchId>> {
        let now = Instant::now();
        let mut batches: Vec<BatchId> = self
            .lock()?
            .iter()
            .filter(|(_, entry)| entry.is_visible(now))
            .map(|((batch, _), _)| *batch)
            .collect();
        batches.sort();
        batches.dedup();
        Ok(batches)
    }
}

#[test]
fn scheduled_artifact_appears_later() {
    let store = InMemStore::new();
    let batch = BatchId::from_payload(b"later");
    store
        .schedule(
            ArtifactName::Output,
            batch,
            &Batch::default(),
            Duration::from_millis(50),
        )
        .unwrap();
    assert!(!store.exists(ArtifactName::Output, batch).unwrap());
    assert!(store.batches().unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(80));
    assert!(store.exists(ArtifactName::Output, batch).unwrap());
    assert_eq!(store.batches().unwrap(), vec![batch]);
}

#[test]
fn raw_garbage_reads_as_corrupt() {
    let store = InMemStore::new();
    let batch = BatchId::from_payload(b"garbage");
    store
        .insert_raw(
            ArtifactName::Output,
            batch,
            vec![b'a', b'\n', 0xff, 0xfe],
            Duration::ZERO,
        )
        .unwrap();
    assert!(matches!(
        store.read(ArtifactName::Output, batch),
        Err(Error::CorruptArtifact { .. })
    ));
}
