//! Artifacts as files, one directory per batch.
//!
//! ```text
//! <root>/<batch id>/stage_1_validation.csv
//! <root>/<batch id>/stage_2_normalization.csv
//! <root>/<batch id>/output.csv
//! ```
//!
//! Each write goes to a hidden temporary file in the same directory
//! and is renamed into place, so a probing reader never sees a
//! partial artifact.

use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::errors::Error;
use crate::errors::Result;
use crate::record::Batch;
use crate::record::BatchId;
use crate::recovery::decode_artifact;
use crate::recovery::ArtifactName;
use crate::recovery::CheckpointStore;

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl FsStore {
    /// Directories are created lazily on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, name: ArtifactName, batch: BatchId) -> PathBuf {
        self.root.join(batch.to_string()).join(name.file_name())
    }

    fn tmp_path(&self, dir: &Path, name: ArtifactName) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(
            ".{}.{}-{seq}.tmp",
            name.file_name(),
            std::process::id()
        ))
    }
}

impl CheckpointStore for FsStore {
    fn write(&self, name: ArtifactName, batch: BatchId, contents: &Batch) -> Result<()> {
        let path = self.artifact_path(name, batch);
        let dir = path
            .parent()
            .ok_or_else(|| Error::config(format!("artifact path {path:?} has no parent")))?;
        fs::create_dir_all(dir)?;

        let tmp = self.tmp_path(dir, name);
        let bytes = contents.to_csv()?;
        let res = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        res
    }

    fn exists(&self, name: ArtifactName, batch: BatchId) -> Result<bool> {
        Ok(self.artifact_path(name, batch).try_exists()?)
    }

    fn read(&self, name: ArtifactName, batch: BatchId) -> Result<Batch> {
        let path = self.artifact_path(name, batch);
        match fs::read(&path) {
            Ok(bytes) => decode_artifact(name, batch, &bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::MissingArtifact {
                name: name.file_name(),
                batch,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn batches(&self) -> Result<Vec<BatchId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().and_then(BatchId::from_hex) {
                Some(batch) => batches.push(batch),
                None => tracing::debug!(path = ?entry.path(), "Skipping non-batch directory"),
            }
        }
        batches.sort();
        Ok(batches)
    }
}

#[cfg(test)]
use crate::pipeline::StageKind;

#[test]
fn write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let batch = BatchId::from_payload(b"fs");
    let contents = Batch::new(vec![crate::record::reading("123456", "3.2 kWh")]);
    let name = ArtifactName::Stage(StageKind::Validation);

    assert!(!store.exists(name, batch).unwrap());
    store.write(name, batch, &contents).unwrap();
    assert!(store.exists(name, batch).unwrap());
    assert_eq!(
        store.read(name, batch).unwrap().records(),
        contents.records()
    );
    assert!(dir
        .path()
        .join(batch.to_string())
        .join("stage_1_validation.csv")
        .is_file());
}

#[test]
fn no_temporary_files_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let batch = BatchId::from_payload(b"tmp");
    store
        .write(ArtifactName::Output, batch, &Batch::default())
        .unwrap();
    store
        .write(ArtifactName::Output, batch, &Batch::default())
        .unwrap();
    let names: Vec<_> = fs::read_dir(dir.path().join(batch.to_string()))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["output.csv".to_string()]);
}

#[test]
fn missing_artifact_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let err = store
        .read(ArtifactName::Output, BatchId::from_payload(b"none"))
        .unwrap_err();
    assert!(matches!(err, Error::MissingArtifact { .. }));
}

#[test]
fn corrupt_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let batch = BatchId::from_payload(b"corrupt");
    let name = ArtifactName::Stage(StageKind::Validation);
    let path = store.artifact_path(name, batch);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"a,b,c\n1,2\n").unwrap();

    let err = store.read(name, batch).unwrap_err();
    assert!(matches!(err, Error::CorruptArtifact { .. }), "got {err:?}");
}

#[test]
fn batches_lists_batch_dirs_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    assert!(store.batches().unwrap().is_empty());

    let a = BatchId::from_payload(b"a");
    let b = BatchId::from_payload(b"b");
    store.write(ArtifactName::Output, a, &Batch::default()).unwrap();
    store.write(ArtifactName::Output, b, &Batch::default()).unwrap();
    fs::create_dir(dir.path().join("lost+found")).unwrap();

    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(store.batches().unwrap(), expected);
}
