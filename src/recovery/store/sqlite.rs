//! Artifacts as rows in a SQLite DB.
//!
//! One row per `(batch_id, name)`. An artifact becomes visible when
//! its insert transaction commits, so readers never see a partial
//! payload.

use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::Error;
use crate::errors::Result;
use crate::record::Batch;
use crate::record::BatchId;
use crate::recovery::decode_artifact;
use crate::recovery::ArtifactName;
use crate::recovery::CheckpointStore;

pub(crate) const DB_FILE_NAME: &str = "checkpoints.sqlite3";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE artifacts ( \
         created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         batch_id TEXT NOT NULL, \
         name TEXT NOT NULL, \
         payload BLOB NOT NULL, \
         PRIMARY KEY (batch_id, name) \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(file: &Path) -> Result<Self> {
        tracing::info!("Opening checkpoint DB at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }
}

impl CheckpointStore for SqliteStore {
    fn write(&self, name: ArtifactName, batch: BatchId, contents: &Batch) -> Result<()> {
        let payload = contents.to_csv()?;
        let mut conn = self.lock()?;
        let txn = conn.transaction()?;
        tracing::trace!("Writing {name} for batch {batch}");
        txn.execute(
            "INSERT INTO artifacts (batch_id, name, payload) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (batch_id, name) DO UPDATE \
             SET payload = EXCLUDED.payload, created_at = CURRENT_TIMESTAMP",
            (batch.to_string(), name.file_name(), payload),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn exists(&self, name: ArtifactName, batch: BatchId) -> Result<bool> {
        let found = self
            .lock()?
            .query_row(
                "SELECT 1 FROM artifacts WHERE batch_id = ?1 AND name = ?2",
                (batch.to_string(), name.file_name()),
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn read(&self, name: ArtifactName, batch: BatchId) -> Result<Batch> {
        let payload: Option<Vec<u8>> = self
            .lock()?
            .query_row(
                "SELECT payload FROM artifacts WHERE batch_id = ?1 AND name = ?2",
                (batch.to_string(), name.file_name()),
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => decode_artifact(name, batch, &bytes),
            None => Err(Error::MissingArtifact {
                name: name.file_name(),
                batch,
            }),
        }
    }

    fn batches(&self) -> Result<Vec<BatchId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT batch_id FROM artifacts ORDER BY batch_id")?;
        let ids = stmt
            .query_map((), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let parsed = BatchId::from_hex(id);
                if parsed.is_none() {
                    tracing::warn!(batch_id = %id, "Ignoring malformed batch id in checkpoint DB");
                }
                parsed
            })
            .collect())
    }
}

#[cfg(test)]
use crate::pipeline::StageKind;

#[test]
fn write_read_and_overwrite() {
    let store = SqliteStore::open_in_memory().unwrap();
    let batch = BatchId::from_payload(b"sqlite");
    let name = ArtifactName::Stage(StageKind::Normalization);
    assert!(!store.exists(name, batch).unwrap());

    let first = Batch::new(vec![crate::record::reading("111111", "1 kWh")]);
    store.write(name, batch, &first).unwrap();
    let second = Batch::new(vec![crate::record::reading("222222", "2 kWh")]);
    store.write(name, batch, &second).unwrap();

    assert!(store.exists(name, batch).unwrap());
    assert_eq!(store.read(name, batch).unwrap().records(), second.records());
    assert_eq!(store.batches().unwrap(), vec![batch]);
}

#[test]
fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join(DB_FILE_NAME);
    let batch = BatchId::from_payload(b"reopen");
    {
        let store = SqliteStore::open(&file).unwrap();
        store
            .write(ArtifactName::Output, batch, &Batch::default())
            .unwrap();
    }
    let store = SqliteStore::open(&file).unwrap();
    assert!(store.exists(ArtifactName::Output, batch).unwrap());
}

#[test]
fn missing_row_is_missing_artifact() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(matches!(
        store.read(ArtifactName::Output, BatchId::from_payload(b"nope")),
        Err(Error::MissingArtifact { .. })
    ));
}
