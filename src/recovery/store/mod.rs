//! [`CheckpointStore`] backends.
//!
//! All backends hold artifacts as the encoded CSV bytes and decode on
//! read, so a corrupt artifact surfaces the same way everywhere.

use std::path::Path;
use std::sync::Arc;

use crate::config::StoreBackend;
use crate::errors::Result;

use super::CheckpointStore;

pub(crate) mod fs;
pub(crate) mod in_mem;
pub(crate) mod sqlite;

pub use fs::FsStore;
pub use in_mem::InMemStore;
pub use sqlite::SqliteStore;

/// Open the configured backend rooted at `dir`.
pub fn open(backend: StoreBackend, dir: &Path) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match backend {
        StoreBackend::Fs => Arc::new(FsStore::new(dir)),
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(dir)?;
            Arc::new(SqliteStore::open(&dir.join(sqlite::DB_FILE_NAME))?)
        }
    };
    Ok(store)
}
