//! Record storage for sessions and cell outputs, with SQLite and in-memory
//! backends.

mod mem_store;
mod sqlite_store;

pub use mem_store::MemStore;
pub use sqlite_store::SqliteStore;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::model::{CellOutput, Session, SessionStatus};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn Store>;

/// Trait implemented by all record stores.
pub trait Store: Send + Sync {
    fn insert_session(&self, session: &Session) -> StoreResult<()>;
    fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>>;
    /// Sessions owned by `user_id`, most recently active first.
    fn list_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>>;
    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Session>>;
    fn delete_session(&self, id: Uuid) -> StoreResult<bool>;

    fn count_outputs(&self, cell_id: Uuid) -> StoreResult<u32>;
    /// Fails with `DuplicateOutput` if the cell already has an output at
    /// `output.output_index`.
    fn insert_output(&self, output: &CellOutput) -> StoreResult<()>;
    /// Outputs of a cell in index order.
    fn list_outputs(&self, cell_id: Uuid) -> StoreResult<Vec<CellOutput>>;
    fn delete_outputs(&self, cell_id: Uuid) -> StoreResult<usize>;
}

/// Opens the store selected by `config`.
pub fn open(config: &StoreConfig) -> StoreResult<DynStore> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemStore::new())),
        StoreConfig::Sqlite(path) => {
            tracing::info!(path = %path.display(), "opening sqlite store");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session {0} already exists")]
    DuplicateSession(Uuid),
    #[error("cell {cell_id} already has an output at index {index}")]
    DuplicateOutput { cell_id: Uuid, index: u32 },
    #[error("corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
