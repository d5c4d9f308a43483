use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use kgw_protocol::OutputKind;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::model::{CellOutput, Session, SessionStatus};
use crate::store::{Store, StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    notebook_id TEXT NOT NULL,
    kernel_id TEXT NOT NULL,
    status TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id, last_active_at);

CREATE TABLE IF NOT EXISTS cell_outputs (
    id TEXT PRIMARY KEY,
    cell_id TEXT NOT NULL,
    output_index INTEGER NOT NULL,
    output_type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    blob_ref TEXT,
    execution_count INTEGER,
    UNIQUE (cell_id, output_index)
);
"#;

const SESSION_COLUMNS: &str = "id, user_id, notebook_id, kernel_id, status, last_active_at";
const OUTPUT_COLUMNS: &str =
    "id, cell_id, output_index, output_type, data_json, blob_ref, execution_count";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

struct SessionRow {
    id: String,
    user_id: String,
    notebook_id: String,
    kernel_id: String,
    status: String,
    last_active_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            notebook_id: row.get(2)?,
            kernel_id: row.get(3)?,
            status: row.get(4)?,
            last_active_at: row.get(5)?,
        })
    }

    fn into_session(self) -> StoreResult<Session> {
        Ok(Session {
            id: parse_uuid("sessions", &self.id)?,
            user_id: parse_uuid("sessions", &self.user_id)?,
            notebook_id: parse_uuid("sessions", &self.notebook_id)?,
            kernel_id: self.kernel_id,
            status: self.status.parse().map_err(|message| corrupt("sessions", message))?,
            last_active_at: DateTime::parse_from_rfc3339(&self.last_active_at)
                .map_err(|e| corrupt("sessions", format!("last_active_at: {e}")))?
                .with_timezone(&Utc),
        })
    }
}

struct OutputRow {
    id: String,
    cell_id: String,
    output_index: u32,
    output_type: String,
    data_json: String,
    blob_ref: Option<String>,
    execution_count: Option<i64>,
}

impl OutputRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cell_id: row.get(1)?,
            output_index: row.get(2)?,
            output_type: row.get(3)?,
            data_json: row.get(4)?,
            blob_ref: row.get(5)?,
            execution_count: row.get(6)?,
        })
    }

    fn into_output(self) -> StoreResult<CellOutput> {
        Ok(CellOutput {
            id: parse_uuid("cell_outputs", &self.id)?,
            cell_id: parse_uuid("cell_outputs", &self.cell_id)?,
            output_index: self.output_index,
            kind: self
                .output_type
                .parse::<OutputKind>()
                .map_err(|message| corrupt("cell_outputs", message))?,
            data: serde_json::from_str(&self.data_json)
                .map_err(|e| corrupt("cell_outputs", format!("data_json: {e}")))?,
            blob_ref: self.blob_ref,
            execution_count: self.execution_count,
        })
    }
}

fn corrupt(table: &'static str, message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        message: message.into(),
    }
}

fn parse_uuid(table: &'static str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corrupt(table, format!("invalid uuid '{raw}': {e}")))
}

impl Store for SqliteStore {
    fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, user_id, notebook_id, kernel_id, status, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.to_string(),
                session.user_id.to_string(),
                session.notebook_id.to_string(),
                session.kernel_id,
                session.status.as_str(),
                timestamp(&session.last_active_at),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateSession(session.id)
            } else {
                StoreError::Sqlite(e)
            }
        })?;
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
                SessionRow::from_row,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn list_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1
             ORDER BY last_active_at DESC"
        ))?;
        let rows = stmt
            .query_map(params![user_id.to_string()], SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Session>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, last_active_at = ?2 WHERE id = ?3",
            params![status.as_str(), timestamp(&at), id.to_string()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
                SessionRow::from_row,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn delete_session(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn count_outputs(&self, cell_id: Uuid) -> StoreResult<u32> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM cell_outputs WHERE cell_id = ?1",
            params![cell_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_output(&self, output: &CellOutput) -> StoreResult<()> {
        let data_json = serde_json::to_string(&output.data)
            .map_err(|e| corrupt("cell_outputs", format!("data_json: {e}")))?;
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO cell_outputs ({OUTPUT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                output.id.to_string(),
                output.cell_id.to_string(),
                output.output_index,
                output.kind.as_str(),
                data_json,
                output.blob_ref,
                output.execution_count,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateOutput {
                    cell_id: output.cell_id,
                    index: output.output_index,
                }
            } else {
                StoreError::Sqlite(e)
            }
        })?;
        Ok(())
    }

    fn list_outputs(&self, cell_id: Uuid) -> StoreResult<Vec<CellOutput>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM cell_outputs WHERE cell_id = ?1 ORDER BY output_index"
        ))?;
        let rows = stmt
            .query_map(params![cell_id.to_string()], OutputRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OutputRow::into_output).collect()
    }

    fn delete_outputs(&self, cell_id: Uuid) -> StoreResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM cell_outputs WHERE cell_id = ?1",
            params![cell_id.to_string()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(cell_id: Uuid, index: u32, kind: OutputKind) -> CellOutput {
        CellOutput {
            id: Uuid::new_v4(),
            cell_id,
            output_index: index,
            kind,
            data: json!({"text/plain": "42"}),
            blob_ref: None,
            execution_count: (kind == OutputKind::ExecuteResult).then_some(3),
        }
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cell = Uuid::new_v4();
        store.insert_output(&output(cell, 0, OutputKind::Stream)).unwrap();
        let err = store
            .insert_output(&output(cell, 0, OutputKind::DisplayData))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateOutput { index: 0, .. }));
        assert_eq!(store.count_outputs(cell).unwrap(), 1);
    }

    #[test]
    fn outputs_round_trip_in_index_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cell = Uuid::new_v4();
        store.insert_output(&output(cell, 1, OutputKind::ExecuteResult)).unwrap();
        store.insert_output(&output(cell, 0, OutputKind::Stream)).unwrap();

        let listed = store.list_outputs(cell).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].output_index, 0);
        assert_eq!(listed[0].kind, OutputKind::Stream);
        assert_eq!(listed[1].kind, OutputKind::ExecuteResult);
        assert_eq!(listed[1].execution_count, Some(3));
        assert_eq!(listed[1].data, json!({"text/plain": "42"}));

        assert_eq!(store.delete_outputs(cell).unwrap(), 2);
        assert_eq!(store.count_outputs(cell).unwrap(), 0);
    }

    #[test]
    fn sessions_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let user = Uuid::new_v4();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user,
            notebook_id: Uuid::new_v4(),
            kernel_id: "kernel-1".into(),
            status: SessionStatus::Active,
            last_active_at: Utc::now(),
        };
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_session(&session).unwrap();
            assert!(matches!(
                store.insert_session(&session),
                Err(StoreError::DuplicateSession(id)) if id == session.id
            ));
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(loaded.kernel_id, "kernel-1");
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(store.list_sessions(user).unwrap().len(), 1);
        assert!(store.list_sessions(Uuid::new_v4()).unwrap().is_empty());

        let closed = store
            .update_session_status(session.id, SessionStatus::Closed, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(store.delete_session(session.id).unwrap());
        assert!(store.get_session(session.id).unwrap().is_none());
    }
}
