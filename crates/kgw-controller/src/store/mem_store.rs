use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{CellOutput, Session, SessionStatus};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Clone, Default)]
pub struct MemStore {
    sessions: Arc<RwLock<Sessions>>,
    outputs: Arc<RwLock<Outputs>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("sessions", &self.sessions.read().map_or(0, |s| s.len()))
            .field("cells", &self.outputs.read().map_or(0, |o| o.len()))
            .finish()
    }
}

type Sessions = HashMap<Uuid, Session>;
type Outputs = HashMap<Uuid, BTreeMap<u32, CellOutput>>;

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> StoreResult<RwLockReadGuard<'_, Sessions>> {
        self.sessions.read().map_err(|_| poisoned("sessions"))
    }

    fn sessions_mut(&self) -> StoreResult<RwLockWriteGuard<'_, Sessions>> {
        self.sessions.write().map_err(|_| poisoned("sessions"))
    }

    fn outputs(&self) -> StoreResult<RwLockReadGuard<'_, Outputs>> {
        self.outputs.read().map_err(|_| poisoned("outputs"))
    }

    fn outputs_mut(&self) -> StoreResult<RwLockWriteGuard<'_, Outputs>> {
        self.outputs.write().map_err(|_| poisoned("outputs"))
    }
}

fn poisoned(table: &str) -> StoreError {
    StoreError::Unavailable(format!("in-memory {table} lock poisoned"))
}

impl Store for MemStore {
    fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let mut sessions = self.sessions_mut()?;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::DuplicateSession(session.id));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.sessions()?.get(&id).cloned())
    }

    fn list_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let mut owned: Vec<Session> = self
            .sessions()?
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(owned)
    }

    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Session>> {
        let mut sessions = self.sessions_mut()?;
        Ok(sessions.get_mut(&id).map(|session| {
            session.status = status;
            session.last_active_at = at;
            session.clone()
        }))
    }

    fn delete_session(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.sessions_mut()?.remove(&id).is_some())
    }

    fn count_outputs(&self, cell_id: Uuid) -> StoreResult<u32> {
        let outputs = self.outputs()?;
        Ok(outputs.get(&cell_id).map_or(0, |cell| cell.len() as u32))
    }

    fn insert_output(&self, output: &CellOutput) -> StoreResult<()> {
        let mut outputs = self.outputs_mut()?;
        let cell = outputs.entry(output.cell_id).or_default();
        if cell.contains_key(&output.output_index) {
            return Err(StoreError::DuplicateOutput {
                cell_id: output.cell_id,
                index: output.output_index,
            });
        }
        cell.insert(output.output_index, output.clone());
        Ok(())
    }

    fn list_outputs(&self, cell_id: Uuid) -> StoreResult<Vec<CellOutput>> {
        let outputs = self.outputs()?;
        Ok(outputs
            .get(&cell_id)
            .map(|cell| cell.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_outputs(&self, cell_id: Uuid) -> StoreResult<usize> {
        let removed = self.outputs_mut()?.remove(&cell_id);
        Ok(removed.map_or(0, |cell| cell.len()))
    }
}
