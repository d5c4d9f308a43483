use std::sync::Arc;

use chrono::Utc;
use kgw_client::GatewayError;
use uuid::Uuid;

use crate::gateway::SharedGateway;
use crate::model::{Session, SessionStatus};
use crate::relay::RelayRegistry;
use crate::store::{DynStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The kernel was started but the session record could not be written.
    /// `compensated` tells whether the kernel was deleted again.
    #[error("kernel {kernel_id} was started but its session could not be saved: {source}")]
    OrphanedKernel {
        kernel_id: String,
        compensated: bool,
        #[source]
        source: StoreError,
    },
}

/// Creates and manages sessions, each bound to a kernel it started.
#[derive(Clone)]
pub struct SessionManager {
    gateway: Arc<SharedGateway>,
    store: DynStore,
    relays: Arc<RelayRegistry>,
}

impl SessionManager {
    pub fn new(gateway: Arc<SharedGateway>, store: DynStore, relays: Arc<RelayRegistry>) -> Self {
        Self {
            gateway,
            store,
            relays,
        }
    }

    /// Starts a kernel for `runtime` and records a session for it. If the
    /// record cannot be written, the kernel is deleted once (not retried) and
    /// `OrphanedKernel` is returned.
    pub async fn create_session(
        &self,
        owner: Uuid,
        notebook_id: &str,
        runtime: &str,
    ) -> Result<Session, SessionError> {
        let notebook_id = Uuid::parse_str(notebook_id.trim())
            .map_err(|e| SessionError::InvalidRequest(format!("invalid notebook_id: {e}")))?;
        if notebook_id.is_nil() {
            return Err(SessionError::InvalidRequest("notebook_id must not be nil".into()));
        }
        let runtime = runtime.trim();
        if runtime.is_empty() {
            return Err(SessionError::InvalidRequest("language is required".into()));
        }

        let client = self.gateway.client();
        let kernel = client.start_kernel(runtime).await?;
        let session = Session {
            id: Uuid::new_v4(),
            user_id: owner,
            notebook_id,
            kernel_id: kernel.id.clone(),
            status: SessionStatus::Active,
            last_active_at: Utc::now(),
        };

        if let Err(source) = self.store.insert_session(&session) {
            tracing::error!(
                kernel_id = %kernel.id,
                error = %source,
                "failed to save session; deleting its kernel"
            );
            let compensated = match client.delete_kernel(&kernel.id).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(kernel_id = %kernel.id, error = %err, "kernel left running");
                    false
                }
            };
            return Err(SessionError::OrphanedKernel {
                kernel_id: kernel.id,
                compensated,
                source,
            });
        }

        tracing::info!(
            session_id = %session.id,
            kernel_id = %session.kernel_id,
            %notebook_id,
            runtime,
            "session created"
        );
        Ok(session)
    }

    pub fn list_sessions(&self, owner: Uuid) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.list_sessions(owner)?)
    }

    /// Another user's session is reported as missing.
    pub fn get_session(&self, id: Uuid, owner: Uuid) -> Result<Session, SessionError> {
        self.store
            .get_session(id)?
            .filter(|session| session.user_id == owner)
            .ok_or(SessionError::NotFound(id))
    }

    pub fn update_status(
        &self,
        id: Uuid,
        owner: Uuid,
        status: &str,
    ) -> Result<Session, SessionError> {
        let status: SessionStatus = status
            .trim()
            .parse()
            .map_err(SessionError::InvalidRequest)?;
        self.get_session(id, owner)?;
        let updated = self
            .store
            .update_session_status(id, status, Utc::now())?
            .ok_or(SessionError::NotFound(id))?;
        tracing::info!(session_id = %id, status = %updated.status, "session status updated");
        Ok(updated)
    }

    /// Removes the session record, then tears down its relays and deletes its
    /// kernel. Kernel deletion is best effort; the culler reclaims leftovers.
    pub async fn delete_session(&self, id: Uuid, owner: Uuid) -> Result<(), SessionError> {
        let session = self.get_session(id, owner)?;
        if !self.store.delete_session(id)? {
            return Err(SessionError::NotFound(id));
        }
        self.relays.teardown(&session.kernel_id);
        match self.gateway.client().delete_kernel(&session.kernel_id).await {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(
                    session_id = %id,
                    kernel_id = %session.kernel_id,
                    error = %err,
                    "session deleted but its kernel could not be"
                );
            }
        }
        tracing::info!(session_id = %id, kernel_id = %session.kernel_id, "session deleted");
        Ok(())
    }
}
