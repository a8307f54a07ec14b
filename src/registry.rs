use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::session::{ProcessSession, PtyEvent, SpawnOptions};
use crate::store::{SessionRecord, SessionStatus, SessionStore};

/// Default ceiling on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// All live process sessions and their persisted records.
///
/// The registry is the only place sessions are created or destroyed. It is
/// owned by the bridge coordinator, so none of its methods lock.
pub struct SessionRegistry {
    sessions: HashMap<String, ProcessSession>,
    store: Arc<dyn SessionStore>,
    options: SpawnOptions,
    events_tx: mpsc::Sender<PtyEvent>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        options: SpawnOptions,
        events_tx: mpsc::Sender<PtyEvent>,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            store,
            options,
            events_tx,
            max_sessions,
        }
    }

    /// Spawn a session and persist its record. `name` and `cwd` must already
    /// be sanitized.
    pub async fn create(&mut self, name: &str, cwd: &Path) -> Result<SessionRecord, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(id, name, cwd).await
    }

    pub async fn create_with_id(
        &mut self,
        id: String,
        name: &str,
        cwd: &Path,
    ) -> Result<SessionRecord, BridgeError> {
        if self.sessions.contains_key(&id) {
            return Err(BridgeError::DuplicateSession(id));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(BridgeError::validation(format!(
                "Session limit reached ({})",
                self.max_sessions
            )));
        }

        let session = ProcessSession::spawn(id.clone(), cwd, &self.options, self.events_tx.clone())?;
        let record = SessionRecord::new_active(
            id.clone(),
            name.to_string(),
            cwd.display().to_string(),
            session.pid().unwrap_or(0),
        );

        // Dropping `session` on failure kills the process.
        self.store.insert(&record).await?;
        self.sessions.insert(id, session);

        tracing::info!(session_id = %record.id, name, pid = record.pid, "session created");
        Ok(record)
    }

    /// Kill a session and mark its record terminated.
    ///
    /// Returns the terminated record when one existed and was not already
    /// terminated. Unknown ids and repeated kills are no-ops.
    pub async fn kill(&mut self, id: &str) -> Result<Option<SessionRecord>, BridgeError> {
        if let Some(mut session) = self.sessions.remove(id) {
            session.kill();
            tracing::info!(session_id = %id, "session killed");
        }
        self.terminate_record(id).await
    }

    /// Tear down after the process exited on its own.
    ///
    /// `None` when teardown already happened, e.g. the exit that follows an
    /// explicit kill.
    pub async fn handle_exit(&mut self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id)?;
        tracing::info!(session_id = %id, "session process exited");
        match self.terminate_record(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(session_id = %id, ?e, "failed to mark exited session terminated");
                None
            }
        }
    }

    async fn terminate_record(&self, id: &str) -> Result<Option<SessionRecord>, BridgeError> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(None);
        };
        if record.status == SessionStatus::Terminated {
            return Ok(None);
        }
        let now = Utc::now();
        self.store.set_status(id, SessionStatus::Terminated).await?;
        self.store.touch(id, now).await?;
        record.status = SessionStatus::Terminated;
        record.last_activity = now;
        Ok(Some(record))
    }

    pub async fn update_activity(&self, id: &str) {
        if let Err(e) = self.store.touch(id, Utc::now()).await {
            tracing::warn!(session_id = %id, ?e, "failed to record activity");
        }
    }

    pub async fn update_cost(&self, id: &str, cost: f64) {
        if let Err(e) = self.store.set_cost(id, cost).await {
            tracing::warn!(session_id = %id, ?e, "failed to record cost");
        }
    }

    /// Mark every persisted active record without a live process terminated.
    /// Returns how many records were repaired.
    pub async fn reconcile(&mut self) -> Result<usize, BridgeError> {
        let mut repaired = 0;
        for record in self.store.list_by_status(SessionStatus::Active).await? {
            if self.sessions.contains_key(&record.id) {
                continue;
            }
            self.store
                .set_status(&record.id, SessionStatus::Terminated)
                .await?;
            tracing::info!(session_id = %record.id, "marked orphaned session terminated");
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Records not yet terminated, most recently active first.
    pub async fn list_active(&self) -> Result<Vec<SessionRecord>, BridgeError> {
        Ok(self.store.list_open().await?)
    }

    pub fn get(&self, id: &str) -> Option<&ProcessSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProcessSession> {
        self.sessions.get_mut(id)
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    /// Kill every live session and mark each record terminated.
    pub async fn drain(&mut self) -> usize {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in &ids {
            if let Err(e) = self.kill(id).await {
                tracing::error!(session_id = %id, ?e, "failed to terminate session during drain");
            }
        }
        ids.len()
    }
}
