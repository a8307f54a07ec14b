use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{SessionRecord, SessionStatus, SessionStore, StoreError};

/// Process-local store. Used by tests and when no data directory is available.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut SessionRecord)) {
        if let Some(record) = self.records.lock().get_mut(id) {
            f(record);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<(), StoreError> {
        self.update(id, |r| r.status = status);
        Ok(())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |r| r.last_activity = at);
        Ok(())
    }

    async fn set_cost(&self, id: &str, cost: f64) -> Result<(), StoreError> {
        self.update(id, |r| r.total_cost = cost);
        Ok(())
    }

    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>, StoreError> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn list_open(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.status != SessionStatus::Terminated)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(out)
    }
}
