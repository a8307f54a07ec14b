//! Persistent session records.
//!
//! The registry is the only writer. Everything else reads records through
//! the coordinator, so implementations only need to be safe to share, not
//! transactional across calls.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("unknown session status: {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "terminated" => Ok(Self::Terminated),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// The durable description of a session, as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub cwd: String,
    /// Zero when the process id is unknown.
    #[serde(default)]
    pub pid: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_cost: f64,
}

impl SessionRecord {
    /// A fresh active record stamped with the current time.
    pub fn new_active(id: String, name: String, cwd: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            cwd,
            pid,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            total_cost: 0.0,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Updates of unknown ids are no-ops.
    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<(), StoreError>;

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_cost(&self, id: &str, cost: f64) -> Result<(), StoreError>;

    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>, StoreError>;

    /// Every record not yet terminated, most recently active first.
    async fn list_open(&self) -> Result<Vec<SessionRecord>, StoreError>;
}
