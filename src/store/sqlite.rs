use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::{SessionRecord, SessionStatus, SessionStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY NOT NULL,
    name          TEXT NOT NULL,
    cwd           TEXT NOT NULL,
    pid           INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'active',
    created_at    TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    total_cost    REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
"#;

const COLUMNS: &str = "id, name, cwd, pid, status, created_at, last_activity, total_cost";

/// SQLite-backed session store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    name: String,
    cwd: String,
    pid: Option<i64>,
    status: String,
    created_at: String,
    last_activity: String,
    total_cost: f64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            cwd: row.cwd,
            // Databases created before the NOT NULL default may hold NULL.
            pid: row.pid.and_then(|p| u32::try_from(p).ok()).unwrap_or(0),
            status: row.status.parse()?,
            created_at: parse_timestamp(&row.created_at)?,
            last_activity: parse_timestamp(&row.last_activity)?,
            total_cost: row.total_cost,
        })
    }
}

/// Fixed-width so that lexical order in SQL matches time order.
fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        Self::connect(options).await
    }

    /// A private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // A single connection serializes writes and keeps an in-memory
        // database alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    async fn fetch(&self, sql: &str, bind: Option<&str>) -> Result<Vec<SessionRecord>, StoreError> {
        let mut query = sqlx::query_as::<_, SessionRow>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SessionRecord::try_from)
            .collect()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO sessions (id, name, cwd, pid, status, created_at, last_activity, total_cost) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.cwd)
        .bind(i64::from(record.pid))
        .bind(record.status.as_str())
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.last_activity))
        .bind(record.total_cost)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRecord::try_from).transpose()
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_activity = ? WHERE id = ?")
            .bind(format_timestamp(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_cost(&self, id: &str, cost: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET total_cost = ? WHERE id = ?")
            .bind(cost)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>, StoreError> {
        self.fetch(
            &format!("SELECT {COLUMNS} FROM sessions WHERE status = ? ORDER BY created_at DESC"),
            Some(status.as_str()),
        )
        .await
    }

    async fn list_open(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.fetch(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE status != 'terminated' ORDER BY last_activity DESC"
            ),
            None,
        )
        .await
    }
}
