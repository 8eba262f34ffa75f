//! SQLite-backed store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use ssehub_protocol::Event;

use super::{EventPage, Store, StoreError};

/// Event log persisted in a SQLite database.
///
/// Rows are ordered by an autoincrement sequence, so replay order is append
/// order regardless of the ids' format.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Open a private in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A single, never-recycled connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Sequence number of `id` within `event_type`'s log.
    async fn seq_of(&self, event_type: &str, id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT seq FROM events WHERE id = ? AND event_type = ?")
            .bind(id)
            .bind(event_type)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("seq")))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        let data = serde_json::to_string(&event.data)?;
        sqlx::query(
            r#"
            INSERT INTO events (id, event_type, data, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(data)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_last_id(
        &self,
        event_type: &str,
        last_id: &str,
        page_size: usize,
    ) -> Result<EventPage, StoreError> {
        let after = if last_id.is_empty() {
            0
        } else {
            match self.seq_of(event_type, last_id).await? {
                Some(seq) => seq,
                None => return Ok(EventPage::default()),
            }
        };

        let page_size = page_size.max(1);
        // One extra row tells us whether another page follows.
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, data
            FROM events
            WHERE event_type = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(event_type)
        .bind(after)
        .bind((page_size + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > page_size;
        let mut events = Vec::with_capacity(rows.len().min(page_size));
        for row in rows.into_iter().take(page_size) {
            let id: String = row.get("id");
            let event_type: String = row.get("event_type");
            let data: String = row.get("data");
            events.push(Event::from_record(id, event_type, &data)?);
        }

        let next_id = if has_more {
            events.last().map(|e| e.id.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(EventPage { events, next_id })
    }
}
