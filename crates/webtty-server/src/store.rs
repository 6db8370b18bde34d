//! Durable session rows and history chunks, on SQLite.
//!
//! The store issues single-row updates plus two grouped operations that
//! must stay coherent: a history flush (chunk insert + bookkeeping + prune)
//! and a session delete (chunks then row). Both run in one transaction.

use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::TermResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Closed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: String,
    pub cols: i64,
    pub rows: i64,
    pub status: String,
    pub pty_status: String,
    pub history_size: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct TermStore {
    pool: SqlitePool,
}

impl TermStore {
    pub async fn open(path: &Path) -> TermResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "terminal store opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and ephemeral servers.
    pub async fn open_in_memory() -> TermResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> TermResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS terminal_sessions (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL DEFAULT '',
                shell        TEXT NOT NULL,
                cwd          TEXT NOT NULL,
                cols         INTEGER NOT NULL,
                "rows"       INTEGER NOT NULL,
                status       TEXT NOT NULL,
                pty_status   TEXT NOT NULL,
                history_size INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS terminal_history (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                data       BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_terminal_history_session
             ON terminal_history(session_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_session(&self, row: &SessionRow) -> TermResult<()> {
        sqlx::query(
            r#"
            INSERT INTO terminal_sessions
                (id, name, shell, cwd, cols, "rows", status, pty_status,
                 history_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.shell)
        .bind(&row.cwd)
        .bind(row.cols)
        .bind(row.rows)
        .bind(&row.status)
        .bind(&row.pty_status)
        .bind(row.history_size)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> TermResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM terminal_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_sessions(&self) -> TermResult<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM terminal_sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_size(&self, id: &str, cols: u16, rows: u16) -> TermResult<()> {
        sqlx::query(
            r#"UPDATE terminal_sessions SET cols = ?, "rows" = ?, updated_at = ? WHERE id = ?"#,
        )
        .bind(cols as i64)
        .bind(rows as i64)
        .bind(now_epoch())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_closed_exited(&self, id: &str) -> TermResult<()> {
        sqlx::query(
            "UPDATE terminal_sessions SET status = ?, pty_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(Lifecycle::Closed.as_str())
        .bind(ProcessState::Exited.as_str())
        .bind(now_epoch())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_active_running(&self, id: &str) -> TermResult<()> {
        sqlx::query(
            "UPDATE terminal_sessions SET status = ?, pty_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(Lifecycle::Active.as_str())
        .bind(ProcessState::Running.as_str())
        .bind(now_epoch())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup reconciliation: no durable row may claim a running child
    /// from a previous server life.
    pub async fn mark_all_exited(&self) -> TermResult<u64> {
        let result = sqlx::query(
            "UPDATE terminal_sessions SET status = ?, pty_status = ?, updated_at = ?
             WHERE pty_status = ?",
        )
        .bind(Lifecycle::Closed.as_str())
        .bind(ProcessState::Exited.as_str())
        .bind(now_epoch())
        .bind(ProcessState::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Spill one ring snapshot. Inserts the chunk, records its size on the
    /// session row and keeps only the newest `max_records` chunks
    /// (0 disables pruning), all in one transaction.
    pub async fn flush_history(
        &self,
        session_id: &str,
        data: &[u8],
        max_records: i64,
    ) -> TermResult<()> {
        let now = now_epoch();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO terminal_history (session_id, data, created_at) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(data)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE terminal_sessions SET history_size = ?, updated_at = ? WHERE id = ?")
            .bind(data.len() as i64)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        if max_records > 0 {
            sqlx::query(
                "DELETE FROM terminal_history
                 WHERE session_id = ?1 AND id NOT IN (
                     SELECT id FROM terminal_history
                     WHERE session_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2
                 )",
            )
            .bind(session_id)
            .bind(max_records)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Newest chunk for a session, or `None` when nothing was spilled.
    pub async fn load_latest_history(&self, session_id: &str) -> TermResult<Option<Vec<u8>>> {
        let data = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM terminal_history
             WHERE session_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(data)
    }

    pub async fn prune_history_by_age(&self, cutoff: i64) -> TermResult<u64> {
        let result = sqlx::query("DELETE FROM terminal_history WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove the session and every chunk it owns.
    pub async fn delete_session(&self, id: &str) -> TermResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM terminal_history WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM terminal_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_history(&self, session_id: &str) -> TermResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM terminal_history WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
