//! Coordination between the long-running bot and one-shot CLI commands that
//! share the same database.
//!
//! Whoever holds the instance lease is the only process allowed to run
//! enforcement passes. A CLI command that cannot take the lease queues its
//! request instead, and the lease holder drains the queue.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::retention::RetentionPolicy;

/// Work handed from a CLI command to the lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Configure(RetentionPolicy),
    Remove {
        server_id: String,
        channel_id: String,
    },
    Enforce {
        server_id: String,
        channel_id: String,
    },
}

impl ControlRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::Configure(_) => "configure",
            Self::Remove { .. } => "remove",
            Self::Enforce { .. } => "enforce",
        }
    }

    fn target(&self) -> (&str, &str) {
        match self {
            Self::Configure(policy) => (&policy.server_id, &policy.channel_id),
            Self::Remove {
                server_id,
                channel_id,
            }
            | Self::Enforce {
                server_id,
                channel_id,
            } => (server_id, channel_id),
        }
    }
}

/// `instance_lease` and `control_requests` tables.
pub struct ControlStore {
    pool: SqlitePool,
}

impl ControlStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .with_context(|| format!("Failed to open control DB: {}", db_path.display()))?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory control DB")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Take or renew the lease for `ttl`. Fails (returns `false`) while a
    /// different holder's lease is still live.
    pub async fn try_acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(ttl).context("lease ttl out of range")?;
        let expires_at = (now + ttl).timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO instance_lease (id, holder, expires_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE instance_lease.holder = excluded.holder
                OR instance_lease.expires_at <= ?",
        )
        .bind(holder)
        .bind(expires_at)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to acquire instance lease")?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the lease if `holder` still owns it.
    pub async fn release_lease(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM instance_lease WHERE holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await
            .context("Failed to release instance lease")?;
        Ok(())
    }

    /// Current live holder and its expiry, if any.
    pub async fn lease_holder(&self) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT holder, expires_at FROM instance_lease WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read instance lease")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let holder: String = row.try_get("holder")?;
        let expires_at: i64 = row.try_get("expires_at")?;
        let Some(expires_at) = DateTime::from_timestamp_millis(expires_at) else {
            bail!("stored lease expiry out of range: {expires_at}");
        };
        Ok((expires_at > Utc::now()).then_some((holder, expires_at)))
    }

    pub async fn enqueue(&self, request: &ControlRequest) -> Result<()> {
        let (server_id, channel_id) = request.target();
        let (max_messages, keep_pinned) = match request {
            ControlRequest::Configure(policy) => {
                (Some(i64::from(policy.max_messages)), Some(policy.keep_pinned))
            }
            _ => (None, None),
        };

        sqlx::query(
            "INSERT INTO control_requests
                (kind, server_id, channel_id, max_messages, keep_pinned, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(request.kind())
        .bind(server_id)
        .bind(channel_id)
        .bind(max_messages)
        .bind(keep_pinned)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to queue control request")?;
        Ok(())
    }

    /// Remove and return every queued request, oldest first.
    pub async fn take_requests(&self) -> Result<Vec<ControlRequest>> {
        let mut tx = self.pool.begin().await.context("Failed to start transaction")?;
        let rows = sqlx::query(
            "SELECT id, kind, server_id, channel_id, max_messages, keep_pinned
             FROM control_requests
             ORDER BY id ASC",
        )
        .fetch_all(&mut *tx)
        .await
        .context("Failed to read control requests")?;

        let Some(last) = rows.last() else {
            return Ok(Vec::new());
        };
        let last_id: i64 = last.try_get("id")?;
        sqlx::query("DELETE FROM control_requests WHERE id <= ?")
            .bind(last_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear control requests")?;
        tx.commit().await.context("Failed to commit control requests")?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_request(row) {
                Ok(request) => requests.push(request),
                Err(err) => tracing::warn!("dropping malformed control request: {err:#}"),
            }
        }
        Ok(requests)
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<ControlRequest> {
    let kind: String = row.try_get("kind")?;
    let server_id: String = row.try_get("server_id")?;
    let channel_id: String = row.try_get("channel_id")?;

    match kind.as_str() {
        "configure" => {
            let max_messages: Option<i64> = row.try_get("max_messages")?;
            let keep_pinned: Option<bool> = row.try_get("keep_pinned")?;
            let max_messages = max_messages.context("configure request without max_messages")?;
            let max_messages = u32::try_from(max_messages)
                .with_context(|| format!("queued max_messages out of range: {max_messages}"))?;
            let policy = RetentionPolicy::new(
                server_id,
                channel_id,
                max_messages,
                keep_pinned.unwrap_or(false),
            )?;
            Ok(ControlRequest::Configure(policy))
        }
        "remove" => Ok(ControlRequest::Remove {
            server_id,
            channel_id,
        }),
        "enforce" => Ok(ControlRequest::Enforce {
            server_id,
            channel_id,
        }),
        other => bail!("unknown control request kind: {other}"),
    }
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS instance_lease (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            holder     TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create instance_lease table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS control_requests (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            kind         TEXT NOT NULL,
            server_id    TEXT NOT NULL,
            channel_id   TEXT NOT NULL,
            max_messages INTEGER,
            keep_pinned  BOOLEAN,
            created_at   INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create control_requests table")?;

    Ok(())
}
