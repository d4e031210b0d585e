use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use super::traits::{PolicyStore, StoreFuture};
use crate::retention::RetentionPolicy;

/// `channel_settings` table in a local SQLite database.
pub struct SqlitePolicyStore {
    pool: SqlitePool,
}

impl SqlitePolicyStore {
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
            .max_connections(4)
            .connect(&url)
            .await
            .with_context(|| format!("Failed to open policy DB: {}", db_path.display()))?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory policy DB")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn fetch_policy(
        &self,
        server_id: &str,
        channel_id: &str,
    ) -> Result<Option<RetentionPolicy>> {
        let row = sqlx::query(
            "SELECT server_id, channel_id, max_messages, keep_pinned
             FROM channel_settings
             WHERE server_id = ? AND channel_id = ?",
        )
        .bind(server_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query channel settings")?;

        row.map(|row| row_to_policy(&row)).transpose()
    }

    async fn upsert_policy(&self, policy: &RetentionPolicy) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO channel_settings
                (server_id, channel_id, max_messages, keep_pinned)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&policy.server_id)
        .bind(&policy.channel_id)
        .bind(i64::from(policy.max_messages))
        .bind(policy.keep_pinned)
        .execute(&self.pool)
        .await
        .context("Failed to save channel settings")?;
        Ok(())
    }

    async fn delete_policy(&self, server_id: &str, channel_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM channel_settings WHERE server_id = ? AND channel_id = ?")
                .bind(server_id)
                .bind(channel_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete channel settings")?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_server_policies(&self, server_id: &str) -> Result<Vec<RetentionPolicy>> {
        let rows = sqlx::query(
            "SELECT server_id, channel_id, max_messages, keep_pinned
             FROM channel_settings
             WHERE server_id = ?
             ORDER BY channel_id ASC",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list channel settings")?;

        rows.iter().map(row_to_policy).collect()
    }
}

impl PolicyStore for SqlitePolicyStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, Option<RetentionPolicy>> {
        Box::pin(self.fetch_policy(server_id, channel_id))
    }

    fn save_policy<'a>(&'a self, policy: &'a RetentionPolicy) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert_policy(policy))
    }

    fn remove_policy<'a>(
        &'a self,
        server_id: &'a str,
        channel_id: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(self.delete_policy(server_id, channel_id))
    }

    fn list_policies<'a>(&'a self, server_id: &'a str) -> StoreFuture<'a, Vec<RetentionPolicy>> {
        Box::pin(self.fetch_server_policies(server_id))
    }
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<RetentionPolicy> {
    let server_id: String = row.try_get("server_id")?;
    let channel_id: String = row.try_get("channel_id")?;
    let max_messages: i64 = row.try_get("max_messages")?;
    let keep_pinned: bool = row.try_get("keep_pinned")?;

    let max_messages = u32::try_from(max_messages)
        .with_context(|| format!("stored max_messages out of range: {max_messages}"))?;
    RetentionPolicy::new(server_id, channel_id, max_messages, keep_pinned)
        .context("stored channel settings are invalid")
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channel_settings (
            server_id    TEXT NOT NULL,
            channel_id   TEXT NOT NULL,
            max_messages INTEGER NOT NULL,
            keep_pinned  BOOLEAN NOT NULL DEFAULT 0,
            PRIMARY KEY (server_id, channel_id)
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create channel_settings table")?;

    Ok(())
}
