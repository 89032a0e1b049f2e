//! Lease-based [`Locker`] over the shared SQLite database.
//!
//! Each lock is one row in `locks`. Acquisition is a single upsert that
//! only takes over an existing row once its lease has expired, so a
//! controller that crashed while holding a lock blocks others for at most
//! one TTL. A holder renews its lease every third of the TTL while it
//! works. Release deletes the row only if this locker still holds it.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use vulnsync_core::locker::Locker;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

pub struct SqliteLocker {
    pool: SqlitePool,
    holder: String,
    ttl: Duration,
}

impl SqliteLocker {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// Identity written into lock rows taken by this instance.
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl Locker for SqliteLocker {
    async fn try_lock(&self, name: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE locks.expires_at < ?
            "#,
        )
        .bind(name)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        tracing::trace!(lock = name, holder = %self.holder, acquired, "lock attempt");
        Ok(acquired)
    }

    async fn extend(&self, name: &str) -> Result<bool> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);

        let result = sqlx::query("UPDATE locks SET expires_at = ? WHERE name = ? AND holder = ?")
            .bind(expires_at)
            .bind(name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    fn renew_interval(&self) -> Option<Duration> {
        Some((self.ttl / 3).max(MIN_RENEW_INTERVAL))
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
