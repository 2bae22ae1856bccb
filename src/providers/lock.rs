//! Leases stored in the `app_locks` table.
//!
//! One row per held scope, keyed by `(task_hub, scope)`. A row is live while
//! `locked_until` is in the future; an expired row is free for anyone to take.
//! Two kinds of scopes share the table:
//!
//! - `instance:{id}`: orchestration ownership, claimed inside the fetch
//!   transaction and released by the ack/abandon transaction. The holder is
//!   the lease token itself, so these are never reentrant.
//! - [`HUB_SCOPE`]: serializes maintenance (schema creation, purge sweeps).
//!   Reentrant for the same holder, tracked through a depth counter.

use super::error::ProviderError;
use async_trait::async_trait;
use rand::Rng;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::time::{Duration, Instant};
use tracing::debug;

/// Scope guarding schema creation and purge sweeps.
pub const HUB_SCOPE: &str = "hub";

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

pub(crate) fn instance_scope(instance: &str) -> String {
    format!("instance:{instance}")
}

pub(crate) fn instance_from_scope(scope: &str) -> Option<&str> {
    scope.strip_prefix("instance:")
}

pub(crate) fn new_lock_token() -> String {
    format!("lock_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire app lock '{scope}' within {waited:?}")]
    TimedOut { scope: String, waited: Duration },
    #[error("lock '{scope}' is not held by this handle")]
    NotHeld { scope: String },
    #[error(transparent)]
    Storage(#[from] ProviderError),
}

impl From<LockError> for ProviderError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::TimedOut { .. } => ProviderError::retryable("acquire_lock", e.to_string()),
            LockError::NotHeld { .. } => ProviderError::permanent("release_lock", e.to_string()),
            LockError::Storage(inner) => inner,
        }
    }
}

/// Proof of a held scope. Pass it back to renew or release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub scope: String,
    pub token: String,
    /// Nesting depth after this acquisition (1 for a fresh lease).
    pub depth: u32,
    pub acquired_at_ms: u64,
}

/// Mutual exclusion over named scopes, shared across processes.
#[async_trait]
pub trait ExclusiveScope: Send + Sync {
    /// Wait up to `timeout` for the scope. The lease lasts `ttl` unless renewed.
    async fn acquire(&self, scope: &str, ttl: Duration, timeout: Duration) -> Result<LockHandle, LockError>;

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError>;

    /// Undo one acquisition. The row is deleted when the depth reaches zero.
    async fn release(&self, handle: LockHandle) -> Result<(), LockError>;
}

/// [`ExclusiveScope`] over the `app_locks` table.
#[derive(Clone)]
pub struct SqliteScopeLock {
    pool: SqlitePool,
    task_hub: String,
    holder: String,
}

impl SqliteScopeLock {
    pub fn new(pool: SqlitePool, task_hub: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            pool,
            task_hub: task_hub.into(),
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// One acquisition attempt. `None` when another holder owns a live lease.
    async fn try_acquire(&self, scope: &str, ttl: Duration) -> Result<Option<LockHandle>, ProviderError> {
        let now = now_millis();
        let until = now + ttl.as_millis() as i64;
        let token = new_lock_token();

        let row = sqlx::query(
            r#"
            INSERT INTO app_locks (task_hub, scope, holder, token, depth, acquired_at, locked_until)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
            ON CONFLICT(task_hub, scope) DO UPDATE SET
                depth = CASE WHEN app_locks.holder = excluded.holder AND app_locks.locked_until > excluded.acquired_at
                             THEN app_locks.depth + 1 ELSE 1 END,
                token = CASE WHEN app_locks.holder = excluded.holder AND app_locks.locked_until > excluded.acquired_at
                             THEN app_locks.token ELSE excluded.token END,
                acquired_at = CASE WHEN app_locks.holder = excluded.holder AND app_locks.locked_until > excluded.acquired_at
                             THEN app_locks.acquired_at ELSE excluded.acquired_at END,
                locked_until = CASE WHEN app_locks.holder = excluded.holder AND app_locks.locked_until > excluded.acquired_at
                             THEN MAX(app_locks.locked_until, excluded.locked_until) ELSE excluded.locked_until END,
                holder = excluded.holder
            WHERE app_locks.locked_until <= excluded.acquired_at OR app_locks.holder = excluded.holder
            RETURNING token, depth, acquired_at
            "#,
        )
        .bind(&self.task_hub)
        .bind(scope)
        .bind(&self.holder)
        .bind(&token)
        .bind(now)
        .bind(until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProviderError::from_sqlx("acquire_lock", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let token: String = row
            .try_get("token")
            .map_err(|e| ProviderError::from_sqlx("acquire_lock", e))?;
        let depth: i64 = row
            .try_get("depth")
            .map_err(|e| ProviderError::from_sqlx("acquire_lock", e))?;
        let acquired_at: i64 = row
            .try_get("acquired_at")
            .map_err(|e| ProviderError::from_sqlx("acquire_lock", e))?;
        Ok(Some(LockHandle {
            scope: scope.to_string(),
            token,
            depth: depth as u32,
            acquired_at_ms: acquired_at as u64,
        }))
    }
}

#[async_trait]
impl ExclusiveScope for SqliteScopeLock {
    async fn acquire(&self, scope: &str, ttl: Duration, timeout: Duration) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if let Some(handle) = self.try_acquire(scope, ttl).await? {
                debug!(
                    target: "durasql::providers::lock",
                    task_hub = %self.task_hub,
                    scope = %scope,
                    depth = handle.depth,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Acquired lock"
                );
                return Ok(handle);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                debug!(
                    target: "durasql::providers::lock",
                    task_hub = %self.task_hub,
                    scope = %scope,
                    waited_ms = waited.as_millis() as u64,
                    "Timed out waiting for lock"
                );
                return Err(LockError::TimedOut {
                    scope: scope.to_string(),
                    waited,
                });
            }
            let delay = backoff_with_jitter(attempt).min(timeout - waited);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE app_locks SET locked_until = ?1 WHERE task_hub = ?2 AND scope = ?3 AND token = ?4 AND locked_until > ?5",
        )
        .bind(now + ttl.as_millis() as i64)
        .bind(&self.task_hub)
        .bind(&handle.scope)
        .bind(&handle.token)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| ProviderError::from_sqlx("renew_lock", e))?;
        if result.rows_affected() == 0 {
            return Err(LockError::NotHeld {
                scope: handle.scope.clone(),
            });
        }
        Ok(())
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let started = Instant::now();
        let held_ms = now_millis().saturating_sub(handle.acquired_at_ms as i64).max(0) as u64;
        let nested = sqlx::query(
            "UPDATE app_locks SET depth = depth - 1 WHERE task_hub = ?1 AND scope = ?2 AND token = ?3 AND depth > 1",
        )
        .bind(&self.task_hub)
        .bind(&handle.scope)
        .bind(&handle.token)
        .execute(&self.pool)
        .await
        .map_err(|e| ProviderError::from_sqlx("release_lock", e))?;
        if nested.rows_affected() > 0 {
            debug!(
                target: "durasql::providers::lock",
                task_hub = %self.task_hub,
                scope = %handle.scope,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Released nested lock"
            );
            return Ok(());
        }

        let deleted = sqlx::query("DELETE FROM app_locks WHERE task_hub = ?1 AND scope = ?2 AND token = ?3")
            .bind(&self.task_hub)
            .bind(&handle.scope)
            .bind(&handle.token)
            .execute(&self.pool)
            .await
            .map_err(|e| ProviderError::from_sqlx("release_lock", e))?;
        if deleted.rows_affected() == 0 {
            return Err(LockError::NotHeld { scope: handle.scope });
        }
        debug!(
            target: "durasql::providers::lock",
            task_hub = %self.task_hub,
            scope = %handle.scope,
            held_ms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Released lock"
        );
        Ok(())
    }
}

/// Exponential backoff from [`BACKOFF_BASE`] capped at [`BACKOFF_MAX`], plus up to 50% jitter.
pub(crate) fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(10)).min(BACKOFF_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}

pub(crate) fn now_millis() -> i64 {
    crate::now_ms() as i64
}

// Transaction-scoped helpers for instance leases. The caller owns the transaction.

/// Drop every expired lease in the hub. Used as the first statement of the
/// fetch transaction so the write lock is taken before any read.
pub(crate) async fn reap_expired(conn: &mut SqliteConnection, task_hub: &str, now: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM app_locks WHERE task_hub = ?1 AND locked_until <= ?2")
        .bind(task_hub)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Claim a free scope. Returns false if a lease row already exists.
pub(crate) async fn claim(
    conn: &mut SqliteConnection,
    task_hub: &str,
    scope: &str,
    token: &str,
    now: i64,
    locked_until: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO app_locks (task_hub, scope, holder, token, depth, acquired_at, locked_until)
        VALUES (?1, ?2, ?3, ?3, 1, ?4, ?5)
        ON CONFLICT(task_hub, scope) DO NOTHING
        "#,
    )
    .bind(task_hub)
    .bind(scope)
    .bind(token)
    .bind(now)
    .bind(locked_until)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Confirm a lease is live and return its scope. Written as an UPDATE so the
/// ack transaction takes the write lock up front.
pub(crate) async fn validate(
    conn: &mut SqliteConnection,
    task_hub: &str,
    token: &str,
    now: i64,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        "UPDATE app_locks SET locked_until = locked_until WHERE task_hub = ?1 AND token = ?2 AND locked_until > ?3 RETURNING scope",
    )
    .bind(task_hub)
    .bind(token)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|r| r.try_get::<String, _>("scope")).transpose()
}

/// Delete a lease by token, live or expired. Returns its scope if it existed.
pub(crate) async fn release_token(
    conn: &mut SqliteConnection,
    task_hub: &str,
    token: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("DELETE FROM app_locks WHERE task_hub = ?1 AND token = ?2 RETURNING scope")
        .bind(task_hub)
        .bind(token)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.try_get::<String, _>("scope")).transpose()
}

pub(crate) async fn extend(
    conn: &mut SqliteConnection,
    task_hub: &str,
    token: &str,
    now: i64,
    locked_until: i64,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE app_locks SET locked_until = ?1 WHERE task_hub = ?2 AND token = ?3 AND locked_until > ?4")
            .bind(locked_until)
            .bind(task_hub)
            .bind(token)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected() == 1)
}
