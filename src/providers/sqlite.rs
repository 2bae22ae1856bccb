use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::lock::{self, ExclusiveScope, SqliteScopeLock, HUB_SCOPE};
use super::{
    CreateOutcome, ExecutionInfo, InstanceInfo, NewInstance, OrchestrationItem, Provider, ProviderError, PurgeFilter,
    PurgeResult, TurnCommit, WorkItem,
};
use crate::{Event, OrchestrationStatus, INITIAL_EXECUTION_ID};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Default cap on instances removed by one purge sweep.
const DEFAULT_PURGE_LIMIT: u32 = 1000;

/// How long maintenance operations may hold the hub lease.
const MAINTENANCE_LEASE: Duration = Duration::from_secs(60);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        applied_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        task_hub TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        orchestration_name TEXT NOT NULL,
        current_execution_id INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL,
        input TEXT,
        output TEXT,
        custom_status TEXT,
        parent_instance_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER,
        PRIMARY KEY (task_hub, instance_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(task_hub, status, completed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        task_hub TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        execution_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        input TEXT,
        output TEXT,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        PRIMARY KEY (task_hub, instance_id, execution_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS history (
        task_hub TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        execution_id INTEGER NOT NULL,
        event_id INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        event_data TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (task_hub, instance_id, execution_id, event_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_hub TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        work_item TEXT NOT NULL,
        visible_at INTEGER NOT NULL,
        lock_token TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orchestrator_visible ON orchestrator_queue(task_hub, visible_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_orchestrator_instance ON orchestrator_queue(task_hub, instance_id, visible_at)",
    "CREATE INDEX IF NOT EXISTS idx_orchestrator_lock ON orchestrator_queue(lock_token)",
    r#"
    CREATE TABLE IF NOT EXISTS worker_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_hub TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        work_item TEXT NOT NULL,
        visible_at INTEGER NOT NULL,
        lock_token TEXT,
        locked_until INTEGER,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(task_hub, visible_at, locked_until, id)",
    "CREATE INDEX IF NOT EXISTS idx_worker_lock ON worker_queue(lock_token)",
];

const LOCK_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS app_locks (
        task_hub TEXT NOT NULL,
        scope TEXT NOT NULL,
        holder TEXT NOT NULL,
        token TEXT NOT NULL,
        depth INTEGER NOT NULL DEFAULT 1,
        acquired_at INTEGER NOT NULL,
        locked_until INTEGER NOT NULL,
        PRIMARY KEY (task_hub, scope)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_app_locks_token ON app_locks(task_hub, token)",
];

/// Configuration for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Namespace for every row this provider reads or writes.
    pub task_hub: String,
    /// Pool size for file databases. In-memory databases always use one connection.
    pub max_connections: u32,
    /// How long maintenance operations wait for the hub lease.
    pub lock_acquire_timeout: Duration,
    /// SQLite busy handler timeout.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            task_hub: "default".to_string(),
            max_connections: 5,
            lock_acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(60),
        }
    }
}

impl SqliteOptions {
    pub fn with_task_hub(mut self, task_hub: impl Into<String>) -> Self {
        self.task_hub = task_hub.into();
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// SQLite-backed provider.
///
/// Every mutating operation is a single transaction that starts with a write
/// statement, so the database write lock is taken (and waited for through the
/// busy handler) before anything is read.
pub struct SqliteProvider {
    pool: SqlitePool,
    options: SqliteOptions,
    lock: SqliteScopeLock,
}

fn db_err(operation: &'static str) -> impl Fn(sqlx::Error) -> ProviderError {
    move |e| ProviderError::from_sqlx(operation, e)
}

fn now_millis() -> i64 {
    lock::now_millis()
}

impl SqliteProvider {
    /// Open (creating if missing) the database at `database_url` and make sure
    /// the schema exists and matches [`CURRENT_SCHEMA_VERSION`].
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened, the hub lease for schema
    /// creation cannot be obtained, or the stored schema version differs.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, ProviderError> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let connect = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err("connect"))?
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout)
            .foreign_keys(true);
        let connect = if is_memory {
            connect
                .journal_mode(SqliteJournalMode::Memory)
                .synchronous(SqliteSynchronous::Off)
        } else {
            connect
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        // An in-memory database lives as long as its last connection.
        let pool_options = if is_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.max_connections.max(1))
        };
        let pool = pool_options.connect_with(connect).await.map_err(db_err("connect"))?;

        let holder = format!("provider-{}", uuid::Uuid::new_v4().simple());
        let lock = SqliteScopeLock::new(pool.clone(), options.task_hub.clone(), holder);
        let provider = Self { pool, options, lock };
        provider.initialize_schema().await?;

        debug!(
            target: "durasql::providers::sqlite",
            task_hub = %provider.options.task_hub,
            in_memory = is_memory,
            "SQLite provider ready"
        );
        Ok(provider)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn new_in_memory() -> Result<Self, ProviderError> {
        Self::new_in_memory_with_options(None).await
    }

    pub async fn new_in_memory_with_options(options: Option<SqliteOptions>) -> Result<Self, ProviderError> {
        Self::new("sqlite::memory:", options).await
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    /// Lease manager sharing this provider's pool and task hub.
    pub fn scope_lock(&self) -> &SqliteScopeLock {
        &self.lock
    }

    async fn initialize_schema(&self) -> Result<(), ProviderError> {
        for stmt in LOCK_SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err("create_schema"))?;
        }

        let handle = self
            .lock
            .acquire(HUB_SCOPE, MAINTENANCE_LEASE, self.options.lock_acquire_timeout)
            .await?;
        let created = self.create_schema().await;
        if let Err(e) = self.lock.release(handle).await {
            warn!(target: "durasql::providers::sqlite", error = %e, "Failed to release hub lock after schema creation");
        }
        created?;

        self.validate_schema().await
    }

    async fn create_schema(&self) -> Result<(), ProviderError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err("create_schema"))?;
        }
        sqlx::query("INSERT OR IGNORE INTO schema_version (id, version, applied_at) VALUES (1, ?1, ?2)")
            .bind(CURRENT_SCHEMA_VERSION)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(db_err("create_schema"))?;
        Ok(())
    }

    fn hub(&self) -> &str {
        &self.options.task_hub
    }

    async fn read_history_in_tx(
        conn: &mut SqliteConnection,
        task_hub: &str,
        instance: &str,
        execution_id: u64,
    ) -> Result<Result<Vec<Event>, String>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT event_data FROM history
            WHERE task_hub = ?1 AND instance_id = ?2 AND execution_id = ?3
            ORDER BY event_id
            "#,
        )
        .bind(task_hub)
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let data: String = row.try_get("event_data")?;
            match serde_json::from_str::<Event>(&data) {
                Ok(event) => events.push(event),
                Err(e) => {
                    return Ok(Err(format!(
                        "Failed to deserialize history event at position {idx} for instance '{instance}' execution {execution_id}: {e}"
                    )))
                }
            }
        }
        Ok(Ok(events))
    }

    async fn append_history_in_tx(
        conn: &mut SqliteConnection,
        task_hub: &str,
        instance: &str,
        execution_id: u64,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        const OP: &str = "ack_orchestration_item";
        let Some(first) = events.first() else {
            return Ok(());
        };

        let last_id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(event_id), 0) FROM history WHERE task_hub = ?1 AND instance_id = ?2 AND execution_id = ?3",
        )
        .bind(task_hub)
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err(OP))?;

        if first.event_id != last_id as u64 + 1 {
            return Err(ProviderError::permanent(
                OP,
                format!(
                    "history append for '{instance}' execution {execution_id} starts at event {} but the last stored event is {last_id}",
                    first.event_id
                ),
            ));
        }
        if events.windows(2).any(|w| w[1].event_id != w[0].event_id + 1) {
            return Err(ProviderError::permanent(OP, "history delta event ids are not sequential"));
        }

        let now = now_millis();
        for event in events {
            let data = serde_json::to_string(event).map_err(|e| ProviderError::serialization(OP, e))?;
            sqlx::query(
                r#"
                INSERT INTO history (task_hub, instance_id, execution_id, event_id, event_type, event_data, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(task_hub)
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id as i64)
            .bind(event.kind.name())
            .bind(data)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(db_err(OP))?;
        }
        Ok(())
    }

    async fn enqueue_orchestrator_in_tx(
        conn: &mut SqliteConnection,
        task_hub: &str,
        item: &WorkItem,
        visible_at: i64,
        operation: &'static str,
    ) -> Result<(), ProviderError> {
        let data = serde_json::to_string(item).map_err(|e| ProviderError::serialization(operation, e))?;
        sqlx::query(
            r#"
            INSERT INTO orchestrator_queue (task_hub, instance_id, work_item, visible_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(task_hub)
        .bind(item.instance())
        .bind(data)
        .bind(visible_at)
        .bind(now_millis())
        .execute(&mut *conn)
        .await
        .map_err(db_err(operation))?;
        debug!(
            target: "durasql::providers::sqlite",
            instance = %item.instance(),
            kind = item.kind_name(),
            visible_at,
            "Enqueued orchestrator message"
        );
        Ok(())
    }

    async fn enqueue_worker_in_tx(
        conn: &mut SqliteConnection,
        task_hub: &str,
        item: &WorkItem,
        operation: &'static str,
    ) -> Result<(), ProviderError> {
        let data = serde_json::to_string(item).map_err(|e| ProviderError::serialization(operation, e))?;
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO worker_queue (task_hub, instance_id, work_item, visible_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(task_hub)
        .bind(item.instance())
        .bind(data)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err(operation))?;
        Ok(())
    }

    /// Remove one terminal instance. The first statement doubles as the
    /// terminal-status check and takes the write lock.
    async fn purge_in_tx(
        conn: &mut SqliteConnection,
        task_hub: &str,
        instance: &str,
    ) -> Result<PurgeResult, sqlx::Error> {
        let terminal: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE instances SET updated_at = updated_at
            WHERE task_hub = ?1 AND instance_id = ?2 AND status IN ('Completed', 'Failed', 'Terminated')
            RETURNING instance_id
            "#,
        )
        .bind(task_hub)
        .bind(instance)
        .fetch_optional(&mut *conn)
        .await?;
        if terminal.is_none() {
            return Ok(PurgeResult::default());
        }

        let mut result = PurgeResult {
            instances_deleted: 0,
            ..Default::default()
        };
        result.events_deleted = sqlx::query("DELETE FROM history WHERE task_hub = ?1 AND instance_id = ?2")
            .bind(task_hub)
            .bind(instance)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        result.executions_deleted = sqlx::query("DELETE FROM executions WHERE task_hub = ?1 AND instance_id = ?2")
            .bind(task_hub)
            .bind(instance)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        result.messages_deleted = sqlx::query("DELETE FROM orchestrator_queue WHERE task_hub = ?1 AND instance_id = ?2")
            .bind(task_hub)
            .bind(instance)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        result.messages_deleted += sqlx::query("DELETE FROM worker_queue WHERE task_hub = ?1 AND instance_id = ?2")
            .bind(task_hub)
            .bind(instance)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        result.instances_deleted = sqlx::query("DELETE FROM instances WHERE task_hub = ?1 AND instance_id = ?2")
            .bind(task_hub)
            .bind(instance)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(result)
    }

    async fn purge_one(&self, instance: &str) -> Result<PurgeResult, ProviderError> {
        const OP: &str = "purge_instance";
        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;
        let result = Self::purge_in_tx(&mut tx, self.hub(), instance).await.map_err(db_err(OP))?;
        tx.commit().await.map_err(db_err(OP))?;
        if result.instances_deleted > 0 {
            debug!(
                target: "durasql::providers::sqlite",
                instance = %instance,
                events = result.events_deleted,
                executions = result.executions_deleted,
                "Purged instance"
            );
        }
        Ok(result)
    }

    async fn select_purge_candidates(&self, filter: &PurgeFilter) -> Result<Vec<String>, ProviderError> {
        let mut statuses: Vec<OrchestrationStatus> = if filter.statuses.is_empty() {
            vec![
                OrchestrationStatus::Completed,
                OrchestrationStatus::Failed,
                OrchestrationStatus::Terminated,
            ]
        } else {
            filter.statuses.iter().copied().filter(|s| s.is_terminal()).collect()
        };
        statuses.dedup();
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            r#"
            SELECT instance_id FROM instances
            WHERE task_hub = ? AND status IN ({placeholders})
              AND (? IS NULL OR completed_at < ?)
            ORDER BY completed_at, instance_id
            LIMIT ?
            "#
        );
        let before = filter.completed_before_ms.map(|t| t as i64);
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(self.hub());
        for status in &statuses {
            query = query.bind(status.as_str());
        }
        query
            .bind(before)
            .bind(before)
            .bind(filter.limit.unwrap_or(DEFAULT_PURGE_LIMIT) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("purge_instances"))
    }
}

fn decode_status(operation: &'static str, raw: &str) -> Result<OrchestrationStatus, ProviderError> {
    raw.parse().map_err(|e: String| ProviderError::permanent(operation, e))
}

fn instance_info_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<InstanceInfo, ProviderError> {
    const OP: &str = "get_instance_info";
    let get_err = db_err(OP);
    let status: String = row.try_get("status").map_err(&get_err)?;
    Ok(InstanceInfo {
        instance_id: row.try_get("instance_id").map_err(&get_err)?,
        orchestration_name: row.try_get("orchestration_name").map_err(&get_err)?,
        execution_id: row.try_get::<i64, _>("current_execution_id").map_err(&get_err)? as u64,
        status: decode_status(OP, &status)?,
        input: row.try_get("input").map_err(&get_err)?,
        output: row.try_get("output").map_err(&get_err)?,
        custom_status: row.try_get("custom_status").map_err(&get_err)?,
        parent_instance: row.try_get("parent_instance_id").map_err(&get_err)?,
        created_at_ms: row.try_get::<i64, _>("created_at").map_err(&get_err)? as u64,
        updated_at_ms: row.try_get::<i64, _>("updated_at").map_err(&get_err)? as u64,
        completed_at_ms: row
            .try_get::<Option<i64>, _>("completed_at")
            .map_err(&get_err)?
            .map(|t| t as u64),
    })
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn task_hub(&self) -> &str {
        self.hub()
    }

    async fn validate_schema(&self) -> Result<(), ProviderError> {
        const OP: &str = "validate_schema";
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err(OP))?;
        match version {
            Some(v) if v == CURRENT_SCHEMA_VERSION => Ok(()),
            Some(v) => Err(ProviderError::permanent(
                OP,
                format!("database schema version {v} does not match expected version {CURRENT_SCHEMA_VERSION}"),
            )),
            None => Err(ProviderError::permanent(OP, "database schema version is not recorded")),
        }
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
        max_batch: usize,
    ) -> Result<Option<(OrchestrationItem, String, u32)>, ProviderError> {
        const OP: &str = "fetch_orchestration_item";
        let hub = self.hub();

        // Read-only check first so idle polls never take the write lock.
        let visible_now = now_millis();
        let visible: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT q.id FROM orchestrator_queue q
            WHERE q.task_hub = ?1 AND q.visible_at <= ?2
              AND NOT EXISTS (
                SELECT 1 FROM app_locks l
                WHERE l.task_hub = q.task_hub AND l.scope = 'instance:' || q.instance_id AND l.locked_until > ?2
              )
            LIMIT 1
            "#,
        )
        .bind(hub)
        .bind(visible_now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(OP))?;
        if visible.is_none() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;
        let now = now_millis();
        let reaped = lock::reap_expired(&mut tx, hub, now).await.map_err(db_err(OP))?;
        if reaped > 0 {
            debug!(target: "durasql::providers::sqlite", reaped, "Reclaimed expired leases");
        }

        let candidate: Option<String> = sqlx::query_scalar(
            r#"
            SELECT q.instance_id FROM orchestrator_queue q
            WHERE q.task_hub = ?1 AND q.visible_at <= ?2
              AND NOT EXISTS (
                SELECT 1 FROM app_locks l WHERE l.task_hub = q.task_hub AND l.scope = 'instance:' || q.instance_id
              )
            ORDER BY q.visible_at, q.id
            LIMIT 1
            "#,
        )
        .bind(hub)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err(OP))?;

        let Some(instance_id) = candidate else {
            tx.commit().await.map_err(db_err(OP))?;
            return Ok(None);
        };

        let lock_token = lock::new_lock_token();
        let locked_until = now + lock_timeout.as_millis() as i64;
        let claimed = lock::claim(
            &mut tx,
            hub,
            &lock::instance_scope(&instance_id),
            &lock_token,
            now,
            locked_until,
        )
        .await
        .map_err(db_err(OP))?;
        if !claimed {
            debug!(target: "durasql::providers::sqlite", instance = %instance_id, "Instance already leased");
            tx.rollback().await.ok();
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE orchestrator_queue
            SET lock_token = ?1, attempt_count = attempt_count + 1
            WHERE id IN (
                SELECT id FROM orchestrator_queue
                WHERE task_hub = ?2 AND instance_id = ?3 AND visible_at <= ?4
                ORDER BY visible_at, id
                LIMIT ?5
            )
            "#,
        )
        .bind(&lock_token)
        .bind(hub)
        .bind(&instance_id)
        .bind(now)
        .bind(max_batch.max(1) as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err(OP))?;

        let rows = sqlx::query(
            r#"
            SELECT id, work_item, attempt_count FROM orchestrator_queue
            WHERE task_hub = ?1 AND lock_token = ?2
            ORDER BY visible_at, id
            "#,
        )
        .bind(hub)
        .bind(&lock_token)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err(OP))?;

        if rows.is_empty() {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let mut max_attempt_count: u32 = 0;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let attempts: i64 = row.try_get("attempt_count").map_err(db_err(OP))?;
            max_attempt_count = max_attempt_count.max(attempts as u32);
            let data: String = row.try_get("work_item").map_err(db_err(OP))?;
            match serde_json::from_str::<WorkItem>(&data) {
                Ok(item) => messages.push(item),
                Err(e) => {
                    let id: i64 = row.try_get("id").unwrap_or_default();
                    warn!(
                        target: "durasql::providers::sqlite",
                        instance = %instance_id,
                        message_id = id,
                        error = %e,
                        "Dropping undecodable orchestrator message"
                    );
                }
            }
        }

        let instance_row = sqlx::query(
            "SELECT orchestration_name, current_execution_id FROM instances WHERE task_hub = ?1 AND instance_id = ?2",
        )
        .bind(hub)
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err(OP))?;

        let (orchestration_name, execution_id) = match instance_row {
            Some(row) => {
                let name: String = row.try_get("orchestration_name").map_err(db_err(OP))?;
                let exec: i64 = row.try_get("current_execution_id").map_err(db_err(OP))?;
                (Some(name), exec as u64)
            }
            None => {
                let exec = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartOrchestration { execution_id, .. } => Some(*execution_id),
                        _ => None,
                    })
                    .unwrap_or(INITIAL_EXECUTION_ID);
                (None, exec)
            }
        };

        let (history, history_error) = match Self::read_history_in_tx(&mut tx, hub, &instance_id, execution_id)
            .await
            .map_err(db_err(OP))?
        {
            Ok(history) => (history, None),
            Err(message) => {
                warn!(target: "durasql::providers::sqlite", instance = %instance_id, error = %message, "History could not be decoded");
                (Vec::new(), Some(message))
            }
        };

        tx.commit().await.map_err(db_err(OP))?;

        debug!(
            target: "durasql::providers::sqlite",
            instance = %instance_id,
            execution_id,
            messages = messages.len(),
            history_len = history.len(),
            attempt = max_attempt_count,
            "Fetched orchestration item"
        );

        Ok(Some((
            OrchestrationItem {
                instance: instance_id,
                orchestration_name,
                execution_id,
                history,
                messages,
                history_error,
            },
            lock_token,
            max_attempt_count,
        )))
    }

    async fn ack_orchestration_item(&self, lock_token: &str, commit: TurnCommit) -> Result<(), ProviderError> {
        const OP: &str = "ack_orchestration_item";
        let hub = self.hub();
        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;
        let now = now_millis();

        let Some(scope) = lock::validate(&mut tx, hub, lock_token, now).await.map_err(db_err(OP))? else {
            tx.rollback().await.ok();
            warn!(target: "durasql::providers::sqlite", lock_token = %lock_token, "Instance lease expired or invalid, aborting ack");
            return Err(ProviderError::permanent(OP, "Instance lease expired or invalid"));
        };
        let Some(instance_id) = lock::instance_from_scope(&scope).map(str::to_string) else {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(OP, format!("Token does not belong to an instance lease: {scope}")));
        };

        let TurnCommit {
            execution_id,
            history_delta,
            worker_items,
            orchestrator_items,
            metadata,
        } = commit;
        let exec = execution_id as i64;

        let consumed = sqlx::query("DELETE FROM orchestrator_queue WHERE task_hub = ?1 AND lock_token = ?2")
            .bind(hub)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?
            .rows_affected();

        if let Some(name) = &metadata.orchestration_name {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO instances
                    (task_hub, instance_id, orchestration_name, current_execution_id, status, input,
                     parent_instance_id, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'Running', ?5, ?6, ?7, ?7)
                "#,
            )
            .bind(hub)
            .bind(&instance_id)
            .bind(name)
            .bind(exec)
            .bind(&metadata.input)
            .bind(&metadata.parent_instance)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;
        }

        if !history_delta.is_empty() || metadata.status.is_some() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO executions (task_hub, instance_id, execution_id, status, input, started_at)
                VALUES (?1, ?2, ?3, 'Running', ?4, ?5)
                "#,
            )
            .bind(hub)
            .bind(&instance_id)
            .bind(exec)
            .bind(&metadata.input)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;

            sqlx::query(
                r#"
                UPDATE instances
                SET current_execution_id = MAX(current_execution_id, ?1),
                    input = COALESCE(?2, input),
                    updated_at = ?3
                WHERE task_hub = ?4 AND instance_id = ?5
                "#,
            )
            .bind(exec)
            .bind(&metadata.input)
            .bind(now)
            .bind(hub)
            .bind(&instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;
        }

        Self::append_history_in_tx(&mut tx, hub, &instance_id, execution_id, &history_delta).await?;

        if let Some(status) = metadata.status {
            let execution_closed = status != OrchestrationStatus::Running && status != OrchestrationStatus::Pending;
            sqlx::query(
                r#"
                UPDATE executions SET status = ?1, output = ?2, completed_at = ?3
                WHERE task_hub = ?4 AND instance_id = ?5 AND execution_id = ?6
                "#,
            )
            .bind(status.as_str())
            .bind(&metadata.output)
            .bind(execution_closed.then_some(now))
            .bind(hub)
            .bind(&instance_id)
            .bind(exec)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;

            sqlx::query(
                r#"
                UPDATE instances SET status = ?1, output = ?2, completed_at = ?3, updated_at = ?4
                WHERE task_hub = ?5 AND instance_id = ?6 AND current_execution_id = ?7
                "#,
            )
            .bind(status.as_str())
            .bind(&metadata.output)
            .bind(status.is_terminal().then_some(now))
            .bind(now)
            .bind(hub)
            .bind(&instance_id)
            .bind(exec)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;
        }

        if let Some(custom_status) = &metadata.custom_status {
            sqlx::query("UPDATE instances SET custom_status = ?1 WHERE task_hub = ?2 AND instance_id = ?3")
                .bind(custom_status)
                .bind(hub)
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err(OP))?;
        }

        for item in &worker_items {
            Self::enqueue_worker_in_tx(&mut tx, hub, item, OP).await?;
        }
        for item in &orchestrator_items {
            let visible_at = item.visible_at_ms().map(|t| t as i64).unwrap_or(now);
            Self::enqueue_orchestrator_in_tx(&mut tx, hub, item, visible_at, OP).await?;
        }

        lock::release_token(&mut tx, hub, lock_token).await.map_err(db_err(OP))?;
        tx.commit().await.map_err(db_err(OP))?;

        debug!(
            target: "durasql::providers::sqlite",
            instance = %instance_id,
            execution_id,
            consumed,
            history_delta = history_delta.len(),
            worker_items = worker_items.len(),
            orchestrator_items = orchestrator_items.len(),
            status = ?metadata.status,
            "Acknowledged orchestration item and released lease"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_orchestration_item";
        let hub = self.hub();
        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;

        let Some(scope) = lock::release_token(&mut tx, hub, lock_token).await.map_err(db_err(OP))? else {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(OP, "Invalid lock token"));
        };

        // Messages that arrived during the turn are parked with the batch so
        // the instance keeps its enqueue order.
        if let Some(delay) = delay {
            let now = now_millis();
            let instance_id = lock::instance_from_scope(&scope).unwrap_or(&scope);
            sqlx::query(
                r#"
                UPDATE orchestrator_queue SET visible_at = ?1
                WHERE task_hub = ?2 AND instance_id = ?3 AND (lock_token = ?4 OR visible_at <= ?5)
                "#,
            )
            .bind(now + delay.as_millis() as i64)
            .bind(hub)
            .bind(instance_id)
            .bind(lock_token)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;
        }
        tx.commit().await.map_err(db_err(OP))?;

        debug!(target: "durasql::providers::sqlite", scope = %scope, ?delay, "Abandoned orchestration item");
        Ok(())
    }

    async fn renew_orchestration_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        const OP: &str = "renew_orchestration_item_lock";
        let mut conn = self.pool.acquire().await.map_err(db_err(OP))?;
        let now = now_millis();
        let renewed = lock::extend(&mut conn, self.hub(), lock_token, now, now + extend_for.as_millis() as i64)
            .await
            .map_err(db_err(OP))?;
        if !renewed {
            return Err(ProviderError::permanent(OP, "Lease expired or invalid"));
        }
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "enqueue_for_orchestrator";
        let now = now_millis();
        let visible_at = match delay {
            Some(d) => now + d.as_millis() as i64,
            None => item.visible_at_ms().map(|t| t as i64).unwrap_or(now),
        };
        let mut conn = self.pool.acquire().await.map_err(db_err(OP))?;
        Self::enqueue_orchestrator_in_tx(&mut conn, self.hub(), &item, visible_at, OP).await
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String, u32)>, ProviderError> {
        const OP: &str = "fetch_work_item";
        let hub = self.hub();
        let now = now_millis();

        let available: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM worker_queue
            WHERE task_hub = ?1 AND visible_at <= ?2 AND (lock_token IS NULL OR locked_until <= ?2)
            LIMIT 1
            "#,
        )
        .bind(hub)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(OP))?;
        if available.is_none() {
            return Ok(None);
        }

        let lock_token = lock::new_lock_token();
        let now = now_millis();
        let row = sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = ?1, locked_until = ?2, attempt_count = attempt_count + 1
            WHERE id = (
                SELECT id FROM worker_queue
                WHERE task_hub = ?3 AND visible_at <= ?4 AND (lock_token IS NULL OR locked_until <= ?4)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, work_item, attempt_count
            "#,
        )
        .bind(&lock_token)
        .bind(now + lock_timeout.as_millis() as i64)
        .bind(hub)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(OP))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.try_get("work_item").map_err(db_err(OP))?;
        let attempt_count: i64 = row.try_get("attempt_count").map_err(db_err(OP))?;
        let item: WorkItem = serde_json::from_str(&data)
            .map_err(|e| ProviderError::permanent(OP, format!("Deserialization error: {e}")))?;

        debug!(
            target: "durasql::providers::sqlite",
            instance = %item.instance(),
            kind = item.kind_name(),
            attempt = attempt_count,
            "Fetched work item"
        );
        Ok(Some((item, lock_token, attempt_count as u32)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        const OP: &str = "ack_work_item";
        let hub = self.hub();
        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;

        let deleted = sqlx::query("DELETE FROM worker_queue WHERE task_hub = ?1 AND lock_token = ?2")
            .bind(hub)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(OP, "Work item lease lost or already acknowledged"));
        }

        let visible_at = completion.visible_at_ms().map(|t| t as i64).unwrap_or_else(now_millis);
        Self::enqueue_orchestrator_in_tx(&mut tx, hub, &completion, visible_at, OP).await?;
        tx.commit().await.map_err(db_err(OP))?;
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        const OP: &str = "abandon_work_item";
        let visible_at = delay.map(|d| now_millis() + d.as_millis() as i64);
        let result = sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = NULL, locked_until = NULL, visible_at = COALESCE(?1, visible_at)
            WHERE task_hub = ?2 AND lock_token = ?3
            "#,
        )
        .bind(visible_at)
        .bind(self.hub())
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(db_err(OP))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(OP, "Invalid lock token"));
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        const OP: &str = "renew_work_item_lock";
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE worker_queue SET locked_until = ?1 WHERE task_hub = ?2 AND lock_token = ?3 AND locked_until > ?4",
        )
        .bind(now + extend_for.as_millis() as i64)
        .bind(self.hub())
        .bind(lock_token)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err(OP))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(OP, "Lease expired or invalid"));
        }
        Ok(())
    }

    async fn create_instance(&self, request: NewInstance) -> Result<CreateOutcome, ProviderError> {
        const OP: &str = "create_instance";
        let hub = self.hub();
        let mut tx = self.pool.begin().await.map_err(db_err(OP))?;
        let now = now_millis();

        let inserted = sqlx::query(
            r#"
            INSERT INTO instances
                (task_hub, instance_id, orchestration_name, current_execution_id, status, input, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'Pending', ?5, ?6, ?6)
            ON CONFLICT(task_hub, instance_id) DO NOTHING
            "#,
        )
        .bind(hub)
        .bind(&request.instance)
        .bind(&request.orchestration)
        .bind(INITIAL_EXECUTION_ID as i64)
        .bind(&request.input)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err(OP))?
        .rows_affected();

        let execution_id = if inserted == 1 {
            INITIAL_EXECUTION_ID
        } else {
            let row = sqlx::query(
                "SELECT status, current_execution_id FROM instances WHERE task_hub = ?1 AND instance_id = ?2",
            )
            .bind(hub)
            .bind(&request.instance)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err(OP))?;
            let status: String = row.try_get("status").map_err(db_err(OP))?;
            let current: i64 = row.try_get("current_execution_id").map_err(db_err(OP))?;
            if !decode_status(OP, &status)?.is_terminal() {
                tx.rollback().await.ok();
                return Ok(CreateOutcome::AlreadyRunning);
            }

            let next = current as u64 + 1;
            sqlx::query(
                r#"
                UPDATE instances
                SET orchestration_name = ?1, current_execution_id = ?2, status = 'Pending', input = ?3,
                    output = NULL, custom_status = NULL, completed_at = NULL, created_at = ?4, updated_at = ?4
                WHERE task_hub = ?5 AND instance_id = ?6
                "#,
            )
            .bind(&request.orchestration)
            .bind(next as i64)
            .bind(&request.input)
            .bind(now)
            .bind(hub)
            .bind(&request.instance)
            .execute(&mut *tx)
            .await
            .map_err(db_err(OP))?;
            next
        };

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO executions (task_hub, instance_id, execution_id, status, input, started_at)
            VALUES (?1, ?2, ?3, 'Pending', ?4, ?5)
            "#,
        )
        .bind(hub)
        .bind(&request.instance)
        .bind(execution_id as i64)
        .bind(&request.input)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err(OP))?;

        let start = WorkItem::StartOrchestration {
            instance: request.instance.clone(),
            orchestration: request.orchestration.clone(),
            input: request.input.clone(),
            execution_id,
            parent: None,
        };
        Self::enqueue_orchestrator_in_tx(&mut tx, hub, &start, now, OP).await?;
        tx.commit().await.map_err(db_err(OP))?;

        debug!(
            target: "durasql::providers::sqlite",
            instance = %request.instance,
            orchestration = %request.orchestration,
            execution_id,
            "Created instance"
        );
        Ok(CreateOutcome::Created { execution_id })
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, orchestration_name, current_execution_id, status, input, output, custom_status,
                   parent_instance_id, created_at, updated_at, completed_at
            FROM instances WHERE task_hub = ?1 AND instance_id = ?2
            "#,
        )
        .bind(self.hub())
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get_instance_info"))?;
        row.as_ref().map(instance_info_from_row).transpose()
    }

    async fn read_history(&self, instance: &str, execution_id: Option<u64>) -> Result<Vec<Event>, ProviderError> {
        const OP: &str = "read_history";
        let hub = self.hub();
        let mut conn = self.pool.acquire().await.map_err(db_err(OP))?;
        let execution_id = match execution_id {
            Some(id) => id,
            None => {
                let current: Option<i64> = sqlx::query_scalar(
                    "SELECT current_execution_id FROM instances WHERE task_hub = ?1 AND instance_id = ?2",
                )
                .bind(hub)
                .bind(instance)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_err(OP))?;
                match current {
                    Some(id) => id as u64,
                    None => return Ok(Vec::new()),
                }
            }
        };
        Self::read_history_in_tx(&mut conn, hub, instance, execution_id)
            .await
            .map_err(db_err(OP))?
            .map_err(|message| ProviderError::permanent(OP, message))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<ExecutionInfo>, ProviderError> {
        const OP: &str = "list_executions";
        let rows = sqlx::query(
            r#"
            SELECT e.execution_id, e.status, e.output, e.started_at, e.completed_at,
                   (SELECT COUNT(*) FROM history h
                    WHERE h.task_hub = e.task_hub AND h.instance_id = e.instance_id AND h.execution_id = e.execution_id)
                   AS event_count
            FROM executions e
            WHERE e.task_hub = ?1 AND e.instance_id = ?2
            ORDER BY e.execution_id
            "#,
        )
        .bind(self.hub())
        .bind(instance)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(OP))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(db_err(OP))?;
                Ok(ExecutionInfo {
                    execution_id: row.try_get::<i64, _>("execution_id").map_err(db_err(OP))? as u64,
                    status: decode_status(OP, &status)?,
                    output: row.try_get("output").map_err(db_err(OP))?,
                    event_count: row.try_get::<i64, _>("event_count").map_err(db_err(OP))? as u64,
                    started_at_ms: row.try_get::<i64, _>("started_at").map_err(db_err(OP))? as u64,
                    completed_at_ms: row
                        .try_get::<Option<i64>, _>("completed_at")
                        .map_err(db_err(OP))?
                        .map(|t| t as u64),
                })
            })
            .collect()
    }

    async fn purge_instance(&self, instance: &str) -> Result<PurgeResult, ProviderError> {
        self.purge_one(instance).await
    }

    async fn purge_instances(&self, filter: PurgeFilter) -> Result<PurgeResult, ProviderError> {
        let handle = self
            .lock
            .acquire(HUB_SCOPE, MAINTENANCE_LEASE, self.options.lock_acquire_timeout)
            .await?;

        let swept = async {
            let mut total = PurgeResult::default();
            for instance in self.select_purge_candidates(&filter).await? {
                total += self.purge_one(&instance).await?;
            }
            Ok::<_, ProviderError>(total)
        }
        .await;

        if let Err(e) = self.lock.release(handle).await {
            warn!(target: "durasql::providers::sqlite", error = %e, "Failed to release hub lock after purge");
        }
        let total = swept?;
        debug!(
            target: "durasql::providers::sqlite",
            instances = total.instances_deleted,
            events = total.events_deleted,
            "Purge sweep finished"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ExecutionMetadata;
    use crate::{EventKind, FailureDetails};

    async fn create_test_store() -> SqliteProvider {
        SqliteProvider::new_in_memory().await.expect("in-memory store")
    }

    fn started() -> Vec<Event> {
        vec![
            Event::new(
                1,
                None,
                10,
                EventKind::ExecutionStarted {
                    name: "Orch".into(),
                    input: "in".into(),
                    parent: None,
                },
            ),
            Event::new(2, None, 10, EventKind::OrchestratorStarted),
        ]
    }

    fn first_turn() -> TurnCommit {
        TurnCommit {
            execution_id: 1,
            history_delta: started(),
            metadata: ExecutionMetadata {
                orchestration_name: Some("Orch".into()),
                input: Some("in".into()),
                status: Some(OrchestrationStatus::Running),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn create(store: &SqliteProvider, instance: &str) -> u64 {
        match store
            .create_instance(NewInstance {
                instance: instance.into(),
                orchestration: "Orch".into(),
                input: "in".into(),
            })
            .await
            .unwrap()
        {
            CreateOutcome::Created { execution_id } => execution_id,
            CreateOutcome::AlreadyRunning => panic!("instance unexpectedly running"),
        }
    }

    #[tokio::test]
    async fn create_fetch_ack_round() {
        let store = create_test_store().await;
        assert_eq!(create(&store, "inst-1").await, 1);

        let (item, token, attempts) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .expect("start message");
        assert_eq!(item.instance, "inst-1");
        assert_eq!(item.execution_id, 1);
        assert_eq!(item.orchestration_name.as_deref(), Some("Orch"));
        assert!(item.history.is_empty());
        assert_eq!(attempts, 1);
        assert!(matches!(item.messages[0], WorkItem::StartOrchestration { .. }));

        let mut commit = first_turn();
        commit.worker_items.push(WorkItem::ActivityExecute {
            instance: "inst-1".into(),
            execution_id: 1,
            id: 3,
            name: "A".into(),
            input: "x".into(),
        });
        store.ack_orchestration_item(&token, commit).await.unwrap();

        let history = store.read_history("inst-1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        let info = store.get_instance_info("inst-1").await.unwrap().unwrap();
        assert_eq!(info.status, OrchestrationStatus::Running);

        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());

        let (work, wtoken, _) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(matches!(work, WorkItem::ActivityExecute { id: 3, .. }));
        store
            .ack_work_item(
                &wtoken,
                WorkItem::ActivityCompleted {
                    instance: "inst-1".into(),
                    execution_id: 1,
                    id: 3,
                    result: "y".into(),
                },
            )
            .await
            .unwrap();
        assert!(store.fetch_work_item(Duration::from_secs(30)).await.unwrap().is_none());

        let (item, _, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.history.len(), 2);
        assert!(matches!(item.messages[0], WorkItem::ActivityCompleted { .. }));
    }

    #[tokio::test]
    async fn leased_instance_is_not_fetched_twice() {
        let store = create_test_store().await;
        create(&store, "inst-1").await;
        let first = store.fetch_orchestration_item(Duration::from_secs(30), 100).await.unwrap();
        assert!(first.is_some());

        store
            .enqueue_for_orchestrator(
                WorkItem::ExternalRaised {
                    instance: "inst-1".into(),
                    name: "go".into(),
                    data: "1".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_token_cannot_ack() {
        let store = create_test_store().await;
        create(&store, "inst-1").await;
        let (_, stale_token, _) = store
            .fetch_orchestration_item(Duration::from_millis(50), 100)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (item, fresh_token, attempts) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .expect("redelivered after lease expiry");
        assert_eq!(attempts, 2);
        assert_eq!(item.messages.len(), 1);

        let err = store
            .ack_orchestration_item(&stale_token, first_turn())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(store.read_history("inst-1", None).await.unwrap().is_empty());

        store
            .ack_orchestration_item(&fresh_token, first_turn())
            .await
            .unwrap();
        assert_eq!(store.read_history("inst-1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn abandon_with_delay_hides_messages() {
        let store = create_test_store().await;
        create(&store, "inst-1").await;
        let (_, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        store
            .abandon_orchestration_item(&token, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_some());
        assert!(store.abandon_orchestration_item(&token, None).await.is_err());
    }

    #[tokio::test]
    async fn abandon_with_delay_keeps_enqueue_order() {
        let store = create_test_store().await;
        let raised = |data: &str| WorkItem::ExternalRaised {
            instance: "inst-1".into(),
            name: "Go".into(),
            data: data.into(),
        };
        store.enqueue_for_orchestrator(raised("a"), None).await.unwrap();
        let (first, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.messages, vec![raised("a")]);

        store.enqueue_for_orchestrator(raised("b"), None).await.unwrap();
        store
            .abandon_orchestration_item(&token, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let (again, _, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.messages, vec![raised("a"), raised("b")]);
    }

    #[tokio::test]
    async fn timers_become_visible_at_fire_time_in_order() {
        let store = create_test_store().await;
        let now = now_millis() as u64;
        for (id, offset) in [(5u64, 150u64), (4, 100)] {
            store
                .enqueue_for_orchestrator(
                    WorkItem::TimerFired {
                        instance: "inst-t".into(),
                        execution_id: 1,
                        id,
                        fire_at_ms: now + offset,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        assert!(store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (item, _, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<u64> = item
            .messages
            .iter()
            .map(|m| match m {
                WorkItem::TimerFired { id, .. } => *id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn batch_size_limits_messages_per_fetch() {
        let store = create_test_store().await;
        for i in 0..5 {
            store
                .enqueue_for_orchestrator(
                    WorkItem::ExternalRaised {
                        instance: "inst-b".into(),
                        name: "e".into(),
                        data: i.to_string(),
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let (item, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.messages.len(), 2);
        store
            .ack_orchestration_item(&token, TurnCommit::default())
            .await
            .unwrap();
        let (item, _, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.messages.len(), 3);
    }

    #[tokio::test]
    async fn append_rejects_event_id_gaps() {
        let store = create_test_store().await;
        create(&store, "inst-1").await;
        let (_, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        let mut commit = first_turn();
        commit.history_delta[1].event_id = 5;
        assert!(store.ack_orchestration_item(&token, commit).await.is_err());
        assert!(store.read_history("inst-1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_lease_renew_and_abandon() {
        let store = create_test_store().await;
        let mut conn = store.pool.acquire().await.unwrap();
        SqliteProvider::enqueue_worker_in_tx(
            &mut conn,
            store.hub(),
            &WorkItem::ActivityExecute {
                instance: "inst-w".into(),
                execution_id: 1,
                id: 2,
                name: "A".into(),
                input: String::new(),
            },
            "test",
        )
        .await
        .unwrap();
        drop(conn);

        let (_, token, attempts) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(attempts, 1);
        store.renew_work_item_lock(&token, Duration::from_secs(60)).await.unwrap();
        assert!(store.fetch_work_item(Duration::from_secs(30)).await.unwrap().is_none());

        store.abandon_work_item(&token, None).await.unwrap();
        assert!(store.renew_work_item_lock(&token, Duration::from_secs(1)).await.is_err());
        let (_, _, attempts) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn create_rejects_running_and_restarts_terminal_instances() {
        let store = create_test_store().await;
        create(&store, "inst-1").await;
        let again = store
            .create_instance(NewInstance {
                instance: "inst-1".into(),
                orchestration: "Orch".into(),
                input: "in".into(),
            })
            .await
            .unwrap();
        assert_eq!(again, CreateOutcome::AlreadyRunning);

        let (_, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        let mut commit = first_turn();
        commit.history_delta.push(Event::new(
            3,
            None,
            10,
            EventKind::ExecutionCompleted {
                status: OrchestrationStatus::Completed,
                result: "done".into(),
            },
        ));
        commit.metadata.status = Some(OrchestrationStatus::Completed);
        commit.metadata.output = Some("done".into());
        store.ack_orchestration_item(&token, commit).await.unwrap();

        assert_eq!(create(&store, "inst-1").await, 2);
        let info = store.get_instance_info("inst-1").await.unwrap().unwrap();
        assert_eq!(info.status, OrchestrationStatus::Pending);
        assert_eq!(info.execution_id, 2);
        assert_eq!(info.output, None);
        assert_eq!(store.read_history("inst-1", Some(1)).await.unwrap().len(), 3);
        assert_eq!(store.list_executions("inst-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_terminal_instances() {
        let store = create_test_store().await;
        create(&store, "done").await;
        let (_, token, _) = store
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .unwrap();
        let mut commit = first_turn();
        let details = FailureDetails::application("boom");
        commit.history_delta.push(Event::new(
            3,
            None,
            10,
            EventKind::ExecutionCompleted {
                status: OrchestrationStatus::Failed,
                result: details.to_json(),
            },
        ));
        commit.metadata.status = Some(OrchestrationStatus::Failed);
        commit.metadata.output = Some(details.to_json());
        store.ack_orchestration_item(&token, commit).await.unwrap();

        create(&store, "running").await;

        let result = store
            .purge_instances(PurgeFilter {
                completed_before_ms: Some(now_millis() as u64 + 1_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.instances_deleted, 1);
        assert_eq!(result.events_deleted, 3);
        assert!(store.get_instance_info("done").await.unwrap().is_none());
        assert!(store.get_instance_info("running").await.unwrap().is_some());

        let nothing = store.purge_instance("running").await.unwrap();
        assert_eq!(nothing, PurgeResult::default());
    }

    #[tokio::test]
    async fn task_hubs_do_not_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("hubs.db").display());
        let a = SqliteProvider::new(&url, Some(SqliteOptions::default().with_task_hub("a")))
            .await
            .unwrap();
        let b = SqliteProvider::new(&url, Some(SqliteOptions::default().with_task_hub("b")))
            .await
            .unwrap();
        create(&a, "shared-id").await;
        assert!(b.get_instance_info("shared-id").await.unwrap().is_none());
        assert!(b
            .fetch_orchestration_item(Duration::from_secs(30), 100)
            .await
            .unwrap()
            .is_none());
        assert_eq!(create(&b, "shared-id").await, 1);
    }

    #[tokio::test]
    async fn schema_version_mismatch_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("schema.db").display());
        let store = SqliteProvider::new(&url, None).await.unwrap();
        sqlx::query("UPDATE schema_version SET version = 999")
            .execute(store.get_pool())
            .await
            .unwrap();
        let err = store.validate_schema().await.unwrap_err();
        assert!(!err.is_retryable());
        drop(store);

        assert!(SqliteProvider::new(&url, None).await.is_err());
    }
}
