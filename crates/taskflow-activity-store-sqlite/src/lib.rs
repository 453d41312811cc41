use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use taskflow_activity_core::{
    format_rfc3339, from_unix_nanos, now_utc, saturating_unix_nanos, to_unix_nanos, Action, Activity, ActivityError,
    ActivityFilter, ActivityShard, BucketMap, EntityPagination, EntityType, OpContext, Predicate,
    Result, ShardConfig, ShardPage, ShardedActivityStore, ShardingConfig,
};
use tracing::{debug, info};

const ACTIVITY_MIGRATION_VERSION: i64 = 1;

/// How often a running statement re-checks its context.
const INTERRUPT_POLL: Duration = Duration::from_millis(5);

const SCHEMA_ACTIVITIES_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activities (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  entity_type TEXT NOT NULL CHECK (entity_type IN ('user','team','task')),
  entity_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('created','updated','deleted')),
  metadata TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_activities_no_update
BEFORE UPDATE ON activities
BEGIN
  SELECT RAISE(FAIL, 'activities is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_activities_no_delete
BEFORE DELETE ON activities
BEGIN
  SELECT RAISE(FAIL, 'activities is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_activities_user_id
  ON activities(user_id);
CREATE INDEX IF NOT EXISTS idx_activities_entity
  ON activities(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_activities_created_at
  ON activities(created_at);
";

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, entity_type, entity_id, action, metadata, created_at FROM activities";

/// Fixed set of connections to one database file.
///
/// Checkout takes the first free slot scanning from a rotating cursor and
/// otherwise blocks on the cursor slot. Closing empties every slot.
struct ConnectionPool {
    slots: Vec<Mutex<Option<Connection>>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    fn checkout(&self, shard: usize) -> Result<MutexGuard<'_, Option<Connection>>> {
        if self.closed.load(Ordering::Acquire) || self.slots.is_empty() {
            return Err(ActivityError::ShardClosed { shard });
        }

        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        for step in 0..len {
            if let Some(guard) = self.slots[(start + step) % len].try_lock() {
                return Ok(guard);
            }
        }
        Ok(self.slots[start].lock())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in &self.slots {
            slot.lock().take();
        }
    }
}

/// One `SQLite` database acting as a shard of the activity store.
pub struct SqliteShard {
    index: usize,
    name: String,
    path: PathBuf,
    pool: ConnectionPool,
}

impl std::fmt::Debug for SqliteShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteShard")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("pool_size", &self.pool.slots.len())
            .finish_non_exhaustive()
    }
}

impl SqliteShard {
    /// Opens the shard's connections and makes sure its schema exists.
    ///
    /// # Errors
    /// Returns [`ActivityError::Connection`] when the database cannot be opened
    /// and [`ActivityError::Schema`] when the schema cannot be applied.
    pub fn open(index: usize, config: &ShardConfig) -> Result<Self> {
        // Each connection to ":memory:" is a separate database.
        let pool_size = if is_memory_path(&config.path) {
            1
        } else {
            config.pool_size.max(1)
        };

        let mut slots = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = open_connection(index, config)?;
            slots.push(Mutex::new(Some(conn)));
        }

        let shard = Self {
            index,
            name: config.display_name(index),
            path: config.path.clone(),
            pool: ConnectionPool {
                slots,
                cursor: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            },
        };
        shard.migrate()?;

        info!(
            shard = index,
            name = %shard.name,
            path = %shard.path.display(),
            pool_size,
            "opened activity shard"
        );
        Ok(shard)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool.slots.len()
    }

    fn migrate(&self) -> Result<()> {
        let schema_error = |err: rusqlite::Error| ActivityError::Schema {
            shard: self.index,
            message: err.to_string(),
        };

        let guard = self.pool.checkout(self.index)?;
        let conn = guard
            .as_ref()
            .ok_or(ActivityError::ShardClosed { shard: self.index })?;

        conn.execute_batch(SCHEMA_ACTIVITIES_V1)
            .map_err(schema_error)?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![ACTIVITY_MIGRATION_VERSION, now],
        )
        .map_err(schema_error)?;
        Ok(())
    }

    /// Runs `work` on a pooled connection. A watcher interrupts the statement
    /// in flight once `ctx` is cancelled or past its deadline, and the failure
    /// is then reported as the context's error.
    fn with_connection<T>(
        &self,
        ctx: &OpContext,
        operation: &'static str,
        work: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let guard = self.pool.checkout(self.index)?;
        let conn = guard
            .as_ref()
            .ok_or(ActivityError::ShardClosed { shard: self.index })?;
        ctx.check(operation)?;

        let interrupt = conn.get_interrupt_handle();
        let (done, finished) = mpsc::channel::<()>();
        let result = thread::scope(|scope| {
            scope.spawn(move || loop {
                match finished.recv_timeout(INTERRUPT_POLL) {
                    Err(RecvTimeoutError::Timeout) => {
                        if ctx.check(operation).is_err() {
                            interrupt.interrupt();
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
            let result = work(conn);
            drop(done);
            result
        });

        result.map_err(|err| match ctx.check(operation) {
            Err(ctx_err) => {
                debug!(shard = self.index, operation, error = %err, "shard work abandoned");
                ctx_err
            }
            Ok(()) => err,
        })
    }

    fn query_error(&self, operation: &'static str) -> impl Fn(rusqlite::Error) -> ActivityError {
        let shard = self.index;
        move |err| ActivityError::Query {
            operation,
            shard,
            message: err.to_string(),
        }
    }
}

impl ActivityShard for SqliteShard {
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn insert(&self, ctx: &OpContext, activity: &Activity) -> Result<()> {
        const OPERATION: &str = "insert_activity";
        let created_at = to_unix_nanos(activity.created_at)?;
        let query_error = self.query_error(OPERATION);

        self.with_connection(ctx, OPERATION, |conn| {
            conn.execute(
                "INSERT INTO activities (id, user_id, entity_type, entity_id, action, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    activity.id,
                    activity.user_id,
                    activity.entity_type.as_str(),
                    activity.entity_id,
                    activity.action.as_str(),
                    activity.metadata,
                    created_at,
                ],
            )
            .map_err(&query_error)?;
            Ok(())
        })?;

        debug!(shard = self.index, id = %activity.id, "inserted activity");
        Ok(())
    }

    fn query(
        &self,
        ctx: &OpContext,
        predicate: &Predicate,
        filter: &ActivityFilter,
    ) -> Result<ShardPage> {
        const OPERATION: &str = "query_activities";
        let query_error = self.query_error(OPERATION);
        let (where_sql, mut values) = where_clause(predicate, filter);

        let page = self.with_connection(ctx, OPERATION, |conn| {
            let count_sql = format!("SELECT COUNT(*) FROM activities{where_sql}");
            let matched: i64 = conn
                .query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))
                .map_err(&query_error)?;

            let mut select_sql =
                format!("{SELECT_COLUMNS}{where_sql} ORDER BY created_at DESC, id DESC");
            append_pagination(&mut select_sql, &mut values, filter)?;

            ctx.check(OPERATION)?;
            let mut stmt = conn.prepare(&select_sql).map_err(&query_error)?;
            let mut rows = stmt
                .query(params_from_iter(values.iter()))
                .map_err(&query_error)?;

            let mut activities = Vec::new();
            while let Some(row) = rows.next().map_err(&query_error)? {
                ctx.check(OPERATION)?;
                activities.push(parse_activity_row(row).map_err(&query_error)?);
            }

            Ok(ShardPage {
                activities,
                matched: u64::try_from(matched).unwrap_or(0),
            })
        })?;

        debug!(
            shard = self.index,
            operation = OPERATION,
            rows = page.activities.len(),
            matched = page.matched,
            "shard query complete"
        );
        Ok(page)
    }

    fn count_all(&self, ctx: &OpContext) -> Result<u64> {
        const OPERATION: &str = "count_activities";
        let query_error = self.query_error(OPERATION);
        self.with_connection(ctx, OPERATION, |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))
                .map_err(&query_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn close(&self) {
        self.pool.close();
        debug!(shard = self.index, "closed activity shard connections");
    }
}

/// Every configured shard, opened and migrated, in configuration order.
#[derive(Debug)]
pub struct SqliteShardPool {
    shards: Vec<Arc<SqliteShard>>,
    map: BucketMap,
    entity_pagination: EntityPagination,
}

impl SqliteShardPool {
    /// Validates the topology, then opens every shard. A failure on any shard
    /// aborts the whole open.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] for an inconsistent
    /// config, or the first shard's open error.
    pub fn open(config: &ShardingConfig) -> Result<Self> {
        config.validate()?;
        let map = config.bucket_map()?;

        let mut shards = Vec::with_capacity(config.shards.len());
        for (index, shard_config) in config.shards.iter().enumerate() {
            shards.push(Arc::new(SqliteShard::open(index, shard_config)?));
        }

        info!(
            shard_count = map.shard_count(),
            bucket_count = map.bucket_count(),
            "opened activity shard pool"
        );
        Ok(Self {
            shards,
            map,
            entity_pagination: config.entity_pagination,
        })
    }

    #[must_use]
    pub fn shard_at(&self, index: usize) -> Option<&Arc<SqliteShard>> {
        self.shards.get(index)
    }

    #[must_use]
    pub fn all_shards(&self) -> &[Arc<SqliteShard>] {
        &self.shards
    }

    #[must_use]
    pub fn bucket_map(&self) -> &BucketMap {
        &self.map
    }

    pub fn close_all(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }

    /// Hands the shards to a routing store. Closing the store closes the pool.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] if the shards and bucket
    /// map disagree.
    pub fn into_store(self) -> Result<ShardedActivityStore> {
        let shards: Vec<Arc<dyn ActivityShard>> = self
            .shards
            .into_iter()
            .map(|shard| shard as Arc<dyn ActivityShard>)
            .collect();
        Ok(ShardedActivityStore::new(shards, self.map)?
            .with_entity_pagination(self.entity_pagination))
    }
}

/// Opens every configured shard and wraps them in a routing store.
///
/// # Errors
/// See [`SqliteShardPool::open`].
pub fn open_sharded_store(config: &ShardingConfig) -> Result<ShardedActivityStore> {
    SqliteShardPool::open(config)?.into_store()
}

fn open_connection(shard: usize, config: &ShardConfig) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection_error = |err: rusqlite::Error| ActivityError::Connection {
        shard,
        message: format!(
            "failed to open sqlite database at {}: {err}",
            config.path.display()
        ),
    };

    let conn = Connection::open_with_flags(&config.path, flags).map_err(connection_error)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(connection_error)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
    .map_err(connection_error)?;
    Ok(conn)
}

/// Paths where every connection gets its own private database.
fn is_memory_path(path: &Path) -> bool {
    path.to_str().is_some_and(|raw| {
        raw.is_empty()
            || raw == ":memory:"
            || raw.starts_with("file::memory:")
            || (raw.starts_with("file:") && raw.contains("mode=memory"))
    })
}

fn where_clause(predicate: &Predicate, filter: &ActivityFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    match predicate {
        Predicate::User(user_id) => {
            values.push(Value::Text(user_id.clone()));
            clauses.push(format!("user_id = ?{}", values.len()));
        }
        Predicate::Entity {
            entity_type,
            entity_id,
        } => {
            values.push(Value::Text(entity_type.as_str().to_string()));
            clauses.push(format!("entity_type = ?{}", values.len()));
            values.push(Value::Text(entity_id.clone()));
            clauses.push(format!("entity_id = ?{}", values.len()));
        }
        Predicate::All => {}
    }

    if let Some(from) = filter.from {
        values.push(Value::Integer(saturating_unix_nanos(from)));
        clauses.push(format!("created_at >= ?{}", values.len()));
    }
    if let Some(to) = filter.to {
        values.push(Value::Integer(saturating_unix_nanos(to)));
        clauses.push(format!("created_at <= ?{}", values.len()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn append_pagination(sql: &mut String, values: &mut Vec<Value>, filter: &ActivityFilter) -> Result<()> {
    let offset = to_sql_count(filter.offset, "offset")?;
    match filter.effective_limit() {
        Some(limit) => {
            values.push(Value::Integer(to_sql_count(limit, "limit")?));
            let limit_index = values.len();
            values.push(Value::Integer(offset));
            sql.push_str(&format!(" LIMIT ?{limit_index} OFFSET ?{}", values.len()));
        }
        None if offset > 0 => {
            values.push(Value::Integer(offset));
            sql.push_str(&format!(" LIMIT -1 OFFSET ?{}", values.len()));
        }
        None => {}
    }
    Ok(())
}

fn to_sql_count(value: usize, name: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| ActivityError::Validation(format!("{name} is too large: {value}")))
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    let entity_type_raw: String = row.get(2)?;
    let action_raw: String = row.get(4)?;
    let created_at_raw: i64 = row.get(6)?;

    let entity_type = EntityType::parse(&entity_type_raw).ok_or_else(|| {
        invalid_column(
            2,
            rusqlite::types::Type::Text,
            format!("invalid entity_type: {entity_type_raw}"),
        )
    })?;

    let action = Action::parse(&action_raw).ok_or_else(|| {
        invalid_column(
            4,
            rusqlite::types::Type::Text,
            format!("invalid action: {action_raw}"),
        )
    })?;

    let created_at = from_unix_nanos(created_at_raw).map_err(|err| {
        invalid_column(6, rusqlite::types::Type::Integer, err.to_string())
    })?;

    Ok(Activity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        entity_type,
        entity_id: row.get(3)?,
        action,
        metadata: row.get(5)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_activity_core::parse_rfc3339_utc;
    use time::Duration as TimeDuration;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct TempShards {
        paths: Vec<PathBuf>,
    }

    impl TempShards {
        fn new(count: usize) -> Self {
            let run = Ulid::new();
            Self {
                paths: (0..count)
                    .map(|index| {
                        std::env::temp_dir()
                            .join(format!("activity-shard-test-{run}-{index}.sqlite3"))
                    })
                    .collect(),
            }
        }

        fn config(&self) -> ShardingConfig {
            ShardingConfig::for_paths(self.paths.iter().cloned())
        }
    }

    impl Drop for TempShards {
        fn drop(&mut self) {
            for path in &self.paths {
                let _ = std::fs::remove_file(path);
                for suffix in ["-wal", "-shm"] {
                    let mut sidecar = path.clone().into_os_string();
                    sidecar.push(suffix);
                    let _ = std::fs::remove_file(PathBuf::from(sidecar));
                }
            }
        }
    }

    fn activity(id: &str, user_id: &str, entity_id: &str, minutes: i64) -> Activity {
        Activity {
            id: id.to_string(),
            user_id: user_id.to_string(),
            entity_type: EntityType::Task,
            entity_id: entity_id.to_string(),
            action: Action::Created,
            metadata: r#"{"source":"test"}"#.to_string(),
            created_at: must(parse_rfc3339_utc("2026-02-07T12:00:00Z"))
                + TimeDuration::minutes(minutes),
        }
    }

    #[test]
    fn opening_the_same_files_twice_is_idempotent() {
        let temp = TempShards::new(2);
        let ctx = OpContext::background();

        let first = must(open_sharded_store(&temp.config()));
        must(first.insert(&ctx, &activity("a-1", "user-1", "task-1", 0)));
        first.close();

        let second = must(open_sharded_store(&temp.config()));
        let page = must(second.by_user(&ctx, "user-1", &ActivityFilter::default()));
        assert_eq!(page.total, 1);
        assert_eq!(page.activities[0].metadata, r#"{"source":"test"}"#);
        second.close();
    }

    #[test]
    fn append_only_triggers_reject_update_and_delete() {
        let temp = TempShards::new(1);
        let pool = must(SqliteShardPool::open(&temp.config()));
        let Some(shard) = pool.shard_at(0) else {
            panic!("shard 0 should exist");
        };
        let ctx = OpContext::background();
        must(shard.insert(&ctx, &activity("a-1", "user-1", "task-1", 0)));

        let update = shard.with_connection(&ctx, "test_update", |conn| {
            conn.execute("UPDATE activities SET metadata = 'x' WHERE id = 'a-1'", [])
                .map_err(shard.query_error("test_update"))
        });
        let delete = shard.with_connection(&ctx, "test_delete", |conn| {
            conn.execute("DELETE FROM activities WHERE id = 'a-1'", [])
                .map_err(shard.query_error("test_delete"))
        });

        for result in [update, delete] {
            match result {
                Ok(_) => panic!("append-only trigger should reject mutation"),
                Err(err) => assert!(err.to_string().contains("append-only")),
            }
        }
        assert_eq!(must(shard.count_all(&ctx)), 1);
        pool.close_all();
    }

    #[test]
    fn reads_are_served_from_the_routed_shard() {
        let temp = TempShards::new(3);
        let pool = must(SqliteShardPool::open(&temp.config()));
        let shards: Vec<Arc<SqliteShard>> = pool.all_shards().to_vec();
        let store = must(pool.into_store());
        let ctx = OpContext::background();

        for step in 0..6 {
            must(store.insert(
                &ctx,
                &activity(&format!("a-{step}"), "user-77", "task-1", step),
            ));
        }

        let owner = store.shard_for("user-77");
        for shard in &shards {
            let expected = if shard.index() == owner { 6 } else { 0 };
            assert_eq!(must(shard.count_all(&ctx)), expected);
        }

        let page = must(store.by_user(
            &ctx,
            "user-77",
            &ActivityFilter::default().with_limit(2).with_offset(2),
        ));
        assert_eq!(page.total, 6);
        let ids: Vec<&str> = page.activities.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a-3", "a-2"]);
        store.close();
    }

    #[test]
    fn all_merges_three_shards_newest_first() {
        let temp = TempShards::new(3);
        let pool = must(SqliteShardPool::open(&temp.config()));
        let ctx = OpContext::background();

        for (index, shard) in pool.all_shards().iter().enumerate() {
            for step in 0..4_i64 {
                let minutes = step * 3 + i64::try_from(index).unwrap_or(0);
                must(shard.insert(
                    &ctx,
                    &activity(&format!("r{minutes:02}"), "u", "task-1", minutes),
                ));
            }
        }
        let store = must(pool.into_store());

        let page = must(store.all(&ctx, &ActivityFilter::default().with_limit(5)));
        assert_eq!(page.total, 12);
        let ids: Vec<&str> = page.activities.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["r11", "r10", "r09", "r08", "r07"]);

        let entity = must(store.by_entity(
            &ctx,
            EntityType::Task,
            "task-1",
            &ActivityFilter::default().with_limit(3).with_offset(1),
        ));
        assert_eq!(entity.total, 12);
        let ids: Vec<&str> = entity.activities.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["r10", "r09", "r08"]);
        store.close();
    }

    #[test]
    fn time_window_bounds_are_inclusive() {
        let temp = TempShards::new(1);
        let store = must(open_sharded_store(&temp.config()));
        let ctx = OpContext::background();
        for step in 0..5 {
            must(store.insert(&ctx, &activity(&format!("a-{step}"), "u", "e", step)));
        }

        let base = must(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let filter = ActivityFilter::default().between(
            Some(base + TimeDuration::minutes(1)),
            Some(base + TimeDuration::minutes(3)),
        );
        let page = must(store.all(&ctx, &filter));
        assert_eq!(page.total, 3);
        let offset_only = must(store.by_user(&ctx, "u", &ActivityFilter::default().with_offset(3)));
        assert_eq!(offset_only.activities.len(), 2);
        store.close();
    }

    #[test]
    fn closed_pool_reports_shard_closed() {
        let temp = TempShards::new(2);
        let store = must(open_sharded_store(&temp.config()));
        store.close();

        let ctx = OpContext::background();
        assert!(matches!(
            store.insert(&ctx, &activity("a", "user-1", "e", 0)),
            Err(ActivityError::ShardClosed { .. })
        ));
        assert!(matches!(
            store.all(&ctx, &ActivityFilter::default()),
            Err(ActivityError::ShardClosed { .. })
        ));
    }

    #[test]
    fn cancelled_context_stops_shard_query() {
        let temp = TempShards::new(1);
        let store = must(open_sharded_store(&temp.config()));
        let ctx = OpContext::background();
        must(store.insert(&ctx, &activity("a", "user-1", "e", 0)));

        let cancelled = ctx.child();
        cancelled.cancel();
        assert!(matches!(
            store.by_user(&cancelled, "user-1", &ActivityFilter::default()),
            Err(ActivityError::Cancelled { .. })
        ));
        store.close();
    }

    #[test]
    fn topology_mismatch_aborts_open() {
        let temp = TempShards::new(2);
        let mut config = temp.config();
        config.shard_count = 3;
        assert!(matches!(
            SqliteShardPool::open(&config),
            Err(ActivityError::InvalidShardTopology(_))
        ));
    }

    #[test]
    fn unopenable_shard_names_its_index() {
        let temp = TempShards::new(1);
        let mut config = temp.config();
        config.shards.push(ShardConfig::at(
            std::env::temp_dir()
                .join(format!("missing-dir-{}", Ulid::new()))
                .join("shard.sqlite3"),
        ));
        config.shard_count = 2;

        match SqliteShardPool::open(&config) {
            Ok(_) => panic!("missing directory should fail to open"),
            Err(err) => assert_eq!(err.shard(), Some(1)),
        }
    }

    #[test]
    fn memory_path_uses_single_connection() {
        let config = ShardingConfig::for_paths([":memory:"]);
        let pool = must(SqliteShardPool::open(&config));
        let Some(shard) = pool.shard_at(0) else {
            panic!("shard 0 should exist");
        };
        assert_eq!(shard.pool_size(), 1);
        assert_eq!(shard.path(), Path::new(":memory:"));
    }

    #[test]
    fn memory_uris_are_recognised() {
        for raw in [
            ":memory:",
            "",
            "file::memory:",
            "file::memory:?cache=shared",
            "file:x?mode=memory",
        ] {
            assert!(is_memory_path(Path::new(raw)), "{raw} should be in-memory");
        }
        for raw in ["shard-0.sqlite3", "file:shard-0.sqlite3", "memory.sqlite3"] {
            assert!(!is_memory_path(Path::new(raw)), "{raw} should be a file");
        }

        let config = ShardingConfig::for_paths(["file::memory:"]);
        let pool = must(SqliteShardPool::open(&config));
        let Some(shard) = pool.shard_at(0) else {
            panic!("shard 0 should exist");
        };
        assert_eq!(shard.pool_size(), 1);
        let ctx = OpContext::background();
        must(shard.insert(&ctx, &activity("a-1", "user-1", "task-1", 0)));
        assert_eq!(must(shard.count_all(&ctx)), 1);
        pool.close_all();
    }

    #[test]
    fn bounds_beyond_storable_range_still_match() {
        let temp = TempShards::new(1);
        let store = must(open_sharded_store(&temp.config()));
        let ctx = OpContext::background();
        must(store.insert(&ctx, &activity("a-1", "user-1", "task-1", 0)));

        let far_past = must(parse_rfc3339_utc("1600-01-01T00:00:00Z"));
        let far_future = must(parse_rfc3339_utc("2300-01-01T00:00:00Z"));

        let open_ended =
            must(store.all(&ctx, &ActivityFilter::default().between(None, Some(far_future))));
        assert_eq!(open_ended.total, 1);
        let both = must(store.by_user(
            &ctx,
            "user-1",
            &ActivityFilter::default().between(Some(far_past), Some(far_future)),
        ));
        assert_eq!(both.total, 1);
        let after_everything =
            must(store.all(&ctx, &ActivityFilter::default().between(Some(far_future), None)));
        assert_eq!(after_everything.total, 0);
        store.close();
    }

    #[test]
    fn deadline_interrupts_running_statement() {
        let temp = TempShards::new(1);
        let pool = must(SqliteShardPool::open(&temp.config()));
        let Some(shard) = pool.shard_at(0) else {
            panic!("shard 0 should exist");
        };

        let ctx = OpContext::with_timeout(std::time::Duration::from_millis(50));
        let started = std::time::Instant::now();
        let result = shard.with_connection(&ctx, "count_series", |conn| {
            conn.query_row(
                "WITH RECURSIVE series(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM series WHERE x < 100000000000)
                 SELECT COUNT(*) FROM series",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(shard.query_error("count_series"))
        });

        assert_eq!(
            result,
            Err(ActivityError::DeadlineExceeded {
                operation: "count_series"
            })
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        // The connection is usable again after the interrupt.
        assert_eq!(must(shard.count_all(&OpContext::background())), 0);
        pool.close_all();
    }
}
