//! Checksum-guarded, resumable data migrations.
//!
//! Migrations are registered once per process, keyed and ordered by ULID.
//! `MigrationRunner::apply_all` holds a process-wide lock for its whole run so
//! two callers in one process never apply the same migration twice.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use workbench_core::{Context, CoreError};

use crate::backup::BackupManager;
use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::sqlite::{SqliteStorage, now_secs};

pub type CursorMap = serde_json::Map<String, Value>;

pub type ApplyFn =
    Arc<dyn Fn(&mut MigrationContext<'_>, &Transaction<'_>) -> Result<(), MigrationError> + Send + Sync>;
pub type HookFn = Arc<dyn Fn(&Connection) -> Result<(), MigrationError> + Send + Sync>;
pub type CursorHook = Arc<dyn Fn(CursorMap) -> Result<CursorMap, MigrationError> + Send + Sync>;

static APPLY_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("duplicate migration id {0}")]
    DuplicateMigration(Ulid),

    #[error("invalid registration for {id}: {reason}")]
    InvalidRegistration { id: Ulid, reason: String },

    #[error("checksum mismatch for {id}: recorded {recorded}, registered {registered}")]
    ChecksumMismatch {
        id: Ulid,
        recorded: String,
        registered: String,
    },

    #[error("precheck failed for {id}: {reason}")]
    Precheck { id: Ulid, reason: String },

    #[error("apply failed for {id}: {reason}")]
    Apply { id: Ulid, reason: String },

    #[error("post-commit validation failed for {id}: {reason}")]
    Validate { id: Ulid, reason: String },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("{0}")]
    Failed(String),

    #[error("migration run cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MigrationError {
    /// Error for migration bodies and hooks to return.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(e))
    }
}

impl From<CoreError> for MigrationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Cancelled | CoreError::DeadlineExceeded => Self::Cancelled,
            other => Self::Storage(StorageError::Core(other)),
        }
    }
}

#[derive(Clone)]
pub struct Migration {
    id: Ulid,
    name: String,
    checksum: String,
    apply: ApplyFn,
    requires_backup: bool,
    precheck: Option<HookFn>,
    validate: Option<HookFn>,
    after: Option<HookFn>,
    cursor_load: Option<CursorHook>,
    cursor_save: Option<CursorHook>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .field("requires_backup", &self.requires_backup)
            .finish_non_exhaustive()
    }
}

impl Migration {
    pub fn new<F>(id: Ulid, name: impl Into<String>, checksum: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut MigrationContext<'_>, &Transaction<'_>) -> Result<(), MigrationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id,
            name: name.into(),
            checksum: checksum.into(),
            apply: Arc::new(apply),
            requires_backup: false,
            precheck: None,
            validate: None,
            after: None,
            cursor_load: None,
            cursor_save: None,
        }
    }

    /// blake3 hex digest of a migration's defining text, for callers that
    /// want the checksum derived from the SQL it runs.
    pub fn checksum_of(body: impl AsRef<[u8]>) -> String {
        blake3::hash(body.as_ref()).to_hex().to_string()
    }

    pub fn requires_backup(mut self) -> Self {
        self.requires_backup = true;
        self
    }

    pub fn precheck<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.precheck = Some(Arc::new(f));
        self
    }

    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(f));
        self
    }

    /// Transform the persisted cursor before `apply` sees it.
    pub fn cursor_load<F>(mut self, f: F) -> Self
    where
        F: Fn(CursorMap) -> Result<CursorMap, MigrationError> + Send + Sync + 'static,
    {
        self.cursor_load = Some(Arc::new(f));
        self
    }

    /// Transform the cursor before it is persisted.
    pub fn cursor_save<F>(mut self, f: F) -> Self
    where
        F: Fn(CursorMap) -> Result<CursorMap, MigrationError> + Send + Sync + 'static,
    {
        self.cursor_save = Some(Arc::new(f));
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Per-attempt state handed to a migration body.
pub struct MigrationContext<'a> {
    ctx: &'a Context,
    id: Ulid,
    attempt: u32,
    cursor: CursorMap,
}

impl MigrationContext<'_> {
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// 1 on the first run, incremented on each retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cursor(&self) -> &CursorMap {
        &self.cursor
    }

    /// Record resume state. It is written to the metadata row in the same
    /// transaction as the migration's own writes, so a rolled back attempt
    /// leaves the previous cursor in place. It is handed back on the next
    /// attempt and cleared once the migration finishes.
    pub fn save_cursor(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.cursor.insert(key.into(), value.into());
    }

    pub fn check(&self) -> Result<(), MigrationError> {
        Ok(self.ctx.check()?)
    }
}

/// Shared, ordered set of registered migrations.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    inner: Arc<RwLock<BTreeMap<Ulid, Migration>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, migration: Migration) -> Result<(), MigrationError> {
        if migration.checksum.trim().is_empty() {
            return Err(MigrationError::InvalidRegistration {
                id: migration.id,
                reason: "checksum must not be empty".into(),
            });
        }
        if migration.cursor_load.is_some() != migration.cursor_save.is_some() {
            return Err(MigrationError::InvalidRegistration {
                id: migration.id,
                reason: "cursor load and save hooks must be registered together".into(),
            });
        }
        let mut guard = self.inner.write();
        if guard.contains_key(&migration.id) {
            return Err(MigrationError::DuplicateMigration(migration.id));
        }
        debug!(id = %migration.id, name = %migration.name, "migration registered");
        guard.insert(migration.id, migration);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Registered migrations in id order.
    pub fn snapshot(&self) -> Vec<Migration> {
        self.inner.read().values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Started,
    Finished,
}

impl MigrationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
        }
    }

    fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            _ => Err(StorageError::Corrupt(format!("unknown migration status {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub id: Ulid,
    pub status: MigrationStatus,
    pub checksum: String,
    pub attempts: u32,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub last_error: Option<String>,
    pub cursor: Option<CursorMap>,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<Ulid>,
    pub skipped: Vec<Ulid>,
}

const METADATA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('started', 'finished')),
    checksum TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    last_error TEXT,
    cursor_json TEXT,
    backup_path TEXT
);
";

#[derive(Clone)]
pub struct MigrationRunner {
    registry: MigrationRegistry,
    config: StoreConfig,
}

impl MigrationRunner {
    pub fn new(registry: MigrationRegistry, config: StoreConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Apply every registered migration not yet finished, in id order.
    pub fn apply_all(
        &self,
        ctx: &Context,
        storage: &mut SqliteStorage,
    ) -> Result<ApplyReport, MigrationError> {
        let _guard = APPLY_LOCK.lock();
        ctx.check()?;
        storage.conn().execute_batch(METADATA_SQL)?;

        let mut report = ApplyReport::default();
        for migration in self.registry.snapshot() {
            ctx.check()?;
            let record = load_record(storage.conn(), migration.id)?;
            if let Some(record) = &record
                && record.status == MigrationStatus::Finished
            {
                if record.checksum != migration.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        id: migration.id,
                        recorded: record.checksum.clone(),
                        registered: migration.checksum.clone(),
                    });
                }
                report.skipped.push(migration.id);
                continue;
            }
            self.run_one(ctx, storage, &migration, record)?;
            report.applied.push(migration.id);
        }

        if !report.applied.is_empty() && !ctx.is_cancelled() {
            storage.checkpoint()?;
        }
        info!(applied = report.applied.len(), skipped = report.skipped.len(), "migrations complete");
        Ok(report)
    }

    /// Every metadata row, in id order.
    pub fn status(&self, conn: &Connection) -> Result<Vec<MigrationRecord>, MigrationError> {
        conn.execute_batch(METADATA_SQL)?;
        let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM schema_migrations ORDER BY id"))?;
        let raw = stmt
            .query_map([], read_raw_record)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRecord::finish).collect()
    }

    fn run_one(
        &self,
        ctx: &Context,
        storage: &mut SqliteStorage,
        migration: &Migration,
        previous: Option<MigrationRecord>,
    ) -> Result<(), MigrationError> {
        let id = migration.id;
        let attempts = previous.as_ref().map_or(0, |r| r.attempts) + 1;
        mark_started(storage.conn(), id, &migration.checksum, attempts)?;
        info!(%id, name = %migration.name, attempt = attempts, "applying migration");

        if let Some(precheck) = &migration.precheck
            && let Err(e) = precheck(storage.conn())
        {
            record_error(storage.conn(), id, &e.to_string())?;
            return Err(MigrationError::Precheck { id, reason: e.to_string() });
        }

        if migration.requires_backup || self.config.force_backup {
            match self.backup(storage, migration) {
                Ok(Some(path)) => {
                    storage.conn().execute(
                        "UPDATE schema_migrations SET backup_path = ?1 WHERE id = ?2",
                        params![path.to_string_lossy(), id.to_string()],
                    )?;
                }
                Ok(None) => {}
                Err(e) => {
                    record_error(storage.conn(), id, &e.to_string())?;
                    return Err(e);
                }
            }
        }

        let stored = previous.and_then(|r| r.cursor).unwrap_or_default();
        let cursor = match &migration.cursor_load {
            Some(load) => load(stored)?,
            None => stored,
        };
        let mut mctx = MigrationContext {
            ctx,
            id,
            attempt: attempts,
            cursor,
        };

        let applied = (|| -> Result<(), MigrationError> {
            let tx = storage.transaction()?;
            (migration.apply)(&mut mctx, &tx)?;
            let cursor = match &migration.cursor_save {
                Some(save) => save(std::mem::take(&mut mctx.cursor))?,
                None => std::mem::take(&mut mctx.cursor),
            };
            // the cursor commits or rolls back together with the work it describes
            write_cursor(&tx, id, &cursor)?;
            ctx.check()?;
            tx.commit()?;
            Ok(())
        })();
        if let Err(e) = applied {
            warn!(%id, error = %e, "migration apply failed");
            record_error(storage.conn(), id, &e.to_string())?;
            return Err(match e {
                MigrationError::Cancelled => MigrationError::Cancelled,
                other => MigrationError::Apply { id, reason: other.to_string() },
            });
        }

        for hook in [&migration.validate, &migration.after].into_iter().flatten() {
            if let Err(e) = hook(storage.conn()) {
                warn!(%id, error = %e, "post-commit validation failed");
                record_error(storage.conn(), id, &e.to_string())?;
                return Err(MigrationError::Validate { id, reason: e.to_string() });
            }
        }

        storage.conn().execute(
            "UPDATE schema_migrations
             SET status = ?1, finished_at = ?2, last_error = NULL, cursor_json = NULL
             WHERE id = ?3",
            params![MigrationStatus::Finished.as_str(), now_secs(), id.to_string()],
        )?;

        if migration.requires_backup || self.config.force_backup {
            let manager = self.backup_manager(storage)?;
            if let Some(manager) = manager {
                let removed = manager.rotate()?;
                if !removed.is_empty() {
                    debug!(removed = removed.len(), "rotated backups");
                }
            }
        }
        Ok(())
    }

    fn backup_manager(&self, storage: &SqliteStorage) -> Result<Option<BackupManager>, MigrationError> {
        let Some(db_path) = storage.database_path() else {
            return Ok(None);
        };
        let dir = match &self.config.backup_dir {
            Some(dir) => dir.clone(),
            None => db_path
                .parent()
                .map(|p| p.join("backups"))
                .ok_or_else(|| MigrationError::Backup("database path has no parent directory".into()))?,
        };
        Ok(Some(BackupManager::new(dir, self.config.retain_backups)))
    }

    fn backup(
        &self,
        storage: &SqliteStorage,
        migration: &Migration,
    ) -> Result<Option<PathBuf>, MigrationError> {
        let Some(manager) = self.backup_manager(storage)? else {
            if migration.requires_backup {
                return Err(MigrationError::Backup(format!(
                    "migration {} requires a backup but the database is in memory",
                    migration.id
                )));
            }
            warn!(id = %migration.id, "in-memory database, skipping forced backup");
            return Ok(None);
        };
        let Some(db_path) = storage.database_path() else {
            return Ok(None);
        };
        storage.checkpoint()?;
        let path = manager
            .create(db_path, &migration.id.to_string())
            .map_err(|e| MigrationError::Backup(e.to_string()))?;
        Ok(Some(path))
    }
}

const RECORD_COLUMNS: &str =
    "id, status, checksum, attempts, started_at, finished_at, last_error, cursor_json, backup_path";

struct RawRecord {
    id: String,
    status: String,
    checksum: String,
    attempts: u32,
    started_at: i64,
    finished_at: Option<i64>,
    last_error: Option<String>,
    cursor_json: Option<String>,
    backup_path: Option<String>,
}

impl RawRecord {
    fn finish(self) -> Result<MigrationRecord, MigrationError> {
        let id = Ulid::from_string(&self.id)
            .map_err(|e| StorageError::Corrupt(format!("migration id {}: {e}", self.id)))?;
        let cursor = match self.cursor_json {
            Some(json) => Some(serde_json::from_str::<CursorMap>(&json).map_err(StorageError::from)?),
            None => None,
        };
        Ok(MigrationRecord {
            id,
            status: MigrationStatus::parse(&self.status)?,
            checksum: self.checksum,
            attempts: self.attempts,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error,
            cursor,
            backup_path: self.backup_path.map(PathBuf::from),
        })
    }
}

fn read_raw_record(row: &rusqlite::Row) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        checksum: row.get(2)?,
        attempts: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        last_error: row.get(6)?,
        cursor_json: row.get(7)?,
        backup_path: row.get(8)?,
    })
}

fn load_record(conn: &Connection, id: Ulid) -> Result<Option<MigrationRecord>, MigrationError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM schema_migrations WHERE id = ?1"),
            params![id.to_string()],
            read_raw_record,
        )
        .optional()?;
    raw.map(RawRecord::finish).transpose()
}

fn mark_started(conn: &Connection, id: Ulid, checksum: &str, attempts: u32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_migrations (id, status, checksum, attempts, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (id) DO UPDATE SET
             status = excluded.status,
             checksum = excluded.checksum,
             attempts = excluded.attempts,
             started_at = excluded.started_at,
             finished_at = NULL",
        params![
            id.to_string(),
            MigrationStatus::Started.as_str(),
            checksum,
            attempts,
            now_secs()
        ],
    )?;
    Ok(())
}

fn record_error(conn: &Connection, id: Ulid, error: &str) -> Result<(), MigrationError> {
    conn.execute(
        "UPDATE schema_migrations SET last_error = ?1 WHERE id = ?2",
        params![error, id.to_string()],
    )?;
    Ok(())
}

fn write_cursor(conn: &Connection, id: Ulid, cursor: &CursorMap) -> Result<(), MigrationError> {
    let json = if cursor.is_empty() {
        None
    } else {
        Some(serde_json::to_string(cursor).map_err(StorageError::from)?)
    };
    conn.execute(
        "UPDATE schema_migrations SET cursor_json = ?1 WHERE id = ?2",
        params![json, id.to_string()],
    )?;
    Ok(())
}
