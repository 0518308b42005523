use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use workbench_core::{Context, CoreError};

use crate::config::StoreConfig;
use crate::error::{StorageError, Transient};

pub struct SqliteStorage {
    conn: Connection,
    config: StoreConfig,
}

impl SqliteStorage {
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let conn = match &config.database_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        crate::schema::init_schema(&conn, config.busy_timeout_ms)?;
        Ok(Self { conn, config })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.config.database_path.as_deref()
    }

    /// Begin a write transaction. `IMMEDIATE` takes the write lock up front so
    /// contention shows up here rather than at the first write.
    pub fn transaction(&mut self) -> Result<Transaction<'_>, StorageError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Run `f` in a write transaction, retrying transient lock failures up to
    /// `max_retries` times. Cancellation is checked before each attempt and
    /// again before commit.
    pub fn write<T, E, F>(&mut self, ctx: &Context, mut f: F) -> Result<T, E>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, E>,
        E: From<StorageError> + From<CoreError> + Transient + std::fmt::Display,
    {
        let max_retries = self.config.max_retries;
        let mut attempt = 0u32;
        loop {
            ctx.check()?;
            let result = (|| -> Result<T, E> {
                let tx = self.transaction()?;
                let value = f(&tx)?;
                ctx.check()?;
                tx.commit().map_err(StorageError::from)?;
                Ok(value)
            })();
            match result {
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient store contention, retrying");
                    std::thread::sleep(backoff(attempt));
                }
                other => return other,
            }
        }
    }

    /// Truncate the write-ahead log.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        if self.config.database_path.is_none() {
            return Ok(());
        }
        let (busy, log_frames, checkpointed): (i64, i64, i64) = self.conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        debug!(busy, log_frames, checkpointed, "wal checkpoint");
        Ok(())
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64 << attempt.min(6))
}

/// Encode an optional id as a nullable blob parameter.
pub(crate) fn opt_blob(id: Option<Uuid>) -> Option<Vec<u8>> {
    id.map(|u| u.as_bytes().to_vec())
}

/// Read a nullable 16-byte blob column as a uuid.
pub(crate) fn uuid_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    match bytes {
        None => Ok(None),
        Some(b) => Uuid::from_slice(&b).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(e))
        }),
    }
}

/// Read a non-null 16-byte blob column as a uuid.
pub(crate) fn required_uuid(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Uuid> {
    uuid_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "id".into(),
        rusqlite::types::Type::Null,
    ))
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
