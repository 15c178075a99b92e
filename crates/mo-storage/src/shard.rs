//! Per-process trial shard.
//!
//! A shard is one SQLite file written by the threads of a single worker
//! process. The file is created lazily on the first write; the table DDL runs
//! at most once per shard. Sibling threads share the shard through an `Arc`
//! and every insertion holds the shard lock for its whole duration, so rows
//! from different threads never interleave.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mo_types::{ColumnSchema, MoResult, StorageError, TrialRecord};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::table::{self, TABLE_NAME};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct ShardState {
    connection: Option<Connection>,
    created: bool,
}

/// Append-only trial table bound to one file.
#[derive(Debug)]
pub struct StorageShard {
    path: PathBuf,
    schema: Arc<ColumnSchema>,
    insert_sql: String,
    state: Mutex<ShardState>,
    ready_to_merge: AtomicBool,
}

impl StorageShard {
    /// Bind a shard to `path`. Nothing touches the disk until the first write.
    /// An existing file is reused; its rows are kept.
    pub fn new(path: impl Into<PathBuf>, schema: Arc<ColumnSchema>) -> Self {
        let path = path.into();
        Self {
            insert_sql: table::insert_sql(&schema),
            path,
            schema,
            state: Mutex::new(ShardState {
                connection: None,
                created: false,
            }),
            ready_to_merge: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    /// Create the trial table if it does not exist yet. Idempotent.
    pub fn ensure_schema(&self) -> MoResult<()> {
        let mut state = self.state.lock();
        self.ensure_schema_locked(&mut state)?;
        Ok(())
    }

    fn ensure_schema_locked<'a>(&self, state: &'a mut ShardState) -> MoResult<&'a Connection> {
        let connection = match state.connection.take() {
            Some(connection) => connection,
            None => {
                let connection = Connection::open(&self.path)
                    .map_err(|e| StorageError::database(&self.path, e))?;
                connection
                    .busy_timeout(BUSY_TIMEOUT)
                    .map_err(|e| StorageError::database(&self.path, e))?;
                connection
            }
        };
        let connection = &*state.connection.insert(connection);
        if !state.created {
            connection
                .execute_batch(&table::create_table_sql(&self.schema))
                .map_err(|e| StorageError::database(&self.path, e))?;
            state.created = true;
            tracing::debug!("Ensured trial table in shard {}", self.path.display());
        }
        Ok(connection)
    }

    /// Coerce `record` to the schema and append it as one committed row.
    pub fn insert(&self, record: &TrialRecord) -> MoResult<()> {
        let values = table::encode_record(&self.schema, record)?;
        let mut state = self.state.lock();
        let connection = self.ensure_schema_locked(&mut state)?;
        connection
            .execute(&self.insert_sql, rusqlite::params_from_iter(values.iter()))
            .map_err(|e| StorageError::database(&self.path, e))?;
        Ok(())
    }

    /// Decode every stored row, in storage order.
    pub fn rows(&self) -> MoResult<Vec<TrialRecord>> {
        let mut state = self.state.lock();
        let connection = self.ensure_schema_locked(&mut state)?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY rowid",
            table::quote_ident(TABLE_NAME)
        );
        let mut stmt = connection
            .prepare(&sql)
            .map_err(|e| StorageError::database(&self.path, e))?;
        let rows = stmt
            .query_map([], |row| table::decode_row(&self.schema, row))
            .map_err(|e| StorageError::database(&self.path, e))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| StorageError::database(&self.path, e))?);
        }
        Ok(records)
    }

    pub fn row_count(&self) -> MoResult<usize> {
        let mut state = self.state.lock();
        let connection = self.ensure_schema_locked(&mut state)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table::quote_ident(TABLE_NAME));
        let count: i64 = connection
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| StorageError::database(&self.path, e))?;
        Ok(count as usize)
    }

    /// Drop the open connection so the file can be attached or removed.
    pub fn close(&self) {
        self.state.lock().connection = None;
    }

    pub fn mark_ready_to_merge(&self) {
        self.ready_to_merge.store(true, Ordering::Release);
    }

    pub fn is_ready_to_merge(&self) -> bool {
        self.ready_to_merge.load(Ordering::Acquire)
    }
}
