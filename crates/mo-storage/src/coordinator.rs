//! Master store ownership, shard allocation and the post-run merge.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mo_types::{
    validation_error, ColumnSchema, MoResult, ObjectiveDirection, StorageError, TrialRecord,
};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::shard::StorageShard;
use crate::summary::{self, SummaryReport};
use crate::table::{self, TABLE_NAME};

/// File name of the master store inside the storage directory.
pub const MASTER_FILE_NAME: &str = "Results.db";

const SHARD_ALIAS: &str = "shard";

pub fn shard_file_name(index: usize) -> String {
    format!("db{index}.db")
}

/// True for `db<digits>.db`, the names handed out by [`shard_file_name`].
pub fn is_shard_file_name(name: &str) -> bool {
    name.strip_prefix("db")
        .and_then(|rest| rest.strip_suffix(".db"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Name a shard carries while it is being merged; not a shard file name.
fn merging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".merging");
    PathBuf::from(name)
}

/// Result of [`StorageCoordinator::merge_all`].
#[derive(Debug, Default)]
pub struct MergeReport {
    pub shards_merged: usize,
    pub rows_merged: usize,
    /// One `MergeIo` error per shard whose rows did not reach the master.
    pub failures: Vec<StorageError>,
    /// Consumed shards that could not be deleted. They no longer carry a shard
    /// name, so no later merge copies them again.
    pub leftovers: Vec<PathBuf>,
}

/// Owns the master store and hands out one shard per worker process.
#[derive(Debug)]
pub struct StorageCoordinator {
    storage_dir: PathBuf,
    master_path: PathBuf,
    target: String,
    schema: Arc<ColumnSchema>,
    shard_counter: AtomicUsize,
}

impl StorageCoordinator {
    /// Validate the schema and create the storage directory if needed.
    pub fn new(
        storage_dir: impl AsRef<Path>,
        target: impl Into<String>,
        schema: Arc<ColumnSchema>,
    ) -> MoResult<Self> {
        let target = target.into();
        schema.validate()?;
        if !schema.contains(&target) {
            return Err(validation_error!("target column {target} is not in the column schema"));
        }

        std::fs::create_dir_all(storage_dir.as_ref())?;
        // Shard paths cross process boundaries, keep them absolute.
        let storage_dir = std::fs::canonicalize(storage_dir.as_ref())?;
        let master_path = storage_dir.join(MASTER_FILE_NAME);

        Ok(Self {
            storage_dir,
            master_path,
            target,
            schema,
            shard_counter: AtomicUsize::new(0),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    pub fn schema(&self) -> &Arc<ColumnSchema> {
        &self.schema
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Allocate a shard at the next free `db<N>.db` path. The file is not
    /// created. Indices whose file already exists, such as a shard left behind
    /// by an earlier failed merge, are skipped.
    pub fn new_shard(&self) -> StorageShard {
        let path = loop {
            let index = self.shard_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let path = self.storage_dir.join(shard_file_name(index));
            if !path.exists() {
                break path;
            }
            debug!("Skipping shard name {}, file exists", path.display());
        };
        debug!("Allocated shard {}", path.display());
        StorageShard::new(path, Arc::clone(&self.schema))
    }

    /// Bind to a shard allocated elsewhere, typically by the parent process.
    pub fn open_shard(&self, path: impl Into<PathBuf>) -> StorageShard {
        StorageShard::new(path, Arc::clone(&self.schema))
    }

    /// Shard files currently in the storage directory, sorted by name.
    pub fn shard_paths(&self) -> MoResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.storage_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == self.master_path || !path.is_file() {
                continue;
            }
            let is_shard = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_shard_file_name);
            if is_shard {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn open_master(&self) -> MoResult<Connection> {
        let connection = Connection::open(&self.master_path)
            .map_err(|e| StorageError::database(&self.master_path, e))?;
        connection
            .execute_batch(&table::create_table_sql(&self.schema))
            .map_err(|e| StorageError::database(&self.master_path, e))?;
        Ok(connection)
    }

    /// Copy every shard into the master table and delete the shard files.
    ///
    /// Must only run once every writer has finished. A shard that fails is
    /// logged, recorded in the report and skipped; the remaining shards are
    /// still merged.
    pub fn merge_all(&self) -> MoResult<MergeReport> {
        let connection = self.open_master()?;
        let mut report = MergeReport::default();

        for path in self.shard_paths()? {
            match self.merge_shard(&connection, &path, &mut report) {
                Ok(rows) => {
                    debug!("Merged {} rows from {}", rows, path.display());
                    report.shards_merged += 1;
                    report.rows_merged += rows;
                }
                Err(e) => {
                    warn!("Shard {} was not merged: {}", path.display(), e);
                    report.failures.push(e);
                }
            }
        }

        info!(
            "Merged {} shards ({} rows) into {}, {} failed",
            report.shards_merged,
            report.rows_merged,
            self.master_path.display(),
            report.failures.len()
        );
        Ok(report)
    }

    fn merge_shard(
        &self,
        connection: &Connection,
        path: &Path,
        report: &mut MergeReport,
    ) -> Result<usize, StorageError> {
        // A shard keeps its shard name only while its rows are not yet in
        // the master.
        let merging = merging_path(path);
        std::fs::rename(path, &merging).map_err(|e| StorageError::merge_io(path, e))?;

        let rows = match copy_shard(connection, &merging) {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(restore) = std::fs::rename(&merging, path) {
                    warn!("Could not restore {}: {}", path.display(), restore);
                }
                return Err(StorageError::merge_io(path, e));
            }
        };

        if let Err(e) = std::fs::remove_file(&merging) {
            warn!(
                "{} rows merged from {} but the file was not removed: {}",
                rows,
                merging.display(),
                e
            );
            report.leftovers.push(merging);
        }
        Ok(rows)
    }

    /// Rank the master table by `target` and write the summary CSV.
    ///
    /// Rows are ordered best first for `direction`; ties keep storage order.
    /// `limit` caps the row count.
    pub fn summarize(
        &self,
        target: &str,
        direction: ObjectiveDirection,
        limit: Option<usize>,
        append: bool,
    ) -> MoResult<SummaryReport> {
        if !self.schema.contains(target) {
            return Err(validation_error!("cannot rank by unknown column {target}"));
        }
        let connection = self.open_master()?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} {}, rowid ASC LIMIT ?1",
            table::quote_ident(TABLE_NAME),
            table::quote_ident(target),
            direction.sort_order()
        );
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = self.query_rows(&connection, &sql, limit)?;

        let path = self.summary_path();
        summary::write_summary_csv(&path, &self.schema, &rows, append)?;
        info!("Wrote {} ranked rows to {}", rows.len(), path.display());
        Ok(SummaryReport { path, rows })
    }

    /// Where [`summarize`](Self::summarize) writes its CSV.
    pub fn summary_path(&self) -> PathBuf {
        self.storage_dir.join(summary::summary_file_name(&self.target))
    }

    pub fn master_row_count(&self) -> MoResult<usize> {
        let connection = self.open_master()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table::quote_ident(TABLE_NAME));
        let count: i64 = connection
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| StorageError::database(&self.master_path, e))?;
        Ok(count as usize)
    }

    /// Every master row in storage order.
    pub fn master_rows(&self) -> MoResult<Vec<TrialRecord>> {
        let connection = self.open_master()?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY rowid LIMIT ?1",
            table::quote_ident(TABLE_NAME)
        );
        self.query_rows(&connection, &sql, -1)
    }

    fn query_rows(&self, connection: &Connection, sql: &str, limit: i64) -> MoResult<Vec<TrialRecord>> {
        let mut stmt = connection
            .prepare(sql)
            .map_err(|e| StorageError::database(&self.master_path, e))?;
        let rows = stmt
            .query_map([limit], |row| table::decode_row(&self.schema, row))
            .map_err(|e| StorageError::database(&self.master_path, e))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| StorageError::database(&self.master_path, e))?);
        }
        Ok(records)
    }
}

/// ATTACH, copy every row in one statement, DETACH.
fn copy_shard(connection: &Connection, path: &Path) -> rusqlite::Result<usize> {
    let path_str = path.to_string_lossy().into_owned();
    connection.execute(
        &format!("ATTACH DATABASE ?1 AS {SHARD_ALIAS}"),
        [path_str.as_str()],
    )?;

    let table = table::quote_ident(TABLE_NAME);
    let copied = connection.execute(
        &format!("INSERT INTO main.{table} SELECT * FROM {SHARD_ALIAS}.{table}"),
        [],
    );
    let detached = connection.execute_batch(&format!("DETACH DATABASE {SHARD_ALIAS}"));
    let rows = copied?;
    if let Err(e) = detached {
        // The copy is already committed.
        warn!("Failed to detach {}: {}", path.display(), e);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_types::{MoError, ParameterValue};
    use tempfile::TempDir;

    fn schema() -> Arc<ColumnSchema> {
        Arc::new(ColumnSchema::new().add_real("x").add_real("score"))
    }

    fn row(x: f64, score: f64) -> TrialRecord {
        TrialRecord::from([
            ("x".to_string(), ParameterValue::Float(x)),
            ("score".to_string(), ParameterValue::Float(score)),
        ])
    }

    fn coordinator(dir: &TempDir) -> StorageCoordinator {
        StorageCoordinator::new(dir.path(), "score", schema()).unwrap()
    }

    #[test]
    fn shard_names_increase() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);
        let a = coord.new_shard();
        let b = coord.new_shard();
        assert!(a.path().ends_with("db1.db"));
        assert!(b.path().ends_with("db2.db"));
        assert!(!a.path().exists());
    }

    #[test]
    fn shard_name_pattern() {
        assert!(is_shard_file_name("db1.db"));
        assert!(is_shard_file_name("db42.db"));
        assert!(!is_shard_file_name("Results.db"));
        assert!(!is_shard_file_name("db.db"));
        assert!(!is_shard_file_name("db1.db-journal"));
        assert!(!is_shard_file_name("dbx.db"));
    }

    #[test]
    fn rejects_unknown_target() {
        let dir = TempDir::new().unwrap();
        let err = StorageCoordinator::new(dir.path(), "loss", schema()).unwrap_err();
        assert!(matches!(err, MoError::Validation(_)));
    }

    #[test]
    fn merge_is_complete_and_removes_shards() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);

        let counts = [3usize, 5, 1];
        for (s, count) in counts.iter().enumerate() {
            let shard = coord.new_shard();
            for i in 0..*count {
                shard.insert(&row(s as f64, i as f64)).unwrap();
            }
            shard.mark_ready_to_merge();
        }
        // A shard that was allocated but never written leaves no file.
        let _unused = coord.new_shard();

        let report = coord.merge_all().unwrap();
        assert_eq!(report.shards_merged, 3);
        assert_eq!(report.rows_merged, 9);
        assert!(report.failures.is_empty());
        assert_eq!(coord.master_row_count().unwrap(), 9);
        assert!(coord.shard_paths().unwrap().is_empty());
        assert!(coord.master_path().exists());
    }

    #[test]
    fn merge_appends_across_runs() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);

        coord.new_shard().insert(&row(1.0, 1.0)).unwrap();
        coord.merge_all().unwrap();
        coord.new_shard().insert(&row(2.0, 4.0)).unwrap();
        coord.merge_all().unwrap();

        assert_eq!(coord.master_rows().unwrap(), vec![row(1.0, 1.0), row(2.0, 4.0)]);
    }

    #[test]
    fn corrupt_shard_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);

        let good = coord.new_shard();
        good.insert(&row(1.0, 2.0)).unwrap();
        good.close();
        let bad_path = coord.storage_dir().join("db7.db");
        std::fs::write(&bad_path, b"definitely not sqlite").unwrap();

        let report = coord.merge_all().unwrap();
        assert_eq!(report.shards_merged, 1);
        assert_eq!(report.rows_merged, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], StorageError::MergeIo { .. }));
        assert_eq!(coord.master_row_count().unwrap(), 1);

        // The unmerged shard keeps its name and is retried, the merged one is gone.
        assert!(bad_path.exists());
        assert!(!merging_path(&bad_path).exists());
        assert_eq!(coord.shard_paths().unwrap(), vec![bad_path]);
        let again = coord.merge_all().unwrap();
        assert_eq!(again.rows_merged, 0);
        assert_eq!(again.failures.len(), 1);
        assert_eq!(coord.master_row_count().unwrap(), 1);
    }

    #[test]
    fn new_shard_skips_names_on_disk() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("db1.db"), b"definitely not sqlite").unwrap();
        let coord = coordinator(&dir);

        let shard = coord.new_shard();
        assert!(shard.path().ends_with("db2.db"));
        shard.insert(&row(1.0, 1.0)).unwrap();
        assert!(coord.new_shard().path().ends_with("db3.db"));
    }

    #[test]
    fn consumed_shard_is_never_merged_twice() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);

        let shard = coord.new_shard();
        shard.insert(&row(1.0, 1.0)).unwrap();
        shard.insert(&row(2.0, 4.0)).unwrap();
        shard.close();
        // A copied shard whose removal failed stays behind under its merging name.
        let leftover = merging_path(&coord.storage_dir().join("db9.db"));
        std::fs::copy(shard.path(), &leftover).unwrap();

        let first = coord.merge_all().unwrap();
        assert_eq!(first.rows_merged, 2);
        assert!(first.leftovers.is_empty());
        assert!(!merging_path(shard.path()).exists());

        let second = coord.merge_all().unwrap();
        assert_eq!(second.shards_merged, 0);
        assert!(second.failures.is_empty());
        assert_eq!(coord.master_row_count().unwrap(), 2);
        assert!(leftover.exists());
    }

    #[test]
    fn summary_orders_by_direction() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);
        let shard = coord.new_shard();
        for (x, score) in [(1.0, 3.0), (2.0, 9.0), (3.0, 1.0), (4.0, 9.0)] {
            shard.insert(&row(x, score)).unwrap();
        }
        shard.close();
        coord.merge_all().unwrap();

        let top = coord
            .summarize("score", ObjectiveDirection::Maximize, Some(3), false)
            .unwrap();
        // Ties keep storage order.
        assert_eq!(top.rows, vec![row(2.0, 9.0), row(4.0, 9.0), row(1.0, 3.0)]);

        let bottom = coord
            .summarize("score", ObjectiveDirection::Minimize, Some(1), false)
            .unwrap();
        assert_eq!(bottom.best(), Some(&row(3.0, 1.0)));
        assert_eq!(
            std::fs::read_to_string(&bottom.path).unwrap(),
            "x,score\n3.0,1.0\n"
        );

        let all = coord
            .summarize("score", ObjectiveDirection::Minimize, None, true)
            .unwrap();
        assert_eq!(all.rows.len(), 4);
        let text = std::fs::read_to_string(coord.summary_path()).unwrap();
        assert_eq!(text.lines().count(), 1 + 1 + 4);
    }

    #[test]
    fn summary_rejects_unknown_column() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir);
        assert!(coord
            .summarize("loss", ObjectiveDirection::Minimize, None, false)
            .is_err());
    }
}
