//! Ranked CSV summary writer.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use mo_types::{ColumnSchema, MoResult, StorageError, TrialRecord};

use crate::table::render_cell;

/// Outcome of one summary query.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub path: PathBuf,
    /// Ranked rows, best first.
    pub rows: Vec<TrialRecord>,
}

impl SummaryReport {
    pub fn best(&self) -> Option<&TrialRecord> {
        self.rows.first()
    }
}

/// File name of the summary for `target`.
pub fn summary_file_name(target: &str) -> String {
    format!("{target} Top Results.csv")
}

/// Write `rows` as CSV with columns in schema order.
///
/// In append mode an existing non-empty file gets the rows without a repeated
/// header. Otherwise the file is rewritten from scratch with a header.
pub fn write_summary_csv(
    path: &Path,
    schema: &ColumnSchema,
    rows: &[TrialRecord],
    append: bool,
) -> MoResult<()> {
    let has_content = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
    let write_header = !append || !has_content;

    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let file = options.open(path)?;

    let summary_err = |e: csv::Error| StorageError::Summary {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if write_header {
        writer.write_record(schema.names()).map_err(summary_err)?;
    }
    for row in rows {
        let cells = schema
            .names()
            .map(|name| row.get(name).map(render_cell).unwrap_or_default());
        writer.write_record(cells).map_err(summary_err)?;
    }
    writer.flush()?;

    tracing::debug!("Wrote {} summary rows to {}", rows.len(), path.display());
    Ok(())
}
