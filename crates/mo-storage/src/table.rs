//! SQL text and row codec for the trial table.

use mo_types::{ColumnKind, ColumnSchema, ParameterValue, StorageError, TrialRecord};
use rusqlite::types::{Value as SqlValue, ValueRef};

/// Name of the trial table in every shard and in the master store.
pub const TABLE_NAME: &str = "myTable";

/// Double-quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql(schema: &ColumnSchema) -> String {
    let columns = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({columns});", quote_ident(TABLE_NAME))
}

pub fn insert_sql(schema: &ColumnSchema) -> String {
    let names = schema.names().map(quote_ident).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=schema.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders});",
        quote_ident(TABLE_NAME)
    )
}

/// Coerce every schema column of `record` into an SQL value, in schema order.
/// Keys not in the schema are ignored.
pub fn encode_record(
    schema: &ColumnSchema,
    record: &TrialRecord,
) -> Result<Vec<SqlValue>, StorageError> {
    schema
        .columns()
        .iter()
        .map(|column| {
            let raw = record
                .get(&column.name)
                .ok_or_else(|| StorageError::SchemaViolation {
                    column: column.name.clone(),
                    message: "value missing from trial record".to_string(),
                })?;
            let value = column
                .coerce(raw)
                .map_err(|message| StorageError::SchemaViolation {
                    column: column.name.clone(),
                    message,
                })?;
            Ok(match value {
                ParameterValue::Int(v) => SqlValue::Integer(v),
                ParameterValue::Float(v) => SqlValue::Real(v),
                ParameterValue::Text(s) => SqlValue::Text(s),
                ParameterValue::Json(v) => SqlValue::Text(v.to_string()),
            })
        })
        .collect()
}

/// Decode one `SELECT *` row back into a trial record using the schema's
/// column order.
pub fn decode_row(schema: &ColumnSchema, row: &rusqlite::Row<'_>) -> rusqlite::Result<TrialRecord> {
    let mut record = TrialRecord::with_capacity(schema.len());
    for (idx, column) in schema.columns().iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => ParameterValue::Json(serde_json::Value::Null),
            ValueRef::Integer(v) => match column.kind {
                ColumnKind::Real => ParameterValue::Float(v as f64),
                _ => ParameterValue::Int(v),
            },
            ValueRef::Real(v) => ParameterValue::Float(v),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                ParameterValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        };
        record.insert(column.name.clone(), value);
    }
    Ok(record)
}

/// CSV cell rendering for a decoded value. Reals always keep a fractional
/// part so they read back as floats.
pub fn render_cell(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Float(v) => format!("{v:?}"),
        ParameterValue::Json(serde_json::Value::Null) => String::new(),
        other => other.to_string(),
    }
}
