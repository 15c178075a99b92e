//! Column schema shared by every shard, the master store and the adapter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::MoResult;
use crate::record::ParameterValue;
use crate::validation_error;

/// Declared storage kind of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// Stored as text; integer values are resolved through the map.
    Categorical(BTreeMap<i64, String>),
}

impl ColumnKind {
    /// SQL column type used in the table DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Categorical(_) => "TEXT",
        }
    }

    /// Coerce `value` into the canonical variant for this kind: `Int` for
    /// integer columns, `Float` for real columns and `Text` otherwise.
    pub fn coerce(&self, value: &ParameterValue) -> Result<ParameterValue, String> {
        match self {
            Self::Integer => to_int(value).map(ParameterValue::Int),
            Self::Real => to_real(value).map(ParameterValue::Float),
            Self::Text => Ok(ParameterValue::Text(to_text(value))),
            Self::Categorical(labels) => match value {
                ParameterValue::Text(s) => Ok(ParameterValue::Text(s.clone())),
                ParameterValue::Json(serde_json::Value::String(s)) => {
                    Ok(ParameterValue::Text(s.clone()))
                }
                other => {
                    let index = to_int(other)?;
                    labels
                        .get(&index)
                        .map(|label| ParameterValue::Text(label.clone()))
                        .ok_or_else(|| format!("index {index} has no categorical label"))
                }
            },
        }
    }
}

fn to_int(value: &ParameterValue) -> Result<i64, String> {
    match value {
        ParameterValue::Int(v) => Ok(*v),
        ParameterValue::Float(v) => float_to_int(*v),
        ParameterValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("cannot parse {s:?} as integer: {e}")),
        ParameterValue::Json(json) => match json {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Ok(v),
                None => float_to_int(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::Bool(b) => Ok(i64::from(*b)),
            serde_json::Value::String(s) => to_int(&ParameterValue::Text(s.clone())),
            other => Err(format!("cannot convert {other} to integer")),
        },
    }
}

fn float_to_int(v: f64) -> Result<i64, String> {
    let truncated = v.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
        Ok(truncated as i64)
    } else {
        Err(format!("{v} is out of integer range"))
    }
}

fn to_real(value: &ParameterValue) -> Result<f64, String> {
    match value {
        ParameterValue::Int(v) => Ok(*v as f64),
        ParameterValue::Float(v) => Ok(*v),
        ParameterValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("cannot parse {s:?} as real: {e}")),
        ParameterValue::Json(json) => match json {
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("cannot represent {n} as real")),
            serde_json::Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            serde_json::Value::String(s) => to_real(&ParameterValue::Text(s.clone())),
            other => Err(format!("cannot convert {other} to real")),
        },
    }
}

fn to_text(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A single named, typed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn coerce(&self, value: &ParameterValue) -> Result<ParameterValue, String> {
        self.kind.coerce(value)
    }
}

/// Ordered column list. Order defines both table layout and insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSchema {
    columns: Vec<Column>,
}

impl ColumnSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_integer(self, name: impl Into<String>) -> Self {
        self.add(name, ColumnKind::Integer)
    }

    pub fn add_real(self, name: impl Into<String>) -> Self {
        self.add(name, ColumnKind::Real)
    }

    pub fn add_text(self, name: impl Into<String>) -> Self {
        self.add(name, ColumnKind::Text)
    }

    pub fn add_categorical<I, S>(self, name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let labels = labels.into_iter().map(|(i, s)| (i, s.into())).collect();
        self.add(name, ColumnKind::Categorical(labels))
    }

    pub fn add(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Reject empty schemas, blank or duplicate names and empty categorical
    /// maps.
    pub fn validate(&self) -> MoResult<()> {
        if self.columns.is_empty() {
            return Err(validation_error!("column schema has no columns"));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(validation_error!("column names must not be blank"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(validation_error!("duplicate column name: {}", column.name));
            }
            if let ColumnKind::Categorical(labels) = &column.kind {
                if labels.is_empty() {
                    return Err(validation_error!(
                        "categorical column {} has no labels",
                        column.name
                    ));
                }
            }
        }
        Ok(())
    }
}
