//! Bridge between a search strategy and the user's objective.

use std::collections::HashMap;
use std::sync::Arc;

use mo_storage::StorageShard;
use mo_types::{MoError, MoResult, ObjectiveDirection, ParameterValue, StorageError, TrialRecord};

/// The user-supplied scoring function.
///
/// Receives the full parameter mapping (search parameters plus presets, cast
/// to the schema) and the opaque extra context, and returns zero or more
/// outcome records. Each outcome record must carry the target column.
pub trait Objective: Send + Sync {
    fn evaluate(
        &self,
        params: &TrialRecord,
        extra: &serde_json::Value,
    ) -> anyhow::Result<Vec<TrialRecord>>;
}

impl<F> Objective for F
where
    F: Fn(&TrialRecord, &serde_json::Value) -> anyhow::Result<Vec<TrialRecord>> + Send + Sync,
{
    fn evaluate(
        &self,
        params: &TrialRecord,
        extra: &serde_json::Value,
    ) -> anyhow::Result<Vec<TrialRecord>> {
        self(params, extra)
    }
}

/// Scalar handed back to a maximizing strategy for a raw target value.
///
/// When minimizing, a raw value of exactly zero maps to `+inf` and anything
/// else to its reciprocal.
pub fn guidance_scalar(raw: f64, direction: ObjectiveDirection) -> f64 {
    match direction {
        ObjectiveDirection::Maximize => raw,
        ObjectiveDirection::Minimize if raw == 0.0 => f64::INFINITY,
        ObjectiveDirection::Minimize => 1.0 / raw,
    }
}

/// Per-thread adapter: casts candidates, calls the objective and stores every
/// outcome in the owning process's shard.
pub struct TrialAdapter {
    target: String,
    direction: ObjectiveDirection,
    presets: Arc<TrialRecord>,
    extra: Arc<serde_json::Value>,
    objective: Arc<dyn Objective>,
    shard: Arc<StorageShard>,
}

impl TrialAdapter {
    pub fn new(
        target: impl Into<String>,
        direction: ObjectiveDirection,
        presets: Arc<TrialRecord>,
        extra: Arc<serde_json::Value>,
        objective: Arc<dyn Objective>,
        shard: Arc<StorageShard>,
    ) -> Self {
        Self {
            target: target.into(),
            direction,
            presets,
            extra,
            objective,
            shard,
        }
    }

    pub fn shard(&self) -> &Arc<StorageShard> {
        &self.shard
    }

    /// Merge presets over `candidate` and cast every schema column present.
    pub fn prepare(&self, candidate: &HashMap<String, ParameterValue>) -> MoResult<TrialRecord> {
        let mut params = candidate.clone();
        params.extend(self.presets.iter().map(|(k, v)| (k.clone(), v.clone())));

        for column in self.shard.schema().columns() {
            if let Some(value) = params.get_mut(&column.name) {
                *value = column.coerce(value).map_err(|message| MoError::TypeCast {
                    column: column.name.clone(),
                    message,
                })?;
            }
        }
        Ok(params)
    }

    /// Score one candidate.
    ///
    /// Every outcome record is stored with its raw target value. The returned
    /// guidance scalar comes from the last outcome; `None` when the objective
    /// returned nothing.
    pub fn evaluate(&self, candidate: &HashMap<String, ParameterValue>) -> MoResult<Option<f64>> {
        let params = self.prepare(candidate)?;
        let outcomes = self
            .objective
            .evaluate(&params, &self.extra)
            .map_err(|e| MoError::Objective(format!("{e:#}")))?;

        let mut guidance = None;
        for outcome in outcomes {
            let mut record = params.clone();
            record.extend(outcome);
            let raw = self.target_value(&record)?;
            self.shard.insert(&record)?;

            tracing::debug!("Stored trial with {} = {}", self.target, raw);
            guidance = Some(guidance_scalar(raw, self.direction));
        }
        Ok(guidance)
    }

    /// The target as stored, read before the record is written.
    fn target_value(&self, record: &TrialRecord) -> Result<f64, StorageError> {
        let violation = |message: String| StorageError::SchemaViolation {
            column: self.target.clone(),
            message,
        };
        let value = record
            .get(&self.target)
            .ok_or_else(|| violation("outcome has no target value".to_string()))?;
        let stored = match self.shard.schema().get(&self.target) {
            Some(column) => column.coerce(value).map_err(&violation)?,
            None => value.clone(),
        };
        stored
            .as_f64()
            .ok_or_else(|| violation(format!("target value {stored} is not numeric")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_types::ColumnSchema;
    use tempfile::TempDir;

    fn schema() -> Arc<ColumnSchema> {
        Arc::new(
            ColumnSchema::new()
                .add_real("x")
                .add_integer("depth")
                .add_categorical("opt", [(0, "adam"), (1, "sgd")])
                .add_real("score"),
        )
    }

    fn adapter<O: Objective + 'static>(
        dir: &TempDir,
        direction: ObjectiveDirection,
        presets: TrialRecord,
        objective: O,
    ) -> TrialAdapter {
        let shard = Arc::new(StorageShard::new(dir.path().join("db1.db"), schema()));
        TrialAdapter::new(
            "score",
            direction,
            Arc::new(presets),
            Arc::new(serde_json::json!({"dataset": "iris"})),
            Arc::new(objective),
            shard,
        )
    }

    fn candidate(x: f64, depth: f64, opt: i64) -> HashMap<String, ParameterValue> {
        HashMap::from([
            ("x".to_string(), ParameterValue::Float(x)),
            ("depth".to_string(), ParameterValue::Float(depth)),
            ("opt".to_string(), ParameterValue::Int(opt)),
        ])
    }

    fn score_is_x(params: &TrialRecord, _extra: &serde_json::Value) -> anyhow::Result<Vec<TrialRecord>> {
        let x = params["x"].as_f64().unwrap_or_default();
        Ok(vec![TrialRecord::from([("score".to_string(), ParameterValue::Float(x))])])
    }

    #[test]
    fn guidance_transform() {
        assert_eq!(guidance_scalar(0.0, ObjectiveDirection::Minimize), f64::INFINITY);
        assert_eq!(guidance_scalar(4.0, ObjectiveDirection::Minimize), 0.25);
        assert_eq!(guidance_scalar(-2.0, ObjectiveDirection::Minimize), -0.5);
        assert_eq!(guidance_scalar(4.0, ObjectiveDirection::Maximize), 4.0);
        assert_eq!(guidance_scalar(0.0, ObjectiveDirection::Maximize), 0.0);
    }

    #[test]
    fn prepare_casts_and_presets_win() {
        let dir = TempDir::new().unwrap();
        let presets = TrialRecord::from([("depth".to_string(), ParameterValue::Text("6".into()))]);
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, presets, score_is_x);

        let params = adapter.prepare(&candidate(0.5, 2.9, 1)).unwrap();
        assert_eq!(params["x"], ParameterValue::Float(0.5));
        assert_eq!(params["depth"], ParameterValue::Int(6));
        assert_eq!(params["opt"], ParameterValue::Text("sgd".into()));
    }

    #[test]
    fn prepare_reports_type_cast_errors() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), score_is_x);
        let err = adapter.prepare(&candidate(0.5, 1.0, 5)).unwrap_err();
        assert!(matches!(err, MoError::TypeCast { ref column, .. } if column == "opt"));
    }

    #[test]
    fn minimize_stores_raw_target() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir, ObjectiveDirection::Minimize, TrialRecord::new(), score_is_x);

        assert_eq!(adapter.evaluate(&candidate(2.0, 3.0, 0)).unwrap(), Some(0.5));
        assert_eq!(adapter.evaluate(&candidate(0.0, 3.0, 0)).unwrap(), Some(f64::INFINITY));

        let rows = adapter.shard().rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["score"], ParameterValue::Float(2.0));
        assert_eq!(rows[0]["depth"], ParameterValue::Int(3));
        assert_eq!(rows[0]["opt"], ParameterValue::Text("adam".into()));
        assert_eq!(rows[1]["score"], ParameterValue::Float(0.0));
    }

    #[test]
    fn every_outcome_is_stored_and_last_one_guides() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, extra: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            assert_eq!(extra["dataset"], "iris");
            Ok([1.0, 3.0, 2.0]
                .into_iter()
                .map(|s| TrialRecord::from([("score".to_string(), ParameterValue::Float(s))]))
                .collect())
        };
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), objective);

        assert_eq!(adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap(), Some(2.0));
        assert_eq!(adapter.shard().row_count().unwrap(), 3);
    }

    #[test]
    fn empty_outcome_gives_no_guidance() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            Ok(Vec::new())
        };
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), objective);
        assert_eq!(adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap(), None);
        assert!(!adapter.shard().path().exists());
    }

    #[test]
    fn missing_target_is_a_schema_violation() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            Ok(vec![TrialRecord::from([("loss".to_string(), ParameterValue::Float(1.0))])])
        };
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), objective);
        let err = adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap_err();
        assert!(matches!(err, MoError::Storage(StorageError::SchemaViolation { .. })));
    }

    #[test]
    fn non_numeric_target_is_rejected_before_storing() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            Ok(vec![TrialRecord::from([(
                "score".to_string(),
                ParameterValue::Text("n/a".into()),
            )])])
        };
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), objective);
        let err = adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap_err();
        assert!(matches!(
            err,
            MoError::Storage(StorageError::SchemaViolation { ref column, .. }) if column == "score"
        ));
        assert!(!adapter.shard().path().exists());
    }

    #[test]
    fn numeric_text_target_is_coerced() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            Ok(vec![TrialRecord::from([(
                "score".to_string(),
                ParameterValue::Text(" 4 ".into()),
            )])])
        };
        let adapter = adapter(&dir, ObjectiveDirection::Minimize, TrialRecord::new(), objective);
        assert_eq!(adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap(), Some(0.25));
        assert_eq!(adapter.shard().rows().unwrap()[0]["score"], ParameterValue::Float(4.0));
    }

    #[test]
    fn objective_errors_propagate() {
        let dir = TempDir::new().unwrap();
        let objective = |_: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
            anyhow::bail!("diverged")
        };
        let adapter = adapter(&dir, ObjectiveDirection::Maximize, TrialRecord::new(), objective);
        let err = adapter.evaluate(&candidate(0.1, 1.0, 0)).unwrap_err();
        assert!(matches!(err, MoError::Objective(ref m) if m.contains("diverged")));
    }
}
