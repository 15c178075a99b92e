//! Run configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use mo_types::{config_error, ColumnKind, ColumnSchema, MoResult, ObjectiveDirection, TrialRecord};

use crate::search::{Budget, SearchSpace, StrategyKind};

/// Everything one optimization run needs, fixed for the run's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,

    /// Column whose value is optimized and ranked.
    pub target: String,

    #[serde(default)]
    pub direction: ObjectiveDirection,

    /// Requested worker processes, clamped to the available parallelism.
    #[serde(default = "default_processes")]
    pub processes: usize,

    #[serde(default = "default_threads")]
    pub threads_per_process: usize,

    /// Seed evaluations per thread.
    pub init_points: usize,

    /// Guided evaluations per thread.
    pub iterations: usize,

    pub search_space: SearchSpace,

    /// Fixed parameters excluded from the search; they override proposals.
    #[serde(default)]
    pub presets: TrialRecord,

    /// Opaque context handed to the objective untouched.
    #[serde(default)]
    pub extra: serde_json::Value,

    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Ordered trial table columns.
    pub columns: ColumnSchema,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Row cap of the ranked summary; `None` keeps every row.
    #[serde(default = "default_summary_limit")]
    pub summary_limit: Option<usize>,

    /// Append to an existing summary file instead of rewriting it.
    #[serde(default)]
    pub append_summary: bool,

    /// Base RNG seed; each thread derives its own from it.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_processes() -> usize {
    1
}

fn default_threads() -> usize {
    1
}

fn default_summary_limit() -> Option<usize> {
    Some(1000)
}

/// `<data dir>/multiopt`, falling back to the working directory.
pub fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multiopt")
}

impl RunConfig {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        columns: ColumnSchema,
        search_space: SearchSpace,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            direction: ObjectiveDirection::Maximize,
            processes: default_processes(),
            threads_per_process: default_threads(),
            init_points: 5,
            iterations: 25,
            search_space,
            presets: TrialRecord::new(),
            extra: serde_json::Value::Null,
            storage_dir: default_storage_dir(),
            columns,
            strategy: StrategyKind::default(),
            summary_limit: default_summary_limit(),
            append_summary: false,
            seed: None,
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_topology(mut self, processes: usize, threads_per_process: usize) -> Self {
        self.processes = processes;
        self.threads_per_process = threads_per_process;
        self
    }

    pub fn with_budget(mut self, init_points: usize, iterations: usize) -> Self {
        self.init_points = init_points;
        self.iterations = iterations;
        self
    }

    pub fn with_presets(mut self, presets: TrialRecord) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_summary(mut self, limit: Option<usize>, append: bool) -> Self {
        self.summary_limit = limit;
        self.append_summary = append;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn budget(&self) -> Budget {
        Budget::new(self.init_points, self.iterations)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> MoResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::info!("Loaded run config {} from {}", config.name, path.display());
        Ok(config)
    }

    pub fn validate(&self) -> MoResult<()> {
        self.columns.validate()?;
        self.search_space.validate()?;
        match self.columns.get(&self.target).map(|column| &column.kind) {
            None => {
                return Err(config_error!("target {} is not a schema column", self.target));
            }
            Some(ColumnKind::Integer | ColumnKind::Real) => {}
            Some(kind) => {
                return Err(config_error!(
                    "target {} must be an integer or real column, got {}",
                    self.target,
                    kind.sql_type()
                ));
            }
        }
        if self.budget().total() == 0 {
            return Err(config_error!("init_points + iterations must be at least 1"));
        }
        if self.search_space.parameters.is_empty() {
            return Err(config_error!("search space has no parameters"));
        }
        if let StrategyKind::Bayesian { exploration_weight } = self.strategy {
            if !(0.0..=1.0).contains(&exploration_weight) {
                return Err(config_error!(
                    "exploration_weight must be within [0, 1], got {exploration_weight}"
                ));
            }
        }
        Ok(())
    }
}
