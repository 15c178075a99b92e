//! # mo-optimizer
//!
//! Multi-process, multi-thread black-box optimization for multiopt.
//!
//! Provides search spaces and strategies, the adapter that turns an
//! objective's outcomes into stored trials, and the orchestrator that fans a
//! run out over worker processes and threads before merging every shard and
//! writing the ranked summary.

mod adapter;
mod config;
mod orchestrator;
mod report;
mod search;

pub use adapter::{guidance_scalar, Objective, TrialAdapter};
pub use config::{default_storage_dir, RunConfig};
pub use orchestrator::{
    Orchestrator, RunOutcome, StrategyFactory, WorkerCommand, WorkerRole, WORKER_DIRECTION_ENV,
    WORKER_INDEX_ENV, WORKER_SHARD_ENV,
};
pub use report::{ProcessRunReport, RunId, RunReport, RunState, Topology, WorkerReport};
pub use search::{
    drive, BayesianSearch, Budget, DriveStats, ParameterDef, ParameterKind, RandomSearch,
    SearchSpace, SearchStrategy, StrategyKind,
};

pub use mo_storage::{MergeReport, StorageCoordinator, StorageShard, SummaryReport};
pub use mo_types::{
    ColumnKind, ColumnSchema, MoError, MoResult, ObjectiveDirection, ParameterValue, TrialRecord,
};
