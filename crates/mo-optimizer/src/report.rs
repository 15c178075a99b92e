//! Run lifecycle and reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use mo_storage::{MergeReport, SummaryReport};
use mo_types::{ObjectiveDirection, TrialRecord};

use crate::search::DriveStats;

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// Fixed worker shape and evaluation budget of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub processes: usize,
    pub threads_per_process: usize,
    pub init_points: usize,
    pub iterations: usize,
}

impl Topology {
    /// Processes are clamped to `[1, available_parallelism]`, threads to at
    /// least one.
    pub fn resolve(
        processes: usize,
        threads_per_process: usize,
        init_points: usize,
        iterations: usize,
        available_parallelism: usize,
    ) -> Self {
        Self {
            processes: processes.min(available_parallelism).max(1),
            threads_per_process: threads_per_process.max(1),
            init_points,
            iterations,
        }
    }

    pub fn total_threads(&self) -> usize {
        self.processes * self.threads_per_process
    }

    /// Proposals made by the whole run when nothing fails.
    pub fn total_evaluations(&self) -> usize {
        self.total_threads() * (self.init_points + self.iterations)
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Merging,
    Completed,
}

/// What one worker (process or in-process fan-out) did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub shard: PathBuf,
    pub threads: usize,
    pub stats: DriveStats,
}

/// Outcome of the fan-out phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRunReport {
    pub workers: usize,
    pub workers_failed: usize,
}

/// Aggregate report of a finished run, as seen by the orchestrating process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: RunId,
    pub target: String,
    pub direction: ObjectiveDirection,
    pub topology: Topology,
    pub state: RunState,
    pub workers_failed: usize,
    pub shards_merged: usize,
    pub rows_merged: usize,
    pub shards_lost: usize,
    pub summary_path: Option<PathBuf>,
    pub best_trial: Option<TrialRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(target: impl Into<String>, direction: ObjectiveDirection, topology: Topology) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            direction,
            topology,
            state: RunState::Pending,
            workers_failed: 0,
            shards_merged: 0,
            rows_merged: 0,
            shards_lost: 0,
            summary_path: None,
            best_trial: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_merging(&mut self, fan_out: ProcessRunReport) {
        self.state = RunState::Merging;
        self.workers_failed = fan_out.workers_failed;
    }

    pub fn mark_completed(&mut self, merge: &MergeReport, summary: &SummaryReport) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
        self.shards_merged = merge.shards_merged;
        self.rows_merged = merge.rows_merged;
        self.shards_lost = merge.failures.len();
        self.summary_path = Some(summary.path.clone());
        self.best_trial = summary.best().cloned();
    }
}
