//! Process and thread fan-out, phase barrier and the final merge.
//!
//! A run has two strictly sequential phases. The fan-out phase starts one
//! worker per process (each with its own shard) and one strategy per thread;
//! it returns only after every process and thread has been joined. The merge
//! phase then folds every shard into the master store and writes the ranked
//! summary.
//!
//! Worker processes are the same program re-executed with the shard path and
//! direction in the environment. The child builds the same [`Orchestrator`]
//! and its call to [`Orchestrator::run`] takes the worker branch instead of
//! orchestrating.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use mo_storage::{MergeReport, StorageCoordinator, StorageShard, SummaryReport};
use mo_types::{MoError, MoResult, ObjectiveDirection, TrialRecord};

use crate::adapter::{Objective, TrialAdapter};
use crate::config::RunConfig;
use crate::report::{ProcessRunReport, RunReport, Topology, WorkerReport};
use crate::search::{self, Budget, DriveStats, SearchSpace, SearchStrategy};

/// Shard file a re-executed worker process writes to.
pub const WORKER_SHARD_ENV: &str = "MULTIOPT_WORKER_SHARD";
/// `maximize` or `minimize`, as chosen by the orchestrating process.
pub const WORKER_DIRECTION_ENV: &str = "MULTIOPT_WORKER_DIRECTION";
/// Zero-based worker index, used to derive per-thread seeds.
pub const WORKER_INDEX_ENV: &str = "MULTIOPT_WORKER_INDEX";

/// Builds one strategy per thread from the budget and an optional seed.
pub type StrategyFactory =
    Arc<dyn Fn(Budget, Option<u64>) -> Box<dyn SearchStrategy> + Send + Sync>;

/// Program and arguments used to start worker processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running executable with its own arguments.
    pub fn current() -> MoResult<Self> {
        Ok(Self::new(std::env::current_exe()?, std::env::args_os().skip(1)))
    }
}

/// Worker assignment read from the environment of a re-executed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRole {
    pub shard: PathBuf,
    pub direction: ObjectiveDirection,
    pub index: usize,
}

impl WorkerRole {
    /// `None` in the orchestrating process.
    pub fn from_env() -> MoResult<Option<Self>> {
        let Some(shard) = std::env::var_os(WORKER_SHARD_ENV) else {
            return Ok(None);
        };
        let direction = match std::env::var(WORKER_DIRECTION_ENV) {
            Ok(value) => value.parse::<ObjectiveDirection>().map_err(MoError::Worker)?,
            Err(_) => ObjectiveDirection::Maximize,
        };
        let index = match std::env::var(WORKER_INDEX_ENV) {
            Ok(value) => value
                .parse::<usize>()
                .map_err(|e| MoError::Worker(format!("bad {WORKER_INDEX_ENV} {value:?}: {e}")))?,
            Err(_) => 0,
        };
        Ok(Some(Self {
            shard: PathBuf::from(shard),
            direction,
            index,
        }))
    }
}

/// What [`Orchestrator::run`] did in this process.
#[derive(Debug)]
pub enum RunOutcome {
    /// This process orchestrated the run and merged the results.
    Coordinator(RunReport),
    /// This process was a re-executed worker; the parent merges.
    Worker(WorkerReport),
}

/// Drives one optimization run across processes and threads.
pub struct Orchestrator {
    config: RunConfig,
    topology: Topology,
    space: Arc<SearchSpace>,
    presets: Arc<TrialRecord>,
    extra: Arc<serde_json::Value>,
    objective: Arc<dyn Objective>,
    coordinator: StorageCoordinator,
    strategy_factory: StrategyFactory,
    worker_command: Option<WorkerCommand>,
}

impl Orchestrator {
    /// Validate `config`, resolve the topology and prepare the storage
    /// directory.
    pub fn new(config: RunConfig, objective: impl Objective + 'static) -> MoResult<Self> {
        config.validate()?;
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let topology = resolve_topology(&config, available);

        let coordinator = StorageCoordinator::new(
            &config.storage_dir,
            config.target.clone(),
            Arc::new(config.columns.clone()),
        )?;
        let strategy = config.strategy.clone();
        let strategy_factory: StrategyFactory =
            Arc::new(move |budget, seed| strategy.build(budget, seed));

        Ok(Self {
            space: Arc::new(config.search_space.clone()),
            presets: Arc::new(config.presets.clone()),
            extra: Arc::new(config.extra.clone()),
            objective: Arc::new(objective),
            topology,
            coordinator,
            strategy_factory,
            worker_command: None,
            config,
        })
    }

    /// Replace the configured strategy with a custom one.
    pub fn with_strategy_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(Budget, Option<u64>) -> Box<dyn SearchStrategy> + Send + Sync + 'static,
    {
        self.strategy_factory = Arc::new(factory);
        self
    }

    /// Clamp the process count against `available` instead of the detected
    /// hardware parallelism.
    pub fn with_available_parallelism(mut self, available: usize) -> Self {
        self.topology = resolve_topology(&self.config, available);
        self
    }

    /// Command used to start worker processes. Defaults to
    /// [`WorkerCommand::current`].
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn coordinator(&self) -> &StorageCoordinator {
        &self.coordinator
    }

    pub fn maximize(&self) -> MoResult<RunOutcome> {
        self.run(ObjectiveDirection::Maximize)
    }

    pub fn minimize(&self) -> MoResult<RunOutcome> {
        self.run(ObjectiveDirection::Minimize)
    }

    /// Fan out, wait for every worker, then merge and summarize.
    ///
    /// In a re-executed worker process this runs only that worker's share
    /// and returns [`RunOutcome::Worker`].
    pub fn run(&self, direction: ObjectiveDirection) -> MoResult<RunOutcome> {
        if let Some(role) = WorkerRole::from_env()? {
            debug!("Running as worker {} on {}", role.index, role.shard.display());
            let shard = Arc::new(self.coordinator.open_shard(role.shard));
            return self
                .worker_main(role.direction, shard, role.index)
                .map(RunOutcome::Worker);
        }

        let mut report = RunReport::new(self.config.target.clone(), direction, self.topology);
        report.mark_running();
        info!(
            "Starting run {} ({}): {} processes x {} threads, {} + {} evaluations each, {} {}",
            self.config.name,
            report.id,
            self.topology.processes,
            self.topology.threads_per_process,
            self.topology.init_points,
            self.topology.iterations,
            direction.as_str(),
            self.config.target
        );

        let fan_out = self.process_run(direction)?;
        report.mark_merging(fan_out);

        let (merge, summary) =
            self.generate_summary(direction, self.config.summary_limit, self.config.append_summary)?;
        report.mark_completed(&merge, &summary);
        info!(
            "Run {} completed: {} rows merged, {} workers failed, {} shards lost",
            report.id, report.rows_merged, report.workers_failed, report.shards_lost
        );
        Ok(RunOutcome::Coordinator(report))
    }

    /// Fan-out phase. Returns once every worker has finished.
    pub fn process_run(&self, direction: ObjectiveDirection) -> MoResult<ProcessRunReport> {
        if self.topology.processes > 1 {
            return self.spawn_processes(direction);
        }

        let shard = Arc::new(self.coordinator.new_shard());
        let workers_failed = match self.worker_main(direction, Arc::clone(&shard), 0) {
            Ok(_) => 0,
            Err(e) => {
                warn!("Worker on {} failed: {}", shard.path().display(), e);
                1
            }
        };
        shard.close();
        Ok(ProcessRunReport {
            workers: 1,
            workers_failed,
        })
    }

    fn spawn_processes(&self, direction: ObjectiveDirection) -> MoResult<ProcessRunReport> {
        let command = match &self.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current()?,
        };
        // All shard names are allocated here, before any worker exists.
        let shards: Vec<StorageShard> = (0..self.topology.processes)
            .map(|_| self.coordinator.new_shard())
            .collect();

        let mut report = ProcessRunReport {
            workers: shards.len(),
            workers_failed: 0,
        };
        let mut children = Vec::with_capacity(shards.len());
        for (index, shard) in shards.iter().enumerate() {
            let spawned = Command::new(&command.program)
                .args(&command.args)
                .env(WORKER_SHARD_ENV, shard.path())
                .env(WORKER_DIRECTION_ENV, direction.as_str())
                .env(WORKER_INDEX_ENV, index.to_string())
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!("Spawned worker {} (pid {}) on {}", index, child.id(), shard.path().display());
                    children.push((index, child));
                }
                Err(e) => {
                    warn!("Failed to spawn worker {}: {}", index, e);
                    report.workers_failed += 1;
                }
            }
        }

        for (index, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => debug!("Worker {} finished", index),
                Ok(status) => {
                    warn!("Worker {} exited with {}", index, status);
                    report.workers_failed += 1;
                }
                Err(e) => {
                    warn!("Failed to wait for worker {}: {}", index, e);
                    report.workers_failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run every thread of one worker against `shard` and join them.
    ///
    /// Fails if any thread failed; rows already committed stay in the shard.
    pub fn worker_main(
        &self,
        direction: ObjectiveDirection,
        shard: Arc<StorageShard>,
        worker_index: usize,
    ) -> MoResult<WorkerReport> {
        let threads = self.topology.threads_per_process;
        let results: Vec<MoResult<DriveStats>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let shard = Arc::clone(&shard);
                    let seed = self
                        .config
                        .seed
                        .map(|s| s.wrapping_add((worker_index * threads + t) as u64));
                    scope.spawn(move || self.thread_main(direction, shard, seed))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(MoError::Worker("worker thread panicked".into())))
                })
                .collect()
        });
        shard.mark_ready_to_merge();

        let mut stats = DriveStats::default();
        let mut first_error = None;
        for (t, result) in results.into_iter().enumerate() {
            match result {
                Ok(thread_stats) => stats.absorb(thread_stats),
                Err(e) => {
                    warn!("Thread {} of worker {} aborted: {}", t, worker_index, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(
            "Worker {} done: {} proposals, {} observed, {} skipped",
            worker_index, stats.proposals, stats.observed, stats.skipped
        );
        Ok(WorkerReport {
            shard: shard.path().to_path_buf(),
            threads,
            stats,
        })
    }

    /// One strategy instance spending its whole budget through an adapter.
    pub fn thread_main(
        &self,
        direction: ObjectiveDirection,
        shard: Arc<StorageShard>,
        seed: Option<u64>,
    ) -> MoResult<DriveStats> {
        let adapter = TrialAdapter::new(
            self.config.target.clone(),
            direction,
            Arc::clone(&self.presets),
            Arc::clone(&self.extra),
            Arc::clone(&self.objective),
            shard,
        );
        let budget = Budget::new(self.topology.init_points, self.topology.iterations);
        let mut strategy = (self.strategy_factory)(budget, seed);
        debug!("Thread running {} search", strategy.name());
        search::drive(strategy.as_mut(), &self.space, |candidate| {
            adapter.evaluate(candidate)
        })
    }

    /// Merge phase: fold every shard into the master store, then rank it.
    pub fn generate_summary(
        &self,
        direction: ObjectiveDirection,
        limit: Option<usize>,
        append: bool,
    ) -> MoResult<(MergeReport, SummaryReport)> {
        let merge = self.coordinator.merge_all()?;
        let summary = self
            .coordinator
            .summarize(&self.config.target, direction, limit, append)?;
        Ok((merge, summary))
    }
}

fn resolve_topology(config: &RunConfig, available: usize) -> Topology {
    let topology = Topology::resolve(
        config.processes,
        config.threads_per_process,
        config.init_points,
        config.iterations,
        available,
    );
    if topology.processes < config.processes {
        info!(
            "Clamped processes from {} to {} (available parallelism {})",
            config.processes, topology.processes, available
        );
    }
    topology
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("topology", &self.topology)
            .field("worker_command", &self.worker_command)
            .finish_non_exhaustive()
    }
}
