//! Minimizes `x^2 + y^2` across worker processes and threads.
//!
//! Usage: `multiopt-sphere [config.json]`. Without an argument the config is
//! read from `MULTIOPT_CONFIG`, falling back to a built-in sphere run.

use anyhow::Context;
use mo_optimizer::{
    ColumnSchema, ObjectiveDirection, Orchestrator, ParameterValue, RunConfig, RunOutcome,
    SearchSpace, TrialRecord,
};

fn sphere(params: &TrialRecord, _extra: &serde_json::Value) -> anyhow::Result<Vec<TrialRecord>> {
    let coordinate = |name: &str| {
        params
            .get(name)
            .and_then(ParameterValue::as_f64)
            .with_context(|| format!("missing numeric parameter {name}"))
    };
    let (x, y) = (coordinate("x")?, coordinate("y")?);
    Ok(vec![TrialRecord::from([(
        "score".to_string(),
        ParameterValue::Float(x * x + y * y),
    )])])
}

fn default_config() -> RunConfig {
    RunConfig::new(
        "sphere",
        "score",
        ColumnSchema::new().add_real("x").add_real("y").add_real("score"),
        SearchSpace::new()
            .add_float("x", -5.0, 5.0)
            .add_float("y", -5.0, 5.0),
    )
    .with_direction(ObjectiveDirection::Minimize)
    .with_topology(2, 2)
    .with_budget(5, 20)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Worker processes inherit the same arguments and environment, so they
    // resolve the same config.
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("MULTIOPT_CONFIG"));
    let config = match config_path {
        Some(path) => RunConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.to_string_lossy()))?,
        None => default_config(),
    };

    let direction = config.direction;
    let orchestrator = Orchestrator::new(config, sphere)?;
    match orchestrator.run(direction)? {
        RunOutcome::Coordinator(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        RunOutcome::Worker(report) => {
            tracing::debug!(
                "Worker on {} finished {} proposals",
                report.shard.display(),
                report.stats.proposals
            );
        }
    }
    Ok(())
}
