use mo_optimizer::{
    ColumnSchema, ObjectiveDirection, Orchestrator, ParameterValue, RunConfig, RunOutcome,
    RunReport, RunState, SearchSpace, TrialRecord, WorkerCommand,
};
use tempfile::TempDir;

fn square(params: &TrialRecord, _extra: &serde_json::Value) -> anyhow::Result<Vec<TrialRecord>> {
    let x = params["x"].as_f64().unwrap_or_default();
    Ok(vec![TrialRecord::from([("score".to_string(), ParameterValue::Float(x * x))])])
}

fn square_config(dir: &TempDir) -> RunConfig {
    RunConfig::new(
        "square",
        "score",
        ColumnSchema::new().add_real("x").add_real("score"),
        SearchSpace::new().add_float("x", -3.0, 3.0),
    )
    .with_storage_dir(dir.path())
    .with_budget(2, 2)
    .with_seed(11)
}

/// Re-runs this test binary, filtered to `test_name`, as the worker process.
fn test_worker(test_name: &str) -> WorkerCommand {
    WorkerCommand::new(
        std::env::current_exe().unwrap(),
        [test_name, "--exact", "--test-threads=1", "--nocapture"],
    )
}

fn sorted_xs(rows: &[TrialRecord]) -> Vec<f64> {
    let mut xs: Vec<f64> = rows.iter().filter_map(|r| r["x"].as_f64()).collect();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    xs
}

#[test]
fn two_processes_two_threads() {
    let dir = TempDir::new().unwrap();
    let config = square_config(&dir).with_topology(2, 2).with_budget(1, 0);
    let orchestrator = Orchestrator::new(config, square)
        .unwrap()
        .with_available_parallelism(2)
        .with_worker_command(test_worker("two_processes_two_threads"));

    // Inside a worker process the run ends after this process's share.
    let RunOutcome::Coordinator(report) = orchestrator.minimize().unwrap() else {
        return;
    };

    assert_eq!(orchestrator.topology().processes, 2);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.workers_failed, 0);
    assert_eq!(report.shards_lost, 0);
    assert_eq!(report.shards_merged, 2);
    assert_eq!(report.rows_merged, 4);

    let coordinator = orchestrator.coordinator();
    assert!(coordinator.shard_paths().unwrap().is_empty());
    let rows = coordinator.master_rows().unwrap();
    assert_eq!(rows.len(), 4);
    for row in &rows {
        let x = row["x"].as_f64().unwrap();
        assert!((-3.0..=3.0).contains(&x));
        assert_eq!(row["score"], ParameterValue::Float(x * x));
    }

    let best = coordinator
        .summarize("score", ObjectiveDirection::Minimize, Some(1), false)
        .unwrap();
    assert_eq!(best.rows.len(), 1);
    let smallest = rows
        .iter()
        .filter_map(|r| r["score"].as_f64())
        .fold(f64::INFINITY, f64::min);
    assert_eq!(best.rows[0]["score"], ParameterValue::Float(smallest));
}

#[test]
fn unspawnable_workers_are_counted() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(square_config(&dir).with_topology(2, 1), square)
        .unwrap()
        .with_available_parallelism(2)
        .with_worker_command(WorkerCommand::new(
            dir.path().join("no-such-binary"),
            Vec::<String>::new(),
        ));
    let RunOutcome::Coordinator(report) = orchestrator.maximize().unwrap() else {
        panic!("orchestrating process ran as a worker");
    };

    assert_eq!(orchestrator.topology().processes, 2);
    assert_eq!(report.workers_failed, 2);
    assert_eq!(report.rows_merged, 0);
    assert!(report.best_trial.is_none());
    assert_eq!(report.state, RunState::Completed);
}

fn coordinator_report(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Coordinator(report) => report,
        RunOutcome::Worker(_) => panic!("orchestrating process ran as a worker"),
    }
}

#[test]
fn categorical_labels_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = RunConfig::new(
        "optimizers",
        "accuracy",
        ColumnSchema::new()
            .add_real("lr")
            .add_categorical("optimizer", [(0, "adam"), (1, "sgd")])
            .add_real("accuracy"),
        SearchSpace::new()
            .add_log_uniform("lr", 1e-4, 1e-1)
            .add_int("optimizer", 0, 1),
    )
    .with_storage_dir(dir.path())
    .with_topology(1, 2)
    .with_budget(4, 4)
    .with_seed(3);

    let objective = |params: &TrialRecord, _: &serde_json::Value| -> anyhow::Result<Vec<TrialRecord>> {
        let bonus = match &params["optimizer"] {
            ParameterValue::Text(label) if label == "sgd" => 1.0,
            ParameterValue::Text(_) => 0.0,
            other => anyhow::bail!("optimizer was not resolved to a label: {other}"),
        };
        let lr = params["lr"].as_f64().unwrap_or_default();
        Ok(vec![TrialRecord::from([(
            "accuracy".to_string(),
            ParameterValue::Float(bonus + lr),
        )])])
    };

    let orchestrator = Orchestrator::new(config, objective).unwrap();
    let report = coordinator_report(orchestrator.maximize().unwrap());
    assert_eq!(report.workers_failed, 0);
    assert_eq!(report.rows_merged, 16);

    let rows = orchestrator.coordinator().master_rows().unwrap();
    for row in &rows {
        assert!(matches!(&row["optimizer"], ParameterValue::Text(l) if l == "adam" || l == "sgd"));
    }

    let csv = std::fs::read_to_string(report.summary_path.unwrap()).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("lr,optimizer,accuracy"));
    assert_eq!(lines.count(), 16);
    if rows.iter().any(|r| r["optimizer"] == ParameterValue::Text("sgd".into())) {
        assert_eq!(
            report.best_trial.unwrap()["optimizer"],
            ParameterValue::Text("sgd".into())
        );
    }
}

#[test]
fn appended_summaries_keep_one_header() {
    let dir = TempDir::new().unwrap();
    let config = square_config(&dir)
        .with_topology(1, 1)
        .with_summary(Some(2), true);
    let orchestrator = Orchestrator::new(config, square).unwrap();

    coordinator_report(orchestrator.maximize().unwrap());
    let report = coordinator_report(orchestrator.maximize().unwrap());

    let csv = std::fs::read_to_string(report.summary_path.unwrap()).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "x,score");
    assert!(lines[1..].iter().all(|l| *l != "x,score"));
    assert_eq!(orchestrator.coordinator().master_row_count().unwrap(), 8);
}

#[test]
fn seeded_runs_repeat() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();

    let mut xs = Vec::new();
    for dir in [&first_dir, &second_dir] {
        let config = square_config(dir).with_topology(1, 3);
        let orchestrator = Orchestrator::new(config, square).unwrap();
        coordinator_report(orchestrator.maximize().unwrap());
        xs.push(sorted_xs(&orchestrator.coordinator().master_rows().unwrap()));
    }
    assert_eq!(xs[0].len(), 12);
    assert_eq!(xs[0], xs[1]);
}
