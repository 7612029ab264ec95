/// Validate loading scenarios and thresholds from a JSON scenario table.
use std::time::Duration;

mod common;

use skein::prelude::*;

const SCENARIO_TABLE: &str = r#"{
    "scenarios": {
        "warmup": {
            "executor": "constant-vus",
            "exec": "browse",
            "vus": 2,
            "duration": "2s",
            "tags": {"phase": "warmup"}
        },
        "flash_sale": {
            "executor": "ramping-arrival-rate",
            "exec": "purchase",
            "startTime": "1s",
            "gracefulStop": "1s",
            "startRate": 2,
            "timeUnit": "1s",
            "preAllocatedVUs": 1,
            "maxVUs": 4,
            "stages": [
                {"duration": "1s", "target": 10},
                {"duration": "1s", "target": 10}
            ]
        },
        "late_checkout": {
            "executor": "per-vu-iterations",
            "exec": "purchase",
            "startTime": "10m",
            "vus": 1,
            "iterations": 1
        }
    },
    "thresholds": {
        "iterations{scenario:warmup}": ["count>0"],
        "iteration_failures": ["rate==0"]
    }
}"#;

async fn browse(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn purchase(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_millis(300)).await;
    Ok(())
}

fn build(configuration: SkeinConfiguration) -> LoadTest {
    LoadTest::initialize_with_config(configuration)
        .unwrap()
        .register_workload("browse", workload!(browse))
        .register_workload("purchase", workload!(purchase))
}

#[tokio::test(start_paused = true)]
/// A scenario table loaded from --config; the run time ends the run before the
/// late scenario's start time.
async fn test_config_file() {
    let path = std::env::temp_dir().join("skein-scenario-table.json");
    let path_str = path.to_str().unwrap().to_string();
    std::fs::write(&path, SCENARIO_TABLE).unwrap();

    let configuration =
        common::build_configuration(None, vec!["--config", &path_str, "--run-time", "5s"]);
    let result = common::run_load_test(build(configuration)).await;
    common::cleanup_files(vec![&path_str]);

    assert_eq!(result.scenarios.len(), 3);
    let warmup = result.scenario("warmup").unwrap();
    assert!(warmup.started);
    assert!(warmup.completed >= 38);

    let flash_sale = result.scenario("flash_sale").unwrap();
    assert!(flash_sale.started);
    assert!(flash_sale.start_offset >= Duration::from_secs(1));
    // 6 iterations while ramping from 2 to 10, then 10 more.
    assert_eq!(flash_sale.scheduled, 16);
    assert_eq!(flash_sale.started_iterations() + flash_sale.dropped, 16);

    let late_checkout = result.scenario("late_checkout").unwrap();
    assert!(!late_checkout.started);
    assert_eq!(late_checkout.completed, 0);

    assert_eq!(result.thresholds.len(), 2);
    assert!(result.passed());
    // Tags from the table are attached to every sample of the scenario.
    assert!(result
        .metrics
        .get("iterations{scenario:warmup}")
        .is_some());
}

#[tokio::test(start_paused = true)]
/// --list shows the scenarios without running them.
async fn test_list() {
    let configuration = common::build_configuration(None, vec!["--list"]);
    let result = common::run_load_test(
        build(configuration)
            .load_scenario_table(SCENARIO_TABLE)
            .unwrap(),
    )
    .await;
    assert!(result.scenarios.is_empty());
    assert!(result.metrics.is_empty());
}

#[tokio::test(start_paused = true)]
/// A table naming a workload nobody registered is rejected before any load.
async fn test_unknown_workload() {
    let configuration = common::build_configuration(None, vec![]);
    let error = LoadTest::initialize_with_config(configuration)
        .unwrap()
        .register_workload("browse", workload!(browse))
        .load_scenario_table(SCENARIO_TABLE)
        .unwrap()
        .execute()
        .await
        .err()
        .unwrap();
    match error {
        SkeinError::UnknownWorkload { workload, .. } => assert_eq!(workload, "purchase"),
        e => panic!("unexpected error: {}", e),
    }
}

#[tokio::test(start_paused = true)]
/// Executor settings that can't run are rejected before any load.
async fn test_invalid_scenario() {
    let configuration = common::build_configuration(None, vec![]);
    let error = build(configuration)
        .load_scenario_table(
            r#"{"scenarios": {"browse": {
                "executor": "ramping-arrival-rate",
                "stages": [{"duration": "1s", "target": 10}],
                "preAllocatedVUs": 5,
                "maxVUs": 2
            }}}"#,
        )
        .unwrap()
        .execute()
        .await
        .err()
        .unwrap();
    assert!(matches!(error, SkeinError::InvalidScenario { .. }));

    let configuration = common::build_configuration(None, vec![]);
    let error = build(configuration)
        .load_scenario_table(r#"{"scenarios": {"browse": {"executor": "shared-iterations"}}}"#)
        .err()
        .unwrap();
    assert!(error.is_config_error());
}
