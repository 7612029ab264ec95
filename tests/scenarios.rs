/// Run each executor end to end on a paused clock and validate how many
/// iterations it started, completed, cancelled and dropped.
use std::time::Duration;

mod common;

use skein::metrics;
use skein::prelude::*;

async fn short_iteration(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn half_second_iteration(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_millis(500)).await;
    Ok(())
}

async fn slow_iteration(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_secs(2)).await;
    Ok(())
}

async fn crashing_iteration(user: &mut VirtualUser) -> WorkloadResult {
    user.sleep(Duration::from_millis(100)).await;
    panic!("checkout service client crashed");
}

fn secs(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

fn millis(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

async fn run_scenario(scenario: Scenario) -> RunResult {
    let configuration = common::build_configuration(None, vec![]);
    common::run_load_test(common::build_load_test(configuration, vec![scenario])).await
}

#[tokio::test(start_paused = true)]
/// Users ramp up to the target and back down, finishing their iterations.
async fn test_ramping_vus() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_vus(0, vec![Stage::new(secs(2), 4), Stage::new(secs(2), 0)]),
        )
        .set_workload(workload!(half_second_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert!(outcome.started);
    assert!(!outcome.stopped_early);
    assert_eq!(outcome.executor, ExecutorKind::RampingVus);
    assert_eq!(outcome.peak_vus, 4);
    assert!(outcome.completed > 0);
    assert_eq!(outcome.failed, 0);
    // The default ramp-down grace is long enough for every iteration.
    assert_eq!(outcome.cancelled, 0);
    assert_eq!(
        result.metrics.counter(metrics::ITERATIONS) as u64,
        outcome.completed
    );
    assert_eq!(result.history.len(), 2);
}

#[tokio::test(start_paused = true)]
/// Users retired while ramping down are interrupted after the ramp-down grace.
async fn test_ramping_vus_graceful_ramp_down() {
    let result = run_scenario(
        Scenario::new(
            "ramp_down",
            ExecutorConfig::ramping_vus(2, vec![Stage::new(secs(1), 2), Stage::new(secs(1), 0)])
                .set_graceful_ramp_down(millis(100)),
        )
        .set_workload(workload!(slow_iteration)),
    )
    .await;

    let outcome = result.scenario("ramp_down").unwrap();
    assert_eq!(outcome.peak_vus, 2);
    assert!(outcome.cancelled >= 1);
    assert_eq!(
        result.metrics.counter(metrics::CANCELLED_ITERATIONS) as u64,
        outcome.cancelled
    );
    assert!(outcome.duration < secs(3));
}

#[tokio::test(start_paused = true)]
/// A fixed number of users iterates back to back for the duration.
async fn test_constant_vus() {
    let result = run_scenario(
        Scenario::new("browse", ExecutorConfig::constant_vus(3, secs(1)))
            .set_workload(workload!(short_iteration)),
    )
    .await;

    let outcome = result.scenario("browse").unwrap();
    assert_eq!(outcome.peak_vus, 3);
    assert!(
        outcome.completed >= 30 && outcome.completed <= 33,
        "completed {}",
        outcome.completed
    );
    assert_eq!(outcome.cancelled, 0);
    assert_eq!(outcome.dropped, 0);

    let duration = result.metrics.trend(metrics::ITERATION_DURATION).unwrap();
    assert_eq!(duration.count as u64, outcome.completed);
    assert_eq!(duration.min, 100.0);
}

#[tokio::test(start_paused = true)]
/// Every user runs its iterations, then the scenario ends early.
async fn test_per_vu_iterations() {
    let result = run_scenario(
        Scenario::new(
            "checkout",
            ExecutorConfig::per_vu_iterations(2, 5, secs(10)),
        )
        .set_workload(workload!(short_iteration)),
    )
    .await;

    let outcome = result.scenario("checkout").unwrap();
    assert_eq!(outcome.completed, 10);
    assert_eq!(outcome.cancelled, 0);
    assert!(!outcome.stopped_early);
    assert!(outcome.duration < secs(1));
}

#[tokio::test(start_paused = true)]
/// Iterations still running at maxDuration are interrupted without grace.
async fn test_per_vu_iterations_max_duration() {
    let result = run_scenario(
        Scenario::new(
            "checkout",
            ExecutorConfig::per_vu_iterations(3, 1, millis(1)),
        )
        .set_workload(workload!(short_iteration)),
    )
    .await;

    let outcome = result.scenario("checkout").unwrap();
    assert_eq!(outcome.completed, 0);
    assert_eq!(outcome.cancelled, 3);
    assert!(!outcome.stopped_early);
    assert_eq!(result.metrics.counter(metrics::CANCELLED_ITERATIONS), 3.0);
    assert_eq!(result.metrics.counter(metrics::ITERATIONS), 0.0);
}

#[tokio::test(start_paused = true)]
/// With enough workers every scheduled iteration starts.
async fn test_arrival_rate() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_arrival_rate(10, secs(1), vec![Stage::new(secs(2), 10)], 2, 2),
        )
        .set_workload(workload!(short_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert_eq!(outcome.scheduled, 20);
    assert_eq!(outcome.dropped, 0);
    assert_eq!(outcome.completed, 20);
    assert_eq!(outcome.started_iterations() + outcome.dropped, outcome.scheduled);
}

#[tokio::test(start_paused = true)]
/// Iterations no worker is free for are dropped, never queued.
async fn test_arrival_rate_drops_iterations() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_arrival_rate(10, secs(1), vec![Stage::new(secs(1), 10)], 1, 1),
        )
        .set_workload(workload!(slow_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert_eq!(outcome.scheduled, 10);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.dropped, 9);
    assert_eq!(outcome.peak_vus, 1);
    assert_eq!(outcome.started_iterations() + outcome.dropped, outcome.scheduled);
    assert_eq!(result.metrics.counter(metrics::DROPPED_ITERATIONS), 9.0);
    assert_eq!(
        result
            .metrics
            .counter(&metrics::scenario_submetric(metrics::DROPPED_ITERATIONS, "flash_sale")),
        9.0
    );
}

#[tokio::test(start_paused = true)]
/// The pool grows from the pre-allocated workers up to the maximum.
async fn test_arrival_rate_grows_pool() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_arrival_rate(10, secs(1), vec![Stage::new(secs(1), 10)], 1, 3),
        )
        .set_workload(workload!(slow_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert_eq!(outcome.peak_vus, 3);
    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.dropped, 7);
}

#[tokio::test(start_paused = true)]
/// Scenarios start at their own offsets and run concurrently.
async fn test_staggered_scenarios() {
    let configuration = common::build_configuration(None, vec![]);
    let result = common::run_load_test(common::build_load_test(
        configuration,
        vec![
            Scenario::new("warmup", ExecutorConfig::constant_vus(2, secs(2)))
                .set_workload(workload!(short_iteration)),
            Scenario::new(
                "flash_sale",
                ExecutorConfig::ramping_arrival_rate(5, secs(1), vec![Stage::new(secs(1), 5)], 1, 1),
            )
            .set_start_time(secs(1))
            .set_workload(workload!(short_iteration)),
        ],
    ))
    .await;

    let warmup = result.scenario("warmup").unwrap();
    let flash_sale = result.scenario("flash_sale").unwrap();
    assert!(warmup.start_offset < millis(100));
    assert!(flash_sale.start_offset >= secs(1) && flash_sale.start_offset < millis(1_100));
    assert_eq!(flash_sale.scheduled, 5);
    assert_eq!(flash_sale.dropped, 0);

    // Both scenarios feed the same metrics, each under its own sub-metric.
    let total = result.metrics.counter(metrics::ITERATIONS);
    let warmup_iterations = result
        .metrics
        .counter(&metrics::scenario_submetric(metrics::ITERATIONS, "warmup"));
    let flash_sale_iterations = result
        .metrics
        .counter(&metrics::scenario_submetric(metrics::ITERATIONS, "flash_sale"));
    assert_eq!(total, warmup_iterations + flash_sale_iterations);
    assert_eq!(flash_sale_iterations, 5.0);
    assert_eq!(result.history.len(), 4);
}

#[tokio::test(start_paused = true)]
/// A worker freed at the instant the next iteration is due takes it.
async fn test_arrival_rate_reuses_worker() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_arrival_rate(10, secs(1), vec![Stage::new(secs(2), 10)], 1, 1),
        )
        .set_workload(workload!(short_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert_eq!(outcome.scheduled, 20);
    assert_eq!(outcome.dropped, 0);
    assert_eq!(outcome.completed, 20);
    assert_eq!(outcome.peak_vus, 1);
}

#[tokio::test(start_paused = true)]
/// A panicking workload fails its iteration, and its user keeps iterating.
async fn test_panicking_workload_constant_vus() {
    let result = run_scenario(
        Scenario::new("checkout", ExecutorConfig::constant_vus(2, secs(1)))
            .set_workload(workload!(crashing_iteration)),
    )
    .await;

    let outcome = result.scenario("checkout").unwrap();
    assert!(
        outcome.completed >= 18 && outcome.completed <= 22,
        "completed {}",
        outcome.completed
    );
    assert_eq!(outcome.failed, outcome.completed);
    assert_eq!(outcome.cancelled, 0);
    assert_eq!(outcome.peak_vus, 2);

    let failures = result.metrics.rate(metrics::ITERATION_FAILURES).unwrap();
    assert_eq!(failures.trues as u64, outcome.completed);
    assert_eq!(failures.total as u64, outcome.completed);
}

#[tokio::test(start_paused = true)]
/// Panicking workers return to the pool, so no arrival is lost.
async fn test_panicking_workload_arrival_rate() {
    let result = run_scenario(
        Scenario::new(
            "flash_sale",
            ExecutorConfig::ramping_arrival_rate(10, secs(1), vec![Stage::new(secs(1), 10)], 1, 1),
        )
        .set_workload(workload!(crashing_iteration)),
    )
    .await;

    let outcome = result.scenario("flash_sale").unwrap();
    assert_eq!(outcome.scheduled, 10);
    assert_eq!(outcome.dropped, 0);
    assert_eq!(outcome.completed, 10);
    assert_eq!(outcome.failed, 10);
    assert_eq!(outcome.started_iterations() + outcome.dropped, outcome.scheduled);
    assert_eq!(result.metrics.rate(metrics::ITERATION_FAILURES).unwrap().trues, 10);
}
