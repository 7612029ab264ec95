use httpmock::Method::{GET, POST};
use httpmock::{Mock, MockServer};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod common;

use skein::metrics;
use skein::prelude::*;

const INDEX_PATH: &str = "/";
const SETUP_PATH: &str = "/setup";
const TEARDOWN_PATH: &str = "/teardown";

const INDEX_KEY: usize = 0;
const SETUP_KEY: usize = 1;
const TEARDOWN_KEY: usize = 2;

// Written by setup, read by every virtual user and by teardown.
#[derive(Deserialize)]
struct Catalog {
    products: Vec<String>,
    // Users may still hand values to each other through synchronised fields.
    #[serde(skip)]
    reservations: AtomicUsize,
}

pub async fn setup(user: &mut VirtualUser) -> WorkloadResult {
    let catalog = user
        .post(SETUP_PATH, "setting up load test")
        .await?
        .error_for_status()?
        .json::<Catalog>()?;
    user.set_shared_data(catalog);
    Ok(())
}

pub async fn failing_setup(user: &mut VirtualUser) -> WorkloadResult {
    user.post("/missing", "").await?.error_for_status()?;
    Ok(())
}

pub async fn teardown(user: &mut VirtualUser) -> WorkloadResult {
    let reservations = user
        .get_shared_data::<Catalog>()
        .map(|catalog| catalog.reservations.load(Ordering::SeqCst))
        .unwrap_or(0);
    user.check("teardown sees reservations", reservations > 0);
    let _response = user
        .post(TEARDOWN_PATH, "cleaning up after load test")
        .await?;
    Ok(())
}

pub async fn get_index(user: &mut VirtualUser) -> WorkloadResult {
    let _response = user.get(INDEX_PATH).await?;
    let catalog = user.get_shared_data::<Catalog>();
    user.check("catalog loaded", catalog.is_some());
    if let Some(catalog) = catalog {
        user.check("catalog has products", catalog.products.len() == 2);
        catalog.reservations.fetch_add(1, Ordering::SeqCst);
    }
    // A scenario user can't replace the shared context.
    let replaced = user.set_shared_data(0_usize);
    user.check("shared context is read-only", !replaced);
    user.sleep(Duration::from_millis(50)).await;
    Ok(())
}

// All tests in this file run against common endpoints.
fn setup_mock_server_endpoints(server: &MockServer) -> Vec<Mock> {
    vec![
        // First set up INDEX_PATH, store in vector at INDEX_KEY.
        server.mock(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        }),
        // Next set up SETUP_PATH, store in vector at SETUP_KEY.
        server.mock(|when, then| {
            when.method(POST).path(SETUP_PATH);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"products": ["sku-1", "sku-2"]}"#);
        }),
        // Next set up TEARDOWN_PATH, store in vector at TEARDOWN_KEY.
        server.mock(|when, then| {
            when.method(POST).path(TEARDOWN_PATH);
            then.status(200);
        }),
    ]
}

fn index_scenario() -> Scenario {
    Scenario::new(
        "browse",
        ExecutorConfig::per_vu_iterations(2, 3, Duration::from_secs(10)),
    )
    .set_exec("index")
}

#[tokio::test]
/// Setup runs once before the scenarios, teardown once after, and both share
/// the context setup stored.
async fn test_setup_teardown() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(Some(&server), vec![]);
    let load_test = common::build_load_test(configuration, vec![index_scenario()])
        .register_workload("index", workload!(get_index))
        .test_start(workload!(setup))
        .test_stop(workload!(teardown));
    let result = common::run_load_test(load_test).await;

    assert_eq!(mock_endpoints[SETUP_KEY].hits(), 1);
    assert_eq!(mock_endpoints[INDEX_KEY].hits(), 6);
    assert_eq!(mock_endpoints[TEARDOWN_KEY].hits(), 1);

    let checks = result.metrics.rate(metrics::CHECKS).unwrap();
    // Three checks per iteration, plus the teardown check.
    assert_eq!(checks.total, 19);
    assert_eq!(checks.trues, 19);

    // Setup and teardown requests are tagged with their own phase.
    assert_eq!(
        result
            .metrics
            .counter(&metrics::scenario_submetric(metrics::HTTP_REQS, "setup")),
        1.0
    );
    assert_eq!(
        result
            .metrics
            .counter(&metrics::scenario_submetric(metrics::HTTP_REQS, "teardown")),
        1.0
    );
    assert_eq!(
        result
            .metrics
            .counter(&metrics::scenario_submetric(metrics::HTTP_REQS, "browse")),
        6.0
    );
}

#[tokio::test]
/// A failing setup aborts the run before any scenario starts.
async fn test_failing_setup() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(Some(&server), vec![]);
    let error = common::build_load_test(configuration, vec![index_scenario()])
        .register_workload("index", workload!(get_index))
        .test_start(workload!(failing_setup))
        .test_stop(workload!(teardown))
        .execute()
        .await
        .err()
        .unwrap();

    match error {
        SkeinError::InvalidScenario { scenario, .. } => assert_eq!(scenario, "setup"),
        e => panic!("unexpected error: {}", e),
    }
    assert_eq!(mock_endpoints[INDEX_KEY].hits(), 0);
    assert_eq!(mock_endpoints[TEARDOWN_KEY].hits(), 0);
}
