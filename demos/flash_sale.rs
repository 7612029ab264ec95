//! A flash sale against an e-commerce site.
//!
//! Shoppers browse the catalog for fifteen minutes to warm the caches, then a
//! flash sale opens and purchases arrive at a rate ramping from 100 to 2,000 per
//! second, whatever the site's response times. A handful of administrators
//! restock products throughout.
//!
//! Run against a local site with:
//! ```text
//! cargo run --example flash_sale -- --host http://localhost:8080
//! ```
//! Add `--scenarios flash_sale` to skip the warmup, or `--run-time 5m` for a short
//! run. The process exits with code 99 if a threshold fails.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use skein::prelude::*;

const SCENARIOS: &str = r#"{
    "scenarios": {
        "warmup": {
            "executor": "ramping-vus",
            "exec": "browse",
            "startVUs": 0,
            "stages": [
                {"duration": "2m", "target": 100},
                {"duration": "13m", "target": 100}
            ],
            "tags": {"phase": "warmup"}
        },
        "flash_sale": {
            "executor": "ramping-arrival-rate",
            "exec": "purchase",
            "startTime": "15m",
            "gracefulStop": "1m",
            "startRate": 100,
            "timeUnit": "1s",
            "preAllocatedVUs": 500,
            "maxVUs": 5000,
            "stages": [
                {"duration": "10s", "target": 500},
                {"duration": "30s", "target": 2000},
                {"duration": "5m", "target": 2000},
                {"duration": "1m", "target": 0}
            ],
            "tags": {"phase": "sale"}
        }
    },
    "thresholds": {
        "http_req_duration": ["p(95)<500", "p(99.9)<2000"],
        "http_req_failed{scenario:flash_sale}": ["rate<0.01"],
        "checks": ["rate>0.99"]
    }
}"#;

#[derive(Deserialize)]
struct Product {
    sku: String,
}

// Loaded by setup, shared by every shopper.
struct Catalog {
    products: Vec<Product>,
}

// Each shopper's cart, kept across iterations.
#[derive(Default)]
struct Cart {
    items: Vec<String>,
}

#[derive(Serialize)]
struct Order<'a> {
    items: &'a [String],
}

#[derive(Clone, Copy, Debug)]
enum BrowseAction {
    Home,
    Product,
    Search,
}

#[tokio::main]
async fn main() -> Result<(), SkeinError> {
    let result = LoadTest::initialize()?
        .load_scenario_table(SCENARIOS)?
        .register_workload("browse", workload!(browse))
        .register_workload("purchase", workload!(purchase))
        .register_scenario(
            Scenario::new(
                "restock",
                ExecutorConfig::constant_vus(2, Duration::from_secs(21 * 60)),
            )
            .set_tag("phase", "admin")
            .set_workload(workload!(restock)),
        )
        .test_start(workload!(load_catalog))
        .set_default(SkeinDefault::Host, "http://localhost:8080")?
        .set_default(SkeinDefault::GracefulStop, "10s")?
        .execute()
        .await?;

    std::process::exit(result.exit_code());
}

/// Fetch the catalog once, before any scenario starts.
async fn load_catalog(user: &mut VirtualUser) -> WorkloadResult {
    let products = user
        .get("/api/products")
        .await?
        .error_for_status()?
        .json::<Vec<Product>>()?;
    user.check_or_fail("catalog has products", !products.is_empty())?;
    user.set_shared_data(Catalog { products });
    Ok(())
}

fn random_sku(user: &mut VirtualUser) -> Option<String> {
    let catalog = user.get_shared_data::<Catalog>()?;
    let index = user.rng().random_range(0..catalog.products.len());
    Some(catalog.products[index].sku.clone())
}

async fn browse(user: &mut VirtualUser) -> WorkloadResult {
    let mut actions = ActionSelector::new(SelectionPolicy::Random)
        .with(BrowseAction::Home, 2)
        .with(BrowseAction::Product, 5)
        .with(BrowseAction::Search, 3);
    for _ in 0..3 {
        let response = match user.choose(&mut actions).copied() {
            Some(BrowseAction::Home) => user.get("/").await?,
            Some(BrowseAction::Product) => match random_sku(user) {
                Some(sku) => user.get(&format!("/products/{}", sku)).await?,
                None => user.get("/products").await?,
            },
            Some(BrowseAction::Search) => user.get("/search?q=sale").await?,
            None => break,
        };
        user.check("page loaded", response.is_success());
        user.sleep_between(Duration::from_millis(500), Duration::from_secs(3))
            .await;
    }
    Ok(())
}

async fn purchase(user: &mut VirtualUser) -> WorkloadResult {
    let sku = random_sku(user).ok_or_else(|| WorkloadError::custom("no catalog"))?;
    user.get(&format!("/products/{}", sku))
        .await?
        .error_for_status()?;

    if user.get_session_data::<Cart>().is_none() {
        user.set_session_data(Cart::default());
    }
    if let Some(cart) = user.get_session_data_mut::<Cart>() {
        cart.items.push(sku);
    }
    let items = user
        .get_session_data::<Cart>()
        .map(|cart| cart.items.clone())
        .unwrap_or_default();

    let response = user
        .post_json("/checkout", &Order { items: &items })
        .await?;
    let paid = user.check("payment accepted", response.is_success());
    user.add_rate("payment_success", paid);
    if paid {
        user.take_session_data::<Cart>();
    }
    response.error_for_status()?;
    Ok(())
}

async fn restock(user: &mut VirtualUser) -> WorkloadResult {
    if let Some(sku) = random_sku(user) {
        user.put(
            &format!("/admin/products/{}/stock", sku),
            r#"{"quantity": 100}"#,
        )
        .await?
        .error_for_status()?;
    }
    user.sleep(Duration::from_secs(30)).await;
    Ok(())
}
