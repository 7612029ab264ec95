//! Scenarios and workloads.
//!
//! A [`Scenario`] names a [`Workload`] and the [`ExecutorConfig`] that schedules
//! it. Scenarios are built in code, or read from a JSON [`ScenarioTable`] and bound
//! to workloads registered by name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::metrics::Tags;
use crate::threshold::ThresholdSpec;
use crate::user::{VirtualUser, WorkloadResult};
use crate::util;
use crate::SkeinError;

/// The function a virtual user runs once per iteration.
pub type WorkloadFunction = Arc<
    dyn for<'r> Fn(&'r mut VirtualUser) -> Pin<Box<dyn Future<Output = WorkloadResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// `workload!(foo)` expands to `Workload::new(foo)`, boxing the future `foo`
/// returns so any `async fn foo(&mut VirtualUser) -> WorkloadResult` fits.
///
/// # Example
/// ```rust
/// use skein::prelude::*;
///
/// let browse = workload!(list_products).set_name("browse");
///
/// async fn list_products(user: &mut VirtualUser) -> WorkloadResult {
///     let _response = user.get("/products").await?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! workload {
    ($workload_func:ident) => {
        $crate::scenario::Workload::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($workload_func(s))
        }))
    };
}

/// A named workload function.
#[derive(Clone)]
pub struct Workload {
    pub name: String,
    pub function: WorkloadFunction,
}
impl Workload {
    pub fn new(function: WorkloadFunction) -> Self {
        Workload {
            name: String::new(),
            function,
        }
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}
impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Workload").field("name", &self.name).finish()
    }
}

/// A workload, the executor that schedules it, and when it starts.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: String,
    pub executor: ExecutorConfig,
    /// Name of the registered workload to run. Defaults to the scenario name.
    pub exec: Option<String>,
    /// Offset from the start of the run.
    pub start_time: Duration,
    /// Overrides the run's `--graceful-stop`.
    pub graceful_stop: Option<Duration>,
    pub tags: Tags,
    pub(crate) workload: Option<Workload>,
}

impl Scenario {
    /// # Example
    /// ```rust
    /// use skein::prelude::*;
    /// use std::time::Duration;
    ///
    /// let scenario = Scenario::new(
    ///     "warmup",
    ///     ExecutorConfig::constant_vus(10, Duration::from_secs(60)),
    /// )
    /// .set_start_time(Duration::from_secs(30))
    /// .set_tag("phase", "warmup")
    /// .set_workload(workload!(warm_cache));
    ///
    /// async fn warm_cache(user: &mut VirtualUser) -> WorkloadResult {
    ///     let _response = user.get("/").await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn new(name: &str, executor: ExecutorConfig) -> Self {
        Scenario {
            name: name.to_string(),
            executor,
            exec: None,
            start_time: Duration::from_secs(0),
            graceful_stop: None,
            tags: Tags::new(),
            workload: None,
        }
    }

    pub fn set_start_time(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn set_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = Some(graceful_stop);
        self
    }

    pub fn set_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Run the registered workload called `exec` instead of the one named after
    /// the scenario.
    pub fn set_exec(mut self, exec: &str) -> Self {
        self.exec = Some(exec.to_string());
        self
    }

    pub fn set_workload(mut self, workload: Workload) -> Self {
        self.workload = Some(workload);
        self
    }

    /// The registered workload this scenario runs, when none was set directly.
    pub fn workload_name(&self) -> &str {
        self.exec.as_deref().unwrap_or(&self.name)
    }

    pub(crate) fn workload(&self) -> Option<&Workload> {
        self.workload.as_ref()
    }

    /// Tags attached to every sample of the scenario: its own, plus `scenario`.
    pub(crate) fn sample_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.entry("scenario".to_string())
            .or_insert_with(|| self.name.clone());
        tags
    }

    /// The scenario's own timeline, without the start offset.
    pub fn duration(&self) -> Duration {
        self.executor.total_duration()
    }
}

/// One row of the scenario table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    #[serde(flatten)]
    pub executor: ExecutorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(
        default,
        with = "util::timespan::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<Duration>,
    #[serde(
        default,
        with = "util::timespan::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub graceful_stop: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
}

/// Declarative scenarios and thresholds.
///
/// # Example
/// ```rust
/// use skein::scenario::ScenarioTable;
///
/// let table = ScenarioTable::from_json(r#"{
///     "scenarios": {
///         "browse": {"executor": "constant-vus", "vus": 10, "duration": "1m"}
///     },
///     "thresholds": {"http_req_duration": ["p(95)<500"]}
/// }"#).unwrap();
/// assert_eq!(table.scenarios().len(), 1);
/// assert_eq!(table.thresholds().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTable {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioSpec>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

impl ScenarioTable {
    pub fn from_json(json: &str) -> Result<Self, SkeinError> {
        serde_json::from_str(json).map_err(|e| SkeinError::InvalidOption {
            option: "scenario table".to_string(),
            value: json.chars().take(80).collect(),
            detail: format!("invalid scenario table: {}", e),
        })
    }

    /// The table's scenarios, in name order, not yet bound to workloads.
    pub fn scenarios(&self) -> Vec<Scenario> {
        self.scenarios
            .iter()
            .map(|(name, spec)| {
                let mut scenario = Scenario::new(name, spec.executor.clone());
                scenario.exec = spec.exec.clone();
                scenario.start_time = spec.start_time.unwrap_or_default();
                scenario.graceful_stop = spec.graceful_stop;
                scenario.tags = spec.tags.clone();
                scenario
            })
            .collect()
    }

    /// Parse every threshold expression.
    pub fn thresholds(&self) -> Result<Vec<ThresholdSpec>, SkeinError> {
        let mut thresholds = Vec::new();
        for (metric, expressions) in &self.thresholds {
            for expression in expressions {
                thresholds.push(ThresholdSpec::new(metric, expression)?);
            }
        }
        Ok(thresholds)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timeline::Stage;

    const FLASH_SALE: &str = r#"{
        "scenarios": {
            "warmup": {
                "executor": "constant-vus",
                "exec": "browse",
                "vus": 100,
                "duration": "15m",
                "tags": {"phase": "warmup"}
            },
            "flash_sale": {
                "executor": "ramping-arrival-rate",
                "startTime": "15m",
                "gracefulStop": "1m",
                "startRate": 100,
                "timeUnit": "1s",
                "preAllocatedVUs": 500,
                "maxVUs": 5000,
                "stages": [
                    {"duration": "10s", "target": 500},
                    {"duration": "30s", "target": 2000}
                ]
            }
        },
        "thresholds": {
            "http_req_duration": ["p(95)<500", "p(99.9)<2000"],
            "errors{scenario:flash_sale}": ["rate<0.1"]
        }
    }"#;

    #[test]
    fn load_table() {
        let table = ScenarioTable::from_json(FLASH_SALE).unwrap();
        let scenarios = table.scenarios();
        assert_eq!(scenarios.len(), 2);

        let flash_sale = &scenarios[0];
        assert_eq!(flash_sale.name, "flash_sale");
        assert_eq!(flash_sale.workload_name(), "flash_sale");
        assert_eq!(flash_sale.start_time, Duration::from_secs(900));
        assert_eq!(flash_sale.graceful_stop, Some(Duration::from_secs(60)));
        assert_eq!(
            flash_sale.executor,
            ExecutorConfig::ramping_arrival_rate(
                100,
                Duration::from_secs(1),
                vec![
                    Stage::new(Duration::from_secs(10), 500),
                    Stage::new(Duration::from_secs(30), 2_000)
                ],
                500,
                5_000
            )
        );

        let warmup = &scenarios[1];
        assert_eq!(warmup.workload_name(), "browse");
        assert_eq!(warmup.start_time, Duration::from_secs(0));
        assert_eq!(warmup.duration(), Duration::from_secs(900));
        let tags = warmup.sample_tags();
        assert_eq!(tags.get("phase").unwrap(), "warmup");
        assert_eq!(tags.get("scenario").unwrap(), "warmup");

        let thresholds = table.thresholds().unwrap();
        assert_eq!(thresholds.len(), 3);
        assert!(thresholds
            .iter()
            .any(|threshold| threshold.metric == "errors{scenario:flash_sale}"));
    }

    #[test]
    fn invalid_tables() {
        assert!(ScenarioTable::from_json("{").unwrap_err().is_config_error());
        assert!(ScenarioTable::from_json(
            r#"{"scenarios": {"a": {"executor": "constant-vus", "vus": 1}}}"#
        )
        .is_err());
        let table = ScenarioTable::from_json(r#"{"thresholds": {"checks": ["rate>>1"]}}"#).unwrap();
        assert!(table.thresholds().unwrap_err().is_config_error());
    }

    #[test]
    fn scenario_tag_can_be_overridden() {
        let scenario = Scenario::new(
            "checkout",
            ExecutorConfig::constant_vus(1, Duration::from_secs(1)),
        )
        .set_tag("scenario", "purchase");
        assert_eq!(scenario.sample_tags().get("scenario").unwrap(), "purchase");
    }
}
