//! # Skein
//!
//! Skein is a load generation scheduling and metrics engine. It runs several
//! load-generation scenarios concurrently, each driven by its own executor, and
//! aggregates what every virtual user records into metrics that are checked
//! against thresholds at the end of the run.
//!
//! Four executors are available:
//!  - `ramping-vus`: a closed model whose number of virtual users follows a
//!    piecewise-linear ramp;
//!  - `constant-vus`: a fixed number of virtual users for a fixed duration;
//!  - `per-vu-iterations`: every virtual user runs a fixed number of iterations,
//!    bounded by a maximum duration;
//!  - `ramping-arrival-rate`: an open model starting iterations at a ramping rate
//!    from a bounded pool of workers, dropping the ones no worker is free for.
//!
//! ## Creating a load test
//!
//! Add the following boilerplate `use` declaration at the top of your `src/main.rs`:
//!
//! ```rust
//! use skein::prelude::*;
//! ```
//!
//! Workloads are async functions taking a `&mut VirtualUser`:
//!
//! ```rust
//! use skein::prelude::*;
//!
//! async fn browse(user: &mut VirtualUser) -> WorkloadResult {
//!     let response = user.get("/products").await?;
//!     user.check("products listed", response.is_success());
//!     user.sleep_between(
//!         std::time::Duration::from_millis(500),
//!         std::time::Duration::from_secs(2),
//!     )
//!     .await;
//!     Ok(())
//! }
//! ```
//!
//! Scenarios bind a workload to an executor, either in code or in a JSON
//! scenario table:
//!
//! ```rust,no_run
//! use skein::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SkeinError> {
//!     let result = LoadTest::initialize()?
//!         .load_scenario_table(r#"{
//!             "scenarios": {
//!                 "browse": {"executor": "constant-vus", "vus": 10, "duration": "1m"}
//!             },
//!             "thresholds": {"http_req_duration": ["p(95)<500"]}
//!         }"#)?
//!         .register_workload("browse", workload!(browse))
//!         .set_default(SkeinDefault::Host, "http://localhost:8080")?
//!         .execute()
//!         .await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//!
//! async fn browse(user: &mut VirtualUser) -> WorkloadResult {
//!     let _response = user.get("/").await?;
//!     Ok(())
//! }
//! ```
//!
//! Run with `-h` to see the run-time options.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod executor;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod report;
pub mod scenario;
pub mod scheduler;
pub mod select;
pub mod threshold;
pub mod timeline;
pub mod user;
pub mod util;

use gumdrop::Options;
use std::collections::HashMap;
use std::sync::Arc;
use std::{fmt, io};
use tokio::time::Instant;

use crate::client::Transport;
use crate::config::{RunSettings, SkeinConfiguration, SkeinDefaults};
use crate::logger::SampleLogger;
use crate::metrics::{MetricsCollector, Tags};
use crate::report::RunResult;
use crate::scenario::{Scenario, ScenarioTable, Workload};
use crate::scheduler::{CancelHandle, LifecycleEvent, ScenarioScheduler};
use crate::threshold::ThresholdSpec;
use crate::timeline::Clock;
use crate::user::{SharedContext, UserTemplate};

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum SkeinError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`tokio::task::JoinError`](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serde(serde_json::Error),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// A scenario's executor is misconfigured, or the setup workload failed.
    InvalidScenario {
        scenario: String,
        detail: String,
    },
    /// Two scenarios share a name.
    DuplicateScenario { name: String },
    /// A threshold expression could not be parsed.
    InvalidThreshold {
        metric: String,
        expression: String,
        detail: String,
    },
    /// A scenario names a workload that was never registered.
    UnknownWorkload { scenario: String, workload: String },
    /// [`LoadTest`] has no scenarios defined.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl SkeinError {
    pub fn describe(&self) -> &str {
        match *self {
            SkeinError::Io(_) => "io::Error",
            SkeinError::Reqwest(_) => "reqwest::Error",
            SkeinError::TokioJoin(_) => "tokio::task::JoinError",
            SkeinError::Serde(_) => "serde_json::Error",
            SkeinError::InvalidOption { .. } => "invalid option or value specified",
            SkeinError::InvalidHost { .. } => "failed to parse hostname",
            SkeinError::InvalidScenario { .. } => "invalid scenario",
            SkeinError::DuplicateScenario { .. } => "duplicate scenario name",
            SkeinError::InvalidThreshold { .. } => "invalid threshold expression",
            SkeinError::UnknownWorkload { .. } => "no workload registered for scenario",
            SkeinError::NoScenarios { .. } => "no scenarios defined",
        }
    }

    /// True for errors in how the load test is configured. These are all returned
    /// before any load is generated.
    pub fn is_config_error(&self) -> bool {
        !matches!(
            self,
            SkeinError::Io(_)
                | SkeinError::Reqwest(_)
                | SkeinError::TokioJoin(_)
                | SkeinError::Serde(_)
        )
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for SkeinError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SkeinError::Io(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::Reqwest(ref source) => {
                write!(f, "SkeinError: {} ({})", self.describe(), source)
            }
            SkeinError::TokioJoin(ref source) => {
                write!(f, "SkeinError: {} ({})", self.describe(), source)
            }
            SkeinError::Serde(ref source) => {
                write!(f, "SkeinError: {} ({})", self.describe(), source)
            }
            SkeinError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "SkeinError: {} ({})", self.describe(), parse_error),
            SkeinError::InvalidOption { ref detail, .. }
            | SkeinError::InvalidScenario { ref detail, .. }
            | SkeinError::InvalidThreshold { ref detail, .. }
            | SkeinError::NoScenarios { ref detail } => {
                write!(f, "SkeinError: {}: {}", self.describe(), detail)
            }
            SkeinError::DuplicateScenario { ref name } => {
                write!(f, "SkeinError: {}: {}", self.describe(), name)
            }
            SkeinError::UnknownWorkload {
                ref scenario,
                ref workload,
            } => write!(
                f,
                "SkeinError: {}: {} runs {}",
                self.describe(),
                scenario,
                workload
            ),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            SkeinError::Io(ref source) => Some(source),
            SkeinError::Reqwest(ref source) => Some(source),
            SkeinError::TokioJoin(ref source) => Some(source),
            SkeinError::Serde(ref source) => Some(source),
            SkeinError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for SkeinError {
    fn from(err: reqwest::Error) -> SkeinError {
        SkeinError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for SkeinError {
    fn from(err: io::Error) -> SkeinError {
        SkeinError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for SkeinError {
    fn from(err: tokio::task::JoinError) -> SkeinError {
        SkeinError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for SkeinError {
    fn from(err: serde_json::Error) -> SkeinError {
        SkeinError::Serde(err)
    }
}

/// Global state for a load test.
pub struct LoadTest {
    /// Configuration object holding options set when launching the load test.
    configuration: SkeinConfiguration,
    /// Optional default values for run-time options.
    pub(crate) defaults: SkeinDefaults,
    scenarios: Vec<Scenario>,
    /// Workloads scenarios can name, by name.
    workloads: HashMap<String, Workload>,
    thresholds: Vec<ThresholdSpec>,
    /// An optional workload run one time before any scenario starts.
    test_start: Option<Workload>,
    /// An optional workload run one time after every scenario has stopped.
    test_stop: Option<Workload>,
    transport: Option<Arc<dyn Transport>>,
    observer: Option<flume::Sender<LifecycleEvent>>,
    cancel: CancelHandle,
}

impl LoadTest {
    /// Load configuration from the command line and initialize a [`LoadTest`].
    ///
    /// # Example
    /// ```rust
    /// use skein::prelude::*;
    ///
    /// let load_test = LoadTest::initialize();
    /// ```
    pub fn initialize() -> Result<LoadTest, SkeinError> {
        LoadTest::initialize_with_config(SkeinConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`LoadTest`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use skein::LoadTest;
    /// use skein::config::SkeinConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = SkeinConfiguration::parse_args_default(&["--run-time", "1m"]).unwrap();
    /// let load_test = LoadTest::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(
        configuration: SkeinConfiguration,
    ) -> Result<LoadTest, SkeinError> {
        Ok(LoadTest {
            configuration,
            defaults: SkeinDefaults::default(),
            scenarios: Vec::new(),
            workloads: HashMap::new(),
            thresholds: Vec::new(),
            test_start: None,
            test_stop: None,
            transport: None,
            observer: None,
            cancel: CancelHandle::new(),
        })
    }

    /// Add a scenario built in code.
    ///
    /// # Example
    /// ```rust
    /// use skein::prelude::*;
    /// use std::time::Duration;
    ///
    /// fn main() -> Result<(), SkeinError> {
    ///     LoadTest::initialize()?
    ///         .register_scenario(
    ///             Scenario::new(
    ///                 "checkout",
    ///                 ExecutorConfig::per_vu_iterations(20, 5, Duration::from_secs(60)),
    ///             )
    ///             .set_workload(workload!(checkout)),
    ///         );
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn checkout(user: &mut VirtualUser) -> WorkloadResult {
    ///     let _response = user.post("/checkout", "").await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Make a workload available to scenarios that name it, through their `exec`
    /// or their own name.
    pub fn register_workload(mut self, name: &str, workload: Workload) -> Self {
        let workload = if workload.name.is_empty() {
            workload.set_name(name)
        } else {
            workload
        };
        self.workloads.insert(name.to_string(), workload);
        self
    }

    /// Add the scenarios and thresholds of a JSON scenario table.
    pub fn load_scenario_table(mut self, json: &str) -> Result<Self, SkeinError> {
        let table = ScenarioTable::from_json(json)?;
        self.add_table(table)?;
        Ok(self)
    }

    fn add_table(&mut self, table: ScenarioTable) -> Result<(), SkeinError> {
        self.thresholds.extend(table.thresholds()?);
        self.scenarios.extend(table.scenarios());
        Ok(())
    }

    /// Check `metric` against `expression` at the end of the run, for example
    /// `set_threshold("http_req_duration", "p(95)<500")`.
    pub fn set_threshold(mut self, metric: &str, expression: &str) -> Result<Self, SkeinError> {
        self.thresholds.push(ThresholdSpec::new(metric, expression)?);
        Ok(self)
    }

    /// Optionally define a workload to run one time before any scenario starts.
    ///
    /// It runs on a dedicated virtual user, the only one allowed to store the
    /// run's shared context with
    /// [`set_shared_data`](user/struct.VirtualUser.html#method.set_shared_data).
    /// If it fails, no scenario runs.
    ///
    /// # Example
    /// ```rust
    /// use skein::prelude::*;
    ///
    /// struct Catalog {
    ///     products: Vec<String>,
    /// }
    ///
    /// fn main() -> Result<(), SkeinError> {
    ///     LoadTest::initialize()?
    ///         .test_start(workload!(setup));
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn setup(user: &mut VirtualUser) -> WorkloadResult {
    ///     let products = user.get("/products").await?.json::<Vec<String>>()?;
    ///     user.set_shared_data(Catalog { products });
    ///     Ok(())
    /// }
    /// ```
    pub fn test_start(mut self, workload: Workload) -> Self {
        self.test_start = Some(workload);
        self
    }

    /// Optionally define a workload to run one time after every scenario has
    /// stopped. It sees the same shared context as the scenarios did.
    pub fn test_stop(mut self, workload: Workload) -> Self {
        self.test_stop = Some(workload);
        self
    }

    /// Issue requests through `transport` instead of a reqwest client per user.
    pub fn set_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Also deliver every lifecycle event to `observer`.
    pub fn set_event_observer(mut self, observer: flume::Sender<LifecycleEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// A handle that stops the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    // Resolve the workload of every scenario, then apply the scenario selector.
    fn bind_scenarios(&mut self, selector: &[String]) -> Result<Vec<Scenario>, SkeinError> {
        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for mut scenario in self.scenarios.drain(..) {
            if scenario.workload().is_none() {
                match self.workloads.get(scenario.workload_name()) {
                    Some(workload) => scenario.workload = Some(workload.clone()),
                    None => {
                        return Err(SkeinError::UnknownWorkload {
                            workload: scenario.workload_name().to_string(),
                            scenario: scenario.name,
                        })
                    }
                }
            }
            scenarios.push(scenario);
        }

        if selector.is_empty() {
            return Ok(scenarios);
        }
        for name in selector {
            if !scenarios.iter().any(|scenario| &scenario.name == name) {
                return Err(SkeinError::InvalidOption {
                    option: "--scenarios".to_string(),
                    value: name.clone(),
                    detail: format!(
                        "No scenario named {}, available scenarios: {}",
                        name,
                        scenarios
                            .iter()
                            .map(|scenario| scenario.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
        }
        Ok(scenarios
            .into_iter()
            .filter(|scenario| selector.contains(&scenario.name))
            .collect())
    }

    fn list_scenarios(scenarios: &[Scenario]) {
        println!("Available scenarios:");
        for scenario in scenarios {
            println!(
                " - {} ({}, runs {}, starts at {}, lasts {})",
                scenario.name,
                scenario.executor.kind(),
                scenario.workload_name(),
                util::format_timespan(scenario.start_time),
                util::format_timespan(scenario.duration())
            );
        }
    }

    fn phase_template(
        &self,
        phase: &str,
        index: usize,
        settings: &RunSettings,
        metrics: &MetricsCollector,
        shared: Option<SharedContext>,
    ) -> UserTemplate {
        let mut tags = Tags::new();
        tags.insert("scenario".to_string(), phase.to_string());
        UserTemplate {
            scenario: phase.to_string(),
            scenario_index: index,
            tags,
            metrics: metrics.clone(),
            clock: Clock::start(),
            base_url: settings.host.clone(),
            shared,
            transport: self.transport.clone(),
            seed: settings.seed,
        }
    }

    /// Run the load test to completion.
    ///
    /// Configuration errors are returned before any load is generated. Once
    /// scenarios are running, a failed threshold is not an error: it is reported
    /// in the returned [`RunResult`], whose
    /// [`exit_code`](report/struct.RunResult.html#method.exit_code) is then 99.
    pub async fn execute(mut self) -> Result<RunResult, SkeinError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        let started = Instant::now();
        self.configuration.configure(&self.defaults);
        let settings = self.configuration.validate()?;

        if !self.configuration.config.is_empty() {
            let json = tokio::fs::read_to_string(&self.configuration.config).await?;
            let table = ScenarioTable::from_json(&json)?;
            self.add_table(table)?;
            info!("loaded scenario table from {}", self.configuration.config);
        }

        let scenarios = self.bind_scenarios(&settings.scenarios)?;
        if self.configuration.list {
            LoadTest::list_scenarios(&scenarios);
            return Ok(RunResult::empty());
        }
        scheduler::validate(&scenarios)?;

        util::setup_ctrlc_handler();
        let metrics = MetricsCollector::new();
        let sample_logger = if self.configuration.sample_log.is_empty() {
            None
        } else {
            let logger = SampleLogger::start(
                &self.configuration.sample_log,
                self.configuration.sample_format.unwrap_or_default(),
            )
            .await?;
            metrics.set_sample_log(Some(logger.sender.clone()));
            Some(logger)
        };

        let result = self.run(scenarios, &settings, &metrics, started).await;

        metrics.set_sample_log(None);
        if let Some(logger) = sample_logger {
            logger.finish().await?;
        }
        util::reset_ctrlc();

        let result = result?;
        if !self.configuration.no_print_metrics {
            println!("{}", result);
        }
        if !self.configuration.report_file.is_empty() {
            result.write_json(&self.configuration.report_file).await?;
        }
        Ok(result)
    }

    async fn run(
        &self,
        scenarios: Vec<Scenario>,
        settings: &RunSettings,
        metrics: &MetricsCollector,
        started: Instant,
    ) -> Result<RunResult, SkeinError> {
        let setup_index = scenarios.len();

        let mut shared = None;
        if let Some(workload) = &self.test_start {
            info!("running test_start workload {}", workload.name);
            let mut user = self
                .phase_template("setup", setup_index, settings, metrics, None)
                .build_setup();
            if let Err(e) = (workload.function)(&mut user).await {
                return Err(SkeinError::InvalidScenario {
                    scenario: "setup".to_string(),
                    detail: format!("test_start workload failed: {}", e),
                });
            }
            shared = user.take_shared();
            info!("test_start workload finished");
        }

        let mut scheduler = ScenarioScheduler::new(metrics, Clock::start());
        scheduler.base_url = settings.host.clone();
        scheduler.shared = shared.clone();
        scheduler.transport = self.transport.clone();
        scheduler.seed = settings.seed;
        scheduler.graceful_stop = settings.graceful_stop;
        scheduler.tick = settings.tick;
        scheduler.run_time = settings.run_time;
        scheduler.observer = self.observer.clone();
        scheduler.cancel = self.cancel.clone();
        let schedule = scheduler.run(scenarios).await?;

        if let Some(workload) = &self.test_stop {
            info!("running test_stop workload {}", workload.name);
            let mut user = self
                .phase_template("teardown", setup_index + 1, settings, metrics, shared)
                .build(0);
            match (workload.function)(&mut user).await {
                Ok(()) => info!("test_stop workload finished"),
                Err(e) => warn!("test_stop workload failed: {}", e),
            }
        }

        let snapshot = metrics.snapshot();
        let thresholds = threshold::evaluate(&snapshot, &self.thresholds);
        for verdict in thresholds.iter().filter(|verdict| verdict.failed()) {
            warn!("threshold failed: {}", verdict);
        }
        Ok(RunResult {
            scenarios: schedule.outcomes,
            metrics: snapshot,
            thresholds,
            history: schedule.history,
            duration: started.elapsed(),
        })
    }
}
