//! Runs scenarios concurrently, each from its own start offset.
//!
//! Every scenario gets a task that waits for its start time, starts its executor,
//! and stops it early if the run is cancelled. The run is cancelled by the
//! `--run-time` deadline, by ctrl-c, or through a [`CancelHandle`]. Scenarios
//! whose start time has not come when the run is cancelled never start.
//!
//! Starting and stopping a scenario emits a [`LifecycleEvent`]. Events are logged,
//! forwarded to an optional observer, and kept as the run's history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use url::Url;

use crate::client::Transport;
use crate::executor::{ExecutorContext, ExecutorKind, ScenarioOutcome, StopSignal};
use crate::metrics::MetricsCollector;
use crate::scenario::Scenario;
use crate::timeline::Clock;
use crate::user::{SharedContext, UserTemplate};
use crate::util;
use crate::SkeinError;

/// Stops a run from outside, for example from another task.
///
/// Cancelling before the run starts means no scenario ever starts.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}
impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        CancelHandle {
            sender: Arc::new(sender),
        }
    }

    /// Stop every running scenario, letting in-flight iterations finish within
    /// each scenario's graceful stop.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    fn signal(&self) -> StopSignal {
        StopSignal::new(self.sender.subscribe())
    }
}
impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

/// A scenario started or stopped.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ScenarioStarted {
        scenario: String,
        executor: ExecutorKind,
        timestamp: DateTime<Utc>,
        /// Offset from the start of the run.
        #[serde(with = "util::timespan")]
        offset: Duration,
    },
    ScenarioStopped {
        scenario: String,
        timestamp: DateTime<Utc>,
        outcome: ScenarioOutcome,
    },
}
impl LifecycleEvent {
    pub fn scenario(&self) -> &str {
        match self {
            LifecycleEvent::ScenarioStarted { scenario, .. } => scenario,
            LifecycleEvent::ScenarioStopped { scenario, .. } => scenario,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::ScenarioStarted { timestamp, .. } => *timestamp,
            LifecycleEvent::ScenarioStopped { timestamp, .. } => *timestamp,
        }
    }
}
impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifecycleEvent::ScenarioStarted {
                scenario,
                executor,
                offset,
                ..
            } => write!(
                f,
                "scenario {} started ({}) at {}",
                scenario,
                executor,
                util::format_timespan(*offset)
            ),
            LifecycleEvent::ScenarioStopped {
                scenario, outcome, ..
            } => {
                write!(
                    f,
                    "scenario {} stopped after {}: {} completed, {} failed, {} cancelled",
                    scenario,
                    util::format_timespan(outcome.duration),
                    outcome.completed,
                    outcome.failed,
                    outcome.cancelled
                )?;
                if outcome.scheduled > 0 {
                    write!(f, ", {} dropped", outcome.dropped)?;
                }
                if outcome.stopped_early {
                    write!(f, " (stopped early)")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
struct EventSink {
    history: flume::Sender<LifecycleEvent>,
    observer: Option<flume::Sender<LifecycleEvent>>,
}
impl EventSink {
    fn emit(&self, event: LifecycleEvent) {
        info!("{}", event);
        if let Some(observer) = &self.observer {
            if observer.send(event.clone()).is_err() {
                debug!("lifecycle event observer went away");
            }
        }
        let _ = self.history.send(event);
    }
}

/// Outcomes of every scenario, in the order they were given, plus the events
/// emitted along the way.
pub(crate) struct Schedule {
    pub(crate) outcomes: Vec<ScenarioOutcome>,
    pub(crate) history: Vec<LifecycleEvent>,
}

/// Runs a set of scenarios to completion or cancellation.
pub(crate) struct ScenarioScheduler {
    pub(crate) metrics: MetricsCollector,
    pub(crate) clock: Clock,
    pub(crate) base_url: Option<Url>,
    pub(crate) shared: Option<SharedContext>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) seed: Option<u64>,
    /// Used by scenarios that do not set their own.
    pub(crate) graceful_stop: Duration,
    pub(crate) tick: Duration,
    /// Global deadline, measured from the start of the clock.
    pub(crate) run_time: Option<Duration>,
    pub(crate) observer: Option<flume::Sender<LifecycleEvent>>,
    pub(crate) cancel: CancelHandle,
}

/// Reject duplicate names, invalid executors and scenarios without a workload.
pub(crate) fn validate(scenarios: &[Scenario]) -> Result<(), SkeinError> {
    if scenarios.is_empty() {
        return Err(SkeinError::NoScenarios {
            detail: "No scenarios are defined.".to_string(),
        });
    }
    let mut names = HashSet::new();
    for scenario in scenarios {
        if !names.insert(scenario.name.as_str()) {
            return Err(SkeinError::DuplicateScenario {
                name: scenario.name.clone(),
            });
        }
        scenario.executor.validate(&scenario.name)?;
        if scenario.workload().is_none() {
            return Err(SkeinError::UnknownWorkload {
                scenario: scenario.name.clone(),
                workload: scenario.workload_name().to_string(),
            });
        }
    }
    Ok(())
}

impl ScenarioScheduler {
    pub(crate) fn new(metrics: &MetricsCollector, clock: Clock) -> Self {
        ScenarioScheduler {
            metrics: metrics.clone(),
            clock,
            base_url: None,
            shared: None,
            transport: None,
            seed: None,
            graceful_stop: crate::config::DEFAULT_GRACEFUL_STOP,
            tick: crate::config::DEFAULT_TICK,
            run_time: None,
            observer: None,
            cancel: CancelHandle::new(),
        }
    }

    fn context(&self, index: usize, scenario: &Scenario) -> Result<ExecutorContext, SkeinError> {
        let workload = scenario
            .workload()
            .cloned()
            .ok_or_else(|| SkeinError::UnknownWorkload {
                scenario: scenario.name.clone(),
                workload: scenario.workload_name().to_string(),
            })?;
        Ok(ExecutorContext {
            template: UserTemplate {
                scenario: scenario.name.clone(),
                scenario_index: index,
                tags: scenario.sample_tags(),
                metrics: self.metrics.clone(),
                clock: self.clock,
                base_url: self.base_url.clone(),
                shared: self.shared.clone(),
                transport: self.transport.clone(),
                seed: self.seed,
            },
            workload,
            graceful_stop: scenario.graceful_stop.unwrap_or(self.graceful_stop),
            tick: self.tick,
        })
    }

    /// Run every scenario, returning once all of them have stopped.
    pub(crate) async fn run(self, scenarios: Vec<Scenario>) -> Result<Schedule, SkeinError> {
        validate(&scenarios)?;

        let (history, events) = flume::unbounded();
        let sink = EventSink {
            history,
            observer: self.observer.clone(),
        };
        let mut tasks = Vec::with_capacity(scenarios.len());
        for (index, scenario) in scenarios.into_iter().enumerate() {
            let context = self.context(index, &scenario)?;
            tasks.push(tokio::spawn(scenario_main(
                scenario,
                context,
                self.clock,
                self.cancel.signal(),
                sink.clone(),
            )));
        }
        drop(sink);

        let deadline = self.run_time.map(|run_time| self.clock.at(run_time));
        let watchdog = tokio::spawn(watchdog(self.cancel.clone(), deadline));

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut failure = None;
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => failure = Some(e),
                Err(e) => failure = Some(SkeinError::TokioJoin(e)),
            }
        }
        watchdog.abort();
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(Schedule {
            outcomes,
            history: events.try_iter().collect(),
        })
    }
}

async fn scenario_main(
    scenario: Scenario,
    context: ExecutorContext,
    clock: Clock,
    mut cancel: StopSignal,
    events: EventSink,
) -> Result<ScenarioOutcome, SkeinError> {
    let kind = scenario.executor.kind();
    let cancelled = tokio::select! {
        biased;
        _ = cancel.stopped() => true,
        _ = time::sleep_until(clock.at(scenario.start_time)) => false,
    };
    if cancelled {
        info!("scenario {} cancelled before its start time", scenario.name);
        return Ok(ScenarioOutcome::not_started(&scenario.name, kind));
    }

    let start_offset = clock.elapsed();
    events.emit(LifecycleEvent::ScenarioStarted {
        scenario: scenario.name.clone(),
        executor: kind,
        timestamp: Utc::now(),
        offset: start_offset,
    });

    let mut handle = scenario.executor.start(context);
    let finished = tokio::select! {
        biased;
        outcome = handle.wait() => Some(outcome),
        _ = cancel.stopped() => None,
    };
    let mut outcome = match finished {
        Some(outcome) => outcome?,
        None => {
            handle.stop();
            handle.wait().await?
        }
    };
    outcome.start_offset = start_offset;

    events.emit(LifecycleEvent::ScenarioStopped {
        scenario: scenario.name.clone(),
        timestamp: Utc::now(),
        outcome: outcome.clone(),
    });
    Ok(outcome)
}

// Cancel the run at the deadline, or on ctrl-c.
async fn watchdog(cancel: CancelHandle, deadline: Option<Instant>) {
    let mut ctrlc = util::ctrlc_receiver();
    let deadline_reached = async {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = deadline_reached => info!("run time reached, stopping all scenarios"),
        _ = ctrlc.changed() => info!("stopping all scenarios"),
    }
    cancel.cancel();
}
