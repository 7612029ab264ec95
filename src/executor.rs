//! Executors decide when iterations start.
//!
//! [`ExecutorConfig`] is a closed set of four scheduling behaviors:
//!  - [`RampingVus`](ExecutorConfig::RampingVus): a closed model whose number of
//!    virtual users follows a stage timeline;
//!  - [`ConstantVus`](ExecutorConfig::ConstantVus): a fixed number of virtual users
//!    iterating for a fixed duration;
//!  - [`PerVuIterations`](ExecutorConfig::PerVuIterations): each virtual user runs
//!    a fixed number of iterations, bounded by a maximum duration;
//!  - [`RampingArrivalRate`](ExecutorConfig::RampingArrivalRate): an open model
//!    starting iterations at a rate that follows a stage timeline, on a bounded
//!    pool of workers.
//!
//! Each one is started on its own task and stopped through an [`ExecutorHandle`].
//! Stopping ends the scheduling of new iterations; iterations in flight get the
//! scenario's graceful stop to finish and are then interrupted.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::scenario::Workload;
use crate::timeline::{Stage, StageTimeline};
use crate::user::{self, Classification, Outcome, UserCommand, UserTemplate};
use crate::util;
use crate::SkeinError;

mod constant_vus;
mod per_vu_iterations;
mod ramping_arrival_rate;
mod ramping_vus;

fn default_iterations() -> u64 {
    1
}

fn default_max_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

/// How a scenario schedules its iterations.
///
/// Deserializes from the scenario table, for example:
/// ```rust
/// use skein::executor::ExecutorConfig;
///
/// let config: ExecutorConfig = serde_json::from_str(
///     r#"{"executor": "per-vu-iterations", "vus": 5, "maxDuration": "1m"}"#,
/// ).unwrap();
/// assert_eq!(
///     config,
///     ExecutorConfig::per_vu_iterations(5, 1, std::time::Duration::from_secs(60))
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    #[serde(rename_all = "camelCase")]
    RampingVus {
        #[serde(default, rename = "startVUs", alias = "startVus")]
        start_vus: u64,
        stages: Vec<Stage>,
        /// How long a virtual user retired while ramping down may take to finish
        /// its iteration. Defaults to the scenario's graceful stop.
        #[serde(
            default,
            with = "util::timespan::option",
            skip_serializing_if = "Option::is_none"
        )]
        graceful_ramp_down: Option<Duration>,
    },
    ConstantVus {
        vus: u64,
        #[serde(with = "util::timespan")]
        duration: Duration,
    },
    #[serde(rename_all = "camelCase")]
    PerVuIterations {
        vus: u64,
        #[serde(default = "default_iterations")]
        iterations: u64,
        #[serde(default = "default_max_duration", with = "util::timespan")]
        max_duration: Duration,
    },
    #[serde(rename_all = "camelCase")]
    RampingArrivalRate {
        #[serde(default)]
        start_rate: u64,
        #[serde(default = "default_time_unit", with = "util::timespan")]
        time_unit: Duration,
        stages: Vec<Stage>,
        #[serde(alias = "preAllocatedVUs")]
        pre_allocated_workers: u64,
        /// Defaults to `pre_allocated_workers`.
        #[serde(default, alias = "maxVUs", skip_serializing_if = "Option::is_none")]
        max_workers: Option<u64>,
    },
}

/// The name of an executor, as written in the scenario table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    RampingVus,
    ConstantVus,
    PerVuIterations,
    RampingArrivalRate,
}

impl ExecutorConfig {
    pub fn ramping_vus(start_vus: u64, stages: Vec<Stage>) -> Self {
        ExecutorConfig::RampingVus {
            start_vus,
            stages,
            graceful_ramp_down: None,
        }
    }

    pub fn constant_vus(vus: u64, duration: Duration) -> Self {
        ExecutorConfig::ConstantVus { vus, duration }
    }

    pub fn per_vu_iterations(vus: u64, iterations: u64, max_duration: Duration) -> Self {
        ExecutorConfig::PerVuIterations {
            vus,
            iterations,
            max_duration,
        }
    }

    pub fn ramping_arrival_rate(
        start_rate: u64,
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_workers: u64,
        max_workers: u64,
    ) -> Self {
        ExecutorConfig::RampingArrivalRate {
            start_rate,
            time_unit,
            stages,
            pre_allocated_workers,
            max_workers: Some(max_workers),
        }
    }

    /// Set the ramp-down grace of a `ramping-vus` executor, ignored by the others.
    pub fn set_graceful_ramp_down(mut self, grace: Duration) -> Self {
        if let ExecutorConfig::RampingVus {
            graceful_ramp_down, ..
        } = &mut self
        {
            *graceful_ramp_down = Some(grace);
        }
        self
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorConfig::RampingVus { .. } => ExecutorKind::RampingVus,
            ExecutorConfig::ConstantVus { .. } => ExecutorKind::ConstantVus,
            ExecutorConfig::PerVuIterations { .. } => ExecutorKind::PerVuIterations,
            ExecutorConfig::RampingArrivalRate { .. } => ExecutorKind::RampingArrivalRate,
        }
    }

    /// The target function: virtual users over time for the closed models,
    /// iterations per time unit for the arrival rate.
    pub fn timeline(&self) -> StageTimeline {
        match self {
            ExecutorConfig::RampingVus {
                start_vus, stages, ..
            } => StageTimeline::new(*start_vus, stages),
            ExecutorConfig::ConstantVus { vus, duration } => {
                StageTimeline::constant(*vus, *duration)
            }
            ExecutorConfig::PerVuIterations {
                vus, max_duration, ..
            } => StageTimeline::constant(*vus, *max_duration),
            ExecutorConfig::RampingArrivalRate {
                start_rate, stages, ..
            } => StageTimeline::new(*start_rate, stages),
        }
    }

    /// The longest the executor schedules iterations for.
    pub fn total_duration(&self) -> Duration {
        match self {
            ExecutorConfig::ConstantVus { duration, .. } => *duration,
            ExecutorConfig::PerVuIterations { max_duration, .. } => *max_duration,
            _ => self.timeline().total_duration(),
        }
    }

    fn max_workers(&self) -> Option<u64> {
        match self {
            ExecutorConfig::RampingArrivalRate {
                pre_allocated_workers,
                max_workers,
                ..
            } => Some(max_workers.unwrap_or(*pre_allocated_workers)),
            _ => None,
        }
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self, scenario: &str) -> Result<(), SkeinError> {
        let invalid = |detail: &str| {
            Err(SkeinError::InvalidScenario {
                scenario: scenario.to_string(),
                detail: detail.to_string(),
            })
        };
        match self {
            ExecutorConfig::RampingVus { stages, .. } => {
                if stages.is_empty() {
                    return invalid("ramping-vus requires at least one stage.");
                }
            }
            ExecutorConfig::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return invalid("constant-vus requires vus greater than 0.");
                }
                if *duration == Duration::from_secs(0) {
                    return invalid("constant-vus requires a duration greater than 0.");
                }
            }
            ExecutorConfig::PerVuIterations {
                vus,
                iterations,
                max_duration,
            } => {
                if *vus == 0 {
                    return invalid("per-vu-iterations requires vus greater than 0.");
                }
                if *iterations == 0 {
                    return invalid("per-vu-iterations requires iterations greater than 0.");
                }
                if *max_duration == Duration::from_secs(0) {
                    return invalid("per-vu-iterations requires a maxDuration greater than 0.");
                }
            }
            ExecutorConfig::RampingArrivalRate {
                time_unit,
                stages,
                pre_allocated_workers,
                ..
            } => {
                if stages.is_empty() {
                    return invalid("ramping-arrival-rate requires at least one stage.");
                }
                if *time_unit == Duration::from_secs(0) {
                    return invalid("ramping-arrival-rate requires a timeUnit greater than 0.");
                }
                let max_workers = self.max_workers().unwrap_or(0);
                if max_workers == 0 {
                    return invalid("ramping-arrival-rate requires maxWorkers greater than 0.");
                }
                if max_workers < *pre_allocated_workers {
                    return invalid(
                        "ramping-arrival-rate requires maxWorkers of at least preAllocatedWorkers.",
                    );
                }
            }
        }
        Ok(())
    }

    /// Start scheduling on a new task.
    pub(crate) fn start(&self, context: ExecutorContext) -> ExecutorHandle {
        let (stop, receiver) = watch::channel(false);
        let config = self.clone();
        let join = tokio::spawn(async move {
            let signal = StopSignal::new(receiver);
            let scenario = context.template.scenario.clone();
            let kind = config.kind();
            let counters = Arc::new(OutcomeCounters::default());
            let started = Instant::now();
            let stopped_early = match config {
                ExecutorConfig::RampingVus {
                    start_vus,
                    stages,
                    graceful_ramp_down,
                } => {
                    let timeline = StageTimeline::new(start_vus, &stages);
                    let ramp_down = graceful_ramp_down.unwrap_or(context.graceful_stop);
                    ramping_vus::run(context, timeline, ramp_down, &counters, signal).await
                }
                ExecutorConfig::ConstantVus { vus, duration } => {
                    constant_vus::run(context, vus as usize, duration, &counters, signal).await
                }
                ExecutorConfig::PerVuIterations {
                    vus,
                    iterations,
                    max_duration,
                } => {
                    per_vu_iterations::run(
                        context,
                        vus as usize,
                        iterations,
                        max_duration,
                        &counters,
                        signal,
                    )
                    .await
                }
                ExecutorConfig::RampingArrivalRate {
                    start_rate,
                    time_unit,
                    stages,
                    pre_allocated_workers,
                    max_workers,
                } => {
                    let timeline = StageTimeline::new(start_rate, &stages);
                    let max_workers = max_workers.unwrap_or(pre_allocated_workers);
                    ramping_arrival_rate::run(
                        context,
                        timeline,
                        time_unit,
                        pre_allocated_workers as usize,
                        max_workers as usize,
                        &counters,
                        signal,
                    )
                    .await
                }
            };
            counters.outcome(&scenario, kind, started.elapsed(), stopped_early)
        });
        ExecutorHandle { stop, join }
    }
}

/// What an executor needs to run a scenario's users.
pub(crate) struct ExecutorContext {
    pub(crate) template: UserTemplate,
    pub(crate) workload: Workload,
    pub(crate) graceful_stop: Duration,
    /// How often closed-model executors reconcile the number of users.
    pub(crate) tick: Duration,
}

/// A running executor.
pub(crate) struct ExecutorHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<ScenarioOutcome>,
}
impl ExecutorHandle {
    /// Stop scheduling new iterations. Returns immediately, [`wait`](#method.wait)
    /// for the executor to wind down.
    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the executor to finish. Must not be called again once it has
    /// returned.
    pub(crate) async fn wait(&mut self) -> Result<ScenarioOutcome, SkeinError> {
        Ok((&mut self.join).await?)
    }
}

/// The executor side of [`ExecutorHandle::stop`].
pub(crate) struct StopSignal(watch::Receiver<bool>);
impl StopSignal {
    pub(crate) fn new(receiver: watch::Receiver<bool>) -> Self {
        StopSignal(receiver)
    }

    /// Resolves once stop is requested. Never resolves if the handle is dropped
    /// without stopping.
    pub(crate) async fn stopped(&mut self) {
        let result = self.0.wait_for(|stopped| *stopped).await.map(|_| ());
        if result.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Per-scenario tallies, updated concurrently by the scenario's users.
#[derive(Debug, Default)]
pub(crate) struct OutcomeCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    dropped: AtomicU64,
    scheduled: AtomicU64,
    peak_vus: AtomicUsize,
}
impl OutcomeCounters {
    pub(crate) fn record(&self, outcome: &Outcome) {
        let counter = match outcome.classification {
            Classification::Success => &self.succeeded,
            Classification::Failed => &self.failed,
            Classification::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn observe_vus(&self, vus: usize) {
        self.peak_vus.fetch_max(vus, Ordering::SeqCst);
    }

    fn outcome(
        &self,
        scenario: &str,
        executor: ExecutorKind,
        duration: Duration,
        stopped_early: bool,
    ) -> ScenarioOutcome {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        ScenarioOutcome {
            scenario: scenario.to_string(),
            executor,
            started: true,
            start_offset: Duration::from_secs(0),
            duration,
            completed: succeeded + failed,
            failed,
            cancelled: self.cancelled.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            scheduled: self.scheduled.load(Ordering::SeqCst),
            peak_vus: self.peak_vus.load(Ordering::SeqCst),
            stopped_early,
        }
    }
}

/// How one scenario went.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub executor: ExecutorKind,
    /// False if the run was cancelled before the scenario's start time.
    pub started: bool,
    /// When the scenario started, relative to the start of the run.
    #[serde(with = "util::timespan")]
    pub start_offset: Duration,
    #[serde(with = "util::timespan")]
    pub duration: Duration,
    /// Iterations that ran to the end, failed ones included.
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Arrival-rate iterations that found no free worker.
    pub dropped: u64,
    /// Arrival-rate iterations that fell due, started or dropped.
    pub scheduled: u64,
    pub peak_vus: usize,
    /// True when the scenario was stopped before its timeline ended.
    pub stopped_early: bool,
}
impl ScenarioOutcome {
    pub(crate) fn not_started(scenario: &str, executor: ExecutorKind) -> Self {
        ScenarioOutcome {
            scenario: scenario.to_string(),
            executor,
            started: false,
            start_offset: Duration::from_secs(0),
            duration: Duration::from_secs(0),
            completed: 0,
            failed: 0,
            cancelled: 0,
            dropped: 0,
            scheduled: 0,
            peak_vus: 0,
            stopped_early: true,
        }
    }

    /// Completed iterations that did not fail.
    pub fn succeeded(&self) -> u64 {
        self.completed - self.failed
    }

    /// Iterations that were started, whatever their outcome.
    pub fn started_iterations(&self) -> u64 {
        self.completed + self.cancelled
    }
}

struct VuHandle {
    id: usize,
    commands: flume::Sender<UserCommand>,
    // Taken once the user has been joined.
    join: Option<JoinHandle<()>>,
}
impl VuHandle {
    fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    // Wait for the user to exit. Returns false if `deadline` passed first.
    async fn join_by(&mut self, deadline: Option<Instant>) -> bool {
        let join = match self.join.as_mut() {
            Some(join) => join,
            None => return true,
        };
        let result = match deadline {
            Some(deadline) => match time::timeout_at(deadline, join).await {
                Ok(result) => result,
                Err(_) => return false,
            },
            None => join.await,
        };
        self.join = None;
        if let Err(e) = result {
            warn!("user {} failed: {}", self.id, e);
        }
        true
    }
}

/// The live users of one scenario.
pub(crate) struct VuPool {
    template: UserTemplate,
    workload: Workload,
    counters: Arc<OutcomeCounters>,
    active: Vec<VuHandle>,
    // Users told to exit, with the instant after which they are interrupted.
    retiring: Vec<(VuHandle, Instant)>,
    next_id: usize,
}

impl VuPool {
    pub(crate) fn new(context: &ExecutorContext, counters: &Arc<OutcomeCounters>) -> Self {
        VuPool {
            template: context.template.clone(),
            workload: context.workload.clone(),
            counters: Arc::clone(counters),
            active: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
        }
    }

    /// Users that have not been told to stop.
    pub(crate) fn active(&self) -> usize {
        self.active.len()
    }

    fn next_user(&mut self) -> user::VirtualUser {
        let user = self.template.build(self.next_id);
        self.next_id += 1;
        user
    }

    fn push(&mut self, id: usize, commands: flume::Sender<UserCommand>, join: JoinHandle<()>) {
        self.active.push(VuHandle {
            id,
            commands,
            join: Some(join),
        });
        self.counters
            .observe_vus(self.active.len() + self.retiring.len());
    }

    /// Start a closed-model user, optionally limited to `iterations`.
    pub(crate) fn spawn_user(&mut self, iterations: Option<u64>) {
        let user = self.next_user();
        let id = user.vu_id;
        let (sender, receiver) = flume::unbounded();
        let join = tokio::spawn(user::user_main(
            user,
            self.workload.clone(),
            receiver,
            Arc::clone(&self.counters),
            iterations,
        ));
        self.push(id, sender, join);
    }

    /// Start an arrival-rate worker reporting on `idle` when it is free.
    pub(crate) fn spawn_worker(&mut self, idle: flume::Sender<usize>) -> usize {
        let user = self.next_user();
        let id = user.vu_id;
        let (sender, receiver) = flume::unbounded();
        let join = tokio::spawn(user::worker_main(
            user,
            self.workload.clone(),
            receiver,
            Arc::clone(&self.counters),
            idle,
        ));
        self.push(id, sender, join);
        id
    }

    /// Hand an iteration to the idle worker `id`.
    pub(crate) fn iterate(&self, id: usize) -> bool {
        self.active
            .iter()
            .find(|handle| handle.id == id)
            .map(|handle| handle.commands.send(UserCommand::Iterate).is_ok())
            .unwrap_or(false)
    }

    /// Start or retire users until `target` are active. Retired users finish their
    /// iteration, and are interrupted if it takes longer than `ramp_down`.
    pub(crate) fn scale_to(&mut self, target: usize, ramp_down: Duration) {
        while self.active.len() < target {
            self.spawn_user(None);
        }
        if self.active.len() > target {
            debug!(
                "{}: retiring {} users",
                self.template.scenario,
                self.active.len() - target
            );
        }
        while self.active.len() > target {
            if let Some(handle) = self.active.pop() {
                let _ = handle.commands.send(UserCommand::Exit);
                self.retiring.push((handle, Instant::now() + ramp_down));
            }
        }
    }

    /// Interrupt retired users past their deadline, and forget finished ones.
    pub(crate) fn reap(&mut self) {
        let now = Instant::now();
        for (handle, deadline) in &self.retiring {
            if *deadline <= now && !handle.is_finished() {
                debug!(
                    "{}: interrupting retired user {}",
                    self.template.scenario, handle.id
                );
                let _ = handle.commands.send(UserCommand::Interrupt);
            }
        }
        self.retiring.retain(|(handle, _)| !handle.is_finished());
    }

    /// Resolves once every active user has exited on its own.
    pub(crate) async fn wait_all(&mut self) {
        for handle in &mut self.active {
            handle.join_by(None).await;
        }
    }

    /// Tell every user to exit after its current iteration, and interrupt those
    /// still running after `grace`.
    pub(crate) async fn shutdown(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut handles = Vec::with_capacity(self.active.len() + self.retiring.len());
        for handle in self.active {
            let _ = handle.commands.send(UserCommand::Exit);
            handles.push((handle, deadline));
        }
        for (handle, retire_deadline) in self.retiring {
            handles.push((handle, retire_deadline.min(deadline)));
        }

        let mut interrupted = 0;
        for (mut handle, deadline) in handles {
            if !handle.join_by(Some(deadline)).await {
                interrupted += 1;
                let _ = handle.commands.send(UserCommand::Interrupt);
                handle.join_by(None).await;
            }
        }
        if interrupted > 0 {
            debug!(
                "{}: interrupted {} users after the graceful stop",
                self.template.scenario, interrupted
            );
        }
    }

    /// Interrupt every user immediately.
    pub(crate) async fn interrupt_all(self) {
        self.shutdown(Duration::from_secs(0)).await;
    }
}
