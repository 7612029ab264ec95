//! Virtual users and the iteration runner.
//!
//! A [`VirtualUser`] is the state one simulated client carries from iteration to
//! iteration: its identity, its own random generator, its own HTTP client (and so
//! its own cookies), optional session data, and read access to the run's shared
//! context. Workload functions receive it as `&mut VirtualUser`.
//!
//! The executors drive users with [`run_iteration`], which times one call of the
//! workload, classifies it as a success, a failure or a cancellation, and records
//! the iteration metrics.

use downcast_rs::{impl_downcast, Downcast};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::client::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
use crate::executor::OutcomeCounters;
use crate::metrics::{self, MetricsCollector, Sample, Tags};
use crate::scenario::Workload;
use crate::select::ActionSelector;
use crate::timeline::Clock;

/// Context written by the setup workload and readable by every virtual user.
pub type SharedContext = Arc<dyn Any + Send + Sync>;

/// Per-user session data, for example an auth token or the id of an order in
/// progress.
///
/// Any `Send + Sync + 'static` type qualifies:
/// ```rust
/// use skein::prelude::*;
///
/// struct Session {
///     token: String,
/// }
///
/// async fn login(user: &mut VirtualUser) -> WorkloadResult {
///     if user.get_session_data::<Session>().is_none() {
///         user.set_session_data(Session {
///             token: "secret".to_string(),
///         });
///     }
///     Ok(())
/// }
/// ```
pub trait SessionData: Downcast + Send + Sync + 'static {}
impl_downcast!(SessionData);
impl<T: Send + Sync + 'static> SessionData for T {}

/// Why a workload iteration did not succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadError {
    /// A request could not be issued or did not complete.
    Transport { detail: String },
    /// The target answered with a non-2xx status.
    RequestFailed { status: u16 },
    /// A check the workload required did not pass.
    Check { name: String },
    Custom { detail: String },
}
impl WorkloadError {
    pub fn custom(detail: &str) -> Self {
        WorkloadError::Custom {
            detail: detail.to_string(),
        }
    }
}
impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkloadError::Transport { detail } => write!(f, "transport error: {}", detail),
            WorkloadError::RequestFailed { status } => write!(f, "request failed: {}", status),
            WorkloadError::Check { name } => write!(f, "check failed: {}", name),
            WorkloadError::Custom { detail } => write!(f, "{}", detail),
        }
    }
}
impl std::error::Error for WorkloadError {}

impl From<TransportError> for WorkloadError {
    fn from(err: TransportError) -> WorkloadError {
        WorkloadError::Transport {
            detail: err.to_string(),
        }
    }
}

/// What a workload function returns.
pub type WorkloadResult = Result<(), WorkloadError>;

/// How an iteration ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    /// The workload returned an error.
    Failed,
    /// The iteration was interrupted before it completed.
    Cancelled,
}

/// The result of one iteration.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub duration: Duration,
    /// Time spent in [`VirtualUser::sleep`] and [`VirtualUser::sleep_between`].
    pub idle: Duration,
    pub classification: Classification,
    pub error: Option<WorkloadError>,
    pub tags: Tags,
}

/// Commands an executor sends to a running virtual user.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UserCommand {
    /// Start one iteration (arrival-rate workers only).
    Iterate,
    /// Finish the current iteration, then exit.
    Exit,
    /// Abandon the current iteration now.
    Interrupt,
}

/// One simulated client.
pub struct VirtualUser {
    /// Name of the scenario this user belongs to.
    pub scenario: String,
    /// Zero-based index of this user within its scenario.
    pub vu_id: usize,
    /// Number of iterations started by this user, the current one included.
    pub iteration: u64,
    base_url: Option<Url>,
    tags: Tags,
    metrics: MetricsCollector,
    clock: Clock,
    shared: Option<SharedContext>,
    is_setup: bool,
    session_data: Option<Box<dyn SessionData>>,
    transport: Option<Arc<dyn Transport>>,
    rng: StdRng,
    idle: Duration,
}

impl VirtualUser {
    /// A stand-alone user recording into `metrics`, for trying workloads outside
    /// of a load test.
    pub fn single(base_url: Option<Url>, metrics: &MetricsCollector) -> Self {
        let template = UserTemplate {
            scenario: "single".to_string(),
            scenario_index: 0,
            tags: Tags::new(),
            metrics: metrics.clone(),
            clock: Clock::start(),
            base_url,
            shared: None,
            transport: None,
            seed: None,
        };
        template.build(0)
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// The tags attached to every sample this user records.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Elapsed time since the start of the run.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn set_session_data<T: SessionData>(&mut self, data: T) {
        self.session_data.replace(Box::new(data));
    }

    pub fn get_session_data<T: SessionData>(&self) -> Option<&T> {
        match &self.session_data {
            Some(data) => data.downcast_ref::<T>(),
            None => None,
        }
    }

    pub fn get_session_data_mut<T: SessionData>(&mut self) -> Option<&mut T> {
        match &mut self.session_data {
            Some(data) => data.downcast_mut::<T>(),
            None => None,
        }
    }

    /// Remove and return the session data.
    pub fn take_session_data<T: SessionData>(&mut self) -> Option<Box<T>> {
        match self.session_data.take() {
            Some(data) => match data.downcast::<T>() {
                Ok(data) => Some(data),
                Err(data) => {
                    self.session_data = Some(data);
                    None
                }
            },
            None => None,
        }
    }

    /// Store the run's shared context. Only the setup workload may do this, any
    /// other caller is ignored and gets `false`.
    pub fn set_shared_data<T: Any + Send + Sync>(&mut self, data: T) -> bool {
        if !self.is_setup {
            warn!(
                "{} user {}: shared data can only be set by the setup workload",
                self.scenario, self.vu_id
            );
            return false;
        }
        self.shared = Some(Arc::new(data));
        true
    }

    pub fn get_shared_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.shared.clone()?.downcast::<T>().ok()
    }

    pub(crate) fn take_shared(&mut self) -> Option<SharedContext> {
        self.shared.take()
    }

    /// Record a sample, tagged with this user's tags.
    pub fn record(&self, sample: Sample) {
        self.metrics
            .record(sample.at(self.clock.elapsed()).with_tags(&self.tags));
    }

    pub fn add_counter(&self, metric: &str, value: f64) {
        self.record(Sample::counter(metric, value));
    }

    pub fn add_rate(&self, metric: &str, value: bool) {
        self.record(Sample::rate(metric, value));
    }

    pub fn add_trend(&self, metric: &str, value: f64) {
        self.record(Sample::trend(metric, value));
    }

    /// Record the named check into the `checks` rate, and return `passed`.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.record(Sample::rate(metrics::CHECKS, passed).with_tag("check", name));
        passed
    }

    /// Like [`check`](#method.check), but a failed check fails the iteration.
    pub fn check_or_fail(&self, name: &str, passed: bool) -> WorkloadResult {
        if self.check(name, passed) {
            Ok(())
        } else {
            Err(WorkloadError::Check {
                name: name.to_string(),
            })
        }
    }

    /// Pause the workload. The pause counts as idle time.
    pub async fn sleep(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.idle += duration;
    }

    /// Pause for a random time in `[min, max]`.
    pub async fn sleep_between(&mut self, min: Duration, max: Duration) {
        let duration = if max > min {
            let millis = self
                .rng
                .random_range(min.as_millis() as u64..=max.as_millis() as u64);
            Duration::from_millis(millis)
        } else {
            min
        };
        self.sleep(duration).await;
    }

    /// This user's random generator, seeded from `--seed` when one is set.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Pick the next action from `selector` using this user's random generator.
    pub fn choose<'s, A>(&mut self, selector: &'s mut ActionSelector<A>) -> Option<&'s A> {
        selector.select(&mut self.rng)
    }

    /// Resolve `path` against the base URL. Absolute URLs are returned unchanged.
    /// A leading `/` is relative to the base URL's path, not to the host root.
    pub fn build_url(&self, path: &str) -> Result<String, TransportError> {
        if let Ok(url) = Url::parse(path) {
            if url.has_host() {
                return Ok(path.to_string());
            }
        }
        let base_url = self.base_url.as_ref().ok_or_else(|| {
            TransportError::new(&format!("no base url configured for relative path {}", path))
        })?;
        base_url
            .join(path.trim_start_matches('/'))
            .map(|url| url.to_string())
            .map_err(|e| {
                TransportError::new(&format!(
                    "failed to build url from base {} and path {}: {}",
                    base_url, path, e
                ))
            })
    }

    fn transport(&mut self) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
        self.transport = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Send `request` and record `http_reqs`, `http_req_duration` and
    /// `http_req_failed`. A non-2xx response is returned as `Ok`, see
    /// [`HttpResponse::error_for_status`].
    pub async fn request(&mut self, mut request: HttpRequest) -> Result<HttpResponse, WorkloadError> {
        let (name, method) = request_label(&request);
        request.url = self.build_url(&request.url)?;
        let transport = self.transport()?;

        let result = transport.send(request).await;
        self.record_request(&name, &method, &result);
        result.map_err(WorkloadError::from)
    }

    /// Send every request concurrently and wait for all of them. Results are
    /// in the order of `requests`, each one recorded as by
    /// [`request`](#method.request).
    ///
    /// ```rust
    /// use skein::prelude::*;
    ///
    /// async fn load_storefront(user: &mut VirtualUser) -> WorkloadResult {
    ///     let responses = user
    ///         .batch(vec![
    ///             HttpRequest::get("/products"),
    ///             HttpRequest::get("/cart"),
    ///             HttpRequest::get("/recommendations"),
    ///         ])
    ///         .await;
    ///     for response in responses {
    ///         let response = response?;
    ///         user.check("storefront part loaded", response.is_success());
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub async fn batch(
        &mut self,
        requests: Vec<HttpRequest>,
    ) -> Vec<Result<HttpResponse, WorkloadError>> {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(e) => {
                let error = WorkloadError::from(e);
                return requests.iter().map(|_| Err(error.clone())).collect();
            }
        };

        let mut labels = Vec::with_capacity(requests.len());
        let mut pending = Vec::with_capacity(requests.len());
        for mut request in requests {
            labels.push(request_label(&request));
            let url = self.build_url(&request.url);
            let transport = Arc::clone(&transport);
            // An unresolvable url fails before anything is sent or recorded.
            pending.push(async move {
                request.url = url?;
                Ok::<_, TransportError>(transport.send(request).await)
            });
        }
        let results = futures::future::join_all(pending).await;

        labels
            .into_iter()
            .zip(results)
            .map(|((name, method), result)| match result {
                Ok(result) => {
                    self.record_request(&name, &method, &result);
                    result.map_err(WorkloadError::from)
                }
                Err(e) => Err(WorkloadError::from(e)),
            })
            .collect()
    }

    fn record_request(
        &self,
        name: &str,
        method: &str,
        result: &Result<HttpResponse, TransportError>,
    ) {
        let status = match result {
            Ok(response) => response.status.as_u16().to_string(),
            Err(_) => "0".to_string(),
        };
        let tag = |sample: Sample| {
            sample
                .with_tag("name", name)
                .with_tag("method", method)
                .with_tag("status", &status)
        };
        self.record(tag(Sample::counter(metrics::HTTP_REQS, 1.0)));
        match result {
            Ok(response) => {
                self.record(tag(Sample::trend(
                    metrics::HTTP_REQ_DURATION,
                    response.latency.as_secs_f64() * 1_000.0,
                )));
                self.record(tag(Sample::rate(
                    metrics::HTTP_REQ_FAILED,
                    !response.is_success(),
                )));
            }
            Err(e) => {
                debug!("{} user {}: {} {} {}", self.scenario, self.vu_id, method, name, e);
                self.record(tag(Sample::rate(metrics::HTTP_REQ_FAILED, true)));
            }
        }
    }

    pub async fn get(&mut self, path: &str) -> Result<HttpResponse, WorkloadError> {
        self.request(HttpRequest::get(path)).await
    }

    pub async fn post<B: Into<Vec<u8>>>(
        &mut self,
        path: &str,
        body: B,
    ) -> Result<HttpResponse, WorkloadError> {
        self.request(HttpRequest::post(path).body(body)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &mut self,
        path: &str,
        value: &T,
    ) -> Result<HttpResponse, WorkloadError> {
        self.request(HttpRequest::post(path).json(value)?).await
    }

    pub async fn put<B: Into<Vec<u8>>>(
        &mut self,
        path: &str,
        body: B,
    ) -> Result<HttpResponse, WorkloadError> {
        self.request(HttpRequest::put(path).body(body)).await
    }

    pub async fn delete(&mut self, path: &str) -> Result<HttpResponse, WorkloadError> {
        self.request(HttpRequest::delete(path)).await
    }
}

// The name and method a request's samples are tagged with.
fn request_label(request: &HttpRequest) -> (String, String) {
    let name = request.name.clone().unwrap_or_else(|| request.url.clone());
    (name, request.method.to_string())
}

/// Everything needed to build the users of one scenario.
#[derive(Clone)]
pub(crate) struct UserTemplate {
    pub(crate) scenario: String,
    pub(crate) scenario_index: usize,
    pub(crate) tags: Tags,
    pub(crate) metrics: MetricsCollector,
    pub(crate) clock: Clock,
    pub(crate) base_url: Option<Url>,
    pub(crate) shared: Option<SharedContext>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) seed: Option<u64>,
}

impl UserTemplate {
    pub(crate) fn build(&self, vu_id: usize) -> VirtualUser {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(
                seed ^ ((self.scenario_index as u64 + 1) << 32) ^ vu_id as u64,
            ),
            None => StdRng::from_os_rng(),
        };
        VirtualUser {
            scenario: self.scenario.clone(),
            vu_id,
            iteration: 0,
            base_url: self.base_url.clone(),
            tags: self.tags.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock,
            shared: self.shared.clone(),
            is_setup: false,
            session_data: None,
            transport: self.transport.clone(),
            rng,
            idle: Duration::from_secs(0),
        }
    }

    /// The user that runs the setup workload, the only one allowed to set the
    /// shared context.
    pub(crate) fn build_setup(&self) -> VirtualUser {
        let mut user = self.build(0);
        user.is_setup = true;
        user
    }
}

/// Run one iteration of `workload`, interruptible through `commands`.
///
/// An `Exit` received mid-iteration lets the iteration finish and sets
/// `exit_requested`. An `Interrupt`, or the executor dropping its end of the
/// channel, abandons the iteration, which is then classified as cancelled. A
/// workload that panics fails its iteration and the user carries on.
pub(crate) async fn run_iteration(
    user: &mut VirtualUser,
    workload: &Workload,
    commands: &flume::Receiver<UserCommand>,
    exit_requested: &mut bool,
) -> Outcome {
    user.iteration += 1;
    user.idle = Duration::from_secs(0);
    let started = Instant::now();

    let result = {
        let mut iteration = AssertUnwindSafe((workload.function)(user)).catch_unwind();
        loop {
            tokio::select! {
                biased;
                result = &mut iteration => break Some(result),
                command = commands.recv_async() => match command {
                    Ok(UserCommand::Exit) => *exit_requested = true,
                    Ok(UserCommand::Iterate) => {}
                    Ok(UserCommand::Interrupt) | Err(_) => break None,
                },
            }
        }
    };
    let duration = started.elapsed();

    let (classification, error) = match result {
        Some(Ok(Ok(()))) => (Classification::Success, None),
        Some(Ok(Err(e))) => (Classification::Failed, Some(e)),
        Some(Err(panic)) => {
            let detail = format!("workload panicked: {}", panic_detail(panic.as_ref()));
            debug!("{} user {}: {}", user.scenario, user.vu_id, detail);
            (Classification::Failed, Some(WorkloadError::Custom { detail }))
        }
        None => (Classification::Cancelled, None),
    };

    match classification {
        Classification::Cancelled => {
            user.add_counter(metrics::CANCELLED_ITERATIONS, 1.0);
        }
        _ => {
            user.add_counter(metrics::ITERATIONS, 1.0);
            user.add_trend(
                metrics::ITERATION_DURATION,
                duration.as_secs_f64() * 1_000.0,
            );
            user.add_rate(
                metrics::ITERATION_FAILURES,
                classification == Classification::Failed,
            );
        }
    }
    trace!(
        "{} user {} iteration {}: {:?} in {:?}{}",
        user.scenario,
        user.vu_id,
        user.iteration,
        classification,
        duration,
        error.as_ref().map(|e| format!(" ({})", e)).unwrap_or_default()
    );

    Outcome {
        duration,
        idle: user.idle,
        classification,
        error,
        tags: user.tags.clone(),
    }
}

fn panic_detail(panic: &(dyn Any + Send)) -> &str {
    if let Some(detail) = panic.downcast_ref::<&str>() {
        detail
    } else if let Some(detail) = panic.downcast_ref::<String>() {
        detail
    } else {
        "unknown cause"
    }
}

// Drain pending commands without waiting, returning true when the user must stop.
fn received_exit(commands: &flume::Receiver<UserCommand>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(UserCommand::Exit) | Ok(UserCommand::Interrupt) => return true,
            Ok(UserCommand::Iterate) => {}
            Err(flume::TryRecvError::Empty) => return false,
            Err(flume::TryRecvError::Disconnected) => return true,
        }
    }
}

/// Closed-model loop: iterate back to back until told to stop, or until
/// `iterations` have run.
pub(crate) async fn user_main(
    mut user: VirtualUser,
    workload: Workload,
    commands: flume::Receiver<UserCommand>,
    counters: Arc<OutcomeCounters>,
    iterations: Option<u64>,
) {
    debug!("launching {} user {}", user.scenario, user.vu_id);
    loop {
        if let Some(limit) = iterations {
            if user.iteration >= limit {
                break;
            }
        }
        if received_exit(&commands) {
            break;
        }

        let mut exit_requested = false;
        let outcome = run_iteration(&mut user, &workload, &commands, &mut exit_requested).await;
        counters.record(&outcome);
        if outcome.classification == Classification::Cancelled || exit_requested {
            break;
        }

        // A workload that never awaits must not monopolize the runtime.
        tokio::task::yield_now().await;
    }
    debug!(
        "{} user {} exiting after {} iterations",
        user.scenario, user.vu_id, user.iteration
    );
}

/// Open-model loop: run one iteration per `Iterate` command, reporting back on
/// `idle` after each one.
pub(crate) async fn worker_main(
    mut user: VirtualUser,
    workload: Workload,
    commands: flume::Receiver<UserCommand>,
    counters: Arc<OutcomeCounters>,
    idle: flume::Sender<usize>,
) {
    debug!("launching {} worker {}", user.scenario, user.vu_id);
    while let Ok(command) = commands.recv_async().await {
        match command {
            UserCommand::Iterate => {
                let mut exit_requested = false;
                let outcome =
                    run_iteration(&mut user, &workload, &commands, &mut exit_requested).await;
                counters.record(&outcome);
                if outcome.classification == Classification::Cancelled || exit_requested {
                    break;
                }
                if idle.send(user.vu_id).is_err() {
                    break;
                }
            }
            UserCommand::Exit | UserCommand::Interrupt => break,
        }
    }
    debug!(
        "{} worker {} exiting after {} iterations",
        user.scenario, user.vu_id, user.iteration
    );
}
