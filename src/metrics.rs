//! Optionally collect and aggregate metrics during a load test.
//!
//! Every measurement is a [`Sample`] of one of three kinds:
//!  - [`MetricKind::Counter`]: a running sum, for example `iterations`;
//!  - [`MetricKind::Rate`]: the share of true samples, for example `http_req_failed`;
//!  - [`MetricKind::Trend`]: a distribution queried by percentile, for example
//!    `http_req_duration`.
//!
//! Samples are recorded into a shared [`MetricsCollector`], which aggregates them
//! under their metric name and, when the sample carries a `scenario` tag, also
//! under the sub-metric `name{scenario:value}`. A [`MetricsSnapshot`] is a
//! consistent copy of every metric that can be read while writers continue.

use num_format::{Locale, ToFormattedString};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// Iterations that ran to completion, successful or not.
pub const ITERATIONS: &str = "iterations";
/// Wall time of completed iterations, in milliseconds.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// True when the workload returned an error.
pub const ITERATION_FAILURES: &str = "iteration_failures";
/// Iterations interrupted before they completed.
pub const CANCELLED_ITERATIONS: &str = "cancelled_iterations";
/// Arrival-rate iterations that found no idle worker.
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
/// Outcome of every named check.
pub const CHECKS: &str = "checks";
/// Requests issued through the virtual user helpers.
pub const HTTP_REQS: &str = "http_reqs";
/// Request latency, in milliseconds.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// True for transport errors and non-2xx responses.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

/// Trend values are bucketed to a thousandth of their unit.
const TREND_RESOLUTION: f64 = 1_000.0;

/// Tags attached to a sample.
pub type Tags = BTreeMap<String, String>;

/// The three kinds of metric.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

/// One measurement, immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    /// Name of the metric this sample is aggregated into.
    pub metric: String,
    pub kind: MetricKind,
    /// Amount for a counter, `1.0` or `0.0` for a rate, measurement for a trend.
    pub value: f64,
    /// Offset from the start of the run.
    #[serde(serialize_with = "serialize_offset")]
    pub offset: Duration,
    pub tags: Tags,
}
impl Sample {
    pub fn new(metric: &str, kind: MetricKind, value: f64) -> Self {
        Sample {
            metric: metric.to_string(),
            kind,
            value,
            offset: Duration::from_secs(0),
            tags: Tags::new(),
        }
    }

    pub fn counter(metric: &str, value: f64) -> Self {
        Sample::new(metric, MetricKind::Counter, value)
    }

    pub fn rate(metric: &str, value: bool) -> Self {
        Sample::new(metric, MetricKind::Rate, if value { 1.0 } else { 0.0 })
    }

    pub fn trend(metric: &str, value: f64) -> Self {
        Sample::new(metric, MetricKind::Trend, value)
    }

    pub fn at(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_tags(mut self, tags: &Tags) -> Self {
        self.tags
            .extend(tags.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

fn serialize_offset<S: Serializer>(offset: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(offset.as_millis() as u64)
}

/// The name under which per-scenario values of `metric` are aggregated.
///
/// # Example
/// ```rust
/// use skein::metrics::scenario_submetric;
///
/// assert_eq!(scenario_submetric("errors", "flash_sale"), "errors{scenario:flash_sale}");
/// ```
pub fn scenario_submetric(metric: &str, scenario: &str) -> String {
    format!("{}{{scenario:{}}}", metric, scenario)
}

/// Running sum of a counter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CounterState {
    pub sum: f64,
    pub samples: usize,
}

/// True and total sample counts of a rate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateState {
    pub trues: usize,
    pub total: usize,
}
impl RateState {
    /// `trues / total`, or `None` before the first sample.
    pub fn rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.trues as f64 / self.total as f64)
        }
    }
}

/// Distribution of a trend.
///
/// Values are counted in a sorted map keyed by the value in thousandths, so any
/// percentile can be read back without being declared up front.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrendState {
    values: BTreeMap<u64, usize>,
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}
impl TrendState {
    /// Negative values are recorded as zero.
    fn record(&mut self, value: f64) {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        let key = (value * TREND_RESOLUTION).round() as u64;
        *self.values.entry(key).or_insert(0) += 1;
    }

    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// The smallest recorded value that at least `percent` percent of the
    /// samples are less than or equal to (nearest rank).
    pub fn percentile(&self, percent: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let percent = percent.max(0.0).min(100.0);
        let rank = ((self.count as f64 * percent / 100.0).ceil() as usize).max(1);
        debug!(
            "percentile: {}, sample {} of total {}",
            percent, rank, self.count
        );

        let mut seen = 0;
        for (key, counter) in &self.values {
            seen += counter;
            if seen >= rank {
                let value = *key as f64 / TREND_RESOLUTION;
                // Bucketing may round past the real extremes.
                return Some(value.max(self.min).min(self.max));
            }
        }
        Some(self.max)
    }
}
impl Serialize for TrendState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TrendState", 9)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("avg", &self.avg())?;
        state.serialize_field("min", &self.min)?;
        state.serialize_field("med", &self.median())?;
        state.serialize_field("max", &self.max)?;
        state.serialize_field("p90", &self.percentile(90.0))?;
        state.serialize_field("p95", &self.percentile(95.0))?;
        state.serialize_field("p99", &self.percentile(99.0))?;
        state.serialize_field("sum", &self.sum)?;
        state.end()
    }
}

/// Aggregated state of one metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricState {
    Counter(CounterState),
    Rate(RateState),
    Trend(TrendState),
}
impl MetricState {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricState::Counter(CounterState::default()),
            MetricKind::Rate => MetricState::Rate(RateState::default()),
            MetricKind::Trend => MetricState::Trend(TrendState::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricState::Counter(_) => MetricKind::Counter,
            MetricState::Rate(_) => MetricKind::Rate,
            MetricState::Trend(_) => MetricKind::Trend,
        }
    }

    /// How many samples were aggregated.
    pub fn samples(&self) -> usize {
        match self {
            MetricState::Counter(counter) => counter.samples,
            MetricState::Rate(rate) => rate.total,
            MetricState::Trend(trend) => trend.count,
        }
    }

    fn apply(&mut self, value: f64) {
        match self {
            MetricState::Counter(counter) => {
                counter.sum += value;
                counter.samples += 1;
            }
            MetricState::Rate(rate) => {
                rate.total += 1;
                if value != 0.0 {
                    rate.trues += 1;
                }
            }
            MetricState::Trend(trend) => trend.record(value),
        }
    }
}

type MetricEntry = Arc<Mutex<MetricState>>;

#[derive(Default)]
struct CollectorInner {
    metrics: RwLock<HashMap<String, MetricEntry>>,
    sample_log: RwLock<Option<flume::Sender<Sample>>>,
}

/// Thread-safe, append-only aggregation of samples.
///
/// Cloning a collector is cheap, every clone records into the same metrics.
/// Updates to one metric are serialized by that metric's own lock, so writers of
/// different metrics never wait on each other.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}
impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector::default()
    }

    /// Also forward every recorded sample to a sample log.
    pub(crate) fn set_sample_log(&self, sender: Option<flume::Sender<Sample>>) {
        *self
            .inner
            .sample_log
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sender;
    }

    /// Aggregate one sample.
    ///
    /// The first sample of a metric fixes its kind; later samples of another kind
    /// are ignored.
    pub fn record(&self, sample: Sample) {
        self.apply(&sample.metric, sample.kind, sample.value);
        if let Some(scenario) = sample.tags.get("scenario") {
            let submetric = scenario_submetric(&sample.metric, scenario);
            self.apply(&submetric, sample.kind, sample.value);
        }

        let sample_log = self
            .inner
            .sample_log
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sample_log.as_ref() {
            // The sample log is best effort, it must never slow the load test.
            let _ = sender.try_send(sample);
        }
    }

    fn apply(&self, name: &str, kind: MetricKind, value: f64) {
        let entry = self.entry(name, kind);
        let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if state.kind() != kind {
            debug!(
                "ignoring {} sample for {} metric {}",
                kind,
                state.kind(),
                name
            );
            return;
        }
        state.apply(value);
    }

    fn entry(&self, name: &str, kind: MetricKind) -> MetricEntry {
        {
            let metrics = self
                .inner
                .metrics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = metrics.get(name) {
                return Arc::clone(entry);
            }
        }
        let mut metrics = self
            .inner
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            metrics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MetricState::new(kind)))),
        )
    }

    /// Copy every metric. Each metric is copied under its own lock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let entries: Vec<(String, MetricEntry)> = self
            .inner
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let metrics = entries
            .into_iter()
            .map(|(name, entry)| {
                let state = entry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                (name, state)
            })
            .collect();
        MetricsSnapshot { metrics }
    }
}

/// A point-in-time copy of every metric, keyed by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricState>,
}
impl MetricsSnapshot {
    pub fn get(&self, metric: &str) -> Option<&MetricState> {
        self.metrics.get(metric)
    }

    /// Counter sum, zero when the counter was never incremented.
    pub fn counter(&self, metric: &str) -> f64 {
        match self.metrics.get(metric) {
            Some(MetricState::Counter(counter)) => counter.sum,
            _ => 0.0,
        }
    }

    pub fn rate(&self, metric: &str) -> Option<&RateState> {
        match self.metrics.get(metric) {
            Some(MetricState::Rate(rate)) => Some(rate),
            _ => None,
        }
    }

    pub fn trend(&self, metric: &str) -> Option<&TrendState> {
        match self.metrics.get(metric) {
            Some(MetricState::Trend(trend)) => Some(trend),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.metrics.iter())
    }
}

/// Format large numbers in a human readable manner.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// Format a measurement with at most two decimals, dropping needless zeros.
pub(crate) fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        let formatted = format_number(value.abs() as usize);
        if value < 0.0 {
            format!("-{}", formatted)
        } else {
            formatted
        }
    } else {
        let formatted = format!("{:.2}", value);
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn rate_and_counter() {
        let collector = MetricsCollector::new();
        collector.record(Sample::rate("errors", true));
        collector.record(Sample::rate("errors", false));
        collector.record(Sample::rate("errors", false));
        collector.record(Sample::rate("errors", false));
        collector.record(Sample::counter(ITERATIONS, 1.0));
        collector.record(Sample::counter(ITERATIONS, 2.0));

        let snapshot = collector.snapshot();
        let errors = snapshot.rate("errors").unwrap();
        assert_eq!(errors.trues, 1);
        assert_eq!(errors.total, 4);
        assert_eq!(errors.rate(), Some(0.25));
        assert_eq!(snapshot.counter(ITERATIONS), 3.0);
        assert_eq!(snapshot.get(ITERATIONS).unwrap().samples(), 2);
        assert_eq!(snapshot.counter("missing"), 0.0);
        assert!(snapshot.rate("missing").is_none());
    }

    #[test]
    fn trend_percentiles() {
        let collector = MetricsCollector::new();
        for value in 1..=100 {
            collector.record(Sample::trend(HTTP_REQ_DURATION, value as f64));
        }
        let snapshot = collector.snapshot();
        let trend = snapshot.trend(HTTP_REQ_DURATION).unwrap();
        assert_eq!(trend.count, 100);
        assert_eq!(trend.min, 1.0);
        assert_eq!(trend.max, 100.0);
        assert_eq!(trend.avg(), Some(50.5));
        assert_eq!(trend.median(), Some(50.0));
        assert_eq!(trend.percentile(95.0), Some(95.0));
        assert_eq!(trend.percentile(99.9), Some(100.0));
        assert_eq!(trend.percentile(100.0), Some(100.0));
        assert_eq!(trend.percentile(0.0), Some(1.0));
        // Percentiles that were never declared are still available.
        assert_eq!(trend.percentile(37.0), Some(37.0));
    }

    #[test]
    fn trend_keeps_fractions() {
        let mut trend = TrendState::default();
        assert_eq!(trend.percentile(50.0), None);
        assert_eq!(trend.avg(), None);
        trend.record(0.25);
        trend.record(0.5);
        trend.record(-3.0);
        assert_eq!(trend.min, 0.0);
        assert_eq!(trend.max, 0.5);
        assert_eq!(trend.percentile(50.0), Some(0.25));
        assert_eq!(trend.percentile(100.0), Some(0.5));
    }

    #[test]
    fn first_kind_wins() {
        let collector = MetricsCollector::new();
        collector.record(Sample::rate("mixed", true));
        collector.record(Sample::counter("mixed", 5.0));
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get("mixed").unwrap().kind(), MetricKind::Rate);
        assert_eq!(snapshot.rate("mixed").unwrap().total, 1);
    }

    #[test]
    fn scenario_tag_adds_submetric() {
        let collector = MetricsCollector::new();
        collector.record(Sample::rate("success", true).with_tag("scenario", "warmup"));
        collector.record(Sample::rate("success", false).with_tag("scenario", "flash_sale"));
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.rate("success").unwrap().total, 2);
        assert_eq!(
            snapshot
                .rate("success{scenario:warmup}")
                .unwrap()
                .rate(),
            Some(1.0)
        );
        assert_eq!(
            snapshot
                .rate("success{scenario:flash_sale}")
                .unwrap()
                .rate(),
            Some(0.0)
        );
    }

    #[test]
    fn concurrent_records_are_never_lost() {
        let collector = MetricsCollector::new();
        let handles: Vec<_> = (0..8)
            .map(|thread_number| {
                let collector = collector.clone();
                thread::spawn(move || {
                    for i in 0..1_000 {
                        collector.record(Sample::rate("shared", (i + thread_number) % 2 == 0));
                        collector.record(Sample::counter(&format!("own_{}", thread_number), 1.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        let shared = snapshot.rate("shared").unwrap();
        assert_eq!(shared.total, 8_000);
        assert_eq!(shared.trues, 4_000);
        for thread_number in 0..8 {
            assert_eq!(snapshot.counter(&format!("own_{}", thread_number)), 1_000.0);
        }
    }

    #[test]
    fn sample_log_receives_samples() {
        let collector = MetricsCollector::new();
        let (sender, receiver) = flume::unbounded();
        collector.set_sample_log(Some(sender));
        collector.record(Sample::counter(ITERATIONS, 1.0).with_tag("scenario", "a"));
        let sample = receiver.try_recv().unwrap();
        assert_eq!(sample.metric, ITERATIONS);
        assert_eq!(sample.tags.get("scenario").map(String::as_str), Some("a"));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_value(1_234.0), "1,234");
        assert_eq!(format_value(0.126), "0.13");
        assert_eq!(format_value(-3.0), "-3");
        assert_eq!(format_value(2.5), "2.5");
    }
}
