//! The result of a load test.
//!
//! [`LoadTest::execute`](../struct.LoadTest.html#method.execute) returns a
//! [`RunResult`]: how each scenario went, the final metrics, and the threshold
//! verdicts. Unless `--no-print-metrics` is set it is also printed, and with
//! `--report-file` written as JSON.

use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::executor::ScenarioOutcome;
use crate::metrics::{format_value, MetricState, MetricsSnapshot};
use crate::scheduler::LifecycleEvent;
use crate::threshold::Verdict;
use crate::util;
use crate::SkeinError;

/// Exit code for a run in which at least one threshold failed.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

const RULE: &str =
    " ------------------------------------------------------------------------------";

#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    /// Outcome of every scenario that was scheduled, including those that never
    /// started.
    pub scenarios: Vec<ScenarioOutcome>,
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<Verdict>,
    pub history: Vec<LifecycleEvent>,
    /// Wall time of the whole run, setup and teardown included.
    #[serde(with = "util::timespan")]
    pub duration: Duration,
}

impl RunResult {
    /// A result for a run that generated no load, such as `--list`.
    pub(crate) fn empty() -> Self {
        RunResult {
            scenarios: Vec::new(),
            metrics: MetricsSnapshot::default(),
            thresholds: Vec::new(),
            history: Vec::new(),
            duration: Duration::from_secs(0),
        }
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioOutcome> {
        self.scenarios.iter().find(|outcome| outcome.scenario == name)
    }

    pub fn failed_thresholds(&self) -> Vec<&Verdict> {
        self.thresholds
            .iter()
            .filter(|verdict| verdict.failed())
            .collect()
    }

    /// True unless a threshold failed. Thresholds that could not be evaluated do
    /// not count.
    pub fn passed(&self) -> bool {
        !self.thresholds.iter().any(Verdict::failed)
    }

    /// Process exit status: 0, or 99 if any threshold failed.
    ///
    /// # Example
    /// ```rust,no_run
    /// use skein::prelude::*;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), SkeinError> {
    ///     let result = LoadTest::initialize()?
    ///         .load_scenario_table(r#"{"scenarios": {"browse": {"executor": "constant-vus", "vus": 1, "duration": "10s"}}}"#)?
    ///         .register_workload("browse", workload!(browse))
    ///         .execute()
    ///         .await?;
    ///     std::process::exit(result.exit_code());
    /// }
    ///
    /// async fn browse(user: &mut VirtualUser) -> WorkloadResult {
    ///     let _response = user.get("/").await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }

    pub(crate) async fn write_json(&self, path: &str) -> Result<(), SkeinError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        info!("wrote report file to: {}", path);
        Ok(())
    }

    fn fmt_scenarios(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scenarios.is_empty() {
            return Ok(());
        }
        writeln!(fmt, "\n === SCENARIOS ===\n{}", RULE)?;
        writeln!(
            fmt,
            " {:<24} | {:>8} | {:>9} | {:>9} | {:>9} | {:>8}",
            "Name", "# vus", "completed", "failed", "cancelled", "dropped"
        )?;
        writeln!(fmt, "{}", RULE)?;
        for outcome in self
            .scenarios
            .iter()
            .sorted_by_key(|outcome| outcome.start_offset)
        {
            if !outcome.started {
                writeln!(fmt, " {:<24} | not started", truncate(&outcome.scenario, 24))?;
                continue;
            }
            writeln!(
                fmt,
                " {:<24} | {:>8} | {:>9} | {:>9} | {:>9} | {:>8}",
                truncate(&outcome.scenario, 24),
                outcome.peak_vus.to_formatted_string(&Locale::en),
                outcome.completed.to_formatted_string(&Locale::en),
                outcome.failed.to_formatted_string(&Locale::en),
                outcome.cancelled.to_formatted_string(&Locale::en),
                outcome.dropped.to_formatted_string(&Locale::en),
            )?;
        }
        Ok(())
    }

    fn fmt_metrics(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.metrics.is_empty() {
            return Ok(());
        }
        let seconds = self.duration.as_secs_f64();
        writeln!(fmt, "\n === METRICS ===\n{}", RULE)?;
        for (name, state) in &self.metrics.metrics {
            let summary = match state {
                MetricState::Counter(counter) => {
                    let per_second = if seconds > 0.0 {
                        counter.sum / seconds
                    } else {
                        0.0
                    };
                    format!(
                        "{} ({}/s)",
                        format_value(counter.sum),
                        format_value(per_second)
                    )
                }
                MetricState::Rate(rate) => format!(
                    "{}% ({} of {})",
                    format_value(rate.rate().unwrap_or(0.0) * 100.0),
                    rate.trues.to_formatted_string(&Locale::en),
                    rate.total.to_formatted_string(&Locale::en)
                ),
                MetricState::Trend(trend) => {
                    let value = |value: Option<f64>| format_value(value.unwrap_or(0.0));
                    format!(
                        "avg={} min={} med={} max={} p(90)={} p(95)={}",
                        value(trend.avg()),
                        format_value(trend.min),
                        value(trend.median()),
                        format_value(trend.max),
                        value(trend.percentile(90.0)),
                        value(trend.percentile(95.0))
                    )
                }
            };
            writeln!(fmt, " {:<40} {}", truncate(name, 40), summary)?;
        }
        Ok(())
    }

    fn fmt_thresholds(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.thresholds.is_empty() {
            return Ok(());
        }
        writeln!(fmt, "\n === THRESHOLDS ===\n{}", RULE)?;
        for verdict in &self.thresholds {
            writeln!(fmt, " {}", verdict)?;
        }
        let failed = self.failed_thresholds().len();
        if failed > 0 {
            writeln!(fmt, "{}\n {} of {} thresholds failed", RULE, failed, self.thresholds.len())?;
        }
        Ok(())
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_scenarios(fmt)?;
        self.fmt_metrics(fmt)?;
        self.fmt_thresholds(fmt)?;
        writeln!(fmt, "\n Run time: {}", util::format_timespan(self.duration))
    }
}

// Cut `text` to `width` characters, marking the cut.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(width - 2).collect();
        truncated.push_str("..");
        truncated
    }
}
