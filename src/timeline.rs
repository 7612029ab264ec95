//! Stage timelines and the run clock.
//!
//! A [`StageTimeline`] is a piecewise-linear ramp: it starts at a start target at
//! time zero, and reaches each [`Stage`]'s target at the end of that stage,
//! interpolating linearly in between. Closed-model executors read it as a number
//! of virtual users, the arrival-rate executor reads it as a rate and integrates
//! it to find the instant each iteration is due.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::util;
use crate::SkeinError;

// Integration slack, keeps 4.9999999 scheduled iterations from rounding down.
const EPSILON: f64 = 1e-9;

/// One segment of a ramp: reach `target` by the end of `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "util::timespan")]
    pub duration: Duration,
    pub target: u64,
}
impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Stage { duration, target }
    }
}
/// Parse one stage from `target,timespan`, for example `200,2m`.
impl FromStr for Stage {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| SkeinError::InvalidOption {
            option: "stage".to_string(),
            value: s.to_string(),
            detail: detail.to_string(),
        };
        let mut parts = s.splitn(2, ',');
        let target = parts
            .next()
            .and_then(|target| u64::from_str(target.trim()).ok())
            .ok_or_else(|| invalid("a stage starts with an integer target, e.g. 200,2m"))?;
        let duration = parts
            .next()
            .and_then(util::parse_timespan)
            .ok_or_else(|| invalid("a stage ends with a time span, e.g. 200,2m"))?;
        Ok(Stage { duration, target })
    }
}

/// A start target followed by an ordered list of stages.
#[derive(Clone, Debug, PartialEq)]
pub struct StageTimeline {
    start: f64,
    stages: Vec<Stage>,
}
impl StageTimeline {
    pub fn new(start: u64, stages: &[Stage]) -> Self {
        StageTimeline {
            start: start as f64,
            stages: stages.to_vec(),
        }
    }

    /// A timeline that holds `target` for `duration`.
    pub fn constant(target: u64, duration: Duration) -> Self {
        StageTimeline::new(target, &[Stage::new(duration, target)])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// The smallest and largest target the timeline ever asks for.
    pub fn bounds(&self) -> (f64, f64) {
        self.stages
            .iter()
            .fold((self.start, self.start), |(low, high), stage| {
                let target = stage.target as f64;
                (low.min(target), high.max(target))
            })
    }

    /// The interpolated target `elapsed` into the timeline. Past the end the
    /// last stage's target holds; an empty timeline is the start target.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let elapsed = elapsed.as_secs_f64();
        let mut segment_start = 0.0;
        let mut previous = self.start;
        for stage in &self.stages {
            let length = stage.duration.as_secs_f64();
            let target = stage.target as f64;
            if elapsed < segment_start + length {
                let progress = (elapsed - segment_start) / length;
                return (previous + (target - previous) * progress).max(0.0);
            }
            segment_start += length;
            previous = target;
        }
        previous.max(0.0)
    }

    /// Number of virtual users the timeline asks for at `elapsed`.
    pub fn vus_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round() as usize
    }

    /// Number of events due by `elapsed` when the target is read as events
    /// per `time_unit`: the integral of the rate over `[0, elapsed]`.
    pub fn events_by(&self, elapsed: Duration, time_unit: Duration) -> f64 {
        let unit = time_unit.as_secs_f64();
        let elapsed = elapsed.as_secs_f64();
        let mut segment_start = 0.0;
        let mut previous = self.start / unit;
        let mut events = 0.0;
        for stage in &self.stages {
            let length = stage.duration.as_secs_f64();
            let target = stage.target as f64 / unit;
            if elapsed < segment_start + length {
                let x = elapsed - segment_start;
                let slope = (target - previous) / length;
                return events + previous * x + slope * x * x / 2.0;
            }
            events += (previous + target) / 2.0 * length;
            segment_start += length;
            previous = target;
        }
        events
    }

    /// How many iterations the whole timeline schedules.
    pub fn scheduled_events(&self, time_unit: Duration) -> u64 {
        (self.events_by(self.total_duration(), time_unit) + EPSILON).floor() as u64
    }

    /// The offset at which the `n`th event (counting from 1) is due, or `None`
    /// if the timeline ends first.
    ///
    /// Solves `events_by(t) == n` segment by segment. Within a segment the rate
    /// is `a + slope * x`, so the count is quadratic in `x` and the root is taken
    /// in the form that stays stable when the slope is zero.
    pub fn event_offset(&self, n: u64, time_unit: Duration) -> Option<Duration> {
        if n == 0 {
            return Some(Duration::from_secs(0));
        }
        let unit = time_unit.as_secs_f64();
        let mut remaining = n as f64;
        let mut segment_start = 0.0;
        let mut previous = self.start / unit;
        for stage in &self.stages {
            let length = stage.duration.as_secs_f64();
            let target = stage.target as f64 / unit;
            let area = (previous + target) / 2.0 * length;
            if remaining <= area + EPSILON {
                let slope = (target - previous) / length;
                let discriminant = (previous * previous + 2.0 * slope * remaining).max(0.0);
                let denominator = previous + discriminant.sqrt();
                let x = if denominator > 0.0 {
                    (2.0 * remaining / denominator).min(length)
                } else {
                    0.0
                };
                return Some(Duration::from_secs_f64(segment_start + x));
            }
            remaining -= area;
            segment_start += length;
            previous = target;
        }
        None
    }
}

/// Monotonic clock for one run. Every offset reported in samples and events is
/// measured from the moment the clock was started.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}
impl Clock {
    pub fn start() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// The instant `offset` after the clock started.
    pub fn at(&self, offset: Duration) -> Instant {
        self.epoch + offset
    }
}
