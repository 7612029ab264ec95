//! Pass/fail thresholds evaluated against the final metrics.
//!
//! A threshold pairs a metric name with an expression such as `rate<0.1` or
//! `p(95)<3000`. Evaluation is a pure function of a [`MetricsSnapshot`]: a
//! threshold on a metric with no samples is [`ThresholdOutcome::NotEvaluable`],
//! which is reported but never fails a run.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::metrics::{MetricKind, MetricState, MetricsSnapshot};
use crate::SkeinError;

lazy_static! {
    static ref EXPRESSION: Regex = Regex::new(
        r"^\s*(?P<aggregation>rate|count|value|avg|min|max|med|p\(\s*(?P<percentile>\d+(?:\.\d+)?)\s*\))\s*(?P<comparison><=|>=|==|!=|<|>)\s*(?P<bound>-?\d+(?:\.\d+)?)\s*$"
    )
    .expect("valid threshold regex");
}

/// Which value of the metric an expression looks at.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Share of true samples in a rate.
    Rate,
    /// Counter sum, rate sample total or trend sample count.
    Count,
    /// Counter sum.
    Value,
    Avg,
    Min,
    Max,
    Med,
    /// A percentile of a trend, `0 < p <= 100`.
    Percentile(f64),
}
impl Aggregation {
    fn observe(self, state: &MetricState) -> Result<f64, String> {
        let unsupported = || {
            Err(format!(
                "{} is not defined for {} metrics",
                self,
                state.kind()
            ))
        };
        match (self, state) {
            (Aggregation::Rate, MetricState::Rate(rate)) => {
                rate.rate().ok_or_else(|| "no samples recorded".to_string())
            }
            (Aggregation::Count, MetricState::Counter(counter))
            | (Aggregation::Value, MetricState::Counter(counter)) => Ok(counter.sum),
            (Aggregation::Count, MetricState::Rate(rate)) => Ok(rate.total as f64),
            (Aggregation::Count, MetricState::Trend(trend)) => Ok(trend.count as f64),
            (Aggregation::Avg, MetricState::Trend(trend)) => {
                trend.avg().ok_or_else(|| "no samples recorded".to_string())
            }
            (Aggregation::Min, MetricState::Trend(trend)) => Ok(trend.min),
            (Aggregation::Max, MetricState::Trend(trend)) => Ok(trend.max),
            (Aggregation::Med, MetricState::Trend(trend)) => {
                trend.median().ok_or_else(|| "no samples recorded".to_string())
            }
            (Aggregation::Percentile(percent), MetricState::Trend(trend)) => trend
                .percentile(percent)
                .ok_or_else(|| "no samples recorded".to_string()),
            _ => unsupported(),
        }
    }
}
impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Value => write!(f, "value"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(percent) => write!(f, "p({})", percent),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}
impl Comparison {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Less => observed < bound,
            Comparison::LessOrEqual => observed <= bound,
            Comparison::Greater => observed > bound,
            Comparison::GreaterOrEqual => observed >= bound,
            Comparison::Equal => (observed - bound).abs() < f64::EPSILON,
            Comparison::NotEqual => (observed - bound).abs() >= f64::EPSILON,
        }
    }
}
impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let operator = match self {
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        };
        write!(f, "{}", operator)
    }
}

/// A parsed threshold expression such as `p(95)<3000`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Expression {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
}
impl FromStr for Expression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = EXPRESSION
            .captures(s)
            .ok_or_else(|| "expected <aggregation><operator><number>, e.g. p(95)<3000".to_string())?;

        let aggregation = match &captures["aggregation"] {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "value" => Aggregation::Value,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let percent = f64::from_str(&captures["percentile"])
                    .map_err(|e| format!("invalid percentile: {}", e))?;
                if percent <= 0.0 || percent > 100.0 {
                    return Err(format!("percentile {} is outside (0, 100]", percent));
                }
                Aggregation::Percentile(percent)
            }
        };
        let comparison = match &captures["comparison"] {
            "<" => Comparison::Less,
            "<=" => Comparison::LessOrEqual,
            ">" => Comparison::Greater,
            ">=" => Comparison::GreaterOrEqual,
            "==" => Comparison::Equal,
            _ => Comparison::NotEqual,
        };
        let bound =
            f64::from_str(&captures["bound"]).map_err(|e| format!("invalid bound: {}", e))?;

        Ok(Expression {
            aggregation,
            comparison,
            bound,
        })
    }
}
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison, self.bound)
    }
}

/// A threshold on one metric.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: Expression,
    // As written, for reporting.
    source: String,
}
impl ThresholdSpec {
    /// Parse `expression` as a threshold on `metric`.
    ///
    /// # Example
    /// ```rust
    /// use skein::threshold::ThresholdSpec;
    ///
    /// assert!(ThresholdSpec::new("http_req_duration", "p(95)<5000").is_ok());
    /// assert!(ThresholdSpec::new("errors", "rate<0.25").is_ok());
    /// assert!(ThresholdSpec::new("errors", "mostly fine").is_err());
    /// ```
    pub fn new(metric: &str, expression: &str) -> Result<Self, SkeinError> {
        let parsed =
            Expression::from_str(expression).map_err(|detail| SkeinError::InvalidThreshold {
                metric: metric.to_string(),
                expression: expression.to_string(),
                detail,
            })?;
        Ok(ThresholdSpec {
            metric: metric.to_string(),
            expression: parsed,
            source: expression.trim().to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The metric kind this threshold can be evaluated against, if only one fits.
    pub fn expected_kind(&self) -> Option<MetricKind> {
        match self.expression.aggregation {
            Aggregation::Rate => Some(MetricKind::Rate),
            Aggregation::Value => Some(MetricKind::Counter),
            Aggregation::Count => None,
            _ => Some(MetricKind::Trend),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ThresholdOutcome {
    Passed { observed: f64 },
    Failed { observed: f64 },
    NotEvaluable { reason: String },
}

/// The result of one threshold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verdict {
    pub metric: String,
    pub expression: String,
    #[serde(flatten)]
    pub outcome: ThresholdOutcome,
}
impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, ThresholdOutcome::Passed { .. })
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, ThresholdOutcome::Failed { .. })
    }

    pub fn is_evaluable(&self) -> bool {
        !matches!(self.outcome, ThresholdOutcome::NotEvaluable { .. })
    }
}
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.outcome {
            ThresholdOutcome::Passed { observed } => write!(
                f,
                "✓ {}: {} (observed {})",
                self.metric,
                self.expression,
                crate::metrics::format_value(*observed)
            ),
            ThresholdOutcome::Failed { observed } => write!(
                f,
                "✗ {}: {} (observed {})",
                self.metric,
                self.expression,
                crate::metrics::format_value(*observed)
            ),
            ThresholdOutcome::NotEvaluable { reason } => {
                write!(f, "- {}: {} (not evaluable: {})", self.metric, self.expression, reason)
            }
        }
    }
}

/// Evaluate every threshold against the snapshot, in order.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[ThresholdSpec]) -> Vec<Verdict> {
    thresholds
        .iter()
        .map(|threshold| {
            let outcome = match snapshot.get(&threshold.metric) {
                Some(state) if state.samples() > 0 => {
                    match threshold.expression.aggregation.observe(state) {
                        Ok(observed) => {
                            if threshold
                                .expression
                                .comparison
                                .holds(observed, threshold.expression.bound)
                            {
                                ThresholdOutcome::Passed { observed }
                            } else {
                                ThresholdOutcome::Failed { observed }
                            }
                        }
                        Err(reason) => ThresholdOutcome::NotEvaluable { reason },
                    }
                }
                _ => ThresholdOutcome::NotEvaluable {
                    reason: "no samples recorded".to_string(),
                },
            };
            Verdict {
                metric: threshold.metric.clone(),
                expression: threshold.source.clone(),
                outcome,
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metrics::{MetricsCollector, Sample, HTTP_REQ_DURATION, ITERATIONS};

    fn snapshot() -> MetricsSnapshot {
        let collector = MetricsCollector::new();
        for i in 0..10 {
            collector.record(Sample::rate("errors", i < 2));
            collector.record(Sample::trend(HTTP_REQ_DURATION, (i * 100) as f64));
            collector.record(Sample::counter(ITERATIONS, 1.0));
        }
        collector.snapshot()
    }

    #[test]
    fn parse_expressions() {
        let expression = Expression::from_str("p(95)<3000").unwrap();
        assert_eq!(expression.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(expression.comparison, Comparison::Less);
        assert_eq!(expression.bound, 3000.0);

        let expression = Expression::from_str(" rate >= 0.75 ").unwrap();
        assert_eq!(expression.aggregation, Aggregation::Rate);
        assert_eq!(expression.comparison, Comparison::GreaterOrEqual);

        assert_eq!(
            Expression::from_str("p(99.9)!=1").unwrap().aggregation,
            Aggregation::Percentile(99.9)
        );
        assert!(Expression::from_str("p(0)<1").is_err());
        assert!(Expression::from_str("p(101)<1").is_err());
        assert!(Expression::from_str("rate<").is_err());
        assert!(Expression::from_str("latency<3").is_err());
        assert!(Expression::from_str("rate<0.1 or so").is_err());

        let error = ThresholdSpec::new("errors", "rate<<0.1").unwrap_err();
        assert!(error.is_config_error());
    }

    #[test]
    fn pass_fail_and_not_evaluable() {
        let thresholds = vec![
            ThresholdSpec::new("errors", "rate<0.25").unwrap(),
            ThresholdSpec::new("errors", "rate<0.1").unwrap(),
            ThresholdSpec::new(HTTP_REQ_DURATION, "p(90)<=800").unwrap(),
            ThresholdSpec::new(HTTP_REQ_DURATION, "max<500").unwrap(),
            ThresholdSpec::new(ITERATIONS, "count==10").unwrap(),
            ThresholdSpec::new("payment_processing", "rate>0.03").unwrap(),
            ThresholdSpec::new("errors", "p(95)<1").unwrap(),
        ];
        let verdicts = evaluate(&snapshot(), &thresholds);
        assert_eq!(verdicts.len(), thresholds.len());
        assert_eq!(verdicts[0].outcome, ThresholdOutcome::Passed { observed: 0.2 });
        assert_eq!(verdicts[1].outcome, ThresholdOutcome::Failed { observed: 0.2 });
        assert_eq!(verdicts[2].outcome, ThresholdOutcome::Passed { observed: 800.0 });
        assert_eq!(verdicts[3].outcome, ThresholdOutcome::Failed { observed: 900.0 });
        assert!(verdicts[4].passed());
        // A metric nothing recorded is reported, not failed.
        assert!(!verdicts[5].is_evaluable());
        assert!(!verdicts[5].failed());
        // So is a percentile of a rate.
        assert!(!verdicts[6].is_evaluable());
        assert_eq!(verdicts[1].expression, "rate<0.1");
    }

    #[test]
    fn evaluation_is_pure() {
        let snapshot = snapshot();
        let thresholds = vec![
            ThresholdSpec::new("errors", "rate<0.1").unwrap(),
            ThresholdSpec::new(HTTP_REQ_DURATION, "avg<1000").unwrap(),
        ];
        assert_eq!(
            evaluate(&snapshot, &thresholds),
            evaluate(&snapshot, &thresholds)
        );
    }

    #[test]
    fn verdict_display() {
        let verdicts = evaluate(
            &snapshot(),
            &[ThresholdSpec::new("errors", "rate<0.1").unwrap()],
        );
        assert_eq!(verdicts[0].to_string(), "✗ errors: rate<0.1 (observed 0.2)");
    }
}
