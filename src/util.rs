//! Utility functions used by Skein, and available when writing load tests.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serializer};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::SkeinError;

lazy_static! {
    static ref TIMESPAN_COMPONENT: Regex =
        Regex::new(r"(?P<value>\d+(?:\.\d+)?)(?P<unit>ms|h|m|s)").expect("valid timespan regex");
    // Incremented once per ctrl-c; every running load test watches it.
    static ref CTRLC: watch::Sender<usize> = watch::channel(0).0;
}

static CTRLC_INSTALL: Once = Once::new();
static CTRLC_PENDING: AtomicBool = AtomicBool::new(false);

/// Parse a string representing a time span.
///
/// Can be specified as an integer, indicating seconds. Or can use numbers
/// together with one or more of "h", "m", "s" and "ms", indicating hours,
/// minutes, seconds and milliseconds. Returns `None` if the string is not a
/// valid time span.
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 500ms, 1.5s, etc.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use skein::util;
///
/// // 1 hour 2 minutes and 3 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // A bare integer is seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Milliseconds.
/// assert_eq!(util::parse_timespan("250ms"), Some(Duration::from_millis(250)));
///
/// // Invalid value.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return None;
    }
    // If an integer is passed in, assume it's seconds
    if let Ok(seconds) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, seconds);
        return Some(Duration::from_secs(seconds));
    }

    let mut consumed = 0;
    let mut total = 0.0_f64;
    for captures in TIMESPAN_COMPONENT.captures_iter(time_str) {
        let whole = captures.get(0)?;
        // Components must be contiguous, "1m foo 3s" is not a time span.
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let value = f64::from_str(&captures["value"]).ok()?;
        total += match &captures["unit"] {
            "h" => value * 3_600.0,
            "m" => value * 60.0,
            "s" => value,
            _ => value / 1_000.0,
        };
    }
    if consumed != time_str.len() {
        return None;
    }
    trace!("{}: {} seconds", time_str, total);
    Some(Duration::from_secs_f64(total))
}

/// Format a duration the way [`parse_timespan`] reads it, for example `1m30s`
/// or `250ms`.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use skein::util;
///
/// assert_eq!(util::format_timespan(Duration::from_secs(90)), "1m30s");
/// assert_eq!(util::format_timespan(Duration::from_millis(1_250)), "1s250ms");
/// assert_eq!(util::format_timespan(Duration::from_secs(0)), "0s");
/// ```
pub fn format_timespan(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;

    let mut formatted = String::new();
    if hours > 0 {
        formatted.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        formatted.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        formatted.push_str(&format!("{}s", seconds));
    }
    if millis > 0 {
        formatted.push_str(&format!("{}ms", millis));
    }
    formatted
}

/// Serde helpers so durations in the scenario table can be written as time
/// spans (`"2m"`) or as an integer number of seconds.
pub(crate) mod timespan {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    fn from_raw<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            Raw::Text(text) => parse_timespan(&text)
                .ok_or_else(|| E::custom(format!("invalid time span: {:?}", text))),
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timespan(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.serialize_str(&format_timespan(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                Some(raw) => from_raw(raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

/// Returns a [`SkeinError::InvalidHost`] if the host can not be parsed as a URL.
///
/// # Example
/// ```rust
/// use skein::util;
///
/// assert!(util::is_valid_host("http://localhost:8080").is_ok());
/// assert!(util::is_valid_host("localhost").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, SkeinError> {
    Url::parse(host).map_err(|parse_error| SkeinError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

// Install the process-wide control-c handler. The first ctrl-c asks every running
// load test to stop; another ctrl-c before that run finishes exits abruptly.
pub(crate) fn setup_ctrlc_handler() {
    CTRLC_PENDING.store(false, Ordering::SeqCst);
    CTRLC_INSTALL.call_once(|| {
        if let Err(e) = ctrlc::set_handler(move || {
            if CTRLC_PENDING.swap(true, Ordering::SeqCst) {
                warn!("caught another ctrl-c, exiting immediately...");
                std::process::exit(1);
            }
            warn!("caught ctrl-c, stopping...");
            CTRLC.send_modify(|count| *count += 1);
        }) {
            info!("failed to set ctrl-c handler: {}", e);
        }
    });
}

// A receiver that changes each time ctrl-c is caught.
pub(crate) fn ctrlc_receiver() -> watch::Receiver<usize> {
    CTRLC.subscribe()
}

// Called once a load test has finished shutting down, so a later ctrl-c is
// treated as a first ctrl-c again.
pub(crate) fn reset_ctrlc() {
    CTRLC_PENDING.store(false, Ordering::SeqCst);
}
