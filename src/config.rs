//! Functions and structures related to configuring a Skein load test.
//!
//! Skein can be configured at run time by passing in the options and flags defined by
//! the [`SkeinConfiguration`] structure.
//!
//! Skein can be configured programmatically with [`SkeinDefaultType::set_default`].
//!
//! Values are resolved in this order: the command line, then the environment
//! (`BASE_URL` for the host, `SCENARIO` for the scenario selector), then defaults set
//! with [`SkeinDefaultType::set_default`], then Skein's own defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::logger::SampleFormat;
use crate::util;
use crate::{LoadTest, SkeinError};

/// Environment variable consulted when `--host` is not set.
pub const BASE_URL_ENV: &str = "BASE_URL";
/// Environment variable consulted when `--scenarios` is not set.
pub const SCENARIO_ENV: &str = "SCENARIO";

pub(crate) const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Runtime options available when launching a Skein load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`SkeinDefaultType::set_default`].
///
/// Skein leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// below structure, displayed when passing `-h`.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Skein runs concurrent load generation scenarios (ramping and constant virtual
users, per-VU iteration batches, open-model arrival rates) and checks the
aggregated metrics against thresholds.

The following runtime options are available when launching a Skein load test:"#
)]
pub struct SkeinConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all scenarios and exits\n")]
    pub list: bool,

    /// Defines base URL requests are resolved against (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Limits the run to these scenarios (comma separated)
    #[options(short = "s", meta = "LIST")]
    pub scenarios: String,
    /// Loads scenarios and thresholds from a JSON scenario table
    #[options(short = "c", meta = "PATH")]
    pub config: String,
    /// Stops all scenarios after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Time in-flight iterations get to finish when a scenario stops (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub graceful_stop: String,
    /// How often ramping executors adjust their virtual users (default: 100ms)
    #[options(no_short, meta = "TIME")]
    pub tick: String,
    // Add a blank line and then a 'Metrics:' header after this option
    #[options(
        no_short,
        meta = "N",
        help = "Seeds every virtual user's random number generator\n\nMetrics:"
    )]
    pub seed: Option<u64>,

    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Writes the run result as JSON to this file
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
    /// Sets sample log file name
    #[options(no_short, meta = "NAME")]
    pub sample_log: String,
    // Add a blank line and then a 'Logging:' header after this option
    #[options(
        no_short,
        meta = "FORMAT",
        help = "Sets sample log format (json, csv, raw)\n\nLogging:"
    )]
    pub sample_format: Option<SampleFormat>,

    /// Enables log file and sets name
    #[options(no_short, meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// Skein's optional default configuration, set with [`SkeinDefaultType::set_default`].
#[derive(Clone, Debug, Default)]
pub(crate) struct SkeinDefaults {
    pub(crate) host: Option<String>,
    pub(crate) scenarios: Option<String>,
    pub(crate) config: Option<String>,
    pub(crate) run_time: Option<String>,
    pub(crate) graceful_stop: Option<String>,
    pub(crate) tick: Option<String>,
    pub(crate) seed: Option<u64>,
    pub(crate) no_print_metrics: Option<bool>,
    pub(crate) report_file: Option<String>,
    pub(crate) sample_log: Option<String>,
    pub(crate) sample_format: Option<SampleFormat>,
    pub(crate) log_file: Option<String>,
    pub(crate) log_level: Option<u8>,
    pub(crate) quiet: Option<u8>,
    pub(crate) verbose: Option<u8>,
}

/// Defaults that can be set programmatically.
///
/// # Example
/// ```rust
/// use skein::prelude::*;
///
/// fn main() -> Result<(), SkeinError> {
///     LoadTest::initialize_with_config(SkeinConfiguration::default())?
///         .set_default(SkeinDefault::Host, "http://localhost:8080")?
///         .set_default(SkeinDefault::GracefulStop, "5s")?
///         .set_default(SkeinDefault::NoPrintMetrics, true)?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkeinDefault {
    /// Base URL requests are resolved against.
    Host,
    /// Comma separated scenario selector.
    Scenarios,
    /// Path of a JSON scenario table.
    Config,
    /// Global deadline.
    RunTime,
    /// Default graceful stop for scenarios.
    GracefulStop,
    /// Scheduling tick of the ramping executors.
    Tick,
    /// Base seed for virtual user random number generators.
    Seed,
    /// Don't print metrics at the end of the run.
    NoPrintMetrics,
    /// JSON report file.
    ReportFile,
    /// Sample log file.
    SampleLog,
    /// Sample log format.
    SampleFormat,
    /// Log file.
    LogFile,
    /// Log file level.
    LogLevel,
    /// Console quietness.
    Quiet,
    /// Console verbosity.
    Verbose,
}

/// Set a default of a given type.
pub trait SkeinDefaultType<T> {
    fn set_default(self, key: SkeinDefault, value: T) -> Result<Self, SkeinError>
    where
        Self: Sized;
}

fn wrong_type(key: SkeinDefault, value: &dyn Debug, expected: &str) -> SkeinError {
    SkeinError::InvalidOption {
        option: format!("SkeinDefault::{:?}", key),
        value: format!("{:?}", value),
        detail: format!(
            "set_default(SkeinDefault::{:?}, {:?}) expected {} value",
            key, value, expected
        ),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl SkeinDefaultType<&str> for LoadTest {
    fn set_default(mut self, key: SkeinDefault, value: &str) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::Host => self.defaults.host = non_empty(value),
            SkeinDefault::Scenarios => self.defaults.scenarios = non_empty(value),
            SkeinDefault::Config => self.defaults.config = non_empty(value),
            SkeinDefault::RunTime => self.defaults.run_time = non_empty(value),
            SkeinDefault::GracefulStop => self.defaults.graceful_stop = non_empty(value),
            SkeinDefault::Tick => self.defaults.tick = non_empty(value),
            SkeinDefault::ReportFile => self.defaults.report_file = non_empty(value),
            SkeinDefault::SampleLog => self.defaults.sample_log = non_empty(value),
            SkeinDefault::LogFile => self.defaults.log_file = non_empty(value),
            SkeinDefault::SampleFormat => {
                self.defaults.sample_format =
                    Some(value.parse::<SampleFormat>().map_err(|e| {
                        SkeinError::InvalidOption {
                            option: "SkeinDefault::SampleFormat".to_string(),
                            value: value.to_string(),
                            detail: e.to_string(),
                        }
                    })?)
            }
            SkeinDefault::Seed
            | SkeinDefault::LogLevel
            | SkeinDefault::Quiet
            | SkeinDefault::Verbose => return Err(wrong_type(key, &value, "usize")),
            SkeinDefault::NoPrintMetrics => return Err(wrong_type(key, &value, "bool")),
        }
        Ok(self)
    }
}
impl SkeinDefaultType<usize> for LoadTest {
    fn set_default(mut self, key: SkeinDefault, value: usize) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::Seed => self.defaults.seed = Some(value as u64),
            SkeinDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            SkeinDefault::Quiet => self.defaults.quiet = Some(value as u8),
            SkeinDefault::Verbose => self.defaults.verbose = Some(value as u8),
            SkeinDefault::NoPrintMetrics => return Err(wrong_type(key, &value, "bool")),
            _ => return Err(wrong_type(key, &value, "&str")),
        }
        Ok(self)
    }
}
impl SkeinDefaultType<bool> for LoadTest {
    fn set_default(mut self, key: SkeinDefault, value: bool) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            SkeinDefault::Seed
            | SkeinDefault::LogLevel
            | SkeinDefault::Quiet
            | SkeinDefault::Verbose => return Err(wrong_type(key, &value, "usize")),
            _ => return Err(wrong_type(key, &value, "&str")),
        }
        Ok(self)
    }
}
impl SkeinDefaultType<SampleFormat> for LoadTest {
    fn set_default(mut self, key: SkeinDefault, value: SampleFormat) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::SampleFormat => self.defaults.sample_format = Some(value),
            _ => return Err(wrong_type(key, &value, "a matching")),
        }
        Ok(self)
    }
}

/// One candidate for a configuration value.
pub(crate) struct ConfigValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Skip this candidate if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

/// Return the first candidate that is set and not filtered.
pub(crate) fn get_value<T: Debug>(values: Vec<ConfigValue<T>>) -> Option<T> {
    for value in values {
        if let Some(v) = value.value {
            if value.filter {
                continue;
            }
            if !value.message.is_empty() {
                info!("{} = {:?}", value.message, v)
            }
            return Some(v);
        }
    }
    None
}

// Resolve a string option from the command line, an optional environment
// variable, then the programmatic default.
fn resolve_string(cli: &str, env: Option<&str>, default: &Option<String>, message: &str) -> String {
    let from_env = env.and_then(|name| std::env::var(name).ok());
    get_value(vec![
        ConfigValue {
            value: Some(cli.to_string()),
            filter: cli.is_empty(),
            message: "",
        },
        ConfigValue {
            filter: from_env.as_deref().map_or(true, str::is_empty),
            value: from_env,
            message,
        },
        ConfigValue {
            value: default.clone(),
            filter: default.is_none(),
            message,
        },
    ])
    .unwrap_or_default()
}

fn resolve_count(cli: u8, default: Option<u8>) -> u8 {
    get_value(vec![
        ConfigValue {
            value: Some(cli),
            filter: cli == 0,
            message: "",
        },
        ConfigValue {
            value: default,
            filter: default.is_none(),
            message: "",
        },
    ])
    .unwrap_or(0)
}

/// Typed settings derived from a validated [`SkeinConfiguration`].
#[derive(Clone, Debug)]
pub(crate) struct RunSettings {
    pub(crate) host: Option<Url>,
    pub(crate) scenarios: Vec<String>,
    pub(crate) run_time: Option<Duration>,
    pub(crate) graceful_stop: Duration,
    pub(crate) tick: Duration,
    pub(crate) seed: Option<u64>,
}

impl SkeinConfiguration {
    /// Merge programmatic defaults and environment into the configuration.
    pub(crate) fn configure(&mut self, defaults: &SkeinDefaults) {
        self.quiet = resolve_count(self.quiet, defaults.quiet);
        self.verbose = resolve_count(self.verbose, defaults.verbose);
        self.log_level = resolve_count(self.log_level, defaults.log_level);
        self.log_file = resolve_string(&self.log_file, None, &defaults.log_file, "log_file");

        // Configure the logger before anything else gets logged.
        self.initialize_logger();

        self.host = resolve_string(&self.host, Some(BASE_URL_ENV), &defaults.host, "host");
        self.scenarios = resolve_string(
            &self.scenarios,
            Some(SCENARIO_ENV),
            &defaults.scenarios,
            "scenarios",
        );
        self.config = resolve_string(&self.config, None, &defaults.config, "config");
        self.run_time = resolve_string(&self.run_time, None, &defaults.run_time, "run_time");
        self.graceful_stop = resolve_string(
            &self.graceful_stop,
            None,
            &defaults.graceful_stop,
            "graceful_stop",
        );
        self.tick = resolve_string(&self.tick, None, &defaults.tick, "tick");
        self.report_file =
            resolve_string(&self.report_file, None, &defaults.report_file, "report_file");
        self.sample_log = resolve_string(&self.sample_log, None, &defaults.sample_log, "sample_log");

        self.seed = get_value(vec![
            ConfigValue {
                value: self.seed,
                filter: self.seed.is_none(),
                message: "",
            },
            ConfigValue {
                value: defaults.seed,
                filter: defaults.seed.is_none(),
                message: "seed",
            },
        ]);
        self.sample_format = get_value(vec![
            ConfigValue {
                value: self.sample_format,
                filter: self.sample_format.is_none(),
                message: "",
            },
            ConfigValue {
                value: defaults.sample_format,
                filter: defaults.sample_format.is_none(),
                message: "sample_format",
            },
        ]);
        self.no_print_metrics = get_value(vec![
            ConfigValue {
                value: Some(self.no_print_metrics),
                filter: !self.no_print_metrics,
                message: "",
            },
            ConfigValue {
                value: defaults.no_print_metrics,
                filter: defaults.no_print_metrics.is_none(),
                message: "no_print_metrics",
            },
        ])
        .unwrap_or(false);
    }

    /// Validate the configured values and convert them to typed settings.
    pub(crate) fn validate(&self) -> Result<RunSettings, SkeinError> {
        let timespan = |option: &str, value: &str| -> Result<Option<Duration>, SkeinError> {
            if value.is_empty() {
                return Ok(None);
            }
            util::parse_timespan(value)
                .map(Some)
                .ok_or_else(|| SkeinError::InvalidOption {
                    option: option.to_string(),
                    value: value.to_string(),
                    detail: format!("{} expects a time span such as 30s, 20m or 1h30m.", option),
                })
        };

        let host = if self.host.is_empty() {
            None
        } else {
            util::is_valid_host(&self.host)?;
            // Only a base ending in '/' keeps its last path segment when joining.
            let mut host = self.host.clone();
            if !host.ends_with('/') {
                host.push('/');
            }
            Url::parse(&host).ok()
        };

        let run_time = timespan("--run-time", &self.run_time)?;
        let graceful_stop =
            timespan("--graceful-stop", &self.graceful_stop)?.unwrap_or(DEFAULT_GRACEFUL_STOP);
        let tick = timespan("--tick", &self.tick)?.unwrap_or(DEFAULT_TICK);
        if tick == Duration::from_secs(0) {
            return Err(SkeinError::InvalidOption {
                option: "--tick".to_string(),
                value: self.tick.clone(),
                detail: "--tick must be greater than zero.".to_string(),
            });
        }

        if self.sample_format.is_some() && self.sample_log.is_empty() {
            return Err(SkeinError::InvalidOption {
                option: "--sample-format".to_string(),
                value: format!("{:?}", self.sample_format),
                detail: "--sample-format requires --sample-log.".to_string(),
            });
        }

        let scenarios = self
            .scenarios
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Ok(RunSettings {
            host,
            scenarios,
            run_time,
            graceful_stop,
            tick,
            seed: self.seed,
        })
    }

    /// Configure the console logger and the optional log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        let mut log_file_error = None;
        if !self.log_file.is_empty() {
            let log_to_file = PathBuf::from(&self.log_file);
            match std::fs::File::create(&log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => log_file_error = Some((log_to_file, e)),
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }
        if let Some((path, e)) = log_file_error {
            warn!("failed to create log file {}: {}", path.display(), e);
        } else if !self.log_file.is_empty() {
            info!("Writing to log file: {}", self.log_file);
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_options() {
        let config = SkeinConfiguration::parse_args_default(&[
            "--host",
            "http://localhost:8080",
            "-s",
            "warmup, flash_sale",
            "--run-time",
            "15m",
            "--graceful-stop",
            "10s",
            "--seed",
            "42",
            "--sample-log",
            "samples.csv",
            "--sample-format",
            "csv",
            "-vv",
        ])
        .unwrap();
        assert_eq!(config.verbose, 2);
        assert_eq!(config.sample_format, Some(SampleFormat::Csv));

        let settings = config.validate().unwrap();
        assert_eq!(settings.host.unwrap().as_str(), "http://localhost:8080/");
        assert_eq!(settings.scenarios, vec!["warmup", "flash_sale"]);
        assert_eq!(settings.run_time, Some(Duration::from_secs(900)));
        assert_eq!(settings.graceful_stop, Duration::from_secs(10));
        assert_eq!(settings.tick, DEFAULT_TICK);
        assert_eq!(settings.seed, Some(42));
    }

    #[test]
    fn invalid_options() {
        let config = SkeinConfiguration::parse_args_default(&["--run-time", "soon"]).unwrap();
        assert!(config.validate().unwrap_err().is_config_error());

        let config = SkeinConfiguration::parse_args_default(&["--tick", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config = SkeinConfiguration::parse_args_default(&["--host", "localhost"]).unwrap();
        assert!(config.validate().is_err());

        let config = SkeinConfiguration::parse_args_default(&["--sample-format", "raw"]).unwrap();
        assert!(config.validate().is_err());

        assert!(SkeinConfiguration::parse_args_default(&["--sample-format", "xml"]).is_err());
    }

    #[test]
    fn first_set_value_wins() {
        let value = get_value(vec![
            ConfigValue {
                value: Some(1),
                filter: true,
                message: "",
            },
            ConfigValue {
                value: None,
                filter: false,
                message: "",
            },
            ConfigValue {
                value: Some(3),
                filter: false,
                message: "",
            },
        ]);
        assert_eq!(value, Some(3));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let defaults = SkeinDefaults {
            run_time: Some("2m".to_string()),
            tick: Some("250ms".to_string()),
            seed: Some(7),
            no_print_metrics: Some(true),
            ..Default::default()
        };
        let mut config =
            SkeinConfiguration::parse_args_default(&["--run-time", "30s"]).unwrap();
        config.configure(&defaults);
        let settings = config.validate().unwrap();
        // The command line beats the default.
        assert_eq!(settings.run_time, Some(Duration::from_secs(30)));
        assert_eq!(settings.tick, Duration::from_millis(250));
        assert_eq!(settings.seed, Some(7));
        assert!(config.no_print_metrics);
    }
}
