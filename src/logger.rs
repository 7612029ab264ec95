//! Optional sample log.
//!
//! The sample log is enabled with the `--sample-log` command-line option, or the
//! [`SkeinDefault::SampleLog`](../config/enum.SkeinDefault.html#variant.SampleLog)
//! default configuration option. When enabled, the [`MetricsCollector`] forwards a
//! copy of every recorded [`Sample`] over an unbounded channel to a logger task,
//! which writes them to file through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html). Virtual
//! users never wait on the file.
//!
//! The format is configured with `--sample-format`:
//!  - `json` (default): one JSON object per line;
//!  - `csv`: a header line, then one line per sample with tags as `key=value|key=value`;
//!  - `raw`: the `Debug` representation of the sample.
//!
//! [`MetricsCollector`]: ../metrics/struct.MetricsCollector.html

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use strum_macros::{Display, EnumString};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::task::JoinHandle;

use crate::metrics::Sample;
use crate::SkeinError;

/// Formats the sample log can be written in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Json,
    Csv,
    Raw,
}
impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::Json
    }
}

const CSV_HEADER: &str = "offset_ms,metric,kind,value,tags";

// Quote a field holding a separator, a quote or a line break, doubling quotes.
fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn format_csv(sample: &Sample) -> String {
    let tags = sample
        .tags
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("|");
    format!(
        "{},{},{},{},{}",
        sample.offset.as_millis(),
        csv_field(&sample.metric),
        sample.kind,
        sample.value,
        csv_field(&tags)
    )
}

/// Format one sample as a line of the sample log.
pub(crate) fn format_sample(sample: &Sample, format: SampleFormat) -> String {
    match format {
        // Use serde_json to create JSON.
        SampleFormat::Json => json!(sample).to_string(),
        SampleFormat::Csv => format_csv(sample),
        // Raw format is Debug output for the Sample structure.
        SampleFormat::Raw => format!("{:?}", sample),
    }
}

/// A running sample logger: the channel the collector forwards to, and the task
/// draining it.
pub(crate) struct SampleLogger {
    pub(crate) sender: flume::Sender<Sample>,
    pub(crate) task: JoinHandle<Result<(), SkeinError>>,
}
impl SampleLogger {
    /// Create the log file and start the logger task.
    pub(crate) async fn start(path: &str, format: SampleFormat) -> Result<Self, SkeinError> {
        let file = File::create(path).await?;
        info!("writing samples to sample_log: {}", path);

        let (sender, receiver) = flume::unbounded();
        let path = path.to_string();
        let task = tokio::spawn(logger_main(path, format, BufWriter::new(file), receiver));
        Ok(SampleLogger { sender, task })
    }

    /// Close the channel and wait for everything to be flushed to disk.
    pub(crate) async fn finish(self) -> Result<(), SkeinError> {
        drop(self.sender);
        self.task.await?
    }
}

async fn logger_main(
    path: String,
    format: SampleFormat,
    mut file: BufWriter<File>,
    receiver: flume::Receiver<Sample>,
) -> Result<(), SkeinError> {
    if format == SampleFormat::Csv {
        file.write_all(format!("{}\n", CSV_HEADER).as_bytes()).await?;
    }

    // Loop until every sender, the collector included, is dropped.
    let mut failed_writes: usize = 0;
    while let Ok(sample) = receiver.recv_async().await {
        let formatted = format_sample(&sample, format);
        if let Err(e) = file.write_all(format!("{}\n", formatted).as_bytes()).await {
            failed_writes += 1;
            if failed_writes == 1 {
                warn!("failed to write to {}: {}", path, e);
            } else {
                debug!("failed to write to {} ({} failures): {}", path, failed_writes, e);
            }
        }
    }
    if failed_writes > 1 {
        warn!("{} samples could not be written to {}", failed_writes, path);
    }

    info!("flushing sample_log: {}", path);
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    fn sample() -> Sample {
        Sample::rate("checks", true)
            .at(Duration::from_millis(1_500))
            .with_tag("scenario", "warmup")
            .with_tag("check", "products list loaded")
    }

    #[test]
    fn formats() {
        assert_eq!(SampleFormat::from_str("csv").unwrap(), SampleFormat::Csv);
        assert!(SampleFormat::from_str("pretty").is_err());

        assert_eq!(
            format_sample(&sample(), SampleFormat::Csv),
            "1500,checks,rate,1,check=products list loaded|scenario=warmup"
        );

        let quoted = Sample::rate("checks", false)
            .at(Duration::from_millis(20))
            .with_tag("check", "status is 200, body \"ok\"")
            .with_tag("scenario", "warmup");
        assert_eq!(
            format_sample(&quoted, SampleFormat::Csv),
            "20,checks,rate,0,\"check=status is 200, body \"\"ok\"\"|scenario=warmup\""
        );

        let json: serde_json::Value =
            serde_json::from_str(&format_sample(&sample(), SampleFormat::Json)).unwrap();
        assert_eq!(json["metric"], "checks");
        assert_eq!(json["kind"], "rate");
        assert_eq!(json["offset"], 1_500);
        assert_eq!(json["tags"]["scenario"], "warmup");

        assert!(format_sample(&sample(), SampleFormat::Raw).starts_with("Sample {"));
    }
}
