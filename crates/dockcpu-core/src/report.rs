//! Presentation of a finished measurement.
//!
//! Pure formatting only; printing is left to the binary.

use std::time::Duration;

use serde::Serialize;

use crate::sampler::{Measurement, Outcome, StopReason};

/// JSON view of a [`Measurement`].
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub container: &'a str,
    pub container_id: &'a str,
    /// RFC 3339 start time.
    pub started_at: String,
    pub requested_secs: f64,
    pub elapsed_secs: f64,
    pub stop: &'static str,
    pub records: usize,
    pub skipped: usize,
    pub readings: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl<'a> From<&'a Measurement> for Report<'a> {
    fn from(m: &'a Measurement) -> Self {
        let summary = match m.outcome {
            Outcome::Mean(s) => Some(s),
            Outcome::NoData => None,
        };
        Self {
            container: &m.container,
            container_id: &m.container_id,
            started_at: m.started_at.to_rfc3339(),
            requested_secs: m.requested.as_secs_f64(),
            elapsed_secs: m.elapsed.as_secs_f64(),
            stop: m.stop.as_str(),
            records: m.records,
            skipped: m.skipped,
            readings: m.readings.len(),
            mean: summary.map(|s| s.mean),
            min: summary.map(|s| s.min),
            max: summary.map(|s| s.max),
        }
    }
}

/// Renders the measurement as JSON.
pub fn render_json(m: &Measurement) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&Report::from(m))
}

/// Renders the measurement as text.
///
/// With `detail`, an extra line lists counts, range and elapsed time.
pub fn render_text(m: &Measurement, detail: bool) -> String {
    let mut out = String::new();
    if m.stop == StopReason::Interrupted {
        out.push_str("Interrupted by user\n");
    }

    match m.outcome {
        Outcome::Mean(summary) => {
            out.push_str(&format!(
                "Monitor container '{}' over {} seconds\n",
                m.container,
                format_seconds(m.requested)
            ));
            out.push_str(&format!("Average CPU usage: {:.2}%\n", summary.mean));
            if detail {
                out.push_str(&format!(
                    "Readings: {} of {} records (min {:.2}%, max {:.2}%), elapsed {}\n",
                    summary.count,
                    m.records,
                    summary.min,
                    summary.max,
                    format_duration(m.elapsed)
                ));
            }
        }
        Outcome::NoData => {
            out.push_str("No CPU usage data collected.\n");
            if detail {
                out.push_str(&format!(
                    "Records: {} ({} skipped), elapsed {}\n",
                    m.records,
                    m.skipped,
                    format_duration(m.elapsed)
                ));
            }
        }
    }
    out
}

/// `"55"` for whole seconds, `"1.5"` otherwise.
pub fn format_seconds(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}

/// Human-readable duration: `"850ms"`, `"42s"`, `"3m 5s"`, `"2h 10m"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        format!("{}ms", d.subsec_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
