//! CPU usage sampler.
//!
//! Follows a container's stats stream for a fixed window, turns each record
//! into a CPU percentage and reports the mean of the collected readings.
//!
//! The loop runs on the calling thread. Every wait (for the next record, or
//! the throttle pause after a reading) is sliced into `poll_interval` steps
//! that re-check the cancellation token and the deadline, so the window is
//! closed by the clock even when the daemon goes quiet.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::sample::DecodeError;
use crate::source::{Frame, SourceError, StatsSource, StatsStream};

/// Default pause between processed records.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Longest single wait before deadline and cancellation are re-checked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for a measurement run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureError {
    ContainerNotFound(String),
    ContainerNotRunning(String),
    /// Stats source unreachable, refused the request, or the stream broke.
    Connection(String),
    MalformedSample(String),
}

impl std::fmt::Display for MeasureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasureError::ContainerNotFound(id) => write!(f, "container not found: {}", id),
            MeasureError::ContainerNotRunning(id) => write!(f, "container not running: {}", id),
            MeasureError::Connection(msg) => write!(f, "stats source error: {}", msg),
            MeasureError::MalformedSample(msg) => write!(f, "malformed sample: {}", msg),
        }
    }
}

impl std::error::Error for MeasureError {}

impl From<SourceError> for MeasureError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound(id) => MeasureError::ContainerNotFound(id),
            SourceError::NotRunning(id) => MeasureError::ContainerNotRunning(id),
            SourceError::Connection(msg) => MeasureError::Connection(msg),
            api @ SourceError::Api { .. } => MeasureError::Connection(api.to_string()),
            SourceError::Malformed(msg) => MeasureError::MalformedSample(msg),
        }
    }
}

impl From<DecodeError> for MeasureError {
    fn from(e: DecodeError) -> Self {
        MeasureError::MalformedSample(e.0)
    }
}

/// Sampler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Observation window.
    pub duration: Duration,
    /// Pause after each reading.
    pub throttle: Duration,
    pub poll_interval: Duration,
}

impl SamplerConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            throttle: DEFAULT_THROTTLE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the wait slice. Zero is raised to one millisecond.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }
}

/// Why the sampling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    /// The daemon closed the stream, e.g. because the container stopped.
    StreamClosed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::Interrupted => "interrupted",
            StopReason::StreamClosed => "stream_closed",
        }
    }
}

/// Aggregate over the collected readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl CpuSummary {
    /// Returns `None` for an empty slice.
    pub fn from_readings(readings: &[f64]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let sum: f64 = readings.iter().sum();
        let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
        let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: readings.len(),
            mean: sum / readings.len() as f64,
            min,
            max,
        })
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Mean(CpuSummary),
    /// No record produced a reading.
    NoData,
}

/// Result of one measurement run.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Identifier as given by the caller.
    pub container: String,
    pub container_id: String,
    pub started_at: DateTime<Utc>,
    pub requested: Duration,
    pub elapsed: Duration,
    pub stop: StopReason,
    /// Records received inside the window.
    pub records: usize,
    /// Records that produced no reading.
    pub skipped: usize,
    pub readings: Vec<f64>,
    pub outcome: Outcome,
}

/// Measures average CPU usage of `container` over `config.duration`.
///
/// Returns `Outcome::NoData` rather than an error when nothing could be
/// computed. Cancellation through `cancel` ends the run early with the
/// readings gathered so far. Source and decoding failures are fatal.
pub fn measure<S: StatsSource>(
    source: &mut S,
    container: &str,
    config: &SamplerConfig,
    cancel: &CancelToken,
) -> Result<Measurement, MeasureError> {
    let handle = source.resolve(container)?;
    debug!("Resolved {} to {}", container, handle.id);

    let mut stream = source.open(&handle)?;
    info!(
        "Monitoring container '{}' for {:.1}s",
        container,
        config.duration.as_secs_f64()
    );

    let started_at = Utc::now();
    let start = Instant::now();
    // None when the window is too long to be represented as an instant.
    let deadline = start.checked_add(config.duration);

    let mut readings: Vec<f64> = Vec::new();
    let mut records = 0usize;
    let mut skipped = 0usize;

    let stop = loop {
        if cancel.is_cancelled() {
            break StopReason::Interrupted;
        }
        let elapsed = start.elapsed();
        if elapsed >= config.duration {
            break StopReason::DurationElapsed;
        }

        let wait = (config.duration - elapsed).min(config.poll_interval);
        let record = match stream.next_frame(wait)? {
            Frame::Pending => continue,
            Frame::Closed => break StopReason::StreamClosed,
            Frame::Record(record) => record,
        };

        if start.elapsed() > config.duration {
            break StopReason::DurationElapsed;
        }
        records += 1;

        let sample = record.decode()?;
        match sample.cpu_percent() {
            Ok(percent) => {
                debug!("Sample #{}: {:.2}%", records, percent);
                readings.push(percent);
                pause(config.throttle, deadline, config.poll_interval, cancel);
            }
            Err(reason) => {
                skipped += 1;
                debug!("Sample #{} skipped: {}", records, reason);
            }
        }
    };

    let elapsed = start.elapsed();
    match stop {
        StopReason::Interrupted => warn!("Interrupted after {} readings", readings.len()),
        StopReason::StreamClosed => warn!("Stats stream closed by the daemon"),
        StopReason::DurationElapsed => {}
    }
    info!(
        "Collected {} readings from {} records in {:.1}s",
        readings.len(),
        records,
        elapsed.as_secs_f64()
    );

    let outcome = CpuSummary::from_readings(&readings).map_or(Outcome::NoData, Outcome::Mean);

    Ok(Measurement {
        container: container.to_string(),
        container_id: handle.id,
        started_at,
        requested: config.duration,
        elapsed,
        stop,
        records,
        skipped,
        readings,
        outcome,
    })
}

/// Sleeps for `throttle`, returning early on cancellation or at `deadline`.
fn pause(throttle: Duration, deadline: Option<Instant>, slice: Duration, cancel: &CancelToken) {
    let mut remaining = match deadline {
        Some(deadline) => throttle.min(deadline.saturating_duration_since(Instant::now())),
        None => throttle,
    };
    while remaining > Duration::ZERO && !cancel.is_cancelled() {
        let sleep_time = remaining.min(slice);
        std::thread::sleep(sleep_time);
        remaining = remaining.saturating_sub(sleep_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{CpuCounters, StatsRecord};
    use crate::source::mock::{MockSource, MockStep, stats_record, steady_steps};

    fn fast_config(duration: Duration) -> SamplerConfig {
        SamplerConfig::new(duration)
            .with_throttle(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(5))
    }

    /// Record reading `cpu_delta / 10` percent on one CPU.
    fn percent_record(base: u64, cpu_delta: u64) -> MockStep {
        let prior = CpuCounters {
            cpu_total_usage: base,
            system_total_usage: Some(base * 10),
            online_cpu_count: Some(1),
        };
        let current = CpuCounters {
            cpu_total_usage: base + cpu_delta,
            system_total_usage: Some(base * 10 + 1_000),
            online_cpu_count: Some(1),
        };
        MockStep::Record(stats_record(prior, current))
    }

    fn run(source: &mut MockSource, config: &SamplerConfig) -> Measurement {
        measure(source, "web", config, &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_steady_stream() {
        let mut source = MockSource::steady_load("web", 5, 25.0, 4);
        let m = run(&mut source, &fast_config(Duration::from_secs(10)));

        assert_eq!(m.stop, StopReason::StreamClosed);
        assert_eq!(m.records, 5);
        assert_eq!(m.skipped, 1);
        // first record has no prior system counter
        assert_eq!(m.readings.len(), 4);
        let Outcome::Mean(summary) = m.outcome else {
            panic!("expected a mean, got {:?}", m.outcome);
        };
        assert_eq!(summary.count, 4);
        assert!((summary.mean - 25.0).abs() < 1e-6);
        assert_eq!(m.container, "web");
        assert_eq!(m.container_id, "mock-web");
    }

    #[test]
    fn test_mean_of_known_readings() {
        let mut source = MockSource::new();
        source.add_container(
            "web",
            vec![
                percent_record(1_000, 100),
                percent_record(2_000, 200),
                percent_record(3_000, 300),
            ],
        );
        let m = run(&mut source, &fast_config(Duration::from_secs(10)));

        assert_eq!(m.readings.len(), 3);
        assert!((m.readings[0] - 10.0).abs() < 1e-9);
        assert!((m.readings[2] - 30.0).abs() < 1e-9);
        let Outcome::Mean(summary) = m.outcome else {
            panic!("expected a mean");
        };
        assert!((summary.mean - 20.0).abs() < 1e-9);
        assert!((summary.min - 10.0).abs() < 1e-9);
        assert!((summary.max - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_system_progress_yields_no_reading() {
        let flat = CpuCounters {
            cpu_total_usage: 100,
            system_total_usage: Some(5_000),
            online_cpu_count: Some(2),
        };
        let mut source = MockSource::new();
        source.add_container(
            "web",
            vec![
                MockStep::Record(stats_record(flat, flat)),
                MockStep::Record(stats_record(flat, flat)),
            ],
        );
        let m = run(&mut source, &fast_config(Duration::from_secs(10)));

        assert_eq!(m.records, 2);
        assert_eq!(m.skipped, 2);
        assert!(m.readings.is_empty());
        assert_eq!(m.outcome, Outcome::NoData);
    }

    #[test]
    fn test_interrupt_keeps_partial_readings() {
        let token = CancelToken::new();
        // drop the leading record so all ten planned records are valid
        let steps = steady_steps(11, 40.0, 2).split_off(1);
        let mut source = MockSource::new();
        source.add_container("web", steps);
        let mut source = source.cancel_after(2, token.clone());

        let m = measure(
            &mut source,
            "web",
            &fast_config(Duration::from_secs(10)),
            &token,
        )
        .unwrap();

        assert_eq!(m.stop, StopReason::Interrupted);
        assert_eq!(m.records, 2);
        let Outcome::Mean(summary) = m.outcome else {
            panic!("expected a mean after interrupt");
        };
        assert_eq!(summary.count, 2);
        assert!((summary.mean - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let mut source = MockSource::steady_load("web", 5, 25.0, 1);
        let m = measure(
            &mut source,
            "web",
            &fast_config(Duration::from_secs(10)),
            &token,
        )
        .unwrap();

        assert_eq!(m.stop, StopReason::Interrupted);
        assert_eq!(m.records, 0);
        assert_eq!(m.outcome, Outcome::NoData);
    }

    #[test]
    fn test_first_record_after_window() {
        let mut source = MockSource::new();
        let mut steps = vec![MockStep::Delay(Duration::from_millis(300))];
        steps.extend(steady_steps(3, 50.0, 1));
        source.add_container("web", steps);

        let m = run(&mut source, &fast_config(Duration::from_millis(100)));

        assert_eq!(m.stop, StopReason::DurationElapsed);
        assert_eq!(m.records, 0);
        assert_eq!(m.outcome, Outcome::NoData);
        assert!(m.elapsed >= Duration::from_millis(100));
    }

    #[test]
    fn test_record_arriving_after_window_is_discarded() {
        let mut source = MockSource::new();
        source.add_container(
            "web",
            vec![
                percent_record(1_000, 100),
                MockStep::Stall(Duration::from_millis(150)),
                percent_record(2_000, 500),
            ],
        );

        let m = run(&mut source, &fast_config(Duration::from_millis(50)));

        assert_eq!(m.stop, StopReason::DurationElapsed);
        assert_eq!(m.records, 1);
        assert_eq!(m.readings.len(), 1);
        assert!((m.readings[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_too_long_for_instant() {
        let mut source = MockSource::steady_load("web", 3, 10.0, 1);
        let config = fast_config(Duration::from_secs(10_000_000_000_000_000_000))
            .with_throttle(Duration::from_millis(1));
        let m = run(&mut source, &config);

        assert_eq!(m.stop, StopReason::StreamClosed);
        assert_eq!(m.readings.len(), 2);
    }

    #[test]
    fn test_silent_stream_ends_on_deadline() {
        let mut source = MockSource::new();
        source.add_container("web", vec![MockStep::Delay(Duration::from_secs(30))]);

        let m = run(&mut source, &fast_config(Duration::from_millis(50)));

        assert_eq!(m.stop, StopReason::DurationElapsed);
        assert!(m.elapsed < Duration::from_secs(5));
        assert_eq!(m.outcome, Outcome::NoData);
    }

    #[test]
    fn test_throttle_paces_readings() {
        let mut source = MockSource::steady_load("web", 4, 10.0, 1);
        let config = fast_config(Duration::from_secs(10)).with_throttle(Duration::from_millis(40));
        let m = run(&mut source, &config);

        assert_eq!(m.readings.len(), 3);
        assert!(m.elapsed >= Duration::from_millis(120));
    }

    #[test]
    fn test_throttle_does_not_outlast_window() {
        let mut source = MockSource::steady_load("web", 4, 10.0, 1);
        let config = fast_config(Duration::from_millis(100)).with_throttle(Duration::from_secs(30));
        let m = run(&mut source, &config);

        // the second record produces a reading, then the pause runs to the deadline
        assert_eq!(m.readings.len(), 1);
        assert_eq!(m.stop, StopReason::DurationElapsed);
        assert!(m.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_stream_failure_is_fatal() {
        let mut source = MockSource::new();
        let mut steps = steady_steps(2, 10.0, 1);
        steps.push(MockStep::Fail("connection reset".to_string()));
        source.add_container("web", steps);

        let err = measure(
            &mut source,
            "web",
            &fast_config(Duration::from_secs(10)),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err, MeasureError::Connection("connection reset".to_string()));
    }

    #[test]
    fn test_malformed_record_is_fatal() {
        let mut source = MockSource::new();
        source.add_container(
            "web",
            vec![MockStep::Record(StatsRecord::Raw(b"{\"cpu_stats\": 1}".to_vec()))],
        );

        let err = measure(
            &mut source,
            "web",
            &fast_config(Duration::from_secs(10)),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MeasureError::MalformedSample(_)));
    }

    #[test]
    fn test_resolution_errors() {
        let config = fast_config(Duration::from_secs(1));
        let cancel = CancelToken::new();

        let mut source = MockSource::new();
        source.add_stopped_container("db");
        assert_eq!(
            measure(&mut source, "web", &config, &cancel),
            Err(MeasureError::ContainerNotFound("web".to_string()))
        );
        assert_eq!(
            measure(&mut source, "db", &config, &cancel),
            Err(MeasureError::ContainerNotRunning("db".to_string()))
        );
        assert!(matches!(
            measure(&mut MockSource::unreachable(), "web", &config, &cancel),
            Err(MeasureError::Connection(_))
        ));
    }

    #[test]
    fn test_api_error_maps_to_connection() {
        let err = MeasureError::from(SourceError::Api {
            status: 500,
            message: "boom".to_string(),
        });
        assert_eq!(
            err,
            MeasureError::Connection("stats source returned HTTP 500: boom".to_string())
        );
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(CpuSummary::from_readings(&[]), None);
        let one = CpuSummary::from_readings(&[12.5]).unwrap();
        assert_eq!((one.count, one.mean, one.min, one.max), (1, 12.5, 12.5, 12.5));
    }
}
