//! In-memory stats source for testing the sampler without a Docker daemon.
//!
//! Each container is scripted as a sequence of [`MockStep`]s: records, delays
//! and failures. Delays are real sleeps, bounded by the timeout the caller
//! passes to `next_frame`, so timing behaviour matches a live stream.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::traits::{ContainerHandle, Frame, SourceError, StatsSource, StatsStream};
use crate::cancel::CancelToken;
use crate::sample::{ContainerStats, CpuCounters, CpuStats, CpuUsage, StatsRecord};

/// One scripted step of a mock stats stream.
#[derive(Debug, Clone)]
pub enum MockStep {
    Record(StatsRecord),
    /// Nothing arrives for this long.
    Delay(Duration),
    /// Blocks for this long regardless of the caller's timeout, like a read
    /// that was already in flight when the window closed.
    Stall(Duration),
    /// The stream breaks with a connection error.
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockContainer {
    running: bool,
    steps: Vec<MockStep>,
}

/// Scripted stats source.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    containers: HashMap<String, MockContainer>,
    unreachable: bool,
    cancel_after: Option<(usize, CancelToken)>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose daemon cannot be reached.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Adds a running container with a scripted stream.
    pub fn add_container(&mut self, name: impl Into<String>, steps: Vec<MockStep>) {
        self.containers.insert(
            name.into(),
            MockContainer {
                running: true,
                steps,
            },
        );
    }

    /// Adds a container that exists but is stopped.
    pub fn add_stopped_container(&mut self, name: impl Into<String>) {
        self.containers.insert(
            name.into(),
            MockContainer {
                running: false,
                steps: Vec::new(),
            },
        );
    }

    /// Cancels `token` once `records` records have been handed out, simulating
    /// an operator pressing Ctrl-C while the next record is awaited.
    pub fn cancel_after(mut self, records: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((records, token));
        self
    }

    /// A container under constant load, shaped like a real Docker stream: the
    /// first record has no prior system counter, every following record reads
    /// `percent` on `cpus` CPUs.
    pub fn steady_load(name: &str, records: usize, percent: f64, cpus: u32) -> Self {
        let mut source = Self::new();
        source.add_container(name, steady_steps(records, percent, cpus));
        source
    }
}

/// Builds the steps used by [`MockSource::steady_load`].
pub fn steady_steps(records: usize, percent: f64, cpus: u32) -> Vec<MockStep> {
    // one second of host time per CPU between records
    let system_step = 1_000_000_000u64 * cpus as u64;
    let cpu_step = (system_step as f64 * percent / 100.0 / cpus as f64).round() as u64;

    let mut steps = Vec::with_capacity(records);
    let mut prior = CpuCounters {
        cpu_total_usage: 0,
        system_total_usage: None,
        online_cpu_count: None,
    };
    let mut current = CpuCounters {
        cpu_total_usage: 5 * cpu_step,
        system_total_usage: Some(100 * system_step),
        online_cpu_count: Some(cpus),
    };
    for _ in 0..records {
        steps.push(MockStep::Record(stats_record(prior, current)));
        prior = current;
        current.cpu_total_usage += cpu_step;
        current.system_total_usage = current.system_total_usage.map(|s| s + system_step);
    }
    steps
}

/// Builds a decoded record from prior and current counters.
pub fn stats_record(prior: CpuCounters, current: CpuCounters) -> StatsRecord {
    let cpu_stats = |c: CpuCounters| CpuStats {
        cpu_usage: CpuUsage {
            total_usage: c.cpu_total_usage,
            percpu_usage: None,
        },
        system_cpu_usage: c.system_total_usage,
        online_cpus: c.online_cpu_count,
    };
    StatsRecord::Decoded(Box::new(ContainerStats {
        read: None,
        cpu_stats: cpu_stats(current),
        precpu_stats: cpu_stats(prior),
    }))
}

impl StatsSource for MockSource {
    type Stream = MockStream;

    fn resolve(&mut self, container: &str) -> Result<ContainerHandle, SourceError> {
        if self.unreachable {
            return Err(SourceError::Connection("mock daemon unreachable".to_string()));
        }
        let entry = self
            .containers
            .get(container)
            .ok_or_else(|| SourceError::NotFound(container.to_string()))?;
        if !entry.running {
            return Err(SourceError::NotRunning(container.to_string()));
        }
        Ok(ContainerHandle {
            id: format!("mock-{}", container),
            name: container.to_string(),
        })
    }

    fn open(&mut self, handle: &ContainerHandle) -> Result<Self::Stream, SourceError> {
        let entry = self
            .containers
            .get(&handle.name)
            .ok_or_else(|| SourceError::NotFound(handle.id.clone()))?;
        Ok(MockStream {
            steps: entry.steps.iter().cloned().collect(),
            delivered: 0,
            cancel_after: self.cancel_after.clone(),
        })
    }
}

/// Stream over a container's scripted steps.
#[derive(Debug)]
pub struct MockStream {
    steps: VecDeque<MockStep>,
    delivered: usize,
    cancel_after: Option<(usize, CancelToken)>,
}

impl StatsStream for MockStream {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        if let Some((records, token)) = &self.cancel_after
            && self.delivered >= *records
        {
            token.cancel();
            return Ok(Frame::Pending);
        }

        loop {
            match self.steps.pop_front() {
                None => return Ok(Frame::Closed),
                Some(MockStep::Delay(d)) if d > timeout => {
                    std::thread::sleep(timeout);
                    self.steps.push_front(MockStep::Delay(d - timeout));
                    return Ok(Frame::Pending);
                }
                Some(MockStep::Delay(d)) | Some(MockStep::Stall(d)) => std::thread::sleep(d),
                Some(MockStep::Record(record)) => {
                    self.delivered += 1;
                    return Ok(Frame::Record(record));
                }
                Some(MockStep::Fail(msg)) => return Err(SourceError::Connection(msg)),
            }
        }
    }
}
