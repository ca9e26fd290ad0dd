//! Abstractions over the container runtime's stats endpoint.
//!
//! The `StatsSource` trait lets the sampler run against the real Docker Engine
//! API or against an in-memory mock in tests.

use std::time::Duration;

use crate::sample::StatsRecord;

/// Error type for stats source operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The identifier does not resolve to a container.
    NotFound(String),
    /// The container exists but is not running.
    NotRunning(String),
    /// The source could not be reached, or the stream broke.
    Connection(String),
    /// The source answered with a non-success status.
    Api { status: u16, message: String },
    /// A record could not be decoded by the source.
    Malformed(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::NotFound(id) => write!(f, "no such container: {}", id),
            SourceError::NotRunning(id) => write!(f, "container {} is not running", id),
            SourceError::Connection(msg) => write!(f, "connection error: {}", msg),
            SourceError::Api { status, message } => {
                write!(f, "stats source returned HTTP {}: {}", status, message)
            }
            SourceError::Malformed(msg) => write!(f, "malformed stats record: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// A container resolved by the stats source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Full container id.
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
}

/// Result of waiting on a stats stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A record arrived.
    Record(StatsRecord),
    /// Nothing arrived within the timeout; the stream is still open.
    Pending,
    /// The source closed the stream.
    Closed,
}

/// Source of container stats.
pub trait StatsSource {
    type Stream: StatsStream;

    /// Resolves a container name or id.
    fn resolve(&mut self, container: &str) -> Result<ContainerHandle, SourceError>;

    /// Opens a continuous stats stream for a resolved container.
    fn open(&mut self, handle: &ContainerHandle) -> Result<Self::Stream, SourceError>;
}

/// A continuous stream of stats records.
///
/// Arrival cadence is decided by the runtime. `next_frame` blocks for at most
/// `timeout` so callers can keep checking deadlines and cancellation.
pub trait StatsStream {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError>;
}
