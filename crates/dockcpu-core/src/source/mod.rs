//! Container stats sources.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Sampler                    │
//! │   resolve → open → next_frame(timeout) ...   │
//! └──────────────────────┬───────────────────────┘
//!                        │
//!                 ┌──────▼──────┐
//!                 │ StatsSource │ (trait)
//!                 └──────┬──────┘
//!              ┌─────────┴─────────┐
//!       ┌──────▼──────┐     ┌──────▼──────┐
//!       │DockerSource │     │ MockSource  │
//!       │(unix socket)│     │  (Testing)  │
//!       └─────────────┘     └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use dockcpu_core::source::{DockerSource, StatsSource, DEFAULT_SOCKET};
//!
//! let mut source = DockerSource::new(DEFAULT_SOCKET);
//! let handle = source.resolve("web").unwrap();
//! let stream = source.open(&handle).unwrap();
//! ```

pub mod docker;
pub mod mock;
pub mod traits;

pub use docker::{DEFAULT_SOCKET, DockerSource, DockerStatsStream, StatsMode};
pub use mock::{MockSource, MockStep};
pub use traits::{ContainerHandle, Frame, SourceError, StatsSource, StatsStream};
