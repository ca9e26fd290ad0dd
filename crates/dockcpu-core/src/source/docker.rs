//! Docker Engine API client over a Unix socket.
//!
//! Speaks just enough HTTP/1.0 to inspect a container and follow its stats
//! stream. HTTP/1.0 keeps the daemon from chunk-encoding the response, so the
//! stats body is plain newline-delimited JSON that ends when the daemon closes
//! the connection.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use super::traits::{ContainerHandle, Frame, SourceError, StatsSource, StatsStream};
use crate::sample::{ContainerStats, StatsRecord};

/// Default Docker daemon socket.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Timeout for request/response exchanges outside the stats stream.
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// `set_read_timeout` rejects a zero duration.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// How stats records are handed to the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsMode {
    /// Raw JSON lines; the sampler decodes them.
    #[default]
    Raw,
    /// Records are decoded by the source before delivery.
    Decoded,
}

/// Stats source backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerSource {
    socket_path: PathBuf,
    mode: StatsMode,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: InspectState,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

struct ResponseHead {
    status: u16,
    chunked: bool,
}

impl DockerSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            mode: StatsMode::default(),
        }
    }

    /// Sets how records are delivered.
    pub fn with_mode(mut self, mode: StatsMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sends a GET request and reads the response head.
    fn get(&self, path: &str) -> Result<(ResponseHead, BufReader<UnixStream>), SourceError> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            SourceError::Connection(format!(
                "failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        trace!("GET {}", path);
        let request = format!("GET {} HTTP/1.0\r\nHost: localhost\r\n\r\n", path);
        stream
            .write_all(request.as_bytes())
            .map_err(|e| SourceError::Connection(format!("failed to write request: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader)?;
        if head.chunked {
            return Err(SourceError::Connection(
                "unexpected chunked response to HTTP/1.0 request".to_string(),
            ));
        }
        debug!("GET {} -> {}", path, head.status);
        Ok((head, reader))
    }
}

impl StatsSource for DockerSource {
    type Stream = DockerStatsStream;

    fn resolve(&mut self, container: &str) -> Result<ContainerHandle, SourceError> {
        if !is_valid_container_ref(container) {
            return Err(SourceError::NotFound(container.to_string()));
        }

        let (head, mut reader) = self.get(&format!("/containers/{}/json", container))?;
        let body = read_body(&mut reader)?;
        match head.status {
            200 => {}
            404 => return Err(SourceError::NotFound(container.to_string())),
            status => {
                return Err(SourceError::Api {
                    status,
                    message: api_message(&body),
                });
            }
        }

        let inspect: InspectResponse = serde_json::from_slice(&body)
            .map_err(|e| SourceError::Connection(format!("invalid inspect response: {}", e)))?;
        let name = inspect.name.trim_start_matches('/').to_string();
        if !inspect.state.running {
            return Err(SourceError::NotRunning(container.to_string()));
        }

        Ok(ContainerHandle {
            id: inspect.id,
            name,
        })
    }

    fn open(&mut self, handle: &ContainerHandle) -> Result<Self::Stream, SourceError> {
        let (head, mut reader) = self.get(&format!("/containers/{}/stats?stream=true", handle.id))?;
        match head.status {
            200 => {}
            404 => return Err(SourceError::NotFound(handle.id.clone())),
            status => {
                let body = read_body(&mut reader)?;
                return Err(SourceError::Api {
                    status,
                    message: api_message(&body),
                });
            }
        }

        Ok(DockerStatsStream {
            reader,
            pending: Vec::new(),
            mode: self.mode,
        })
    }
}

/// Open stats stream for one container.
pub struct DockerStatsStream {
    reader: BufReader<UnixStream>,
    /// Bytes of a record whose newline has not arrived yet.
    pending: Vec<u8>,
    mode: StatsMode,
}

impl DockerStatsStream {
    fn frame(&self, line: &[u8]) -> Result<Frame, SourceError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(Frame::Pending);
        }
        let record = match self.mode {
            StatsMode::Raw => StatsRecord::Raw(line.to_vec()),
            StatsMode::Decoded => StatsRecord::Decoded(Box::new(
                ContainerStats::from_slice(line)
                    .map_err(|e| SourceError::Malformed(e.to_string()))?,
            )),
        };
        Ok(Frame::Record(record))
    }
}

impl StatsStream for DockerStatsStream {
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        loop {
            // read_until keeps partial data in `pending` when the read times out.
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    if self.pending.is_empty() {
                        return Ok(Frame::Closed);
                    }
                    let line = std::mem::take(&mut self.pending);
                    return self.frame(&line);
                }
                Ok(_) if self.pending.last() == Some(&b'\n') => {
                    let line = std::mem::take(&mut self.pending);
                    return self.frame(&line);
                }
                // EOF in the middle of a line; the next read returns 0.
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(Frame::Pending);
                }
                Err(e) => {
                    return Err(SourceError::Connection(format!("stats stream broken: {}", e)));
                }
            }
        }
    }
}

/// Docker accepts names (`[a-zA-Z0-9][a-zA-Z0-9_.-]*`) and hex ids.
/// Anything else cannot name a container and must not reach the request line.
fn is_valid_container_ref(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn read_head(reader: &mut impl BufRead) -> Result<ResponseHead, SourceError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| SourceError::Connection(format!("failed to read response: {}", e)))?;

    // "HTTP/1.0 200 OK"
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            SourceError::Connection(format!("invalid HTTP status line: {:?}", line.trim_end()))
        })?;

    let mut chunked = false;
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| SourceError::Connection(format!("failed to read headers: {}", e)))?;
        let header = line.trim_end();
        if n == 0 || header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.trim().eq_ignore_ascii_case("transfer-encoding")
            && value.trim().eq_ignore_ascii_case("chunked")
        {
            chunked = true;
        }
    }

    Ok(ResponseHead { status, chunked })
}

fn read_body(reader: &mut impl Read) -> Result<Vec<u8>, SourceError> {
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| SourceError::Connection(format!("failed to read response body: {}", e)))?;
    Ok(body)
}

/// Extracts `{"message": "..."}` from a Docker error body.
fn api_message(body: &[u8]) -> String {
    serde_json::from_slice::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}
