//! dockcpu - average CPU usage of a running container.
//!
//! Follows the Docker stats stream of one container for a fixed window and
//! prints the mean CPU utilization. Ctrl-C ends the window early and still
//! reports what was collected.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use dockcpu_core::report::{render_json, render_text};
use dockcpu_core::source::{DEFAULT_SOCKET, DockerSource, StatsMode};
use dockcpu_core::{CancelToken, SamplerConfig, measure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Average CPU usage of a running container.
#[derive(Parser, Debug)]
#[command(name = "dockcpu", about = "Average CPU usage of a running container", version)]
struct Args {
    /// Container name or id.
    container: String,

    /// Observation window in seconds (fractions allowed, e.g. 2.5).
    #[arg(short, long, value_parser = parse_duration)]
    duration: Duration,

    /// Docker daemon address: a unix:// URL or a socket path.
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_SOCKET, value_parser = parse_docker_host)]
    host: PathBuf,

    /// Decode stats records while reading the stream instead of in the sampler.
    #[arg(long)]
    decode_in_source: bool,

    /// Pause between readings in milliseconds.
    #[arg(long, default_value = "1000")]
    throttle_ms: u64,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses a positive number of seconds ("55", "2.5").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("duration must be a positive number of seconds, got '{}'", s));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

/// Parses a Docker host into a socket path. Only Unix sockets are supported.
fn parse_docker_host(s: &str) -> Result<PathBuf, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty docker host".to_string());
    }
    if let Some(path) = s.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("missing socket path in '{}'", s));
        }
        return Ok(PathBuf::from(path));
    }
    if s.contains("://") {
        return Err(format!("unsupported docker host '{}': only unix:// is supported", s));
    }
    Ok(PathBuf::from(s))
}

fn stats_mode(decode_in_source: bool) -> StatsMode {
    if decode_in_source {
        StatsMode::Decoded
    } else {
        StatsMode::Raw
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["dockcpu", "dockcpu_core"] {
        match format!("{}={}", target, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", target, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("dockcpu {} starting", env!("CARGO_PKG_VERSION"));
    debug!(
        "Config: container={}, duration={:.1}s, host={}, throttle={}ms",
        args.container,
        args.duration.as_secs_f64(),
        args.host.display(),
        args.throttle_ms
    );

    // Setup graceful shutdown
    let cancel = CancelToken::new();
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal");
        c.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut source = DockerSource::new(&args.host).with_mode(stats_mode(args.decode_in_source));
    let config =
        SamplerConfig::new(args.duration).with_throttle(Duration::from_millis(args.throttle_ms));

    let measurement = match measure(&mut source, &args.container, &config, &cancel) {
        Ok(m) => m,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.format {
        OutputFormat::Text => print!("{}", render_text(&measurement, args.verbose > 0)),
        OutputFormat::Json => match render_json(&measurement) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
