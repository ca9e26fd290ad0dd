//! Stats record schema and CPU percentage computation.
//!
//! A Docker stats record carries both the current counters (`cpu_stats`) and
//! the counters from the previous read (`precpu_stats`), so a single record is
//! enough to derive one reading.
//!
//! Structural fields (`cpu_stats`, `precpu_stats`, `cpu_usage.total_usage`) are
//! required: a record without them fails to decode. The system counter and the
//! CPU count are optional: a record without them decodes fine but yields a
//! [`SkipReason`] instead of a reading.

use serde::{Deserialize, Serialize};

/// Error produced when a stats record cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed stats record: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError(e.to_string())
    }
}

/// Container stats record as returned by `GET /containers/{id}/stats`.
///
/// Only the fields needed for CPU accounting are modelled; everything else in
/// the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Timestamp of the read, as reported by the daemon.
    #[serde(default)]
    pub read: Option<String>,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    /// Cumulative host CPU time in nanoseconds.
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Cumulative container CPU time in nanoseconds.
    pub total_usage: u64,
    /// Per-CPU counters. Only populated on cgroup v1 hosts.
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

impl ContainerStats {
    /// Decodes one JSON stats record.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Cumulative counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub cpu_total_usage: u64,
    pub system_total_usage: Option<u64>,
    pub online_cpu_count: Option<u32>,
}

impl From<&CpuStats> for CpuCounters {
    fn from(stats: &CpuStats) -> Self {
        let percpu = stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len() as u32)
            .filter(|&n| n > 0);

        Self {
            cpu_total_usage: stats.cpu_usage.total_usage,
            system_total_usage: stats.system_cpu_usage,
            // online_cpus is 0 on some older daemons; fall back to the per-CPU list.
            online_cpu_count: stats.online_cpus.filter(|&n| n > 0).or(percpu),
        }
    }
}

/// Prior and current counters taken from one stats record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub prior: CpuCounters,
    pub current: CpuCounters,
}

/// Why a sample produced no reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `system_cpu_usage` missing from the current or prior counters.
    MissingSystemUsage,
    /// Host counter did not advance.
    NoSystemProgress,
    /// Container counter went backwards (cgroup recreated or counters reset).
    CounterReset,
    /// Neither `online_cpus` nor per-CPU counters were reported.
    UnknownCpuCount,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::MissingSystemUsage => "system_cpu_usage missing",
            SkipReason::NoSystemProgress => "system counter did not advance",
            SkipReason::CounterReset => "cpu counter went backwards",
            SkipReason::UnknownCpuCount => "cpu count unknown",
        };
        f.write_str(s)
    }
}

impl Sample {
    /// Computes CPU utilization for this delta pair.
    ///
    /// `(cpu_delta / system_delta) * num_cpus * 100`, full precision. A container
    /// that used no CPU in the interval yields `0.0`, not a skip.
    pub fn cpu_percent(&self) -> Result<f64, SkipReason> {
        let (Some(cur_sys), Some(prev_sys)) = (
            self.current.system_total_usage,
            self.prior.system_total_usage,
        ) else {
            return Err(SkipReason::MissingSystemUsage);
        };

        let system_delta = cur_sys
            .checked_sub(prev_sys)
            .filter(|&d| d > 0)
            .ok_or(SkipReason::NoSystemProgress)?;
        let cpu_delta = self
            .current
            .cpu_total_usage
            .checked_sub(self.prior.cpu_total_usage)
            .ok_or(SkipReason::CounterReset)?;
        let num_cpus = self
            .current
            .online_cpu_count
            .ok_or(SkipReason::UnknownCpuCount)?;

        Ok((cpu_delta as f64 / system_delta as f64) * num_cpus as f64 * 100.0)
    }
}

impl From<&ContainerStats> for Sample {
    fn from(stats: &ContainerStats) -> Self {
        Self {
            prior: CpuCounters::from(&stats.precpu_stats),
            current: CpuCounters::from(&stats.cpu_stats),
        }
    }
}

/// One record as delivered by a stats source.
///
/// Sources either hand over the raw line and leave decoding to the caller, or
/// decode it themselves. Both go through the same schema.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsRecord {
    Raw(Vec<u8>),
    Decoded(Box<ContainerStats>),
}

impl StatsRecord {
    pub fn decode(&self) -> Result<Sample, DecodeError> {
        match self {
            StatsRecord::Raw(bytes) => Ok(Sample::from(&ContainerStats::from_slice(bytes)?)),
            StatsRecord::Decoded(stats) => Ok(Sample::from(stats.as_ref())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST_RECORD: &str = r#"{
        "read": "2024-05-01T10:00:00.000000001Z",
        "preread": "0001-01-01T00:00:00Z",
        "cpu_stats": {
            "cpu_usage": {"total_usage": 1000000000, "usage_in_kernelmode": 0, "usage_in_usermode": 0},
            "system_cpu_usage": 50000000000,
            "online_cpus": 4,
            "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
        },
        "precpu_stats": {
            "cpu_usage": {"total_usage": 0, "usage_in_kernelmode": 0, "usage_in_usermode": 0},
            "throttling_data": {"periods": 0, "throttled_periods": 0, "throttled_time": 0}
        },
        "memory_stats": {"usage": 1024}
    }"#;

    const STEADY_RECORD: &str = r#"{
        "cpu_stats": {
            "cpu_usage": {"total_usage": 1500000000},
            "system_cpu_usage": 54000000000,
            "online_cpus": 4
        },
        "precpu_stats": {
            "cpu_usage": {"total_usage": 1000000000},
            "system_cpu_usage": 50000000000,
            "online_cpus": 4
        }
    }"#;

    fn counters(cpu: u64, sys: Option<u64>, cpus: Option<u32>) -> CpuCounters {
        CpuCounters {
            cpu_total_usage: cpu,
            system_total_usage: sys,
            online_cpu_count: cpus,
        }
    }

    #[test]
    fn test_decode_first_record_skips() {
        let sample = StatsRecord::Raw(FIRST_RECORD.as_bytes().to_vec())
            .decode()
            .unwrap();
        assert_eq!(sample.prior.system_total_usage, None);
        assert_eq!(sample.current.online_cpu_count, Some(4));
        assert_eq!(sample.cpu_percent(), Err(SkipReason::MissingSystemUsage));
    }

    #[test]
    fn test_decode_steady_record() {
        let sample = StatsRecord::Raw(STEADY_RECORD.as_bytes().to_vec())
            .decode()
            .unwrap();
        // 0.5s of cpu over 4s of host time on 4 cpus
        let pct = sample.cpu_percent().unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_and_decoded_agree() {
        let stats = ContainerStats::from_slice(STEADY_RECORD.as_bytes()).unwrap();
        let raw = StatsRecord::Raw(STEADY_RECORD.as_bytes().to_vec());
        let decoded = StatsRecord::Decoded(Box::new(stats));
        assert_eq!(raw.decode().unwrap(), decoded.decode().unwrap());
    }

    #[test]
    fn test_formula() {
        let sample = Sample {
            prior: counters(2_000, Some(10_000), Some(2)),
            current: counters(2_300, Some(11_000), Some(2)),
        };
        let pct = sample.cpu_percent().unwrap();
        assert!((pct - (300.0 / 1000.0) * 2.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_cpu_delta_is_a_reading() {
        let sample = Sample {
            prior: counters(500, Some(1_000), Some(1)),
            current: counters(500, Some(2_000), Some(1)),
        };
        assert_eq!(sample.cpu_percent(), Ok(0.0));
    }

    #[test]
    fn test_no_system_progress() {
        let sample = Sample {
            prior: counters(500, Some(2_000), Some(1)),
            current: counters(600, Some(2_000), Some(1)),
        };
        assert_eq!(sample.cpu_percent(), Err(SkipReason::NoSystemProgress));

        let backwards = Sample {
            prior: counters(500, Some(3_000), Some(1)),
            current: counters(600, Some(2_000), Some(1)),
        };
        assert_eq!(backwards.cpu_percent(), Err(SkipReason::NoSystemProgress));
    }

    #[test]
    fn test_counter_reset() {
        let sample = Sample {
            prior: counters(900, Some(1_000), Some(1)),
            current: counters(100, Some(2_000), Some(1)),
        };
        assert_eq!(sample.cpu_percent(), Err(SkipReason::CounterReset));
    }

    #[test]
    fn test_percpu_fallback() {
        let json = r#"{
            "cpu_stats": {
                "cpu_usage": {"total_usage": 200, "percpu_usage": [50, 50, 50, 50, 0, 0, 0, 0]},
                "system_cpu_usage": 2000,
                "online_cpus": 0
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 100},
                "system_cpu_usage": 1000
            }
        }"#;
        let sample = StatsRecord::Raw(json.as_bytes().to_vec()).decode().unwrap();
        assert_eq!(sample.current.online_cpu_count, Some(8));
        assert!((sample.cpu_percent().unwrap() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_cpu_count() {
        let sample = Sample {
            prior: counters(100, Some(1_000), None),
            current: counters(200, Some(2_000), None),
        };
        assert_eq!(sample.cpu_percent(), Err(SkipReason::UnknownCpuCount));
    }

    #[test]
    fn test_malformed_records() {
        assert!(StatsRecord::Raw(b"not json".to_vec()).decode().is_err());
        // cpu_stats present but precpu_stats missing
        let err = StatsRecord::Raw(br#"{"cpu_stats":{"cpu_usage":{"total_usage":1}}}"#.to_vec())
            .decode()
            .unwrap_err();
        assert!(err.to_string().contains("precpu_stats"));
        // total_usage of the wrong type
        assert!(
            StatsRecord::Raw(
                br#"{"cpu_stats":{"cpu_usage":{"total_usage":"x"}},"precpu_stats":{"cpu_usage":{"total_usage":0}}}"#
                    .to_vec()
            )
            .decode()
            .is_err()
        );
    }
}
