use std::{collections::HashMap, num::ParseIntError, path::Path};

use serde::Serialize;

use crate::common::{self, WrapIoResult, WrappedIoError};

pub(crate) trait StatsProvider {
    type Error;
    type Stats;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error>;
}

/// Snapshot of the accounting data the lifecycle engine reports
#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub pids: PidStats,
    pub blkio: BlkioStats,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub usage: CpuUsage,
}

/// Cpu time consumed by the cgroup, all values in nanoseconds
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    pub usage_total: u64,
    pub usage_user: u64,
    pub usage_kernel: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub memory: MemoryData,
    pub cache: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryData {
    pub usage: u64,
    pub max_usage: u64,
    pub fail_count: u64,
    /// `u64::MAX` when no limit is set
    pub limit: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PidStats {
    pub current: u64,
    /// Zero when unlimited
    pub limit: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BlkioStats {
    /// Bytes transferred per device and operation
    pub service_bytes: Vec<BlkioDeviceStat>,
    /// Number of operations per device and operation
    pub serviced: Vec<BlkioDeviceStat>,
}

impl BlkioStats {
    /// Sum of all read and write entries of `service_bytes`.
    pub fn total_bytes(&self) -> (u64, u64) {
        self.service_bytes
            .iter()
            .fold((0, 0), |(read, write), stat| {
                match stat.op_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
                    Some("read") => (read.saturating_add(stat.value), write),
                    Some("write") => (read, write.saturating_add(stat.value)),
                    _ => (read, write),
                }
            })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BlkioDeviceStat {
    pub major: u64,
    pub minor: u64,
    pub op_type: Option<String>,
    pub value: u64,
}

pub fn parse_value(value: &str) -> Result<u64, ParseIntError> {
    value.trim().parse()
}

/// Reads a file holding a single number. `max` maps to `u64::MAX`.
pub fn parse_single_value(file_path: &Path) -> Result<u64, WrappedIoError> {
    let value = common::read_cgroup_file(file_path)?;
    let value = value.trim();
    if value == "max" {
        return Ok(u64::MAX);
    }

    value
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        .wrap_other(file_path)
}

#[derive(thiserror::Error, Debug)]
pub enum ParseFlatKeyedDataError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("flat keyed data at {path} contains entries that do not conform to 'key value'")]
    DoesNotConform { path: std::path::PathBuf },
    #[error("failed to parse value {value} from {path}")]
    FailedToParse {
        value: String,
        path: std::path::PathBuf,
        err: ParseIntError,
    },
}

/// Parses `key value` lines such as `cpu.stat` or `memory.events`.
pub fn parse_flat_keyed_data(
    file_path: &Path,
) -> Result<HashMap<String, u64>, ParseFlatKeyedDataError> {
    let mut stats = HashMap::new();
    let keyed_data = common::read_cgroup_file(file_path)?;
    for entry in keyed_data.lines() {
        let entry_fields: Vec<&str> = entry.split_ascii_whitespace().collect();
        if entry_fields.len() != 2 {
            return Err(ParseFlatKeyedDataError::DoesNotConform {
                path: file_path.to_path_buf(),
            });
        }

        stats.insert(
            entry_fields[0].to_owned(),
            entry_fields[1]
                .parse()
                .map_err(|err| ParseFlatKeyedDataError::FailedToParse {
                    value: entry_fields[1].into(),
                    path: file_path.to_path_buf(),
                    err,
                })?,
        );
    }

    Ok(stats)
}

#[derive(thiserror::Error, Debug)]
pub enum ParseDeviceNumberError {
    #[error("failed to parse device number from {device}: expected 2 parts, found {numbers}")]
    TooManyNumbers { device: String, numbers: usize },
    #[error("failed to parse device number from {device}: {err}")]
    MalformedNumber { device: String, err: ParseIntError },
}

/// Parses `major:minor`.
pub fn parse_device_number(device: &str) -> Result<(u64, u64), ParseDeviceNumberError> {
    let numbers: Vec<&str> = device.split_terminator(':').collect();
    if numbers.len() != 2 {
        return Err(ParseDeviceNumberError::TooManyNumbers {
            device: device.into(),
            numbers: numbers.len(),
        });
    }

    let parse = |n: &str| {
        n.parse::<u64>()
            .map_err(|err| ParseDeviceNumberError::MalformedNumber {
                device: device.into(),
                err,
            })
    };
    Ok((parse(numbers[0])?, parse(numbers[1])?))
}

#[derive(thiserror::Error, Debug)]
pub enum PidStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
}

/// Returns the current number of tasks and the configured maximum. Shared by
/// v1 and v2 since both expose `pids.current` and `pids.max`.
pub fn pid_stats(cgroup_path: &Path) -> Result<PidStats, PidStatsError> {
    let mut stats = PidStats::default();

    let current = common::read_cgroup_file(cgroup_path.join("pids.current"))?;
    stats.current = current.trim().parse().unwrap_or_default();

    let limit = common::read_cgroup_file(cgroup_path.join("pids.max"))?;
    let limit = limit.trim();
    if limit != "max" {
        stats.limit = limit.parse().unwrap_or_default();
    }

    Ok(stats)
}
