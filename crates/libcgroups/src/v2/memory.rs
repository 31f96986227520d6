use std::path::Path;

use oci_spec::runtime::LinuxMemory;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, MemoryData, MemoryStats, ParseFlatKeyedDataError, StatsProvider};

const CGROUP_MEMORY_SWAP: &str = "memory.swap.max";
const CGROUP_MEMORY_MAX: &str = "memory.max";
const CGROUP_MEMORY_LOW: &str = "memory.low";
const MEMORY_CURRENT: &str = "memory.current";
const MEMORY_PEAK: &str = "memory.peak";
const MEMORY_EVENTS: &str = "memory.events";
const MEMORY_STAT: &str = "memory.stat";

#[derive(thiserror::Error, Debug)]
pub enum V2MemoryControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("invalid memory value {0}")]
    MemoryValue(i64),
    #[error("invalid swap value {0}")]
    SwapValue(i64),
    #[error("swap memory ({swap}) should be bigger than memory limit ({limit})")]
    SwapTooSmall { swap: i64, limit: i64 },
    #[error("unable to set swap limit without memory limit")]
    SwapWithoutLimit,
}

#[derive(thiserror::Error, Debug)]
pub enum V2MemoryStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("while parsing stat table: {0}")]
    ParseNestedKeyedData(#[from] ParseFlatKeyedDataError),
}

pub struct Memory {}

impl Controller for Memory {
    type Error = V2MemoryControllerError;

    fn apply(controller_opt: &ControllerOpt, cgroup_path: &Path) -> Result<(), Self::Error> {
        if let Some(memory) = controller_opt.resources.memory() {
            tracing::debug!("apply memory cgroup v2 config");
            Self::set(cgroup_path, memory)?;
        }

        Ok(())
    }
}

impl StatsProvider for Memory {
    type Error = V2MemoryStatsError;
    type Stats = MemoryStats;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        let usage = stats::parse_single_value(&cgroup_path.join(MEMORY_CURRENT))?;
        let limit = stats::parse_single_value(&cgroup_path.join(CGROUP_MEMORY_MAX))?;
        // memory.peak only exists on newer kernels
        let max_usage = stats::parse_single_value(&cgroup_path.join(MEMORY_PEAK)).unwrap_or(0);

        let events_path = cgroup_path.join(MEMORY_EVENTS);
        let fail_count = if events_path.exists() {
            stats::parse_flat_keyed_data(&events_path)?
                .get("max")
                .copied()
                .unwrap_or_default()
        } else {
            0
        };

        let stat_path = cgroup_path.join(MEMORY_STAT);
        let cache = if stat_path.exists() {
            stats::parse_flat_keyed_data(&stat_path)?
                .get("file")
                .copied()
                .unwrap_or_default()
        } else {
            0
        };

        Ok(MemoryStats {
            memory: MemoryData {
                usage,
                max_usage,
                fail_count,
                limit,
            },
            cache,
        })
    }
}

impl Memory {
    fn set_value(path: &Path, val: i64) -> Result<(), WrappedIoError> {
        if val == -1 {
            common::write_cgroup_file_str(path, "max")
        } else {
            common::write_cgroup_file(path, val)
        }
    }

    fn set(path: &Path, memory: &LinuxMemory) -> Result<(), V2MemoryControllerError> {
        // the OCI swap value is memory+swap, v2 wants the swap part only
        match (memory.limit(), memory.swap()) {
            (None, Some(_)) => return Err(V2MemoryControllerError::SwapWithoutLimit),
            (Some(limit), None) if limit < -1 => {
                return Err(V2MemoryControllerError::MemoryValue(limit))
            }
            (Some(limit), None) => {
                Self::set_value(&path.join(CGROUP_MEMORY_MAX), limit)?;
            }
            (Some(limit), Some(swap)) => {
                if limit < -1 {
                    return Err(V2MemoryControllerError::MemoryValue(limit));
                }
                if swap < -1 {
                    return Err(V2MemoryControllerError::SwapValue(swap));
                }
                let swap_part = match (limit, swap) {
                    (_, -1) => -1,
                    (-1, _) => swap,
                    (limit, swap) if swap < limit => {
                        return Err(V2MemoryControllerError::SwapTooSmall { swap, limit })
                    }
                    (limit, swap) => swap - limit,
                };
                Self::set_value(&path.join(CGROUP_MEMORY_SWAP), swap_part)?;
                Self::set_value(&path.join(CGROUP_MEMORY_MAX), limit)?;
            }
            (None, None) => {}
        }

        if let Some(reservation) = memory.reservation() {
            Self::set_value(&path.join(CGROUP_MEMORY_LOW), reservation)?;
        }

        Ok(())
    }
}
