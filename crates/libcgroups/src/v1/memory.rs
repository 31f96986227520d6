use std::path::Path;

use oci_spec::runtime::LinuxMemory;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, MemoryData, MemoryStats, ParseFlatKeyedDataError, StatsProvider};

const CGROUP_MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const CGROUP_MEMORY_SWAP_LIMIT: &str = "memory.memsw.limit_in_bytes";
const CGROUP_MEMORY_RESERVATION: &str = "memory.soft_limit_in_bytes";
const CGROUP_MEMORY_USAGE: &str = "memory.usage_in_bytes";
const CGROUP_MEMORY_MAX_USAGE: &str = "memory.max_usage_in_bytes";
const CGROUP_MEMORY_FAILCNT: &str = "memory.failcnt";
const MEMORY_STAT: &str = "memory.stat";

// v1 reports "no limit" as the largest page aligned i64
const UNLIMITED_V1: u64 = 9_223_372_036_854_771_712;

#[derive(thiserror::Error, Debug)]
pub enum V1MemoryControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("swap limit ({swap}) must not be lower than memory limit ({limit})")]
    SwapTooSmall { swap: i64, limit: i64 },
}

#[derive(thiserror::Error, Debug)]
pub enum V1MemoryStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("error parsing memory.stat: {0}")]
    Stat(#[from] ParseFlatKeyedDataError),
}

pub struct Memory {}

impl Controller for Memory {
    type Error = V1MemoryControllerError;
    type Resource = LinuxMemory;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(memory) = Self::needs_to_handle(controller_opt) {
            tracing::debug!("apply memory cgroup v1 config");
            Self::set(cgroup_root, memory)?;
        }

        Ok(())
    }

    fn needs_to_handle<'a>(controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        controller_opt.resources.memory().as_ref()
    }
}

impl StatsProvider for Memory {
    type Error = V1MemoryStatsError;
    type Stats = MemoryStats;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        let mut limit = stats::parse_single_value(&cgroup_path.join(CGROUP_MEMORY_LIMIT))?;
        if limit >= UNLIMITED_V1 {
            limit = u64::MAX;
        }

        let memory = MemoryData {
            usage: stats::parse_single_value(&cgroup_path.join(CGROUP_MEMORY_USAGE))?,
            max_usage: stats::parse_single_value(&cgroup_path.join(CGROUP_MEMORY_MAX_USAGE))?,
            fail_count: stats::parse_single_value(&cgroup_path.join(CGROUP_MEMORY_FAILCNT))?,
            limit,
        };

        let stat_path = cgroup_path.join(MEMORY_STAT);
        let cache = if stat_path.exists() {
            stats::parse_flat_keyed_data(&stat_path)?
                .get("cache")
                .copied()
                .unwrap_or_default()
        } else {
            0
        };

        Ok(MemoryStats { memory, cache })
    }
}

impl Memory {
    fn set(cgroup_root: &Path, memory: &LinuxMemory) -> Result<(), V1MemoryControllerError> {
        if let Some(reservation) = memory.reservation() {
            common::write_cgroup_file(cgroup_root.join(CGROUP_MEMORY_RESERVATION), reservation)?;
        }

        let limit = memory.limit();
        let swap = memory.swap();
        if let (Some(limit), Some(swap)) = (limit, swap) {
            if swap != -1 && limit != -1 && swap < limit {
                return Err(V1MemoryControllerError::SwapTooSmall { swap, limit });
            }
        }

        // memsw must stay >= limit at every point, so the order of the writes
        // depends on whether the limit grows or shrinks
        let current = stats::parse_single_value(&cgroup_root.join(CGROUP_MEMORY_LIMIT)).ok();
        let growing = match (limit, current) {
            (Some(-1), _) => true,
            (Some(new), Some(current)) => new as u64 > current,
            _ => false,
        };

        if growing {
            Self::write_swap(cgroup_root, swap)?;
            Self::write_limit(cgroup_root, limit)?;
        } else {
            Self::write_limit(cgroup_root, limit)?;
            Self::write_swap(cgroup_root, swap)?;
        }

        Ok(())
    }

    fn write_limit(cgroup_root: &Path, limit: Option<i64>) -> Result<(), WrappedIoError> {
        match limit {
            Some(limit) => common::write_cgroup_file(cgroup_root.join(CGROUP_MEMORY_LIMIT), limit),
            None => Ok(()),
        }
    }

    fn write_swap(cgroup_root: &Path, swap: Option<i64>) -> Result<(), WrappedIoError> {
        let Some(swap) = swap else {
            return Ok(());
        };

        let target = cgroup_root.join(CGROUP_MEMORY_SWAP_LIMIT);
        // kernels booted without swap accounting have no memsw files
        if !target.exists() {
            tracing::warn!("swap accounting is disabled, ignoring swap limit");
            return Ok(());
        }
        common::write_cgroup_file(target, swap)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use oci_spec::runtime::LinuxMemoryBuilder;

    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_set_limit_and_swap() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_LIMIT, "0").unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_SWAP_LIMIT, "0").unwrap();
        let memory = LinuxMemoryBuilder::default()
            .limit(1024i64)
            .swap(2048i64)
            .build()
            .unwrap();

        Memory::set(tmp.path(), &memory).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join(CGROUP_MEMORY_LIMIT)).unwrap(), "1024");
        assert_eq!(
            fs::read_to_string(tmp.path().join(CGROUP_MEMORY_SWAP_LIMIT)).unwrap(),
            "2048"
        );
    }

    #[test]
    fn test_swap_smaller_than_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = LinuxMemoryBuilder::default()
            .limit(4096i64)
            .swap(1024i64)
            .build()
            .unwrap();
        assert!(matches!(
            Memory::set(tmp.path(), &memory),
            Err(V1MemoryControllerError::SwapTooSmall { .. })
        ));
    }

    #[test]
    fn test_swap_without_accounting_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_LIMIT, "0").unwrap();
        let memory = LinuxMemoryBuilder::default()
            .limit(1024i64)
            .swap(4096i64)
            .build()
            .unwrap();
        Memory::set(tmp.path(), &memory).unwrap();
        assert!(!tmp.path().join(CGROUP_MEMORY_SWAP_LIMIT).exists());
    }

    #[test]
    fn test_stats_unlimited() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_LIMIT, "9223372036854771712\n").unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_USAGE, "4096\n").unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_MAX_USAGE, "8192\n").unwrap();
        set_fixture(tmp.path(), CGROUP_MEMORY_FAILCNT, "0\n").unwrap();
        set_fixture(tmp.path(), MEMORY_STAT, "cache 512\nrss 1024\n").unwrap();

        let stats = Memory::stats(tmp.path()).unwrap();
        assert_eq!(stats.memory.limit, u64::MAX);
        assert_eq!(stats.memory.usage, 4096);
        assert_eq!(stats.memory.max_usage, 8192);
        assert_eq!(stats.cache, 512);
    }
}
