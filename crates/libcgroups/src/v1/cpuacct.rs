use std::path::Path;

use super::controller::Controller;
use crate::common::{ControllerOpt, WrappedIoError};
use crate::stats::{self, CpuUsage, ParseFlatKeyedDataError, StatsProvider};

const CGROUP_CPUACCT_USAGE: &str = "cpuacct.usage";
const CGROUP_CPUACCT_STAT: &str = "cpuacct.stat";

#[derive(thiserror::Error, Debug)]
pub enum V1CpuAcctStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("error parsing cpuacct.stat: {0}")]
    FlatKeyed(#[from] ParseFlatKeyedDataError),
}

pub struct CpuAcct {}

impl Controller for CpuAcct {
    type Error = WrappedIoError;
    type Resource = ();

    fn apply(_controller_opt: &ControllerOpt, _cgroup_root: &Path) -> Result<(), Self::Error> {
        Ok(())
    }

    fn needs_to_handle<'a>(_controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        None
    }
}

impl StatsProvider for CpuAcct {
    type Error = V1CpuAcctStatsError;
    type Stats = CpuUsage;

    /// cpuacct.usage is in nanoseconds while cpuacct.stat counts clock ticks.
    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        let usage_total = stats::parse_single_value(&cgroup_path.join(CGROUP_CPUACCT_USAGE))?;
        let ticks = stats::parse_flat_keyed_data(&cgroup_path.join(CGROUP_CPUACCT_STAT))?;
        let tick_ns = 1_000_000_000 / procfs::ticks_per_second().max(1);

        Ok(CpuUsage {
            usage_total,
            usage_user: ticks.get("user").copied().unwrap_or_default() * tick_ns,
            usage_kernel: ticks.get("system").copied().unwrap_or_default() * tick_ns,
        })
    }
}
