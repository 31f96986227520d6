use std::path::Path;

use oci_spec::runtime::LinuxCpu;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, CpuUsage, ParseFlatKeyedDataError, StatsProvider};

const CGROUP_CPU_WEIGHT: &str = "cpu.weight";
const CGROUP_CPU_MAX: &str = "cpu.max";
const CGROUP_CPU_STAT: &str = "cpu.stat";
const UNRESTRICTED_QUOTA: &str = "max";
const MAX_CPU_WEIGHT: u64 = 10000;

pub struct Cpu {}

impl Controller for Cpu {
    type Error = WrappedIoError;

    fn apply(controller_opt: &ControllerOpt, path: &Path) -> Result<(), Self::Error> {
        if let Some(cpu) = controller_opt.resources.cpu() {
            tracing::debug!("apply cpu cgroup v2 config");
            Self::set(path, cpu)?;
        }

        Ok(())
    }
}

impl StatsProvider for Cpu {
    type Error = ParseFlatKeyedDataError;
    type Stats = CpuUsage;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        let keyed = stats::parse_flat_keyed_data(&cgroup_path.join(CGROUP_CPU_STAT))?;
        let ns = |key: &str| keyed.get(key).copied().unwrap_or_default() * 1000;

        Ok(CpuUsage {
            usage_total: ns("usage_usec"),
            usage_user: ns("user_usec"),
            usage_kernel: ns("system_usec"),
        })
    }
}

impl Cpu {
    fn set(path: &Path, cpu: &LinuxCpu) -> Result<(), WrappedIoError> {
        if let Some(shares) = cpu.shares() {
            let weight = Self::convert_shares_to_cgroup2(shares);
            if weight != 0 {
                common::write_cgroup_file(path.join(CGROUP_CPU_WEIGHT), weight)?;
            }
        }

        if cpu.quota().is_some() || cpu.period().is_some() {
            let quota = match cpu.quota() {
                Some(quota) if quota > 0 => quota.to_string(),
                _ => UNRESTRICTED_QUOTA.to_owned(),
            };
            let max = match cpu.period() {
                Some(period) => format!("{quota} {period}"),
                None => quota,
            };
            common::write_cgroup_file_str(path.join(CGROUP_CPU_MAX), &max)?;
        }

        Ok(())
    }

    // v1 shares range over [2, 262144], v2 weights over [1, 10000]
    fn convert_shares_to_cgroup2(shares: u64) -> u64 {
        if shares == 0 {
            return 0;
        }

        MAX_CPU_WEIGHT.min(1 + ((shares.saturating_sub(2)) * 9999) / 262142)
    }
}
