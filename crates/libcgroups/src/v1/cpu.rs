use std::path::Path;

use oci_spec::runtime::LinuxCpu;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};

const CGROUP_CPU_SHARES: &str = "cpu.shares";
const CGROUP_CPU_QUOTA: &str = "cpu.cfs_quota_us";
const CGROUP_CPU_PERIOD: &str = "cpu.cfs_period_us";

pub struct Cpu {}

impl Controller for Cpu {
    type Error = WrappedIoError;
    type Resource = LinuxCpu;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(cpu) = Self::needs_to_handle(controller_opt) {
            tracing::debug!("apply cpu cgroup v1 config");
            Self::set(cgroup_root, cpu)?;
        }

        Ok(())
    }

    fn needs_to_handle<'a>(controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        controller_opt.resources.cpu().as_ref()
    }
}

impl Cpu {
    fn set(root_path: &Path, cpu: &LinuxCpu) -> Result<(), WrappedIoError> {
        if let Some(shares) = cpu.shares() {
            if shares != 0 {
                common::write_cgroup_file(root_path.join(CGROUP_CPU_SHARES), shares)?;
            }
        }

        // period first, the kernel rejects a quota larger than the current period
        if let Some(period) = cpu.period() {
            if period != 0 {
                common::write_cgroup_file(root_path.join(CGROUP_CPU_PERIOD), period)?;
            }
        }

        if let Some(quota) = cpu.quota() {
            if quota != 0 {
                common::write_cgroup_file(root_path.join(CGROUP_CPU_QUOTA), quota)?;
            }
        }

        Ok(())
    }
}
