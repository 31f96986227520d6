use std::path::Path;

use oci_spec::runtime::LinuxPids;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, PidStats, PidStatsError, StatsProvider};

pub struct Pids {}

impl Controller for Pids {
    type Error = WrappedIoError;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(pids) = controller_opt.resources.pids() {
            tracing::debug!("apply pids cgroup v2 config");
            Self::set_limit(cgroup_root, pids)?;
        }
        Ok(())
    }
}

impl StatsProvider for Pids {
    type Error = PidStatsError;
    type Stats = PidStats;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        stats::pid_stats(cgroup_path)
    }
}

impl Pids {
    fn set_limit(root_path: &Path, pids: &LinuxPids) -> Result<(), WrappedIoError> {
        let limit = match pids.limit() {
            limit if limit > 0 => limit.to_string(),
            _ => "max".to_owned(),
        };
        common::write_cgroup_file(root_path.join("pids.max"), limit)
    }
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{LinuxPidsBuilder, LinuxResourcesBuilder};

    use super::*;
    use crate::test::{controller_opt, setup};

    #[test]
    fn test_update_pids_limit() {
        let (tmp, max) = setup("pids.max");
        let resources = LinuxResourcesBuilder::default()
            .pids(LinuxPidsBuilder::default().limit(42).build().unwrap())
            .build()
            .unwrap();

        <Pids as Controller>::apply(&controller_opt(&resources), tmp.path()).unwrap();
        assert_eq!(std::fs::read_to_string(max).unwrap(), "42");
    }

    #[test]
    fn test_non_positive_limit_is_unlimited() {
        let (tmp, max) = setup("pids.max");
        let pids = LinuxPidsBuilder::default().limit(-1).build().unwrap();
        Pids::set_limit(tmp.path(), &pids).unwrap();
        assert_eq!(std::fs::read_to_string(max).unwrap(), "max");
    }

    #[test]
    fn test_no_pids_section_leaves_file_untouched() {
        let (tmp, max) = setup("pids.max");
        let resources = LinuxResourcesBuilder::default().build().unwrap();
        <Pids as Controller>::apply(&controller_opt(&resources), tmp.path()).unwrap();
        assert_eq!(std::fs::read_to_string(max).unwrap(), "");
    }
}
