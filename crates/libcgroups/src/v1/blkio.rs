use std::path::Path;

use oci_spec::runtime::LinuxBlockIo;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, BlkioDeviceStat, BlkioStats, ParseDeviceNumberError, StatsProvider};

const BLKIO_WEIGHT: &str = "blkio.weight";
const BLKIO_BFQ_WEIGHT: &str = "blkio.bfq.weight";
const BLKIO_THROTTLE_IO_SERVICE_BYTES: &str = "blkio.throttle.io_service_bytes";
const BLKIO_THROTTLE_IO_SERVICED: &str = "blkio.throttle.io_serviced";

#[derive(thiserror::Error, Debug)]
pub enum V1BlkioStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to parse device number: {0}")]
    DeviceNumber(#[from] ParseDeviceNumberError),
    #[error("invalid entry {entry:?} in {file}")]
    Malformed { entry: String, file: &'static str },
}

pub struct Blkio {}

impl Controller for Blkio {
    type Error = WrappedIoError;
    type Resource = LinuxBlockIo;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(blkio) = Self::needs_to_handle(controller_opt) {
            tracing::debug!("apply blkio cgroup v1 config");
            if let Some(weight) = blkio.weight() {
                // bfq takes precedence on kernels that offer it
                let bfq = cgroup_root.join(BLKIO_BFQ_WEIGHT);
                let target = if bfq.exists() {
                    bfq
                } else {
                    cgroup_root.join(BLKIO_WEIGHT)
                };
                common::write_cgroup_file(target, weight)?;
            }
        }

        Ok(())
    }

    fn needs_to_handle<'a>(controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        controller_opt.resources.block_io().as_ref()
    }
}

impl StatsProvider for Blkio {
    type Error = V1BlkioStatsError;
    type Stats = BlkioStats;

    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        Ok(BlkioStats {
            service_bytes: Self::parse_entries(cgroup_path, BLKIO_THROTTLE_IO_SERVICE_BYTES)?,
            serviced: Self::parse_entries(cgroup_path, BLKIO_THROTTLE_IO_SERVICED)?,
        })
    }
}

impl Blkio {
    /// Parses `major:minor Op value` lines. The trailing `Total` line carries
    /// no device number and is skipped.
    fn parse_entries(
        cgroup_path: &Path,
        file: &'static str,
    ) -> Result<Vec<BlkioDeviceStat>, V1BlkioStatsError> {
        let path = cgroup_path.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = common::read_cgroup_file(&path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            if fields.len() != 3 {
                continue;
            }

            let (major, minor) = stats::parse_device_number(fields[0])?;
            let value = stats::parse_value(fields[2]).map_err(|_| V1BlkioStatsError::Malformed {
                entry: line.to_owned(),
                file,
            })?;
            entries.push(BlkioDeviceStat {
                major,
                minor,
                op_type: Some(fields[1].to_owned()),
                value,
            });
        }

        Ok(entries)
    }
}
