use std::path::Path;

use oci_spec::runtime::LinuxBlockIo;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, WrappedIoError};
use crate::stats::{self, BlkioDeviceStat, BlkioStats, ParseDeviceNumberError, StatsProvider};

const CGROUP_IO_WEIGHT: &str = "io.weight";
const CGROUP_IO_STAT: &str = "io.stat";

#[derive(thiserror::Error, Debug)]
pub enum V2IoStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("while parsing device number: {0}")]
    DeviceNumber(#[from] ParseDeviceNumberError),
    #[error("malformed io.stat entry '{0}'")]
    Malformed(String),
}

pub struct Io {}

impl Controller for Io {
    type Error = WrappedIoError;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(io) = controller_opt.resources.block_io() {
            tracing::debug!("apply io cgroup v2 config");
            Self::set(cgroup_root, io)?;
        }
        Ok(())
    }
}

impl StatsProvider for Io {
    type Error = V2IoStatsError;
    type Stats = BlkioStats;

    // io.stat lines look like `8:0 rbytes=1 wbytes=2 rios=3 wios=4 dbytes=0 dios=0`
    fn stats(cgroup_path: &Path) -> Result<Self::Stats, Self::Error> {
        let mut stats = BlkioStats::default();
        let path = cgroup_path.join(CGROUP_IO_STAT);
        if !path.exists() {
            return Ok(stats);
        }

        for line in common::read_cgroup_file(&path)?.lines() {
            let mut fields = line.split_ascii_whitespace();
            let Some(device) = fields.next() else {
                continue;
            };
            let (major, minor) = stats::parse_device_number(device)?;

            for field in fields {
                let (key, value) = field
                    .split_once('=')
                    .ok_or_else(|| V2IoStatsError::Malformed(line.to_owned()))?;
                let value = stats::parse_value(value)
                    .map_err(|_| V2IoStatsError::Malformed(line.to_owned()))?;
                let (target, op) = match key {
                    "rbytes" => (&mut stats.service_bytes, "read"),
                    "wbytes" => (&mut stats.service_bytes, "write"),
                    "rios" => (&mut stats.serviced, "read"),
                    "wios" => (&mut stats.serviced, "write"),
                    _ => continue,
                };
                target.push(BlkioDeviceStat {
                    major,
                    minor,
                    op_type: Some(op.to_owned()),
                    value,
                });
            }
        }

        Ok(stats)
    }
}

impl Io {
    // blkio weights range over [10, 1000], io weights over [1, 10000]
    fn convert_weight(weight: u16) -> u64 {
        let weight = u64::from(weight.clamp(10, 1000));
        1 + (weight - 10) * 9999 / 990
    }

    fn set(root_path: &Path, blkio: &LinuxBlockIo) -> Result<(), WrappedIoError> {
        if let Some(weight) = blkio.weight() {
            let path = root_path.join(CGROUP_IO_WEIGHT);
            if path.exists() {
                common::write_cgroup_file_str(
                    path,
                    &format!("default {}", Self::convert_weight(weight)),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::LinuxBlockIoBuilder;

    use super::*;
    use crate::test::{set_fixture, setup};

    #[test]
    fn test_set_weight() {
        let (tmp, weight) = setup(CGROUP_IO_WEIGHT);
        let blkio = LinuxBlockIoBuilder::default().weight(1000u16).build().unwrap();
        Io::set(tmp.path(), &blkio).unwrap();
        assert_eq!(std::fs::read_to_string(weight).unwrap(), "default 10000");
    }

    #[test]
    fn test_stats() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(
            tmp.path(),
            CGROUP_IO_STAT,
            "8:0 rbytes=100 wbytes=50 rios=2 wios=1 dbytes=0 dios=0\n8:16 rbytes=10 wbytes=5 rios=1 wios=1 dbytes=0 dios=0\n",
        )
        .unwrap();

        let stats = Io::stats(tmp.path()).unwrap();
        assert_eq!(stats.service_bytes.len(), 4);
        assert_eq!(stats.serviced.len(), 4);
        assert_eq!(stats.total_bytes(), (110, 55));
    }

    #[test]
    fn test_stats_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(Io::stats(tmp.path()).unwrap(), BlkioStats::default());
    }
}
