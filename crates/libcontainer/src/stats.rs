//! Resource usage of running instances, sampled from their cgroups.
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use libcgroups::common::{AnyCgroupManager, CgroupManager};
use libcgroups::stats::Stats;
use nix::unistd::Pid;
use procfs::{Current, Meminfo};
use serde::Serialize;
use tabwriter::TabWriter;

use crate::error::LibcontainerError;

pub const TICK: Duration = Duration::from_secs(1);

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSample {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

#[derive(Debug, Clone, Copy)]
struct CpuMark {
    usage_ns: u64,
    at: Instant,
}

impl StatsSample {
    /// `elapsed` is the wall time since the cpu usage `previous_cpu_ns` was
    /// read, none for the first sample.
    fn compute(
        name: &str,
        stats: &Stats,
        previous_cpu_ns: Option<u64>,
        elapsed: Duration,
        system_memory: u64,
    ) -> Self {
        let cpu_percent = match previous_cpu_ns {
            Some(previous) if !elapsed.is_zero() => {
                let used = stats.cpu.usage.usage_total.saturating_sub(previous);
                used as f64 / elapsed.as_nanos() as f64 * 100.0
            }
            _ => 0.0,
        };
        let memory_usage = stats.memory.memory.usage;
        let mut memory_limit = stats.memory.memory.limit;
        if memory_limit == 0 || (system_memory > 0 && memory_limit > system_memory) {
            memory_limit = system_memory;
        }
        let memory_percent = if memory_limit > 0 {
            memory_usage as f64 / memory_limit as f64 * 100.0
        } else {
            0.0
        };
        let (block_read, block_write) = stats.blkio.total_bytes();

        Self {
            name: name.to_owned(),
            cpu_percent,
            memory_usage,
            memory_limit,
            memory_percent,
            block_read,
            block_write,
            pids: stats.pids.current,
        }
    }
}

/// Samples one cgroup, remembering the previous cpu reading for the rate.
pub struct StatsCollector<M = AnyCgroupManager> {
    name: String,
    manager: M,
    previous: Option<CpuMark>,
    system_memory: u64,
}

impl StatsCollector<AnyCgroupManager> {
    /// Collector for the cgroup `pid` currently lives in.
    pub fn for_pid(name: impl Into<String>, pid: Pid) -> Result<Self, LibcontainerError> {
        let manager = libcgroups::common::create_cgroup_manager_for_pid(pid)?;
        Ok(Self::new(name, manager))
    }
}

impl<M> StatsCollector<M>
where
    M: CgroupManager,
    LibcontainerError: From<M::Error>,
{
    pub fn new(name: impl Into<String>, manager: M) -> Self {
        Self {
            name: name.into(),
            manager,
            previous: None,
            system_memory: system_memory(),
        }
    }

    pub fn sample(&mut self) -> Result<StatsSample, LibcontainerError> {
        let stats = self.manager.stats()?;
        let now = Instant::now();
        let sample = StatsSample::compute(
            &self.name,
            &stats,
            self.previous.map(|p| p.usage_ns),
            self.previous.map(|p| now - p.at).unwrap_or_default(),
            self.system_memory,
        );
        self.previous = Some(CpuMark {
            usage_ns: stats.cpu.usage.usage_total,
            at: now,
        });
        Ok(sample)
    }
}

/// Total RAM of the host in bytes, zero when unknown.
pub fn system_memory() -> u64 {
    match Meminfo::current() {
        Ok(info) => info.mem_total,
        Err(err) => {
            tracing::warn!(%err, "failed to read /proc/meminfo");
            0
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

pub fn render_table<W: Write>(samples: &[StatsSample], out: W) -> io::Result<()> {
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "INSTANCE NAME\tCPU %\tMEM USAGE / LIMIT\tMEM %\tBLOCK I/O\tPIDS")?;
    for s in samples {
        writeln!(
            &mut tab_writer,
            "{}\t{:.2}%\t{} / {}\t{:.2}%\t{} / {}\t{}",
            s.name,
            s.cpu_percent,
            human_bytes(s.memory_usage),
            human_bytes(s.memory_limit),
            s.memory_percent,
            human_bytes(s.block_read),
            human_bytes(s.block_write),
            s.pids
        )?;
    }
    tab_writer.flush()
}

/// Redraws the table once per tick until sampling fails or `ticks` runs
/// out. `None` keeps going until the caller's process is interrupted.
pub fn watch<M, W>(
    collectors: &mut [StatsCollector<M>],
    mut out: W,
    ticks: Option<usize>,
) -> Result<(), LibcontainerError>
where
    M: CgroupManager,
    LibcontainerError: From<M::Error>,
    W: Write,
{
    let mut drawn = 0;
    while ticks.map_or(true, |t| drawn < t) {
        let samples = collectors
            .iter_mut()
            .map(StatsCollector::sample)
            .collect::<Result<Vec<_>, _>>()?;
        write!(out, "{CLEAR_SCREEN}")?;
        render_table(&samples, &mut out)?;
        drawn += 1;
        thread::sleep(TICK);
    }
    Ok(())
}

/// One sample per collector with a cpu rate over a single tick.
pub fn snapshot<M>(collectors: &mut [StatsCollector<M>]) -> Result<Vec<StatsSample>, LibcontainerError>
where
    M: CgroupManager,
    LibcontainerError: From<M::Error>,
{
    for collector in collectors.iter_mut() {
        collector.sample()?;
    }
    thread::sleep(TICK);
    collectors.iter_mut().map(StatsCollector::sample).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcgroups::common::{ControllerOpt, FreezerState};
    use libcgroups::stats::BlkioDeviceStat;
    use std::cell::Cell;

    struct FakeManager {
        cpu_ns: Cell<u64>,
    }

    impl CgroupManager for FakeManager {
        type Error = LibcontainerError;

        fn add_task(&self, _: Pid) -> Result<(), Self::Error> {
            Ok(())
        }
        fn apply(&self, _: &ControllerOpt) -> Result<(), Self::Error> {
            Ok(())
        }
        fn remove(&self) -> Result<(), Self::Error> {
            Ok(())
        }
        fn freeze(&self, _: FreezerState) -> Result<(), Self::Error> {
            Ok(())
        }
        fn stats(&self) -> Result<Stats, Self::Error> {
            // half a cpu busy across each tick
            self.cpu_ns.set(self.cpu_ns.get() + 500_000_000);
            let mut stats = Stats::default();
            stats.cpu.usage.usage_total = self.cpu_ns.get();
            stats.memory.memory.usage = 256 << 20;
            stats.memory.memory.limit = u64::MAX;
            stats.pids.current = 3;
            Ok(stats)
        }
        fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
            Ok(vec![])
        }
    }

    fn stats(cpu_ns: u64, usage: u64, limit: u64) -> Stats {
        let mut stats = Stats::default();
        stats.cpu.usage.usage_total = cpu_ns;
        stats.memory.memory.usage = usage;
        stats.memory.memory.limit = limit;
        stats.pids.current = 7;
        stats.blkio.service_bytes = vec![
            BlkioDeviceStat {
                major: 8,
                minor: 0,
                op_type: Some("Read".to_owned()),
                value: 4096,
            },
            BlkioDeviceStat {
                major: 8,
                minor: 0,
                op_type: Some("Write".to_owned()),
                value: 1024,
            },
        ];
        stats
    }

    #[test]
    fn test_compute_rates() {
        let sample = StatsSample::compute(
            "web",
            &stats(3_000_000_000, 512, 1024),
            Some(2_000_000_000),
            Duration::from_secs(2),
            1 << 30,
        );
        assert!((sample.cpu_percent - 50.0).abs() < 1e-9);
        assert_eq!(sample.memory_limit, 1024);
        assert!((sample.memory_percent - 50.0).abs() < 1e-9);
        assert_eq!((sample.block_read, sample.block_write), (4096, 1024));
        assert_eq!(sample.pids, 7);
    }

    #[test]
    fn test_unlimited_memory_uses_system_ram() {
        let sample = StatsSample::compute("web", &stats(0, 1 << 29, u64::MAX), None, Duration::ZERO, 1 << 30);
        assert_eq!(sample.memory_limit, 1 << 30);
        assert!((sample.memory_percent - 50.0).abs() < 1e-9);
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[test]
    fn test_collector_tracks_previous_sample() -> anyhow::Result<()> {
        let mut collector = StatsCollector::new("web", FakeManager { cpu_ns: Cell::new(0) });
        assert_eq!(collector.sample()?.cpu_percent, 0.0);
        thread::sleep(Duration::from_millis(100));
        let second = collector.sample()?;
        // 0.5s of cpu over roughly 0.1s of wall time
        assert!(second.cpu_percent > 100.0, "{}", second.cpu_percent);
        assert_eq!(second.pids, 3);
        Ok(())
    }

    #[test]
    fn test_render_table() -> anyhow::Result<()> {
        let sample = StatsSample::compute("web", &stats(0, 1536, 1 << 20), None, Duration::ZERO, 0);
        let mut out = Vec::new();
        render_table(&[sample], &mut out)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("INSTANCE NAME"));
        assert!(text.contains("1.50KiB / 1.00MiB"), "{text}");
        assert!(text.contains("4.00KiB / 1.00KiB"), "{text}");
        Ok(())
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(1 << 30), "1.00GiB");
    }
}
