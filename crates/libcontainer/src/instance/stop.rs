use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{InstanceError, InstanceFile, InstanceRegistry, Result};
use crate::utils;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SIGKILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StopOptions {
    pub signal: Signal,
    /// Grace period before SIGKILL.
    pub timeout: Duration,
    /// Send SIGKILL right away.
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            signal: Signal::SIGTERM,
            timeout: Duration::from_secs(10),
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after the requested signal.
    Stopped,
    /// Still alive after the grace period and killed.
    Killed,
}

/// Stops `instances` in parallel and removes their records. Results come
/// back in the order of `instances`.
pub fn stop_many(
    registry: &InstanceRegistry,
    instances: &[InstanceFile],
    opts: &StopOptions,
) -> Vec<(String, Result<StopOutcome>)> {
    thread::scope(|scope| {
        let handles: Vec<_> = instances
            .iter()
            .map(|instance| scope.spawn(move || stop_one(registry, instance, opts)))
            .collect();
        instances
            .iter()
            .zip(handles)
            .map(|(instance, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(InstanceError::NotFound(format!("{} (stop thread panicked)", instance.name)))
                });
                (instance.name.clone(), result)
            })
            .collect()
    })
}

fn stop_one(registry: &InstanceRegistry, instance: &InstanceFile, opts: &StopOptions) -> Result<StopOutcome> {
    let pid = Pid::from_raw(instance.pid);
    let sig = if opts.force { Signal::SIGKILL } else { opts.signal };
    tracing::debug!(name = %instance.name, %pid, ?sig, "stopping instance");

    let outcome = if instance.pid <= 0 || !send(instance, pid, sig)? {
        StopOutcome::Stopped
    } else if wait_gone(pid, opts.timeout) {
        StopOutcome::Stopped
    } else {
        tracing::warn!(
            "Killing {} instance of {} (PID={}) (Timeout)",
            instance.name,
            instance.image,
            pid
        );
        send(instance, pid, Signal::SIGKILL)?;
        wait_gone(pid, SIGKILL_GRACE);
        StopOutcome::Killed
    };

    match registry.delete(&instance.name) {
        Ok(()) | Err(InstanceError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }
    if let Some(rootfs) = &instance.rootfs {
        if let Err(err) = fs::remove_dir_all(rootfs) {
            tracing::warn!(%err, ?rootfs, "failed to remove instance sandbox");
        }
    }
    Ok(outcome)
}

/// Returns false when the process was already gone.
fn send(instance: &InstanceFile, pid: Pid, sig: Signal) -> Result<bool> {
    match signal::kill(pid, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(InstanceError::Signal {
            name: instance.name.clone(),
            err,
        }),
    }
}

fn wait_gone(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !utils::process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
