use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::Pid;

use super::Container;
use crate::error::LibcontainerError;
use crate::signal::Signal;
use crate::start_socket;

impl Container {
    /// Sends `signal` to the container process. With a timeout the call
    /// waits until the monitor closes its control connection, which happens
    /// once the process exited, and sends SIGKILL if that takes too long.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id()))]
    pub fn kill(&mut self, signal: Signal, timeout: Option<Duration>) -> Result<(), LibcontainerError> {
        let lock = self.lock()?;
        self.reload()?;
        if !self.can_kill() {
            return Err(self.incorrect_status("kill"));
        }
        let pid = self.pid().ok_or_else(|| {
            LibcontainerError::InvalidInput(format!("container {} has no process", self.id()))
        })?;

        let Some(timeout) = timeout else {
            return send(pid, signal.into_raw());
        };
        let control = match start_socket::connect(&self.control_socket_path()) {
            Ok(control) => control,
            Err(err) => {
                tracing::warn!(%err, "control socket unavailable, killing container");
                return send(pid, NixSignal::SIGKILL);
            }
        };
        send(pid, signal.into_raw())?;
        // the monitor takes the lock to record the exit
        drop(lock);
        if let Err(err) = wait_for_eof(control, timeout) {
            tracing::warn!(%err, ?timeout, "container did not exit in time, sending SIGKILL");
            send(pid, NixSignal::SIGKILL)?;
        }
        Ok(())
    }
}

fn send(pid: Pid, signal: NixSignal) -> Result<(), LibcontainerError> {
    tracing::debug!(%pid, ?signal, "kill");
    match signal::kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Reads until the peer closes the connection or `timeout` runs out.
fn wait_for_eof(mut stream: UnixStream, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(io::ErrorKind::TimedOut)?;
        stream.set_read_timeout(Some(left))?;
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
