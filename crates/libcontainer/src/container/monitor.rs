//! The process that owns a container's init process. It is spawned by
//! `create`, forks the container process, reports back on stdout and then
//! stays around until the container exits: it feeds the container output to
//! the log and attached clients, holds control socket connections open and
//! records the exit status.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use libcgroups::common::{CgroupManager, ControllerOpt};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use oci_spec::runtime::{Process, Spec};

use super::{Container, ContainerStatus};
use crate::error::LibcontainerError;
use crate::start_socket::{self, StartListener};
use crate::{namespaces, rootfs, utils};

pub(super) const READY: &str = "ready";
pub(super) const ERROR_PREFIX: &str = "error: ";
pub(super) const MONITOR_LOG: &str = "monitor.log";

const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type SharedStreams = Arc<Mutex<Vec<UnixStream>>>;

struct Launched {
    container: Container,
    child: Pid,
    output: OwnedFd,
    control: UnixListener,
    attach: UnixListener,
}

/// Runs the monitor of the container in `container_root` and returns the
/// exit code of the container process.
pub fn run_monitor(container_root: &Path) -> Result<i32, LibcontainerError> {
    let launched = match launch(container_root) {
        Ok(launched) => launched,
        Err(err) => {
            report(&format!("{ERROR_PREFIX}{err}"));
            return Err(err);
        }
    };
    report(READY);
    // the creating process stops reading once it has the report
    let null = File::options().write(true).open("/dev/null")?;
    unistd::dup2(null.as_raw_fd(), io::stdout().as_raw_fd())?;
    supervise(launched)
}

fn report(line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn launch(container_root: &Path) -> Result<Launched, LibcontainerError> {
    unistd::setsid()?;
    let mut container = Container::load(container_root.to_path_buf())?;
    let spec = container.spec()?;
    let config = container.config()?;
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| LibcontainerError::InvalidInput("config.json has no process".to_owned()))?;
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| LibcontainerError::InvalidInput("config.json has no root".to_owned()))?;
    let rootfs = container.bundle().join(root.path());
    let readonly = root.readonly().unwrap_or(false);

    let start = StartListener::new(&container.start_socket_path())?;
    let control = start_socket::bind(&container.control_socket_path())?;
    let attach = start_socket::bind(&container.attach_socket_path())?;
    let (output, output_writer) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let cgroup = match config.cgroup_path {
        Some(_) => Some(container.cgroup_manager()?),
        None => None,
    };

    let child = match unsafe { unistd::fork()? } {
        ForkResult::Child => {
            drop(output);
            let err = init_container(&spec, process, &rootfs, readonly, &start, output_writer);
            let _ = writeln!(io::stderr(), "sifbox: {err}");
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => child,
    };
    drop(output_writer);
    drop(start);

    let registered = (|| -> Result<(), LibcontainerError> {
        if let Some(cgroup) = &cgroup {
            cgroup.add_task(child)?;
            if let Some(resources) = spec.linux().as_ref().and_then(|l| l.resources().as_ref()) {
                cgroup.apply(&ControllerOpt {
                    resources,
                    freezer_state: None,
                })?;
            }
        }
        container
            .set_pid(child.as_raw())
            .set_status(ContainerStatus::Created)
            .save()
    })();
    if let Err(err) = registered {
        let _ = signal::kill(child, Signal::SIGKILL);
        let _ = waitpid(child, None);
        return Err(err);
    }

    tracing::debug!(%child, "container process waiting for start");
    Ok(Launched {
        container,
        child,
        output,
        control,
        attach,
    })
}

/// Body of the forked container process. Only returns on failure.
fn init_container(
    spec: &Spec,
    process: &Process,
    rootfs: &Path,
    readonly: bool,
    start: &StartListener,
    output: OwnedFd,
) -> LibcontainerError {
    match prepare_container(spec, process, rootfs, readonly, start, output) {
        Ok(mut cmd) => LibcontainerError::Io {
            path: PathBuf::from(cmd.get_program()),
            err: cmd.exec(),
        },
        Err(err) => err,
    }
}

fn prepare_container(
    spec: &Spec,
    process: &Process,
    rootfs: &Path,
    readonly: bool,
    start: &StartListener,
    output: OwnedFd,
) -> Result<Command, LibcontainerError> {
    unistd::dup2(output.as_raw_fd(), 1)?;
    unistd::dup2(output.as_raw_fd(), 2)?;
    drop(output);
    let null = File::open("/dev/null")?;
    unistd::dup2(null.as_raw_fd(), 0)?;

    let linux = spec.linux().as_ref();
    let spec_namespaces = linux
        .and_then(|l| l.namespaces().clone())
        .unwrap_or_default();
    let mut flags = namespaces::unshare_flags(&spec_namespaces) | CloneFlags::CLONE_NEWNS;
    let rootless = !Uid::effective().is_root();
    if rootless || flags.contains(CloneFlags::CLONE_NEWUSER) {
        namespaces::enter_user_namespace(true)?;
        flags.remove(CloneFlags::CLONE_NEWUSER);
    }
    namespaces::unshare(flags)?;
    namespaces::join_paths(&spec_namespaces)?;
    rootfs::make_private()?;

    if flags.contains(CloneFlags::CLONE_NEWUTS) {
        if let Some(hostname) = spec.hostname() {
            unistd::sethostname(hostname)?;
        }
    }
    if let Some(mounts) = spec.mounts() {
        rootfs::mount_spec_mounts(rootfs, mounts)?;
    }
    if readonly {
        rootfs::bind_mount(rootfs, rootfs, true)?;
    }
    rootfs::enter(rootfs, process.cwd())?;

    start.wait_for_start()?;

    let args = process.args().as_deref().unwrap_or_default();
    let program = args
        .first()
        .ok_or_else(|| LibcontainerError::InvalidInput("config.json has no process arguments".to_owned()))?;
    let env = process.env().as_deref().map(utils::parse_env).unwrap_or_default();
    let mut cmd = Command::new(program);
    cmd.args(&args[1..]).env_clear().envs(env);
    let user = process.user();
    if !rootless && (user.uid() != 0 || user.gid() != 0) {
        if let Some(groups) = user.additional_gids() {
            let groups: Vec<Gid> = groups.iter().map(|g| Gid::from_raw(*g)).collect();
            unistd::setgroups(&groups)?;
        }
        cmd.uid(user.uid()).gid(user.gid());
    }
    Ok(cmd)
}

fn supervise(launched: Launched) -> Result<i32, LibcontainerError> {
    let Launched {
        mut container,
        child,
        output,
        control,
        attach,
    } = launched;

    // `kill --timeout` waits for these to close
    let held: SharedStreams = Arc::default();
    accept_loop(control, held.clone(), "control");
    let clients: SharedStreams = Arc::default();
    accept_loop(attach, clients.clone(), "attach");

    let log_path = container.log_path();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(LibcontainerError::io(&log_path))?;
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        pump_output(File::from(output), log, &clients);
        let _ = done_tx.send(());
    });

    let status = loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            other => break other?,
        }
    };
    // output written by daemonized children may keep the pipe open
    let _ = done_rx.recv_timeout(DRAIN_TIMEOUT);

    let (code, desc) = exit_status(status);
    tracing::debug!(code, %desc, "container process exited");
    if let Ok(mut held) = held.lock() {
        held.clear();
    }
    for path in [
        container.start_socket_path(),
        container.control_socket_path(),
        container.attach_socket_path(),
    ] {
        let _ = fs::remove_file(path);
    }

    if !container.root.exists() {
        return Ok(code);
    }
    let _lock = container.lock()?;
    container.reload()?;
    container.state.exit_code = Some(code);
    container.state.exit_desc = Some(desc);
    container.set_status(ContainerStatus::Stopped).save()?;
    Ok(code)
}

fn accept_loop(listener: UnixListener, streams: SharedStreams, name: &'static str) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let _ = stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT));
                    if let Ok(mut streams) = streams.lock() {
                        streams.push(stream);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "{name} socket accept failed");
                    break;
                }
            }
        }
    });
}

/// Copies the container output to the log and to every attached client,
/// dropping clients whose writes fail.
fn pump_output(mut output: impl Read, mut log: impl Write, clients: &SharedStreams) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match output.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, "reading container output failed");
                break;
            }
        };
        let chunk = &buf[..n];
        if let Err(err) = log.write_all(chunk) {
            tracing::warn!(%err, "writing container log failed");
        }
        if let Ok(mut clients) = clients.lock() {
            clients.retain_mut(|c| c.write_all(chunk).is_ok());
        }
    }
    if let Ok(mut clients) = clients.lock() {
        clients.clear();
    }
}

fn exit_status(status: WaitStatus) -> (i32, String) {
    match status {
        WaitStatus::Exited(_, code) => (code, format!("exited with code {code}")),
        WaitStatus::Signaled(_, sig, _) => (
            128 + sig as i32,
            format!("interrupted by signal {}", sig.as_str()),
        ),
        other => (255, format!("unexpected wait status {other:?}")),
    }
}
