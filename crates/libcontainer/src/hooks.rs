//! OCI lifecycle hooks. Each hook gets the container state as JSON on stdin
//! and must exit zero within its timeout.
use std::io::{ErrorKind, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::sys::signal;
use nix::unistd::Pid;
use oci_spec::runtime::Hook;

use crate::container::State;
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to execute hook command {path}: {err}")]
    CommandExecute {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to encode container state")]
    EncodeContainerState(#[source] serde_json::Error),
    #[error("hook command {path} exited with code {code}")]
    NonZeroExitCode { path: PathBuf, code: i32 },
    #[error("hook command {0} was killed by a signal")]
    Killed(PathBuf),
    #[error("hook command {0} timed out")]
    Timeout(PathBuf),
    #[error("failed to write container state to stdin of {path}: {err}")]
    WriteContainerState {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, HookError>;

/// Runs `hooks` in order and stops at the first failure.
pub fn run_hooks(hooks: Option<&Vec<Hook>>, state: &State) -> Result<()> {
    let Some(hooks) = hooks else {
        return Ok(());
    };
    let encoded = serde_json::to_string(state).map_err(HookError::EncodeContainerState)?;
    for hook in hooks {
        run_hook(hook, &encoded)?;
    }
    Ok(())
}

fn run_hook(hook: &Hook, encoded_state: &str) -> Result<()> {
    let path = hook.path().clone();
    let mut cmd = Command::new(&path);
    // args[0] of an OCI hook is argv[0], not the first argument
    if let Some((arg0, args)) = hook.args().as_ref().and_then(|a| a.split_first()) {
        tracing::debug!(?arg0, ?args, "run hook");
        cmd.arg0(arg0).args(args);
    } else {
        cmd.arg0(path.display().to_string());
    }
    let envs = hook.env().as_deref().map(utils::parse_env).unwrap_or_default();

    let mut child = cmd
        .env_clear()
        .envs(envs)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|err| HookError::CommandExecute {
            path: path.clone(),
            err,
        })?;
    let pid = Pid::from_raw(child.id() as i32);

    if let Some(mut stdin) = child.stdin.take() {
        // a broken pipe means the hook already exited, its status decides
        if let Err(err) = stdin.write_all(encoded_state.as_bytes()) {
            if err.kind() != ErrorKind::BrokenPipe {
                let _ = signal::kill(pid, signal::Signal::SIGKILL);
                let _ = child.wait();
                return Err(HookError::WriteContainerState { path, err });
            }
        }
    }

    let status = match hook.timeout() {
        Some(secs) => {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let _ = tx.send(child.wait());
            });
            match rx.recv_timeout(Duration::from_secs(secs.max(0) as u64)) {
                Ok(status) => status,
                Err(_) => {
                    let _ = signal::kill(pid, signal::Signal::SIGKILL);
                    return Err(HookError::Timeout(path));
                }
            }
        }
        None => child.wait(),
    }
    .map_err(|err| HookError::CommandExecute {
        path: path.clone(),
        err,
    })?;

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(HookError::NonZeroExitCode { path, code }),
        None => Err(HookError::Killed(path)),
    }
}
