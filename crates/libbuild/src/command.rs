//! Child process helpers that honor a [`CancelToken`].
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {err}")]
    Spawn {
        program: String,
        err: std::io::Error,
    },
    #[error("failed waiting for {program}: {err}")]
    Wait {
        program: String,
        err: std::io::Error,
    },
    #[error("{program} failed with {status}{}", stderr_suffix(.stderr))]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<JoinHandle<String>> {
    reader.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn wait(program: &str, child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus, CommandError> {
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("killing {program} after cancellation");
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandError::Cancelled {
                program: program.to_owned(),
            });
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                return Err(CommandError::Wait {
                    program: program.to_owned(),
                    err,
                })
            }
        }
    }
}

/// Runs `cmd` with inherited stdio and fails on a non zero exit.
pub fn run(cmd: &mut Command, cancel: &CancelToken) -> Result<(), CommandError> {
    let program = program_name(cmd);
    tracing::debug!(?cmd, "running");
    let mut child = cmd.spawn().map_err(|err| CommandError::Spawn {
        program: program.clone(),
        err,
    })?;
    let status = wait(&program, &mut child, cancel)?;
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed {
            program,
            status,
            stderr: String::new(),
        })
    }
}

/// Runs `cmd` capturing stdout and stderr; fails on a non zero exit with the
/// captured stderr in the error.
pub fn output(cmd: &mut Command, cancel: &CancelToken) -> Result<Output, CommandError> {
    let program = program_name(cmd);
    tracing::debug!(?cmd, "running");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| CommandError::Spawn {
            program: program.clone(),
            err,
        })?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let status = wait(&program, &mut child, cancel)?;
    let collect = |h: Option<JoinHandle<String>>| h.and_then(|h| h.join().ok()).unwrap_or_default();
    let output = Output {
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    if status.success() {
        Ok(output)
    } else {
        Err(CommandError::Failed {
            program,
            status,
            stderr: output.stderr,
        })
    }
}
