use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Seek, Write};
use std::path::Path;
use std::str::{self, Utf8Error};
use std::thread;
use std::time::Duration;

use super::controller::Controller;
use crate::common::{ControllerOpt, FreezerState, WrapIoResult, WrappedIoError};

const CGROUP_FREEZE: &str = "cgroup.freeze";
const CGROUP_EVENTS: &str = "cgroup.events";
const FREEZE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const FREEZE_POLL_ATTEMPTS: u32 = 1000;

#[derive(thiserror::Error, Debug)]
pub enum V2FreezerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("freezer not supported: {0}")]
    NotSupported(WrappedIoError),
    #[error("expected \"cgroup.freeze\" to be in state {expected:?} but was in {actual:?}")]
    ExpectedToBe {
        expected: FreezerState,
        actual: FreezerState,
    },
    #[error("unexpected \"cgroup.freeze\" state: {state}")]
    UnknownState { state: String },
    #[error("timeout of {0} ms reached waiting for the cgroup to freeze")]
    Timeout(u128),
    #[error("invalid utf8: {0}")]
    InvalidUtf8(#[from] Utf8Error),
}

pub struct Freezer {}

impl Controller for Freezer {
    type Error = V2FreezerError;

    fn apply(controller_opt: &ControllerOpt, cgroup_path: &Path) -> Result<(), Self::Error> {
        if let Some(freezer_state) = controller_opt.freezer_state {
            Self::set_state(freezer_state, cgroup_path)?;
        }

        Ok(())
    }
}

impl Freezer {
    fn set_state(freezer_state: FreezerState, path: &Path) -> Result<(), V2FreezerError> {
        let value = match freezer_state {
            FreezerState::Undefined => return Ok(()),
            FreezerState::Frozen => "1",
            FreezerState::Thawed => "0",
        };

        let target = path.join(CGROUP_FREEZE);
        let mut file = match OpenOptions::new().write(true).open(&target) {
            Ok(file) => file,
            // thawing a cgroup without freezer is a no-op
            Err(_) if freezer_state == FreezerState::Thawed => return Ok(()),
            Err(err) => {
                return Err(V2FreezerError::NotSupported(WrappedIoError::Open {
                    err,
                    path: target,
                }))
            }
        };
        file.write_all(value.as_bytes()).wrap_write(&target, value)?;

        let actual = Self::read_freezer_state(path)?;
        if actual != freezer_state {
            return Err(V2FreezerError::ExpectedToBe {
                expected: freezer_state,
                actual,
            });
        }
        Ok(())
    }

    fn read_freezer_state(path: &Path) -> Result<FreezerState, V2FreezerError> {
        let target = path.join(CGROUP_FREEZE);
        let mut buf = [0; 1];
        OpenOptions::new()
            .read(true)
            .open(&target)
            .wrap_open(&target)?
            .read_exact(&mut buf)
            .wrap_read(&target)?;

        match str::from_utf8(&buf)? {
            "0" => Ok(FreezerState::Thawed),
            "1" => Self::wait_frozen(path),
            state => Err(V2FreezerError::UnknownState {
                state: state.into(),
            }),
        }
    }

    /// Writing "1" only requests the freeze. The kernel flips the `frozen`
    /// key of cgroup.events once every member has stopped.
    fn wait_frozen(path: &Path) -> Result<FreezerState, V2FreezerError> {
        let events = path.join(CGROUP_EVENTS);
        let file = OpenOptions::new()
            .read(true)
            .open(&events)
            .wrap_open(&events)?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        for attempt in 0..FREEZE_POLL_ATTEMPTS {
            reader.rewind().wrap_other(&events)?;
            let mut frozen = None;
            loop {
                line.clear();
                if reader.read_line(&mut line).wrap_read(&events)? == 0 {
                    break;
                }
                if let Some(value) = line.trim_end().strip_prefix("frozen ") {
                    frozen = Some(value == "1");
                    break;
                }
            }
            match frozen {
                Some(true) => {
                    tracing::debug!(attempt, "cgroup frozen");
                    return Ok(FreezerState::Frozen);
                }
                Some(false) => thread::sleep(FREEZE_POLL_INTERVAL),
                None => return Ok(FreezerState::Undefined),
            }
        }
        Err(V2FreezerError::Timeout(
            FREEZE_POLL_INTERVAL.as_millis() * u128::from(FREEZE_POLL_ATTEMPTS),
        ))
    }
}
