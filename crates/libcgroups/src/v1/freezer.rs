use std::path::Path;
use std::thread;
use std::time::Duration;

use super::controller::Controller;
use crate::common::{self, ControllerOpt, FreezerState, WrapIoResult, WrappedIoError};

const CGROUP_FREEZER_STATE: &str = "freezer.state";
const FREEZER_STATE_THAWED: &str = "THAWED";
const FREEZER_STATE_FROZEN: &str = "FROZEN";
const FREEZER_STATE_FREEZING: &str = "FREEZING";

#[derive(thiserror::Error, Debug)]
pub enum V1FreezerControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("unexpected state {state} while freezing")]
    UnexpectedState { state: String },
    #[error("cgroup did not reach FROZEN after {0} attempts")]
    UnableToFreeze(usize),
}

pub struct Freezer {}

impl Controller for Freezer {
    type Error = V1FreezerControllerError;
    type Resource = FreezerState;

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        if let Some(state) = Self::needs_to_handle(controller_opt) {
            tracing::debug!(?state, "apply freezer cgroup v1 config");
            std::fs::create_dir_all(cgroup_root).wrap_create_dir(cgroup_root)?;
            Self::set_state(*state, cgroup_root)?;
        }

        Ok(())
    }

    fn needs_to_handle<'a>(controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        controller_opt.freezer_state.as_ref()
    }
}

impl Freezer {
    const FREEZE_ATTEMPTS: usize = 1000;

    fn set_state(state: FreezerState, cgroup_root: &Path) -> Result<(), V1FreezerControllerError> {
        let state_file = cgroup_root.join(CGROUP_FREEZER_STATE);
        match state {
            FreezerState::Undefined => Ok(()),
            FreezerState::Thawed => {
                common::write_cgroup_file_str(&state_file, FREEZER_STATE_THAWED)?;
                Ok(())
            }
            FreezerState::Frozen => {
                let result = Self::freeze(cgroup_root);
                if result.is_err() {
                    // never leave a half frozen cgroup behind
                    let _ = common::write_cgroup_file_str(&state_file, FREEZER_STATE_THAWED);
                }
                result
            }
        }
    }

    /// The kernel may report FREEZING for a while. Keep writing FROZEN, and
    /// every so often thaw briefly so stuck tasks get a chance to move.
    fn freeze(cgroup_root: &Path) -> Result<(), V1FreezerControllerError> {
        let state_file = cgroup_root.join(CGROUP_FREEZER_STATE);
        for attempt in 0..Self::FREEZE_ATTEMPTS {
            if attempt % 50 == 49 {
                let _ = common::write_cgroup_file_str(&state_file, FREEZER_STATE_THAWED);
                thread::sleep(Duration::from_millis(10));
            }

            common::write_cgroup_file_str(&state_file, FREEZER_STATE_FROZEN)?;
            if attempt % 25 == 24 {
                thread::sleep(Duration::from_millis(10));
            }

            let current = Self::read_freezer_state(cgroup_root)?;
            match current.trim() {
                FREEZER_STATE_FREEZING => continue,
                FREEZER_STATE_FROZEN => {
                    if attempt > 1 {
                        tracing::debug!("frozen after {} attempts", attempt);
                    }
                    return Ok(());
                }
                other => {
                    return Err(V1FreezerControllerError::UnexpectedState {
                        state: other.to_owned(),
                    })
                }
            }
        }

        Err(V1FreezerControllerError::UnableToFreeze(
            Self::FREEZE_ATTEMPTS,
        ))
    }

    fn read_freezer_state(cgroup_root: &Path) -> Result<String, WrappedIoError> {
        common::read_cgroup_file(cgroup_root.join(CGROUP_FREEZER_STATE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_set_thawed() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_FREEZER_STATE, FREEZER_STATE_FROZEN).unwrap();
        Freezer::set_state(FreezerState::Thawed, tmp.path()).unwrap();
        assert_eq!(
            Freezer::read_freezer_state(tmp.path()).unwrap(),
            FREEZER_STATE_THAWED
        );
    }

    #[test]
    fn test_set_frozen_on_plain_file() {
        // a regular file echoes back whatever was written last
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_FREEZER_STATE, FREEZER_STATE_THAWED).unwrap();
        Freezer::set_state(FreezerState::Frozen, tmp.path()).unwrap();
        assert_eq!(
            Freezer::read_freezer_state(tmp.path()).unwrap(),
            FREEZER_STATE_FROZEN
        );
    }

    #[test]
    fn test_undefined_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Freezer::set_state(FreezerState::Undefined, tmp.path()).is_ok());
        assert!(!tmp.path().join(CGROUP_FREEZER_STATE).exists());
    }
}
