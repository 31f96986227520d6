//! Maps a failed command to the process exit status.
use libbuild::error::{sif_kind, source_kind};
use libbuild::{BuildError, ErrorKind};
use libcontainer::error::LibcontainerError;
use libcontainer::instance::InstanceError;
use libcontainer::rootfs_exec::RootfsExecError;
use libsif::SifError;

pub const GENERIC: i32 = 1;
pub const ENGINE: i32 = 125;
pub const INTERNAL: i32 = 255;

fn kind_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::LifecycleState => ENGINE,
        ErrorKind::Internal => INTERNAL,
        ErrorKind::UserInput
        | ErrorKind::Resource
        | ErrorKind::TransientIo
        | ErrorKind::PermanentIo
        | ErrorKind::Verification
        | ErrorKind::Cancelled => GENERIC,
    }
}

fn instance_code(err: &InstanceError) -> i32 {
    match err {
        InstanceError::InvalidName(_) | InstanceError::Pattern(_) => GENERIC,
        _ => ENGINE,
    }
}

/// The first library error found along the context chain decides.
pub fn of(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<BuildError>() {
            return kind_code(e.kind());
        }
        if let Some(e) = cause.downcast_ref::<libbuild::sources::SourceError>() {
            return kind_code(source_kind(e));
        }
        if let Some(e) = cause.downcast_ref::<SifError>() {
            return kind_code(sif_kind(e));
        }
        if let Some(e) = cause.downcast_ref::<RootfsExecError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<LibcontainerError>() {
            return match e {
                LibcontainerError::Instance(inner) => instance_code(inner),
                e if e.is_user_input() => GENERIC,
                _ => ENGINE,
            };
        }
        if let Some(e) = cause.downcast_ref::<InstanceError>() {
            return instance_code(e);
        }
    }
    GENERIC
}
