//! Namespace handling shared by the container init process, `exec` into a
//! running container and the rootfs launcher: unsharing the set a spec asks
//! for, mapping the caller to root in a fresh user namespace and collecting
//! another process' namespaces to join.

use std::fs::{self, File};
use std::os::fd::{AsFd, OwnedFd};
use std::os::linux::fs::MetadataExt;
use std::path::PathBuf;

use nix::sched::{self, CloneFlags};
use nix::unistd::{Gid, Pid, Uid};
use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceType};

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("failed to unshare {flags:?}: {err}")]
    Unshare { flags: CloneFlags, err: nix::Error },
    #[error("failed to join namespace {path}: {err}")]
    Setns { path: PathBuf, err: nix::Error },
    #[error("failed to write {path}: {err}")]
    Mapping {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to open namespace {path}: {err}")]
    Open {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, NamespaceError>;

// user first so the remaining ones are owned by it, mount last
static ORDERED_NAMESPACES: &[(CloneFlags, &str)] = &[
    (CloneFlags::CLONE_NEWUSER, "user"),
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWUTS, "uts"),
    (CloneFlags::CLONE_NEWIPC, "ipc"),
    (CloneFlags::CLONE_NEWNET, "net"),
    (CloneFlags::CLONE_NEWCGROUP, "cgroup"),
    (CloneFlags::CLONE_NEWNS, "mnt"),
];

pub fn clone_flag(namespace_type: LinuxNamespaceType) -> CloneFlags {
    match namespace_type {
        LinuxNamespaceType::User => CloneFlags::CLONE_NEWUSER,
        LinuxNamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        LinuxNamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        LinuxNamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        LinuxNamespaceType::Network => CloneFlags::CLONE_NEWNET,
        LinuxNamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        LinuxNamespaceType::Mount => CloneFlags::CLONE_NEWNS,
    }
}

/// Flags to unshare for the namespaces of a spec. Namespaces given by path
/// are joined with [`join_paths`] instead. A pid namespace only applies to
/// children of the caller, so it is left out for a process about to exec.
pub fn unshare_flags(namespaces: &[LinuxNamespace]) -> CloneFlags {
    namespaces
        .iter()
        .filter(|ns| ns.path().is_none())
        .map(|ns| clone_flag(ns.typ()))
        .filter(|flag| *flag != CloneFlags::CLONE_NEWPID)
        .fold(CloneFlags::empty(), |acc, flag| acc | flag)
}

pub fn unshare(flags: CloneFlags) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    tracing::debug!(?flags, "unshare");
    sched::unshare(flags).map_err(|err| NamespaceError::Unshare { flags, err })
}

/// Joins the namespaces a spec names by path.
pub fn join_paths(namespaces: &[LinuxNamespace]) -> Result<()> {
    for ns in namespaces {
        let Some(path) = ns.path() else { continue };
        let file = File::open(path).map_err(|err| NamespaceError::Open {
            path: path.clone(),
            err,
        })?;
        sched::setns(file.as_fd(), clone_flag(ns.typ())).map_err(|err| NamespaceError::Setns {
            path: path.clone(),
            err,
        })?;
    }
    Ok(())
}

/// Unshares a user namespace in which the caller is mapped to root, or to
/// itself when `as_root` is false. Must run single threaded.
pub fn enter_user_namespace(as_root: bool) -> Result<()> {
    let uid = Uid::effective();
    let gid = Gid::effective();
    unshare(CloneFlags::CLONE_NEWUSER)?;
    let (inner_uid, inner_gid) = if as_root {
        (0, 0)
    } else {
        (uid.as_raw(), gid.as_raw())
    };
    write_proc_self("setgroups", "deny")?;
    write_proc_self("uid_map", &format!("{inner_uid} {uid} 1"))?;
    write_proc_self("gid_map", &format!("{inner_gid} {gid} 1"))?;
    Ok(())
}

fn write_proc_self(name: &str, data: &str) -> Result<()> {
    let path = PathBuf::from("/proc/self").join(name);
    fs::write(&path, data).map_err(|err| NamespaceError::Mapping { path, err })
}

/// Namespaces of `pid` that differ from the caller's, opened for `setns`
/// in the order they must be joined.
pub fn foreign_namespaces(pid: Pid) -> Result<Vec<(OwnedFd, CloneFlags)>> {
    let mut joined = Vec::new();
    for (flag, name) in ORDERED_NAMESPACES {
        let theirs = PathBuf::from(format!("/proc/{pid}/ns/{name}"));
        let ours = PathBuf::from(format!("/proc/self/ns/{name}"));
        let (Ok(theirs_meta), Ok(ours_meta)) = (fs::metadata(&theirs), fs::metadata(&ours)) else {
            continue;
        };
        if theirs_meta.st_ino() == ours_meta.st_ino() {
            continue;
        }
        let file = File::open(&theirs).map_err(|err| NamespaceError::Open {
            path: theirs.clone(),
            err,
        })?;
        joined.push((OwnedFd::from(file), *flag));
    }
    Ok(joined)
}
