use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use libcontainer::utils::{create_dir_all_with_mode, rootless_required};
use nix::sys::stat::Mode;
use nix::unistd::getuid;

/// Directory holding the state of OCI containers. An explicit `--root` wins;
/// root uses the system runtime directory and everybody else the first
/// candidate that can be created with mode 0700.
pub fn determine(root_path: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();

    if let Some(path) = root_path {
        if !path.exists() {
            create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)?;
        }
        return path
            .canonicalize()
            .with_context(|| format!("failed to resolve root {}", path.display()));
    }

    if !rootless_required() {
        let path = system_root();
        create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)?;
        return Ok(path);
    }

    for candidate in rootless_candidates(uid) {
        match create_dir_all_with_mode(&candidate, uid, Mode::S_IRWXU) {
            Ok(()) => return Ok(candidate),
            Err(err) => tracing::debug!(path = %candidate.display(), %err, "root not usable"),
        }
    }
    bail!("could not find a storage location with suitable permissions for the current user")
}

/// Per-user locations in the order they are tried.
fn rootless_candidates(uid: u32) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(dir).join("sifbox"));
    }
    candidates.push(user_run_dir(uid));
    if let Some(home) = std::env::var_os("HOME").and_then(|h| std::fs::canonicalize(h).ok()) {
        candidates.push(home.join(".sifbox/run"));
    }
    candidates.push(PathBuf::from(format!("/tmp/sifbox-{uid}")));
    candidates
}

#[cfg(not(test))]
fn system_root() -> PathBuf {
    PathBuf::from("/run/sifbox")
}

#[cfg(test)]
fn system_root() -> PathBuf {
    std::env::temp_dir().join("sifbox-system-root")
}

#[cfg(not(test))]
fn user_run_dir(uid: u32) -> PathBuf {
    PathBuf::from(format!("/run/user/{uid}/sifbox"))
}

#[cfg(test)]
fn user_run_dir(uid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("sifbox-user-run-{uid}"))
}
