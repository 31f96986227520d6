//! Bind points that make an LD_PRELOAD fakeroot helper usable inside the
//! rootfs during `%post`.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::StageError;
use crate::cancel::CancelToken;
use crate::command;
use crate::fsutil;

/// Library settings the helper exports to the programs it wraps.
#[derive(Debug, PartialEq, Eq)]
struct HelperEnv {
    preload: String,
    library_path: String,
}

fn parse_helper_env(helper: &Path, output: &str) -> Result<HelperEnv, StageError> {
    let value = |key: &str| {
        output
            .lines()
            .filter_map(|line| line.strip_prefix(key))
            .last()
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    let missing = |var: &str| StageError::Fakeroot {
        path: helper.to_path_buf(),
        reason: format!("no {var} in fakeroot environment"),
    };
    Ok(HelperEnv {
        preload: value("LD_PRELOAD=").ok_or_else(|| missing("LD_PRELOAD"))?,
        library_path: value("LD_LIBRARY_PATH=").ok_or_else(|| missing("LD_LIBRARY_PATH"))?,
    })
}

fn helper_env(helper: &Path, cancel: &CancelToken) -> Result<HelperEnv, StageError> {
    let mut cmd = Command::new(helper);
    cmd.arg("env").env_remove("LD_LIBRARY_PATH");
    let output = command::output(&mut cmd, cancel).map_err(|err| StageError::Fakeroot {
        path: helper.to_path_buf(),
        reason: err.to_string(),
    })?;
    parse_helper_env(helper, &output.stdout)
}

fn make_file_point(rootfs: &Path, point: &str) -> Result<(), StageError> {
    tracing::debug!("Making file mountpoint {point}");
    let path = rootfs.join(point.trim_start_matches('/'));
    fsutil::ensure_file(&path).map_err(StageError::io(&path))?;
    Ok(())
}

fn make_dir_point(rootfs: &Path, point: &str) -> Result<(), StageError> {
    tracing::debug!("Making directory mountpoint {point}");
    let path = rootfs.join(point.trim_start_matches('/'));
    fs::create_dir_all(&path).map_err(StageError::io(&path))
}

/// Creates bind points for the helper, `faked` and the preload library
/// directory, returning bind specs in `src:dst` form. A spec ending in `/`
/// binds a directory at the same path.
pub fn make_bindpoints(rootfs: &Path, helper: &Path, cancel: &CancelToken) -> Result<Vec<String>, StageError> {
    let env = helper_env(helper, cancel)?;
    bindpoints_for(rootfs, helper, &env)
}

fn bindpoints_for(rootfs: &Path, helper: &Path, env: &HelperEnv) -> Result<Vec<String>, StageError> {
    let mut binds = Vec::new();
    make_file_point(rootfs, "/usr/bin/fakeroot")?;
    binds.push(format!("{}:/usr/bin/fakeroot", helper.display()));

    let dir = helper.parent().unwrap_or(Path::new("/"));
    let faked = dir.join("faked");
    if faked.exists() {
        make_file_point(rootfs, "/usr/bin/faked")?;
        binds.push(format!("{}:/usr/bin/faked", faked.display()));
    }
    // libfakeroot-sysv.so pairs with faked-sysv
    let stem = env.preload.split('.').next().unwrap_or_default();
    if let Some((_, flavor)) = stem.split_once('-') {
        let flavor = flavor.split('-').next().unwrap_or(flavor);
        let src = dir.join(format!("faked-{flavor}"));
        if src.exists() {
            let point = format!("/usr/bin/faked-{flavor}");
            make_file_point(rootfs, &point)?;
            binds.push(format!("{}:{point}", src.display()));
        }
    }
    let lib_dir = env
        .library_path
        .split(':')
        .filter(|d| !d.is_empty())
        .find(|d| Path::new(d).join(&env.preload).exists());
    if let Some(lib_dir) = lib_dir {
        make_dir_point(rootfs, lib_dir)?;
        binds.push(format!("{}/", lib_dir.trim_end_matches('/')));
    }
    Ok(binds)
}

/// Removes the bind points created by [`make_bindpoints`]: directories up to
/// the first non empty parent, files only while still empty.
pub fn clean_bindpoints(rootfs: &Path, binds: &[String]) {
    for bind in binds {
        let point = bind.rsplit(':').next().unwrap_or(bind);
        tracing::debug!("Removing {point} mount point");
        let mut path: PathBuf = rootfs.join(point.trim_start_matches('/').trim_end_matches('/'));
        if point.ends_with('/') {
            while path.starts_with(rootfs) && path != rootfs {
                if let Err(err) = fs::remove_dir(&path) {
                    tracing::debug!("Removing {} did not succeed because: {err}", path.display());
                    break;
                }
                match path.parent() {
                    Some(parent) => path = parent.to_path_buf(),
                    None => break,
                }
            }
        } else if fs::metadata(&path).map_or(false, |m| m.len() == 0) {
            let _ = fs::remove_file(&path);
        }
    }
}
