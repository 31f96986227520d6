//! `%files` transfers into a bundle rootfs, from the build host or from the
//! rootfs of an earlier stage.
use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

use super::StageError;
use crate::definition::FileTransfer;
use crate::fsutil::{self, Ownership};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Resolves `path` under `root` with every link interpreted relative to
/// `root`. A trailing slash on `path` is kept.
pub(crate) fn scoped(root: &Path, path: &str) -> Result<PathBuf, StageError> {
    let mut out = safe_path::scoped_join(root, path.trim_start_matches('/'))
        .map_err(|_| StageError::UnsafePath(path.to_owned()))?;
    if path.ends_with('/') && !out.as_os_str().to_string_lossy().ends_with('/') {
        out.as_mut_os_string().push("/");
    }
    Ok(out)
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, StageError> {
    let paths = glob::glob_with(pattern, GLOB_OPTIONS).map_err(|err| StageError::Pattern {
        pattern: pattern.to_owned(),
        err,
    })?;
    paths
        .map(|entry| {
            entry.map_err(|err| StageError::Io {
                path: err.path().to_path_buf(),
                err: err.into_error(),
            })
        })
        .collect()
}

/// Matches of `src` inside the rootfs `root`, each paired with its path
/// relative to `root`. Results always stay under `root`.
fn expand_in_root(root: &Path, src: &str) -> Result<Vec<(PathBuf, String)>, StageError> {
    let rel = src.trim_start_matches('/');
    if !has_wildcard(rel) {
        return Ok(vec![(scoped(root, rel)?, rel.to_owned())]);
    }
    let prefix = Pattern::escape(&root.to_string_lossy());
    let mut out = Vec::new();
    for path in glob_paths(&format!("{}/{rel}", prefix.trim_end_matches('/')))? {
        let rel = path
            .strip_prefix(root)
            .map_err(|_| StageError::UnsafePath(path.display().to_string()))?
            .to_string_lossy()
            .into_owned();
        // intermediate links may have been followed by the glob walk
        out.push((scoped(root, &rel)?, rel));
    }
    if out.is_empty() {
        return Err(StageError::NoMatch(src.to_owned()));
    }
    Ok(out)
}

/// Matches of `src` on the build host; relative paths start at the working
/// directory.
fn expand_on_host(src: &str) -> Result<Vec<(PathBuf, String)>, StageError> {
    if !has_wildcard(src) {
        return Ok(vec![(PathBuf::from(src), src.to_owned())]);
    }
    let out: Vec<_> = glob_paths(src)?
        .into_iter()
        .map(|path| {
            let display = path.to_string_lossy().into_owned();
            (path, display)
        })
        .collect();
    if out.is_empty() {
        return Err(StageError::NoMatch(src.to_owned()));
    }
    Ok(out)
}

/// Final location of `src` in `rootfs`. Existing directories and paths
/// with a trailing slash receive the source by its base name.
fn destination(rootfs: &Path, src: &Path, dst: &str, into_dir: bool) -> Result<PathBuf, StageError> {
    let target = scoped(rootfs, dst)?;
    let as_dir = into_dir || dst.ends_with('/') || target.is_dir();
    let target = if as_dir {
        fs::create_dir_all(&target).map_err(StageError::io(&target))?;
        let name = src
            .file_name()
            .ok_or_else(|| StageError::UnsafePath(src.display().to_string()))?;
        target.join(name)
    } else {
        target
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(StageError::io(parent))?;
    }
    Ok(target)
}

fn copy_matches(
    matches: Vec<(PathBuf, String)>,
    transfer: &FileTransfer,
    rootfs: &Path,
) -> Result<(), StageError> {
    // an omitted destination mirrors each matched source path
    let mirror = transfer.dst == transfer.src && has_wildcard(&transfer.src);
    let into_dir = !mirror && matches.len() > 1;
    for (src, rel) in matches {
        let dst = if mirror { rel.as_str() } else { transfer.dst.as_str() };
        let target = destination(rootfs, &src, dst, into_dir)?;
        tracing::debug!(src = ?src, dst = ?target, "copying");
        fsutil::copy_tree(&src, &target, Ownership::Preserve)?;
    }
    Ok(())
}

fn checked(transfer: &FileTransfer) -> bool {
    if transfer.src.is_empty() {
        tracing::warn!("Attempt to copy file with no name, skipping.");
        return false;
    }
    tracing::info!("Copying {} to {}", transfer.src, transfer.dst);
    true
}

/// Copies host paths into `rootfs`.
pub fn copy_from_host(transfers: &[FileTransfer], rootfs: &Path) -> Result<(), StageError> {
    for transfer in transfers.iter().filter(|t| checked(t)) {
        let matches = expand_on_host(&transfer.src)?;
        copy_matches(matches, transfer, rootfs)?;
    }
    Ok(())
}

/// Copies paths out of an earlier stage's rootfs `src_root` into `rootfs`.
pub fn copy_from_stage(transfers: &[FileTransfer], src_root: &Path, rootfs: &Path) -> Result<(), StageError> {
    for transfer in transfers.iter().filter(|t| checked(t)) {
        let matches = expand_in_root(src_root, &transfer.src)?;
        copy_matches(matches, transfer, rootfs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn transfer(src: &str, dst: &str) -> FileTransfer {
        FileTransfer {
            src: src.into(),
            dst: dst.into(),
        }
    }

    #[test]
    fn test_scoped_keeps_trailing_slash() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        assert_eq!(scoped(tmp.path(), "/opt/")?, tmp.path().join("opt/"));
        assert!(scoped(tmp.path(), "/opt/")?.to_string_lossy().ends_with('/'));
        assert_eq!(scoped(tmp.path(), "../../etc")?, tmp.path().join("etc"));
        Ok(())
    }

    #[test]
    fn test_copy_from_stage_glob() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (src_root, rootfs) = (tmp.path().join("one"), tmp.path().join("two"));
        fs::create_dir_all(src_root.join("data"))?;
        fs::create_dir_all(&rootfs)?;
        fs::write(src_root.join("data/a.csv"), "a")?;
        fs::write(src_root.join("data/b.csv"), "b")?;
        fs::write(src_root.join("data/c.txt"), "c")?;

        copy_from_stage(&[transfer("/data/*.csv", "/in/")], &src_root, &rootfs)?;
        assert_eq!(fs::read_to_string(rootfs.join("in/a.csv"))?, "a");
        assert_eq!(fs::read_to_string(rootfs.join("in/b.csv"))?, "b");
        assert!(!rootfs.join("in/c.txt").exists());

        // omitted destination mirrors the source layout
        copy_from_stage(&[transfer("data/*.txt", "data/*.txt")], &src_root, &rootfs)?;
        assert_eq!(fs::read_to_string(rootfs.join("data/c.txt"))?, "c");
        Ok(())
    }

    #[test]
    fn test_copy_from_stage_cannot_escape() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (src_root, rootfs) = (tmp.path().join("one"), tmp.path().join("two"));
        fs::create_dir_all(&src_root)?;
        fs::create_dir_all(&rootfs)?;
        fs::write(tmp.path().join("secret"), "host")?;
        symlink("/", src_root.join("host"))?;

        // the link resolves to the stage root, where no secret exists
        let err = copy_from_stage(
            &[transfer(&format!("host{}/secret", tmp.path().display()), "/secret")],
            &src_root,
            &rootfs,
        );
        assert!(err.is_err());
        assert!(!rootfs.join("secret").exists());
        Ok(())
    }

    #[test]
    fn test_copy_from_host_into_existing_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("opt"))?;
        let host = tmp.path().join("tool.sh");
        fs::write(&host, "#!/bin/sh\n")?;

        let src = host.to_string_lossy().into_owned();
        copy_from_host(&[transfer(&src, "/opt"), transfer(&src, "/usr/bin/tool")], &rootfs)?;
        assert!(rootfs.join("opt/tool.sh").is_file());
        assert!(rootfs.join("usr/bin/tool").is_file());
        Ok(())
    }

    #[test]
    fn test_unmatched_wildcard_fails() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let pattern = format!("{}/nothing-*", tmp.path().display());
        assert!(matches!(
            copy_from_host(&[transfer(&pattern, "/x")], tmp.path()),
            Err(StageError::NoMatch(_))
        ));
        // empty names are skipped with a warning
        copy_from_host(&[transfer("", "/x")], tmp.path())?;
        Ok(())
    }
}
