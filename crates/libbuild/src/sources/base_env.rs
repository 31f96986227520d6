//! Baseline `/.singularity.d` tree every built container carries.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use serde::Serialize;

use super::SourceError;

pub const METADATA_DIR: &str = ".singularity.d";
pub const ENV_DIR: &str = ".singularity.d/env";
pub const LABELS_FILE: &str = ".singularity.d/labels.json";
pub const RUNSCRIPT: &str = ".singularity.d/runscript";
pub const STARTSCRIPT: &str = ".singularity.d/startscript";
pub const TESTSCRIPT: &str = ".singularity.d/test";
pub const HELPFILE: &str = ".singularity.d/runscript.help";
pub const DEFFILE: &str = ".singularity.d/Singularity";
pub const ENVIRONMENT_SCRIPT: &str = ".singularity.d/env/90-environment.sh";
/// Where `%post` appends environment additions at build time.
pub const POST_ENVIRONMENT_SCRIPT: &str = ".singularity.d/env/91-environment.sh";

const DIRS: [&str; 11] = [
    ".singularity.d/libs",
    ".singularity.d/actions",
    ".singularity.d/env",
    "dev",
    "proc",
    "root",
    "var/tmp",
    "tmp",
    "etc",
    "sys",
    "home",
];

const SYMLINKS: [(&str, &str); 6] = [
    (".singularity.d/runscript", "singularity"),
    (".singularity.d/actions/run", ".run"),
    (".singularity.d/actions/exec", ".exec"),
    (".singularity.d/actions/test", ".test"),
    (".singularity.d/actions/shell", ".shell"),
    (".singularity.d/env/90-environment.sh", "environment"),
];

const SOURCE_ENV: &str = r#"for script in /.singularity.d/env/*.sh; do
    if [ -f "$script" ]; then
        . "$script"
    fi
done
"#;

const BASE_ENV: &str = r#"#!/bin/sh
# Base environment, sourced first.
"#;

const DEFAULT_ENVIRONMENT: &str = r#"#!/bin/sh
# Custom environment shell code should follow
"#;

const APPS_ENV: &str = r#"#!/bin/sh
if test -n "${SCIF_APPNAME:-}"; then
    for script in "/scif/apps/${SCIF_APPNAME}/scif/env/"*.sh; do
        if [ -f "$script" ]; then
            . "$script"
        fi
    done
fi
"#;

const BASE_TAIL: &str = r#"#!/bin/sh
if [ -z "${PATH:-}" ]; then
    PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin
fi
export PATH
PS1="Sifbox> "
export PS1
"#;

const RUNTIME_VARS: &str = r#"#!/bin/sh
if [ -n "${SIFBOX_PREPEND_PATH:-}" ]; then
    PATH="${SIFBOX_PREPEND_PATH}:${PATH}"
fi
if [ -n "${SIFBOX_APPEND_PATH:-}" ]; then
    PATH="${PATH}:${SIFBOX_APPEND_PATH}"
fi
export PATH
"#;

const DEFAULT_RUNSCRIPT: &str = r#"#!/bin/sh
echo "There is no runscript defined for this container"
"#;

const DEFAULT_STARTSCRIPT: &str = "#!/bin/sh\n";

fn action(body: &str) -> String {
    format!("#!/bin/sh\n{SOURCE_ENV}{body}")
}

fn actions() -> [(&'static str, String); 5] {
    [
        (".singularity.d/actions/exec", action("exec \"$@\"\n")),
        (
            ".singularity.d/actions/run",
            action(
                "if test -x /.singularity.d/runscript; then\n    exec /.singularity.d/runscript \"$@\"\nfi\necho \"No runscript found\" >&2\nexit 1\n",
            ),
        ),
        (".singularity.d/actions/shell", action("exec /bin/sh \"$@\"\n")),
        (
            ".singularity.d/actions/start",
            action("if test -x /.singularity.d/startscript; then\n    exec /.singularity.d/startscript \"$@\"\nfi\n"),
        ),
        (
            ".singularity.d/actions/test",
            action(
                "if test -x /.singularity.d/test; then\n    exec /.singularity.d/test \"$@\"\nfi\necho \"No test script found\" >&2\nexit 1\n",
            ),
        ),
    ]
}

/// Writes `content` at `path` with `mode`. An existing file only gets its
/// mode fixed unless `overwrite` is set.
/// Links are never followed: they may point anywhere on the host.
pub fn write_file(path: &Path, content: &str, mode: u32, overwrite: bool) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if !overwrite {
                return Ok(());
            }
            fs::remove_file(path)?;
        }
        Ok(_) if !overwrite => {
            return fs::set_permissions(path, fs::Permissions::from_mode(mode));
        }
        _ => {}
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Labels stored at `path`, empty when the file is missing or unreadable.
pub fn read_labels(path: &Path) -> BTreeMap<String, String> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
            tracing::warn!("ignoring malformed labels in {}: {err}", path.display());
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    }
}

/// Writes labels as tab indented JSON.
pub fn write_labels(path: &Path, labels: &BTreeMap<String, String>) -> io::Result<()> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    labels
        .serialize(&mut ser)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    out.push(b'\n');
    write_file(path, &String::from_utf8_lossy(&out), 0o644, true)
}

/// Lays out the metadata tree, mount points and action scripts in `rootfs`.
#[tracing::instrument(level = "debug")]
pub fn make_base_env(rootfs: &Path, overwrite: bool) -> Result<(), SourceError> {
    let wrap = |path: &Path| SourceError::io(path.to_path_buf());

    // the builder must be able to write into the rootfs it populates
    let meta = fs::metadata(rootfs).map_err(wrap(rootfs))?;
    let mode = meta.permissions().mode();
    if mode & 0o200 == 0 {
        fs::set_permissions(rootfs, fs::Permissions::from_mode(mode | 0o200)).map_err(wrap(rootfs))?;
    }

    for dir in DIRS {
        let path = rootfs.join(dir);
        fs::create_dir_all(&path).map_err(wrap(&path))?;
    }
    for (target, link) in SYMLINKS {
        let path = rootfs.join(link);
        if fs::symlink_metadata(&path).is_err() {
            symlink(target, &path).map_err(wrap(&path))?;
        }
    }

    for file in ["etc/hosts", "etc/resolv.conf"] {
        let path = rootfs.join(file);
        if fs::symlink_metadata(&path).is_err() {
            write_file(&path, "", 0o644, false).map_err(wrap(&path))?;
        }
    }

    for (rel, content) in actions() {
        let path = rootfs.join(rel);
        write_file(&path, &content, 0o755, overwrite).map_err(wrap(&path))?;
    }

    let env_files: [(&str, &str); 5] = [
        ("01-base.sh", BASE_ENV),
        ("90-environment.sh", DEFAULT_ENVIRONMENT),
        ("95-apps.sh", APPS_ENV),
        ("99-base.sh", BASE_TAIL),
        ("99-runtimevars.sh", RUNTIME_VARS),
    ];
    for (name, content) in env_files {
        let path = rootfs.join(ENV_DIR).join(name);
        write_file(&path, content, 0o755, overwrite).map_err(wrap(&path))?;
    }

    let path = rootfs.join(RUNSCRIPT);
    write_file(&path, DEFAULT_RUNSCRIPT, 0o755, overwrite).map_err(wrap(&path))?;
    let path = rootfs.join(STARTSCRIPT);
    write_file(&path, DEFAULT_STARTSCRIPT, 0o755, overwrite).map_err(wrap(&path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_base_env_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path();
        make_base_env(rootfs, false)?;

        for dir in DIRS {
            assert!(rootfs.join(dir).is_dir(), "{dir}");
        }
        assert_eq!(
            fs::read_link(rootfs.join("singularity"))?,
            Path::new(".singularity.d/runscript")
        );
        assert_eq!(
            fs::read_link(rootfs.join("environment"))?,
            Path::new(".singularity.d/env/90-environment.sh")
        );
        let exec = rootfs.join(".singularity.d/actions/exec");
        assert_eq!(fs::metadata(&exec)?.permissions().mode() & 0o777, 0o755);
        assert!(fs::read_to_string(exec)?.contains("exec \"$@\""));
        assert!(rootfs.join("etc/resolv.conf").is_file());
        Ok(())
    }

    #[test]
    fn test_existing_files_kept() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path();
        let runscript = rootfs.join(RUNSCRIPT);
        fs::create_dir_all(runscript.parent().unwrap())?;
        fs::write(&runscript, "#!/bin/sh\nexec python3\n")?;

        make_base_env(rootfs, false)?;
        assert_eq!(fs::read_to_string(&runscript)?, "#!/bin/sh\nexec python3\n");
        assert_eq!(fs::metadata(&runscript)?.permissions().mode() & 0o777, 0o755);

        make_base_env(rootfs, true)?;
        assert_eq!(fs::read_to_string(&runscript)?, DEFAULT_RUNSCRIPT);
        Ok(())
    }

    #[test]
    fn test_write_file_never_follows_links() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let outside = tmp.path().join("outside");
        fs::write(&outside, "host file")?;
        let link = tmp.path().join("runscript");
        symlink(&outside, &link)?;

        write_file(&link, "changed", 0o755, false)?;
        assert_eq!(fs::read_to_string(&outside)?, "host file");
        write_file(&link, "changed", 0o755, true)?;
        assert_eq!(fs::read_to_string(&outside)?, "host file");
        assert!(!fs::symlink_metadata(&link)?.file_type().is_symlink());
        Ok(())
    }

    #[test]
    fn test_labels_round_trip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(LABELS_FILE);
        assert!(read_labels(&path).is_empty());

        let mut labels = BTreeMap::new();
        labels.insert("maintainer".to_owned(), "hpc team".to_owned());
        write_labels(&path, &labels)?;
        assert!(fs::read_to_string(&path)?.contains("\n\t\"maintainer\": \"hpc team\""));
        assert_eq!(read_labels(&path), labels);
        Ok(())
    }
}
