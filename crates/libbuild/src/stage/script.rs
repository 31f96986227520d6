//! Scriptlet plumbing shared by host sections and the re-executed `%post`.
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Command;

use super::StageError;
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::command;
use crate::definition::Script;

pub const ENV_ENVIRONMENT: &str = "SINGULARITY_ENVIRONMENT=/.singularity.d/env/91-environment.sh";
pub const LABELS_PATH: &str = "/.build.labels";
pub const ENV_LABELS: &str = "SINGULARITY_LABELS=/.build.labels";

const ENV_PREFIX: &str = "SIFBOX_";

/// `/bin/sh -ex` followed by the section arguments and `script`. With `-c`
/// every word after it and the script path collapse into one argument.
pub fn section_args(name: &str, script: &str, section: &Script) -> Result<Vec<String>, StageError> {
    let mut args = vec!["/bin/sh".to_owned(), "-ex".to_owned()];
    let params: Vec<&str> = section
        .args
        .split('#')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .collect();

    match params.iter().position(|p| *p == "-c") {
        Some(i) => {
            let rest = &params[i + 1..];
            if rest.is_empty() {
                return Err(StageError::MissingShellArgs {
                    section: name.to_owned(),
                });
            }
            args.extend(params[..=i].iter().map(|p| p.to_string()));
            args.push(format!("{} {script}", rest.join(" ")));
        }
        None => {
            args.extend(params.iter().map(|p| p.to_string()));
            args.push(script.to_owned());
        }
    }
    Ok(args)
}

/// Creates an executable script; fails if `path` already exists.
pub fn write_script(path: &Path, body: &str) -> Result<(), StageError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o755)
        .open(path)
        .map_err(StageError::io(path))?;
    file.write_all(body.as_bytes()).map_err(StageError::io(path))
}

/// Current environment without `SIFBOX_*` variables, for commands that must
/// not inherit build configuration.
pub fn env_without_prefix() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| !key.starts_with(ENV_PREFIX))
        .collect()
}

/// Runs a host side section (`pre`, `setup`) with `/bin/sh` as the invoking
/// user. Skipped when empty or deselected.
pub fn run_host_section(
    name: &str,
    section: &Script,
    bundle: &Bundle,
    docker_host: Option<&str>,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    if !bundle.run_section(name) || section.is_empty() {
        return Ok(());
    }
    let path = bundle.tmp_dir().join(name);
    write_script(&path, &section.body)?;
    let result = section_args(name, &path.to_string_lossy(), section).and_then(|args| {
        let (key, value) = ENV_ENVIRONMENT.split_once('=').unwrap_or_default();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .env(key, value)
            .env("SINGULARITY_ROOTFS", bundle.rootfs());
        if let Some(host) = docker_host {
            cmd.env("DOCKER_HOST", host);
        }
        tracing::info!("Running {name} scriptlet");
        command::run(&mut cmd, cancel).map_err(|err| StageError::Script {
            section: name.to_owned(),
            err,
        })
    });
    let _ = std::fs::remove_file(&path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildEnv, BuildOptions, SectionSelection};
    use crate::definition::Definition;

    fn script(args: &str, body: &str) -> Script {
        Script {
            args: args.into(),
            body: body.into(),
        }
    }

    #[test]
    fn test_section_args_plain() -> anyhow::Result<()> {
        assert_eq!(
            section_args("setup", "/tmp/setup", &script("", "true"))?,
            vec!["/bin/sh", "-ex", "/tmp/setup"]
        );
        assert_eq!(
            section_args("setup", "/tmp/setup", &script("-u # strict", "true"))?,
            vec!["/bin/sh", "-ex", "-u", "/tmp/setup"]
        );
        Ok(())
    }

    #[test]
    fn test_section_args_command_option() -> anyhow::Result<()> {
        assert_eq!(
            section_args("post", "/.post.script", &script("-c /bin/bash -l", "true"))?,
            vec!["/bin/sh", "-ex", "-c", "/bin/bash -l /.post.script"]
        );
        assert!(matches!(
            section_args("post", "/.post.script", &script("-c", "true")),
            Err(StageError::MissingShellArgs { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_write_script_refuses_existing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("pre");
        write_script(&path, "echo hi\n")?;
        assert!(write_script(&path, "echo again\n").is_err());
        assert_eq!(std::fs::read_to_string(&path)?, "echo hi\n");
        Ok(())
    }

    #[test]
    fn test_host_section_sees_rootfs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned())])?;
        let bundle = Bundle::new(
            &tmp.path().join("out.sif"),
            Definition::default(),
            &BuildOptions::default(),
            &env,
        )?;
        let body = "echo \"$SINGULARITY_ROOTFS\" > \"$SINGULARITY_ROOTFS/marker\"\n";
        run_host_section("setup", &script("", body), &bundle, None, &CancelToken::new())?;
        let marker = std::fs::read_to_string(bundle.rootfs().join("marker"))?;
        assert_eq!(marker.trim(), bundle.rootfs().to_string_lossy());
        assert!(!bundle.tmp_dir().join("setup").exists());
        Ok(())
    }

    #[test]
    fn test_host_section_failure_and_selection() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned())])?;
        let opts = BuildOptions {
            sections: SectionSelection::List(vec!["pre".into()]),
            ..Default::default()
        };
        let bundle = Bundle::new(&tmp.path().join("out.sif"), Definition::default(), &opts, &env)?;
        let cancel = CancelToken::new();
        // deselected sections never run
        run_host_section("setup", &script("", "exit 3"), &bundle, None, &cancel)?;
        assert!(matches!(
            run_host_section("pre", &script("", "exit 3"), &bundle, None, &cancel),
            Err(StageError::Script { .. })
        ));
        Ok(())
    }
}
