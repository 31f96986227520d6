use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use libbuild::config::{BuildEnv, BuildOptions, OutputFormat};
use libbuild::sources::BuildContext;
use libbuild::BuildSpec;
use libcontainer::instance::{start_instance, validate_name, LaunchOptions, APP_SUBDIR};
use libcontainer::utils;

/// Start a named instance of an image in the background
#[derive(Parser, Debug)]
pub struct Start {
    /// Bind mount into the instance, src[:dst[:opts]]
    #[clap(short = 'B', long = "bind")]
    pub binds: Vec<String>,
    /// Start from a clean environment
    #[clap(short, long)]
    pub cleanenv: bool,
    /// Environment variable NAME=VALUE for the start script
    #[clap(long)]
    pub env: Vec<String>,
    /// Run as root in a user namespace
    #[clap(short = 'u', long)]
    pub userns: bool,

    /// Image file or sandbox directory
    #[clap(required = true)]
    pub image: PathBuf,
    /// Name of the instance
    #[clap(required = true)]
    pub name: String,
    /// Arguments passed to the start script
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Start {
    fn exec_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for bind in &self.binds {
            args.push("-B".to_owned());
            args.push(bind.clone());
        }
        for env in &self.env {
            args.push("--env".to_owned());
            args.push(env.clone());
        }
        if self.cleanenv {
            args.push("--cleanenv".to_owned());
        }
        if self.userns {
            args.push("--userns".to_owned());
        }
        args
    }
}

/// Image files are unpacked into a sandbox owned by the instance.
fn prepare_rootfs(env: &BuildEnv, image: &Path, name: &str) -> Result<(PathBuf, bool)> {
    if image.is_dir() {
        return Ok((image.to_path_buf(), false));
    }
    let dest = env.tmp_dir().join(format!(
        "sifbox-instance-{}-{}-{}",
        utils::current_user_name(),
        name,
        std::process::id()
    ));
    let spec = BuildSpec::resolve(&image.to_string_lossy())?;
    let recipe = spec.recipe(&Default::default())?;
    let cache = crate::commands::build::open_cache(env, false)?;
    let ctx = BuildContext::new(env.clone(), cache);
    let opts = BuildOptions {
        format: OutputFormat::Sandbox,
        notest: true,
        exe: crate::commands::current_exe()?,
        ..Default::default()
    };
    tracing::info!("Extracting {} to {}", image.display(), dest.display());
    if let Err(err) = libbuild::build(&ctx, &dest, &recipe, &opts) {
        let _ = fs::remove_dir_all(&dest);
        return Err(err).with_context(|| format!("failed to extract {}", image.display()));
    }
    Ok((dest, true))
}

pub fn start(args: Start) -> Result<()> {
    validate_name(&args.name)?;
    if !args.image.exists() {
        bail!("image {} does not exist", args.image.display());
    }
    let registry = crate::commands::registry(APP_SUBDIR, None)?;
    if !registry.list(&args.name)?.is_empty() {
        bail!("instance {} already exists", args.name);
    }

    let env = BuildEnv::from_env()?;
    let Some(home) = env.home().map(Path::to_path_buf) else {
        bail!("HOME is not set, cannot place the instance logs");
    };
    let image = fs::canonicalize(&args.image)
        .with_context(|| format!("failed to resolve {}", args.image.display()))?;
    let (rootfs, owns_rootfs) = prepare_rootfs(&env, &image, &args.name)?;

    let opts = LaunchOptions {
        name: args.name.clone(),
        image: image.display().to_string(),
        rootfs: rootfs.clone(),
        owns_rootfs,
        launcher: crate::commands::current_exe()?,
        exec_args: args.exec_args(),
        args: args.args.clone(),
        log_dir: home.join(".sifbox/instances/logs"),
        user: utils::current_user_name(),
        host: utils::hostname(),
    };
    match start_instance(&registry, &opts) {
        Ok(record) => {
            eprintln!("instance started successfully");
            tracing::debug!(pid = record.pid, "instance {} is running", record.name);
            Ok(())
        }
        Err(err) => {
            if owns_rootfs {
                let _ = fs::remove_dir_all(&rootfs);
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_args() -> Result<()> {
        let args = Start::try_parse_from([
            "start", "-B", "/data", "--env", "PORT=80", "--cleanenv", "web.sif", "web", "--", "-v",
        ])?;
        assert_eq!(args.exec_args(), ["-B", "/data", "--env", "PORT=80", "--cleanenv"]);
        assert_eq!(args.name, "web");
        assert_eq!(args.args, ["-v"]);
        Ok(())
    }

    #[test]
    fn test_sandbox_is_used_in_place() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned())])?;
        let (rootfs, owned) = prepare_rootfs(&env, tmp.path(), "web")?;
        assert_eq!(rootfs, tmp.path());
        assert!(!owned);
        Ok(())
    }
}
