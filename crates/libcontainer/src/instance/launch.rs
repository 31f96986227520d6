use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use nix::unistd;

use super::{io_err, validate_name, InstanceError, InstanceFile, InstanceRegistry, Result};

/// Action script every sandbox carries to run its start script.
pub const START_ACTION: &str = "/.singularity.d/actions/start";

/// Time a fresh instance gets to fail before it counts as started.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub name: String,
    /// Image reference shown in listings.
    pub image: String,
    /// Sandbox directory the instance runs in.
    pub rootfs: PathBuf,
    /// Remove `rootfs` once the instance is stopped, set when it was
    /// extracted from an image file for this instance only.
    pub owns_rootfs: bool,
    /// Binary providing the `exec` entry point.
    pub launcher: PathBuf,
    /// Extra `exec` flags such as bind paths.
    pub exec_args: Vec<String>,
    /// Arguments passed to the start script.
    pub args: Vec<String>,
    /// Directory holding `<host>/<user>/<name>.{out,err}`.
    pub log_dir: PathBuf,
    pub user: String,
    pub host: String,
}

impl LaunchOptions {
    pub fn log_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.log_dir.join(&self.host).join(&self.user);
        (
            dir.join(format!("{}.out", self.name)),
            dir.join(format!("{}.err", self.name)),
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.launcher);
        cmd.args(["exec", "--instance", "--pwd", "/"])
            .args(&self.exec_args)
            .arg(&self.rootfs)
            .arg(START_ACTION)
            .args(&self.args);
        cmd
    }
}

/// Launches an instance in the background in a session of its own and
/// records it in `registry`.
#[tracing::instrument(level = "debug", skip(registry, opts), fields(name = %opts.name))]
pub fn start_instance(registry: &InstanceRegistry, opts: &LaunchOptions) -> Result<InstanceFile> {
    validate_name(&opts.name)?;
    if !registry.list(&opts.name)?.is_empty() {
        return Err(InstanceError::Exists(opts.name.clone()));
    }

    let (out_path, err_path) = opts.log_paths();
    let log_dir = out_path.parent().unwrap_or_else(|| Path::new("/"));
    fs::create_dir_all(log_dir).map_err(io_err(log_dir))?;
    let out = File::create(&out_path).map_err(io_err(&out_path))?;
    let err = File::create(&err_path).map_err(io_err(&err_path))?;

    let mut cmd = opts.command();
    cmd.stdin(Stdio::null()).stdout(out).stderr(err);
    unsafe {
        cmd.pre_exec(|| {
            unistd::setsid()?;
            Ok(())
        });
    }
    tracing::debug!(?cmd, "launching instance");
    let mut child = cmd.spawn().map_err(|err| InstanceError::Launch {
        command: opts.launcher.display().to_string(),
        err,
    })?;

    thread::sleep(STARTUP_GRACE);
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(?status, "instance exited during startup");
        return Err(InstanceError::ExitedEarly {
            name: opts.name.clone(),
            log: err_path,
        });
    }

    let record = InstanceFile {
        name: opts.name.clone(),
        pid: child.id() as i32,
        ppid: unistd::getpid().as_raw(),
        image: opts.image.clone(),
        ip: String::new(),
        log_out_path: out_path,
        log_err_path: err_path,
        rootfs: opts.owns_rootfs.then(|| opts.rootfs.clone()),
        ..Default::default()
    };
    if let Err(err) = registry.create(&record) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(err);
    }
    tracing::info!(name = %record.name, pid = record.pid, "instance started");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::APP_SUBDIR;
    use anyhow::Result;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;

    fn options(dir: &Path, launcher_body: &str) -> Result<LaunchOptions> {
        let launcher = dir.join("launcher.sh");
        fs::write(&launcher, format!("#!/bin/sh\n{launcher_body}\n"))?;
        fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755))?;
        Ok(LaunchOptions {
            name: "web".to_owned(),
            image: "web.sif".to_owned(),
            rootfs: dir.join("rootfs"),
            launcher,
            log_dir: dir.join("logs"),
            user: "alice".to_owned(),
            host: "node1".to_owned(),
            args: vec!["--port".to_owned(), "80".to_owned()],
            ..Default::default()
        })
    }

    #[test]
    fn test_command_line() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut opts = options(tmp.path(), "")?;
        opts.exec_args = vec!["-B".to_owned(), "/data".to_owned()];
        let cmd = opts.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let rootfs = opts.rootfs.display().to_string();
        assert_eq!(
            args,
            [
                "exec", "--instance", "--pwd", "/", "-B", "/data", rootfs.as_str(), START_ACTION, "--port", "80"
            ]
        );
        assert_eq!(opts.log_paths().0, tmp.path().join("logs/node1/alice/web.out"));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_start_records_instance() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = InstanceRegistry::with_base(tmp.path().join("instances"), APP_SUBDIR, "alice", "node1");
        let opts = options(tmp.path(), "echo started; exec sleep 30")?;

        let record = start_instance(&registry, &opts)?;
        assert_eq!(registry.get("web")?, record);
        assert!(matches!(
            start_instance(&registry, &opts),
            Err(InstanceError::Exists(_))
        ));

        signal::kill(Pid::from_raw(record.pid), Signal::SIGKILL)?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_start_failure_is_reported() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = InstanceRegistry::with_base(tmp.path().join("instances"), APP_SUBDIR, "alice", "node1");
        let opts = options(tmp.path(), "echo 'no such image' >&2; exit 1")?;
        let err = start_instance(&registry, &opts).unwrap_err();
        assert!(matches!(err, InstanceError::ExitedEarly { .. }));
        assert!(registry.list("*")?.is_empty());
        assert_eq!(fs::read_to_string(opts.log_paths().1)?, "no such image\n");
        Ok(())
    }
}
