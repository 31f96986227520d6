//! One build stage: a source, a bundle and the recipe sections run against
//! it in a fixed order.
pub mod fakeroot;
pub mod files;
pub mod metadata;
pub mod script;
pub mod session;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::bundle::Bundle;
use crate::cancel::Cancelled;
use crate::command::{self, CommandError};
use crate::config::Fakeroot;
use crate::definition::{Definition, Script};
use crate::fsutil::CopyError;
use crate::sources::{BuildContext, ConveyorPacker, SourceError};

use script::{ENV_ENVIRONMENT, ENV_LABELS};
use session::SessionFiles;

const POST_SCRIPT: &str = "/.post.script";
const TEST_SCRIPT: &str = "/.singularity.d/test";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("bad {section} section '-c' parameter: missing arguments")]
    MissingShellArgs { section: String },
    #[error("failed to run %{section} script: {err}")]
    Script {
        section: String,
        #[source]
        err: CommandError,
    },
    #[error("stage io error on {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("path {0:?} resolves outside the root filesystem")]
    UnsafePath(String),
    #[error("no files match {0:?}")]
    NoMatch(String),
    #[error("invalid file pattern {pattern:?}: {err}")]
    Pattern {
        pattern: String,
        #[source]
        err: glob::PatternError,
    },
    #[error("fakeroot helper {path}: {reason}")]
    Fakeroot { path: PathBuf, reason: String },
    #[error("%files from stage {0} refers to a stage that has not been built")]
    MissingStage(usize),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> StageError {
        let path = path.into();
        move |err| StageError::Io { path, err }
    }
}

#[derive(Debug)]
pub struct Stage {
    name: String,
    conveyor: ConveyorPacker,
    bundle: Bundle,
}

impl Stage {
    pub fn new(name: impl Into<String>, conveyor: ConveyorPacker, bundle: Bundle) -> Self {
        Self {
            name: name.into(),
            conveyor,
            bundle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    pub fn into_bundle(self) -> Bundle {
        self.bundle
    }

    /// Runs every section of the stage. `earlier` holds the stages built
    /// before this one, indexed like the recipe.
    #[tracing::instrument(level = "debug", skip_all, fields(stage = %self.name))]
    pub fn run(&mut self, ctx: &BuildContext, earlier: &[Stage], recipe_raw: &str) -> Result<(), StageError> {
        let def = self.bundle.definition().clone();
        let sections = &def.sections;
        let docker_host = ctx.env.docker_host.as_deref();

        script::run_host_section("pre", &sections.pre, &self.bundle, docker_host, &ctx.cancel)?;

        if self.bundle.is_in_place() {
            tracing::info!("Building into existing container: {}", self.bundle.rootfs().display());
        } else {
            self.conveyor.get(ctx, &self.bundle)?;
        }
        self.conveyor.pack(ctx, &self.bundle)?;

        script::run_host_section("setup", &sections.setup, &self.bundle, docker_host, &ctx.cancel)?;

        for section in &sections.files {
            let Some(index) = section.from_stage else {
                continue;
            };
            let source = earlier.get(index).ok_or(StageError::MissingStage(index))?;
            tracing::debug!("Copying files from stage: {}", source.name);
            files::copy_from_stage(&section.transfers, source.bundle.rootfs(), self.bundle.rootfs())?;
        }
        let host_transfers: Vec<_> = sections
            .files
            .iter()
            .filter(|s| s.from_stage.is_none())
            .flat_map(|s| s.transfers.iter().cloned())
            .collect();
        files::copy_from_host(&host_transfers, self.bundle.rootfs())?;
        metadata::prepare_apps(self.bundle.rootfs(), &def)?;

        let session = SessionFiles::create(&self.bundle)?;
        ctx.cancel.check()?;
        self.run_post(ctx, &def, &session)?;
        metadata::insert_metadata(self.bundle.rootfs(), &def, recipe_raw)?;
        ctx.cancel.check()?;
        self.run_test(ctx, &session)
    }

    fn run_post(&self, ctx: &BuildContext, def: &Definition, session: &SessionFiles) -> Result<(), StageError> {
        let body = metadata::post_body(def);
        if !self.bundle.run_section("post") || body.trim().is_empty() {
            return Ok(());
        }
        let section = Script {
            args: def.sections.post.args.clone(),
            body,
        };
        let script_args = script::section_args("post", POST_SCRIPT, &section)?;

        let opts = self.bundle.opts();
        let fakeroot_binds = match &opts.fakeroot {
            Fakeroot::Helper(helper) => fakeroot::make_bindpoints(self.bundle.rootfs(), helper, &ctx.cancel)?,
            _ => Vec::new(),
        };
        let rootfs = self.bundle.rootfs();
        let script_path = rootfs.join(POST_SCRIPT.trim_start_matches('/'));
        let result = script::write_script(&script_path, &section.body).and_then(|_| {
            let args = post_args(rootfs, &opts.fakeroot, &fakeroot_binds, session, &opts.binds, script_args);
            let mut cmd = reexec(&opts.exe);
            cmd.args(&args);
            tracing::info!("Running post scriptlet");
            command::run(&mut cmd, &ctx.cancel).map_err(|err| StageError::Script {
                section: "post".to_owned(),
                err,
            })
        });
        let _ = std::fs::remove_file(&script_path);
        if !fakeroot_binds.is_empty() {
            fakeroot::clean_bindpoints(rootfs, &fakeroot_binds);
        }
        result
    }

    fn run_test(&self, ctx: &BuildContext, session: &SessionFiles) -> Result<(), StageError> {
        let opts = self.bundle.opts();
        let test = &self.bundle.definition().sections.test;
        if opts.notest || !self.bundle.run_section("test") || test.is_empty() {
            return Ok(());
        }
        let args = test_args(self.bundle.rootfs(), &opts.fakeroot, session, &opts.binds);
        let mut cmd = reexec(&opts.exe);
        cmd.args(&args);
        tracing::info!("Running testscript");
        command::run(&mut cmd, &ctx.cancel).map_err(|err| StageError::Script {
            section: "test".to_owned(),
            err,
        })
    }
}

/// The running binary with a clean working directory and no build
/// configuration in its environment.
fn reexec(exe: &Path) -> Command {
    let mut cmd = Command::new(exe);
    cmd.env_clear().envs(script::env_without_prefix()).current_dir("/");
    cmd
}

fn user_binds(binds: &[String]) -> impl Iterator<Item = String> + '_ {
    binds.iter().flat_map(|b| ["-B".to_owned(), b.clone()])
}

fn post_args(
    rootfs: &Path,
    mode: &Fakeroot,
    fakeroot_binds: &[String],
    session: &SessionFiles,
    binds: &[String],
    script_args: Vec<String>,
) -> Vec<String> {
    let mut args: Vec<String> = ["exec", "--pwd", "/", "--writable", "--cleanenv"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(["--env".to_owned(), ENV_ENVIRONMENT.to_owned()]);
    args.extend(["--env".to_owned(), ENV_LABELS.to_owned()]);
    args.extend(session.bind_args());
    match mode {
        Fakeroot::Helper(_) => {
            if !fakeroot_binds.is_empty() {
                args.extend(["-B".to_owned(), fakeroot_binds.join(",")]);
            }
            args.extend(["--env".to_owned(), "FAKEROOTDONTTRYCHOWN=1".to_owned()]);
        }
        Fakeroot::UserNamespace => args.push("--userns".to_owned()),
        Fakeroot::Disabled => {}
    }
    args.extend(user_binds(binds));
    args.push(rootfs.to_string_lossy().into_owned());
    if let Fakeroot::Helper(helper) = mode {
        let base = helper.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        tracing::debug!("Post scriptlet will be run with {base}");
        args.push(format!("/usr/bin/{base}"));
    }
    args.extend(script_args);
    args
}

fn test_args(rootfs: &Path, mode: &Fakeroot, session: &SessionFiles, binds: &[String]) -> Vec<String> {
    let mut args: Vec<String> = ["exec", "--pwd", "/"].into_iter().map(String::from).collect();
    args.extend(session.bind_args());
    if *mode == Fakeroot::UserNamespace {
        args.push("--userns".to_owned());
    }
    args.extend(user_binds(binds));
    args.push(rootfs.to_string_lossy().into_owned());
    args.extend(["/bin/sh", "-ex", TEST_SCRIPT].map(String::from));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::config::{BuildEnv, BuildOptions};
    use crate::definition::parse;
    use std::fs;

    fn session_with_resolv(path: &str) -> SessionFiles {
        SessionFiles {
            resolv: Some(PathBuf::from(path)),
            hosts: None,
        }
    }

    #[test]
    fn test_post_args_plain() {
        let session = session_with_resolv("/tmp/bundle-temp-x/resolv.conf");
        let args = post_args(
            Path::new("/tmp/build-temp-x/rootfs"),
            &Fakeroot::Disabled,
            &[],
            &session,
            &["/data:/mnt".to_owned()],
            vec!["/bin/sh".into(), "-ex".into(), POST_SCRIPT.into()],
        );
        assert_eq!(
            args,
            vec![
                "exec",
                "--pwd",
                "/",
                "--writable",
                "--cleanenv",
                "--env",
                "SINGULARITY_ENVIRONMENT=/.singularity.d/env/91-environment.sh",
                "--env",
                "SINGULARITY_LABELS=/.build.labels",
                "-B",
                "/tmp/bundle-temp-x/resolv.conf:/etc/resolv.conf",
                "-B",
                "/data:/mnt",
                "/tmp/build-temp-x/rootfs",
                "/bin/sh",
                "-ex",
                "/.post.script",
            ]
        );
    }

    #[test]
    fn test_post_args_fakeroot_helper() {
        let session = SessionFiles::default();
        let args = post_args(
            Path::new("/rootfs"),
            &Fakeroot::Helper(PathBuf::from("/opt/fakeroot/bin/fakeroot-sysv")),
            &["/opt/fakeroot/bin/fakeroot-sysv:/usr/bin/fakeroot".to_owned(), "/usr/lib/libfakeroot/".to_owned()],
            &session,
            &[],
            vec!["/bin/sh".into(), "-ex".into(), POST_SCRIPT.into()],
        );
        let joined = args.join(" ");
        assert!(joined.contains("-B /opt/fakeroot/bin/fakeroot-sysv:/usr/bin/fakeroot,/usr/lib/libfakeroot/"));
        assert!(joined.contains("--env FAKEROOTDONTTRYCHOWN=1"));
        assert!(joined.ends_with("/rootfs /usr/bin/fakeroot-sysv /bin/sh -ex /.post.script"));
    }

    #[test]
    fn test_test_args_user_namespace() {
        let args = test_args(Path::new("/rootfs"), &Fakeroot::UserNamespace, &SessionFiles::default(), &[]);
        assert_eq!(
            args,
            vec!["exec", "--pwd", "/", "--userns", "/rootfs", "/bin/sh", "-ex", "/.singularity.d/test"]
        );
    }

    #[test]
    fn test_scratch_stage_runs_host_sections() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned())])?;
        let cache = ImageCache::new(tmp.path().join("cache"))?;
        let ctx = BuildContext::new(env.clone(), cache);
        let host_file = tmp.path().join("motd");
        fs::write(&host_file, "welcome\n")?;

        let text = format!(
            "Bootstrap: scratch\n\
             %setup\n    mkdir -p \"$SINGULARITY_ROOTFS/opt\"\n\
             %files\n    {} /opt/motd\n\
             %runscript\n    cat /opt/motd\n",
            host_file.display()
        );
        let recipe = parse(&text)?;
        let def = recipe.stages[0].clone();
        let opts = BuildOptions {
            notest: true,
            ..Default::default()
        };
        let bundle = Bundle::new(&tmp.path().join("out.sif"), def.clone(), &opts, &env)?;
        let mut stage = Stage::new("stage-0", ConveyorPacker::for_definition(&def)?, bundle);
        stage.run(&ctx, &[], &recipe.raw)?;

        let rootfs = stage.bundle().rootfs();
        assert_eq!(fs::read_to_string(rootfs.join("opt/motd"))?, "welcome\n");
        assert!(fs::read_to_string(rootfs.join(".singularity.d/runscript"))?.contains("cat /opt/motd"));
        assert_eq!(fs::read_to_string(rootfs.join(".singularity.d/Singularity"))?, recipe.raw);
        Ok(())
    }

    #[test]
    fn test_files_from_missing_stage() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned())])?;
        let ctx = BuildContext::new(env.clone(), ImageCache::new(tmp.path().join("cache"))?);
        let recipe = parse(
            "Bootstrap: scratch\nStage: one\n\n\
             Bootstrap: scratch\nStage: two\n%files from one\n    /a /b\n",
        )?;
        let def = recipe.stages[1].clone();
        let bundle = Bundle::new(&tmp.path().join("out.sif"), def.clone(), &BuildOptions::default(), &env)?;
        let mut stage = Stage::new("two", ConveyorPacker::Scratch, bundle);
        assert!(matches!(
            stage.run(&ctx, &[], &recipe.raw),
            Err(StageError::MissingStage(0))
        ));
        Ok(())
    }
}
