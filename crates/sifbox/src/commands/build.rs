//! Build an image file or sandbox directory from a recipe, an image or a
//! source URI.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libbuild::args::read_build_args;
use libbuild::cache::ImageCache;
use libbuild::config::{
    BuildEnv, BuildOptions, Fakeroot, FakerootSupport, OutputFormat, SectionSelection,
};
use libbuild::sources::BuildContext;
use libbuild::BuildSpec;

/// Build a container image
#[derive(Parser, Debug)]
pub struct Build {
    /// Build a writable sandbox directory instead of an image file
    #[clap(short, long)]
    pub sandbox: bool,
    /// Overwrite the destination if it exists
    #[clap(short = 'F', long)]
    pub force: bool,
    /// Build into an existing sandbox, skipping the bootstrap copy
    #[clap(short, long)]
    pub update: bool,
    /// Skip the %test section
    #[clap(short = 'T', long)]
    pub notest: bool,
    /// Host sections to run: 'all', 'none' or a comma separated list
    #[clap(long, default_value = "all")]
    pub sections: SectionSelection,
    /// Make every file of a sandbox writable by its owner
    #[clap(long)]
    pub fix_perms: bool,
    /// Keep temporary bundles when the build fails
    #[clap(long)]
    pub no_cleanup: bool,
    /// Do not use or fill the image cache
    #[clap(long)]
    pub disable_cache: bool,
    /// Run %post and %test as root in a user namespace
    #[clap(short = 'f', long)]
    pub fakeroot: bool,
    /// Fakeroot helper for hosts without user namespaces, implies --fakeroot
    #[clap(long)]
    pub fakeroot_path: Option<PathBuf>,
    /// Add an ext3 overlay partition of this size in MiB
    #[clap(long, value_name = "MiB")]
    pub writable_overlay: Option<u64>,
    /// Bind mount for %post and %test, src[:dst[:opts]]
    #[clap(short = 'B', long = "bind")]
    pub binds: Vec<String>,
    /// Build variable KEY=VALUE
    #[clap(long)]
    pub build_arg: Vec<String>,
    /// File of KEY=VALUE build variables
    #[clap(long)]
    pub build_arg_file: Option<PathBuf>,

    /// Path of the image file or sandbox to create
    #[clap(required = true)]
    pub destination: PathBuf,
    /// Definition file, image, sandbox or URI such as docker://alpine
    #[clap(required = true)]
    pub spec: String,
}

pub(crate) fn open_cache(env: &BuildEnv, disable: bool) -> Result<ImageCache> {
    let cache = if disable || env.disable_cache {
        ImageCache::throwaway(&env.tmp_dir())?
    } else {
        ImageCache::new(env.cache_root())?
    };
    Ok(cache)
}

pub fn build(args: Build) -> Result<()> {
    let env = BuildEnv::from_env()?;
    let fakeroot = if args.fakeroot || args.fakeroot_path.is_some() {
        let helper = args.fakeroot_path.clone().or_else(|| env.fakeroot_path.clone());
        Fakeroot::select(true, FakerootSupport::detect(helper))?
    } else {
        Fakeroot::Disabled
    };
    let opts = BuildOptions {
        format: if args.sandbox {
            OutputFormat::Sandbox
        } else {
            OutputFormat::Sif
        },
        force: args.force,
        no_cleanup: args.no_cleanup,
        update: args.update,
        notest: args.notest,
        fix_perms: args.fix_perms,
        sections: args.sections,
        fakeroot,
        writable_overlay_mib: args.writable_overlay,
        binds: args.binds,
        exe: super::current_exe()?,
    };

    // resolve and expand before anything is created on disk
    let user_args = read_build_args(&args.build_arg, args.build_arg_file.as_deref())?;
    let spec = BuildSpec::resolve(&args.spec)?;
    let recipe = spec.recipe(&user_args)?;

    let cache = open_cache(&env, args.disable_cache)?;
    let ctx = BuildContext::new(env, cache);
    ctx.cleanup.install_signal_handler()?;

    let result = libbuild::build(&ctx, &args.destination, &recipe, &opts);
    ctx.cleanup.run_all();
    result.with_context(|| format!("failed to build {}", args.destination.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() -> Result<()> {
        let args = Build::try_parse_from([
            "build",
            "--sandbox",
            "--sections",
            "setup,files",
            "-B",
            "/data",
            "--build-arg",
            "VERSION=3.19",
            "out",
            "recipe.def",
        ])?;
        assert!(args.sandbox);
        assert_eq!(
            args.sections,
            SectionSelection::List(vec!["setup".to_owned(), "files".to_owned()])
        );
        assert_eq!(args.binds, ["/data"]);
        assert_eq!(args.build_arg, ["VERSION=3.19"]);
        assert_eq!(args.destination, PathBuf::from("out"));
        assert_eq!(args.spec, "recipe.def");
        Ok(())
    }

    #[test]
    fn test_disabled_cache_is_throwaway() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let env = BuildEnv::from_vars([
            ("SIFBOX_TMPDIR", tmp.path().to_string_lossy().into_owned()),
            ("SIFBOX_CACHEDIR", tmp.path().join("cache").to_string_lossy().into_owned()),
        ])?;
        assert!(!open_cache(&env, false)?.is_disabled());
        let throwaway = open_cache(&env, true)?;
        assert!(throwaway.is_disabled());
        assert!(throwaway.root().starts_with(tmp.path()));
        throwaway.cleanup();
        Ok(())
    }
}
