//! Drives a whole build: one bundle per stage, every stage run in recipe
//! order, then the last stage handed to the assembler.
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use libsif::header::{LAUNCH_LEN, MAGIC};

use crate::args::{self, BuildArgs};
use crate::assemble::{self, Assembler};
use crate::bundle::Bundle;
use crate::config::{BuildOptions, OutputFormat};
use crate::definition::{Definition, Recipe};
use crate::error::BuildError;
use crate::sources::{BuildContext, ConveyorPacker, SourceError};
use crate::stage::Stage;

/// What the user asked to build from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSpec {
    /// Text of a definition file.
    Recipe(String),
    /// `kind://reference`, e.g. `docker://alpine:3.19`.
    Uri(String),
    /// Image file or sandbox directory on the host.
    Local(PathBuf),
}

impl BuildSpec {
    pub fn resolve(spec: &str) -> Result<Self, BuildError> {
        if spec.contains("://") {
            return Ok(BuildSpec::Uri(spec.to_owned()));
        }
        let path = Path::new(spec);
        let meta = fs::metadata(path).map_err(|_| BuildError::UnknownSpec(spec.to_owned()))?;
        if meta.is_dir() || is_image_file(path)? {
            let path = fs::canonicalize(path).map_err(SourceError::io(path))?;
            return Ok(BuildSpec::Local(path));
        }
        let text = fs::read_to_string(path).map_err(SourceError::io(path))?;
        Ok(BuildSpec::Recipe(text))
    }

    /// Expands build variables and parses the stages. Fails before any
    /// bundle exists when a variable is undefined.
    pub fn recipe(&self, user_args: &BuildArgs) -> Result<Recipe, BuildError> {
        let def = match self {
            BuildSpec::Recipe(text) => return Ok(args::make_all_defs(text, user_args)?),
            BuildSpec::Uri(uri) => Definition::from_uri(uri)?,
            BuildSpec::Local(path) => Definition::from_uri(&format!("localimage://{}", path.display()))?,
        };
        Ok(Recipe {
            raw: def.raw.clone(),
            stages: vec![def],
        })
    }
}

fn is_image_file(path: &Path) -> Result<bool, BuildError> {
    let mut head = [0u8; LAUNCH_LEN + MAGIC.len()];
    let mut file = File::open(path).map_err(SourceError::io(path))?;
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]).map_err(SourceError::io(path))? {
            0 => break,
            n => filled += n,
        }
    }
    let head = &head[..filled];
    Ok(head.starts_with(b"hsqs") || head.get(LAUNCH_LEN..) == Some(&MAGIC[..]))
}

/// Builds `recipe` into `dest`. Bundles are registered on the context's
/// cleanup list and removed on every exit path.
#[tracing::instrument(level = "debug", skip(ctx, recipe, opts))]
pub fn build(ctx: &BuildContext, dest: &Path, recipe: &Recipe, opts: &BuildOptions) -> Result<(), BuildError> {
    let result = run(ctx, dest, recipe, opts);
    ctx.cache.cleanup();
    result
}

fn run(ctx: &BuildContext, dest: &Path, recipe: &Recipe, opts: &BuildOptions) -> Result<(), BuildError> {
    if recipe.stages.is_empty() {
        return Err(BuildError::NoStages);
    }
    let in_place = opts.update && !opts.force && opts.format == OutputFormat::Sandbox && dest.is_dir();
    if opts.update && opts.format != OutputFormat::Sandbox {
        tracing::warn!("--update only applies to sandbox builds, ignoring it");
    }
    if !in_place && !opts.force && fs::symlink_metadata(dest).is_ok() {
        return Err(assemble::AssembleError::DestinationExists(dest.to_path_buf()).into());
    }
    let assembler = Assembler::for_format(opts.format, &ctx.env)?;

    tracing::info!("Starting build...");
    let mut stages = make_stages(ctx, dest, recipe, opts, in_place)?;
    for i in 0..stages.len() {
        let (earlier, rest) = stages.split_at_mut(i);
        let stage = &mut rest[0];
        tracing::info!("Running stage {} ({})", stage.name(), i + 1);
        stage
            .run(ctx, earlier, &recipe.raw)
            .map_err(|err| BuildError::Stage {
                stage: stage.name().to_owned(),
                err,
            })?;
        ctx.cancel.check()?;
    }

    let last = stages.last().ok_or(BuildError::NoStages)?;
    assembler.assemble(ctx, last.bundle(), dest, &recipe.raw)?;
    drop(stages);
    tracing::info!("Build complete: {}", dest.display());
    Ok(())
}

fn make_stages(
    ctx: &BuildContext,
    dest: &Path,
    recipe: &Recipe,
    opts: &BuildOptions,
    in_place: bool,
) -> Result<Vec<Stage>, BuildError> {
    // only the last stage's rootfs can end up at the destination
    let scratch_opts = BuildOptions {
        format: OutputFormat::Sif,
        ..opts.clone()
    };
    let count = recipe.stages.len();
    let mut stages = Vec::with_capacity(count);
    for (i, def) in recipe.stages.iter().enumerate() {
        let last = i + 1 == count;
        let conveyor = ConveyorPacker::for_definition(def)?;
        let mut bundle = match (last, in_place) {
            (true, true) => Bundle::in_place(dest, def.clone(), opts, &ctx.env)?,
            (true, false) => Bundle::new(dest, def.clone(), opts, &ctx.env)?,
            (false, _) => Bundle::new(dest, def.clone(), &scratch_opts, &ctx.env)?,
        };
        bundle.register(&ctx.cleanup);
        let name = def
            .stage_name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("stage-{i}"));
        stages.push(Stage::new(name, conveyor, bundle));
    }
    Ok(stages)
}
