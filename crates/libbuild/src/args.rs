//! `{{ NAME }}` build variables: user supplied values, `%arguments` defaults
//! and expansion of the raw recipe text.
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::definition::{self, DefinitionError, Recipe};

/// Upper bound on substitutions performed over a single recipe.
pub const MAX_EXPANSIONS: usize = 10_000;

static BUILD_ARG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());
// A `#` that is not a shebang earlier on the same line.
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*#[^!]").unwrap());

pub type BuildArgs = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("build variable {0} is not defined")]
    Undefined(String),
    #[error("expansion depth exceeded")]
    DepthExceeded,
    #[error("{0:?} is not a KEY=VALUE pair")]
    Malformed(String),
    #[error("failed to read build arg file {path}: {err}")]
    ReadFile { path: PathBuf, err: std::io::Error },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Result of expanding build variables over recipe text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expanded {
    pub text: String,
    /// Names substituted at least once.
    pub consumed: BTreeSet<String>,
    /// User supplied names never referenced.
    pub unused: Vec<String>,
}

/// Expands the build variables of every stage in `text`. Each stage sees the
/// user values first and its own `%arguments` defaults second.
pub fn expand(text: &str, user_args: &BuildArgs) -> Result<Expanded, ArgsError> {
    let mut expanded = Expanded::default();
    let mut budget = MAX_EXPANSIONS;

    for stage in definition::split_stages(text) {
        let defaults = parse_arguments_section(&stage.arguments);
        let stage_text = expand_with(
            &stage.raw,
            user_args,
            &defaults,
            &mut expanded.consumed,
            &mut budget,
        )?;
        expanded.text.push_str(&stage_text);
    }

    expanded.unused = user_args
        .keys()
        .filter(|k| !expanded.consumed.contains(*k))
        .cloned()
        .collect();
    Ok(expanded)
}

fn expand_with(
    text: &str,
    user_args: &BuildArgs,
    defaults: &BuildArgs,
    consumed: &mut BTreeSet<String>,
    budget: &mut usize,
) -> Result<String, ArgsError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in BUILD_ARG.captures_iter(text) {
        let (Some(token), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let line_start = text[..token.start()].rfind('\n').map_or(0, |p| p + 1);
        if COMMENT.is_match(&text[line_start..token.start()]) {
            continue;
        }

        let name = name.as_str();
        let value = user_args
            .get(name)
            .or_else(|| defaults.get(name))
            .ok_or_else(|| ArgsError::Undefined(name.to_owned()))?;
        *budget = budget.checked_sub(1).ok_or(ArgsError::DepthExceeded)?;

        out.push_str(&text[last..token.start()]);
        out.push_str(value);
        last = token.end();
        consumed.insert(name.to_owned());
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Reads `KEY=VALUE` defaults from an `%arguments` body. Malformed lines are
/// skipped with a warning.
pub fn parse_arguments_section(body: &str) -> BuildArgs {
    let mut defaults = BuildArgs::new();
    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match key_value(line) {
            Ok((key, value)) => {
                defaults.insert(key, value);
            }
            Err(err) => tracing::warn!("Skipping {line:?} in 'arguments' section: {err}"),
        }
    }
    defaults
}

/// Merges `--build-arg-file` entries with `--build-arg` flags, flags winning.
pub fn read_build_args(flags: &[String], file: Option<&Path>) -> Result<BuildArgs, ArgsError> {
    let mut args = BuildArgs::new();
    if let Some(path) = file {
        let content = fs::read_to_string(path).map_err(|err| ArgsError::ReadFile {
            path: path.to_path_buf(),
            err,
        })?;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match key_value(trimmed) {
                Ok((key, value)) => {
                    args.insert(key, value);
                }
                Err(err) => tracing::warn!("Skipping {trimmed:?} in build arg file: {err}"),
            }
        }
    }

    for flag in flags {
        let (key, value) = key_value(flag)?;
        args.insert(key, value);
    }
    Ok(args)
}

fn key_value(text: &str) -> Result<(String, String), ArgsError> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| ArgsError::Malformed(text.to_owned()))?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(ArgsError::Malformed(text.to_owned()));
    }
    Ok((key.to_owned(), value.trim().to_owned()))
}

/// Expands and parses a recipe. Unused user variables are reported once.
pub fn make_all_defs(text: &str, user_args: &BuildArgs) -> Result<Recipe, ArgsError> {
    let expanded = expand(text, user_args)?;
    let recipe = definition::parse(&expanded.text)?;
    if !expanded.unused.is_empty() {
        tracing::warn!("Unused build variables: {}", expanded.unused.join(", "));
    }
    tracing::debug!(
        stages = recipe.stages.len(),
        consumed = ?expanded.consumed,
        "expanded build variables"
    );
    Ok(recipe)
}
