//! Registry conveyor: pulls an OCI image through the blob cache and lays it
//! out in the bundle rootfs.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use libsif::{Arch, DataType, DescriptorInput, FsType, Image, LoadMode, PartType};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageManifest};
use rayon::prelude::*;

use super::base_env::{self, write_file};
use super::registry::{self, FetchedManifest, Reference, RegistryClient, DEFAULT_REGISTRY};
use super::{extract_layer, BuildContext, SourceError};
use crate::bundle::Bundle;
use crate::cache::CacheType;
use crate::config::EnvPrecedence;
use crate::retry::with_retry;
use crate::squashfs::{self, Mksquashfs, SquashfsError};

/// Name of the JSON object holding the image config inside a cached SIF.
const CONFIG_OBJECT: &str = "oci-config.json";
const STAGE_ENV_SCRIPT: &str = "10-docker2singularity.sh";
const IMAGE_ENV_SCRIPT: &str = "94-docker2singularity.sh";

#[derive(Debug)]
pub struct RegistryConveyor {
    reference: Reference,
    config: Option<ImageConfiguration>,
}

impl RegistryConveyor {
    pub fn new(src: &str) -> Result<Self, SourceError> {
        Ok(Self {
            reference: Reference::parse(src)?,
            config: None,
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    #[tracing::instrument(level = "debug", skip_all, fields(image = %self.reference))]
    pub fn get(&mut self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        let default_registry = ctx.env.library.as_deref().unwrap_or(DEFAULT_REGISTRY);
        let client = RegistryClient::new(&self.reference, default_registry, &ctx.user_agent)?;
        let arch = ctx.env.pull_arch();

        let (manifest, digest) = with_retry(&ctx.cancel, "manifest request", || {
            resolve_manifest(&client, &self.reference, &arch)
        })?;
        let key = registry::digest_hex(&digest)?.to_owned();
        if self.load_cached(ctx, bundle, &key)? {
            return Ok(());
        }

        let mut blobs = vec![manifest.config().clone()];
        blobs.extend(manifest.layers().iter().cloned());
        let paths = fetch_blobs(ctx, &client, &blobs)?;
        let (config_path, layers) = paths
            .split_first()
            .ok_or_else(|| SourceError::NotFound(format!("config blob of {}", self.reference)))?;

        for (layer, desc) in layers.iter().zip(manifest.layers()) {
            ctx.cancel.check()?;
            tracing::debug!(digest = %desc.digest(), "extracting layer");
            extract_layer(layer, bundle.rootfs())?;
        }

        let raw_config = fs::read(config_path).map_err(SourceError::io(config_path))?;
        let config = serde_json::from_slice(&raw_config).map_err(|err| SourceError::Json {
            what: "image config",
            err,
        })?;
        self.config = Some(config);
        cache_converted(ctx, bundle, &key, &raw_config)
    }

    /// Fills the rootfs from the converted image cached under the manifest
    /// digest `key`. Returns false on a cache miss.
    fn load_cached(&mut self, ctx: &BuildContext, bundle: &Bundle, key: &str) -> Result<bool, SourceError> {
        let converted = ctx.cache.get_entry(CacheType::OciTempSif, key)?;
        if !converted.exists() {
            return Ok(false);
        }
        tracing::info!("Using cached SIF image");
        self.config = unpack_cached(ctx, converted.path(), bundle)?;
        Ok(true)
    }

    /// Writes the image env, runscript and labels over the base metadata.
    pub fn pack(&self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        pack_config(config, ctx.env.env_precedence, bundle.rootfs())
    }
}

/// Resolves the reference to a single platform manifest and its digest.
fn resolve_manifest(
    client: &RegistryClient,
    reference: &Reference,
    arch: &str,
) -> Result<(ImageManifest, String), SourceError> {
    match client.fetch_manifest(reference.reference())? {
        FetchedManifest::Manifest { manifest, digest } => Ok((manifest, digest)),
        FetchedManifest::Index(index) => {
            let desc = registry::select_platform(&index, arch)
                .ok_or_else(|| SourceError::NoMatchingPlatform(arch.to_owned()))?;
            tracing::debug!(digest = %desc.digest(), arch, "selected platform manifest");
            match client.fetch_manifest(desc.digest())? {
                FetchedManifest::Manifest { manifest, digest } => Ok((manifest, digest)),
                FetchedManifest::Index(_) => Err(SourceError::UnsupportedMediaType(
                    "nested image index".to_owned(),
                )),
            }
        }
    }
}

/// Downloads every blob into the `oci-blob` cache in parallel and returns
/// their cached paths in input order.
fn fetch_blobs(
    ctx: &BuildContext,
    client: &RegistryClient,
    blobs: &[Descriptor],
) -> Result<Vec<PathBuf>, SourceError> {
    blobs
        .par_iter()
        .map(|desc| -> Result<PathBuf, SourceError> {
            let digest = desc.digest().as_str();
            let mut entry = ctx.cache.get_entry(CacheType::OciBlob, registry::digest_hex(digest)?)?;
            if entry.exists() {
                tracing::debug!(digest, "blob already cached");
                return Ok(entry.path().to_path_buf());
            }
            let staging = entry.tmp_path().to_path_buf();
            let handle = ctx.cleanup.push(format!("staging {}", staging.display()), move || {
                let _ = fs::remove_file(&staging);
            });
            let result = with_retry(&ctx.cancel, &format!("download of {digest}"), || {
                client.download_blob(digest, entry.tmp_path())
            })
            .and_then(|size| {
                tracing::debug!(digest, size, "downloaded blob");
                entry.finalize().map_err(SourceError::from)
            });
            ctx.cleanup.release(handle);
            result.map(|_| entry.path().to_path_buf())
        })
        .collect()
}

/// Stores the freshly extracted rootfs under `key`. Failing to cache is not
/// an error for the build.
fn cache_converted(ctx: &BuildContext, bundle: &Bundle, key: &str, raw_config: &[u8]) -> Result<(), SourceError> {
    let mut converted = ctx.cache.get_entry(CacheType::OciTempSif, key)?;
    if converted.exists() {
        return Ok(());
    }
    let staging = converted.tmp_path().to_path_buf();
    let handle = ctx.cleanup.push(format!("staging {}", staging.display()), move || {
        let _ = fs::remove_file(&staging);
    });
    let result = store_converted(ctx, bundle, converted.tmp_path(), raw_config)
        .and_then(|stored| if stored { converted.finalize().map_err(Into::into) } else { Ok(()) });
    ctx.cleanup.release(handle);
    if let Err(err) = result {
        ctx.cancel.check()?;
        tracing::warn!("could not cache converted image: {err}");
    }
    Ok(())
}

/// Packs the fresh rootfs into a SIF at `dest` holding the primary
/// partition and the image config. Returns false when mksquashfs is
/// unavailable.
fn store_converted(
    ctx: &BuildContext,
    bundle: &Bundle,
    dest: &Path,
    raw_config: &[u8],
) -> Result<bool, SourceError> {
    let mksquashfs = match Mksquashfs::from_env(&ctx.env) {
        Ok(m) => m,
        Err(SquashfsError::NotFound(_)) => {
            tracing::debug!("mksquashfs not available, converted image not cached");
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };
    let squashfs = bundle.tmp_dir().join("oci-rootfs.sqfs");
    let result = mksquashfs
        .create(bundle.rootfs(), &squashfs, bundle.tmp_dir(), &ctx.cancel)
        .map_err(SourceError::from)
        .and_then(|_| {
            let partition = File::open(&squashfs).map_err(SourceError::io(&squashfs))?;
            let mut image = Image::create(dest)?;
            image.add_object(
                DescriptorInput::new(DataType::Partition, partition)
                    .name("rootfs")
                    .partition(FsType::Squashfs, PartType::Primary, Arch::host()),
            )?;
            image.add_object(DescriptorInput::new(DataType::GenericJson, raw_config).name(CONFIG_OBJECT))?;
            Ok(true)
        });
    let _ = fs::remove_file(&squashfs);
    result
}

/// Extracts a converted image from the cache into the bundle rootfs.
fn unpack_cached(
    ctx: &BuildContext,
    path: &Path,
    bundle: &Bundle,
) -> Result<Option<ImageConfiguration>, SourceError> {
    let image = Image::load(path, LoadMode::ReadOnly)?;
    let primary = image.primary_partition()?.id;
    let squashfs = bundle.tmp_dir().join("cached-rootfs.sqfs");
    let result = File::create(&squashfs)
        .map_err(SourceError::io(&squashfs))
        .and_then(|mut file| Ok(image.copy_data(primary, &mut file)?))
        .and_then(|_| Ok(squashfs::unsquash(&squashfs, bundle.rootfs(), None, &ctx.cancel)?));
    let _ = fs::remove_file(&squashfs);
    result?;

    let Some(desc) = image
        .descriptors()
        .find(|d| d.data_type == DataType::GenericJson && d.name == CONFIG_OBJECT)
    else {
        return Ok(None);
    };
    let data = image.read_data(desc.id)?;
    let config = serde_json::from_slice(&data).map_err(|err| SourceError::Json {
        what: "cached image config",
        err,
    })?;
    Ok(Some(config))
}

fn pack_config(config: &ImageConfiguration, precedence: EnvPrecedence, rootfs: &Path) -> Result<(), SourceError> {
    let Some(runtime) = config.config() else {
        return Ok(());
    };
    let env = runtime.env().clone().unwrap_or_default();
    let (name, script) = env_script(&env, precedence);
    let path = rootfs.join(base_env::ENV_DIR).join(name);
    write_file(&path, &script, 0o755, true).map_err(SourceError::io(&path))?;

    let entrypoint = runtime.entrypoint().clone().unwrap_or_default();
    let cmd = runtime.cmd().clone().unwrap_or_default();
    let path = rootfs.join(base_env::RUNSCRIPT);
    write_file(&path, &runscript(&entrypoint, &cmd), 0o755, true).map_err(SourceError::io(&path))?;

    if let Some(labels) = runtime.labels() {
        let path = rootfs.join(base_env::LABELS_FILE);
        let mut merged = base_env::read_labels(&path);
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        base_env::write_labels(&path, &merged).map_err(SourceError::io(&path))?;
    }
    Ok(())
}

/// Image environment as a shell script. With stage precedence the script
/// sorts before `90-environment.sh` and only provides defaults; with image
/// precedence it sorts after and overrides.
fn env_script(env: &[String], precedence: EnvPrecedence) -> (&'static str, String) {
    let mut vars = BTreeMap::new();
    let mut order = Vec::new();
    for entry in env {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            tracing::warn!("skipping invalid image environment entry {entry:?}");
            continue;
        }
        if vars.insert(key, value).is_none() {
            order.push(key);
        }
    }

    let mut script = String::from("#!/bin/sh\n");
    for key in order {
        let value = double_quote(vars[key]);
        let line = match precedence {
            // PATH always has a value at this point
            EnvPrecedence::Stage if key != "PATH" => format!("export {key}=\"${{{key}:-{value}}}\"\n"),
            _ => format!("export {key}={value}\n"),
        };
        script.push_str(&line);
    }
    let name = match precedence {
        EnvPrecedence::Stage => STAGE_ENV_SCRIPT,
        EnvPrecedence::Image => IMAGE_ENV_SCRIPT,
    };
    (name, script)
}

fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn shell_words(words: &[String]) -> String {
    words.iter().map(|w| single_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Runscript executing ENTRYPOINT followed by the caller's arguments, or by
/// CMD when none are given.
fn runscript(entrypoint: &[String], cmd: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("OCI_ENTRYPOINT={}\n", single_quote(&shell_words(entrypoint))));
    script.push_str(&format!("OCI_CMD={}\n", single_quote(&shell_words(cmd))));
    if entrypoint.is_empty() && cmd.is_empty() {
        script.push_str("if [ $# -eq 0 ]; then\n    set -- /bin/sh\nfi\nexec \"$@\"\n");
        return script;
    }
    if !cmd.is_empty() {
        script.push_str("if [ $# -eq 0 ]; then\n");
        for word in cmd.iter().rev() {
            script.push_str(&format!("    set -- {} \"$@\"\n", single_quote(word)));
        }
        script.push_str("fi\n");
    }
    for word in entrypoint.iter().rev() {
        script.push_str(&format!("set -- {} \"$@\"\n", single_quote(word)));
    }
    script.push_str("exec \"$@\"\n");
    script
}
