//! Conveyors fetch a stage's source into the bundle rootfs; packers lay down
//! the baseline container metadata afterwards.
pub mod base_env;
mod http;
mod layer;
mod local;
mod oci;
pub mod registry;

use std::path::PathBuf;

use libsif::SifError;

use crate::bundle::Bundle;
use crate::cache::{CacheError, ImageCache};
use crate::cancel::{CancelToken, Cancelled};
use crate::cleanup::CleanupList;
use crate::config::BuildEnv;
use crate::definition::{Bootstrap, Definition, DefinitionError};
use crate::fsutil::CopyError;
use crate::retry::Retryable;
use crate::squashfs::SquashfsError;

pub use http::HttpConveyor;
pub use layer::{extract_layer, LayerError};
pub use local::LocalConveyor;
pub use oci::RegistryConveyor;

/// Process wide collaborators handed to every build step.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub env: BuildEnv,
    pub cache: ImageCache,
    pub cleanup: CleanupList,
    pub cancel: CancelToken,
    pub user_agent: String,
}

impl BuildContext {
    pub fn new(env: BuildEnv, cache: ImageCache) -> Self {
        Self {
            env,
            cache,
            cleanup: CleanupList::new(),
            cancel: CancelToken::new(),
            user_agent: default_user_agent(),
        }
    }
}

pub fn default_user_agent() -> String {
    format!(
        "sifbox/{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),
    #[error("request to {url} failed: {err}")]
    Network {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("access to {resource} denied: {reason}")]
    AuthDenied { resource: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("unsupported digest {0:?}")]
    UnsupportedDigest(String),
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),
    #[error("image index has no manifest for linux/{0}")]
    NoMatchingPlatform(String),
    #[error("malformed {what}: {err}")]
    Json {
        what: &'static str,
        #[source]
        err: serde_json::Error,
    },
    #[error("{0} is neither an image file nor a sandbox directory")]
    UnknownLocalImage(PathBuf),
    #[error("{0} has an encrypted root filesystem and cannot be used as a build source")]
    EncryptedSource(PathBuf),
    #[error("source io error on {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Squashfs(#[from] SquashfsError),
    #[error(transparent)]
    Sif(#[from] SifError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl SourceError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> SourceError {
        let path = path.into();
        move |err| SourceError::Io { path, err }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network { err, .. } => {
                err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
            }
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            // a truncated download hashes differently
            SourceError::DigestMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Closed set of source kinds a stage can bootstrap from.
#[derive(Debug)]
pub enum ConveyorPacker {
    Registry(RegistryConveyor),
    Local(LocalConveyor),
    Http(HttpConveyor),
    Scratch,
}

impl ConveyorPacker {
    pub fn for_definition(def: &Definition) -> Result<Self, SourceError> {
        let bootstrap = def.bootstrap()?;
        let source = def.source()?;
        Ok(match (bootstrap, source) {
            (Bootstrap::Scratch, _) => ConveyorPacker::Scratch,
            (Bootstrap::Registry, Some(src)) => ConveyorPacker::Registry(RegistryConveyor::new(src)?),
            (Bootstrap::LocalImage, Some(src)) => ConveyorPacker::Local(LocalConveyor::new(src)),
            (Bootstrap::Http | Bootstrap::Https, Some(src)) => {
                ConveyorPacker::Http(HttpConveyor::new(bootstrap, src))
            }
            (_, None) => {
                return Err(DefinitionError::MissingHeader {
                    bootstrap: bootstrap.as_str(),
                    key: "From",
                }
                .into())
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConveyorPacker::Registry(_) => "registry",
            ConveyorPacker::Local(_) => "localimage",
            ConveyorPacker::Http(_) => "http",
            ConveyorPacker::Scratch => "scratch",
        }
    }

    /// Populates the bundle rootfs from the source.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = self.kind()))]
    pub fn get(&mut self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        ctx.cancel.check()?;
        match self {
            ConveyorPacker::Registry(c) => c.get(ctx, bundle),
            ConveyorPacker::Local(c) => c.get(ctx, bundle),
            ConveyorPacker::Http(c) => c.get(ctx, bundle),
            ConveyorPacker::Scratch => Ok(()),
        }
    }

    /// Writes the baseline metadata tree, then anything the source carries
    /// beyond the filesystem (registry env, entrypoint, labels).
    pub fn pack(&self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        base_env::make_base_env(bundle.rootfs(), false)?;
        match self {
            ConveyorPacker::Registry(c) => c.pack(ctx, bundle),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse;

    #[test]
    fn test_dispatch_by_bootstrap() -> anyhow::Result<()> {
        let recipe = parse(
            "Bootstrap: docker\nFrom: alpine:3.17\n\n\
             Bootstrap: scratch\nStage: two\n\n\
             Bootstrap: localimage\nStage: three\nFrom: /tmp/base.sif\n\n\
             Bootstrap: https\nStage: four\nFrom: example.org/img.sif\n",
        )?;
        let kinds: Vec<_> = recipe
            .stages
            .iter()
            .map(|s| ConveyorPacker::for_definition(s).map(|c| c.kind()))
            .collect::<Result<_, _>>()?;
        assert_eq!(kinds, vec!["registry", "scratch", "localimage", "http"]);
        Ok(())
    }

    #[test]
    fn test_retryable_classification() {
        let status = |status| SourceError::Status {
            url: "https://r/v2/".into(),
            status,
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!SourceError::AuthDenied {
            resource: "r".into(),
            reason: "no".into()
        }
        .is_retryable());
        assert!(SourceError::DigestMismatch {
            what: "layer".into(),
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }
}
