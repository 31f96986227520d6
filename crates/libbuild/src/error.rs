//! Top level error of a build and the classification the binary turns into
//! an exit code.
use libsif::SifError;

use crate::args::ArgsError;
use crate::assemble::AssembleError;
use crate::bundle::BundleError;
use crate::cache::CacheError;
use crate::cancel::Cancelled;
use crate::cleanup::CleanupError;
use crate::config::ConfigError;
use crate::definition::DefinitionError;
use crate::sources::SourceError;
use crate::squashfs::SquashfsError;
use crate::stage::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad recipe, reference, flag or script.
    UserInput,
    /// Missing tool, full disk, permission problem on the host.
    Resource,
    TransientIo,
    PermanentIo,
    Verification,
    LifecycleState,
    Internal,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("while running stage {stage}: {err}")]
    Stage {
        stage: String,
        #[source]
        err: StageError,
    },
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Squashfs(#[from] SquashfsError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error(transparent)]
    Sif(#[from] SifError),
    #[error("no stages found in definition")]
    NoStages,
    #[error("{0} is not a definition file, image, sandbox or source URI")]
    UnknownSpec(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Definition(_)
            | BuildError::Args(_)
            | BuildError::Config(_)
            | BuildError::NoStages
            | BuildError::UnknownSpec(_) => ErrorKind::UserInput,
            BuildError::Cache(err) => cache_kind(err),
            BuildError::Bundle(_) | BuildError::Squashfs(_) => ErrorKind::Resource,
            BuildError::Source(err) => source_kind(err),
            BuildError::Stage { err, .. } => stage_kind(err),
            BuildError::Assemble(err) => assemble_kind(err),
            BuildError::Cleanup(_) => ErrorKind::Internal,
            BuildError::Sif(err) => sif_kind(err),
            BuildError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

fn cache_kind(err: &CacheError) -> ErrorKind {
    match err {
        CacheError::InvalidKey(_) | CacheError::UnknownType(_) => ErrorKind::UserInput,
        CacheError::Io { .. } => ErrorKind::Resource,
    }
}

pub fn source_kind(err: &SourceError) -> ErrorKind {
    match err {
        SourceError::Definition(_)
        | SourceError::InvalidReference(_)
        | SourceError::UnknownLocalImage(_)
        | SourceError::EncryptedSource(_) => ErrorKind::UserInput,
        SourceError::Network { .. } | SourceError::Status { .. } => ErrorKind::TransientIo,
        SourceError::AuthDenied { .. }
        | SourceError::NotFound(_)
        | SourceError::UnsupportedDigest(_)
        | SourceError::UnsupportedMediaType(_)
        | SourceError::NoMatchingPlatform(_)
        | SourceError::Json { .. }
        | SourceError::Layer(_) => ErrorKind::PermanentIo,
        SourceError::DigestMismatch { .. } => ErrorKind::Verification,
        SourceError::Io { .. } | SourceError::Copy(_) | SourceError::Squashfs(_) => ErrorKind::Resource,
        SourceError::Cache(err) => cache_kind(err),
        SourceError::Sif(err) => sif_kind(err),
        SourceError::Cancelled(_) => ErrorKind::Cancelled,
    }
}

fn stage_kind(err: &StageError) -> ErrorKind {
    match err {
        StageError::MissingShellArgs { .. }
        | StageError::Script { .. }
        | StageError::UnsafePath(_)
        | StageError::NoMatch(_)
        | StageError::Pattern { .. } => ErrorKind::UserInput,
        StageError::Io { .. } | StageError::Fakeroot { .. } | StageError::Copy(_) => ErrorKind::Resource,
        StageError::MissingStage(_) => ErrorKind::Internal,
        StageError::Source(err) => source_kind(err),
        StageError::Cancelled(_) => ErrorKind::Cancelled,
    }
}

fn assemble_kind(err: &AssembleError) -> ErrorKind {
    match err {
        AssembleError::DestinationExists(_) | AssembleError::OverlaySize(_) => ErrorKind::UserInput,
        AssembleError::Io { .. }
        | AssembleError::Overlay(_)
        | AssembleError::Copy(_)
        | AssembleError::Squashfs(_) => ErrorKind::Resource,
        AssembleError::Sif(err) => sif_kind(err),
        AssembleError::Cancelled(_) => ErrorKind::Cancelled,
    }
}

/// Classification of image format and signature errors, shared with the
/// `sign` and `verify` commands.
pub fn sif_kind(err: &SifError) -> ErrorKind {
    match err {
        SifError::Open { .. } | SifError::Create { .. } | SifError::Io(_) | SifError::ReadOnly => {
            ErrorKind::Resource
        }
        SifError::InvalidImage(_)
        | SifError::UnsupportedVersion(_)
        | SifError::ObjectNotFound(_)
        | SifError::GroupNotFound(_)
        | SifError::NoPrimaryPartition
        | SifError::EncryptedPrimary
        | SifError::OverlayPresent
        | SifError::KeyLoad { .. }
        | SifError::OpenPgp(_)
        | SifError::DescriptorTableFull(_) => ErrorKind::UserInput,
        SifError::Keyserver(_) => ErrorKind::TransientIo,
        SifError::KeyNotFound(_)
        | SifError::MalformedSignature(_)
        | SifError::BadSignature { .. }
        | SifError::DigestMismatch { .. }
        | SifError::CoverageMismatch { .. }
        | SifError::NoSignatures
        | SifError::NotSignedByRequired
        | SifError::VerificationFailed(_) => ErrorKind::Verification,
        SifError::Json(_) | SifError::Base64(_) | SifError::KeyEncoding(_) => ErrorKind::PermanentIo,
    }
}
