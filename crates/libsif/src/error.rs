use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SifError {
    #[error("failed to open {path}: {err}")]
    Open { path: PathBuf, err: std::io::Error },
    #[error("failed to create {path}: {err}")]
    Create { path: PathBuf, err: std::io::Error },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("unsupported image format revision {0:?}")]
    UnsupportedVersion(String),
    #[error("image was opened read-only")]
    ReadOnly,
    #[error("descriptor table is full ({0} entries)")]
    DescriptorTableFull(usize),
    #[error("object {0} not found")]
    ObjectNotFound(u32),
    #[error("group {0} not found")]
    GroupNotFound(u32),
    #[error("image has no primary partition")]
    NoPrimaryPartition,
    #[error("an overlay cannot be added to an image with an encrypted primary partition")]
    EncryptedPrimary,
    #[error("image contains a writable overlay partition, signing would not be reproducible")]
    OverlayPresent,

    #[error("failed to load key from {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },
    #[error("failed to encode key: {0}")]
    KeyEncoding(String),
    #[error("openpgp signing failed: {0}")]
    OpenPgp(String),
    #[error("no public key found for fingerprint {0}")]
    KeyNotFound(String),
    #[error("keyserver request failed: {0}")]
    Keyserver(#[from] reqwest::Error),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature {id} does not match the signing key")]
    BadSignature { id: u32 },
    #[error("object {object} digest mismatch")]
    DigestMismatch { object: u32 },
    #[error("signature {id} does not cover the current content of its group")]
    CoverageMismatch { id: u32 },
    #[error("no signatures found for the selected objects")]
    NoSignatures,
    #[error("image not signed by required entity")]
    NotSignedByRequired,
    #[error("verification of signature {0} failed")]
    VerificationFailed(u32),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}
