//! Check the signatures of an image file.
use std::cell::RefCell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use libsif::key::{Fingerprint, PublicKey};
use libsif::keyring::{HkpClient, KeyChain, KeySource, LocalKeyring};
use libsif::verify::{VerifyResult, VerifySelection, Verifier};
use libsif::{Image, LoadMode, SifError};
use serde::Serialize;

/// Verify the signatures of an image file
#[derive(Parser, Debug)]
pub struct Verify {
    /// Armored OpenPGP public key, or an Ed25519 public key in PEM form
    #[clap(short, long, alias = "certificate")]
    pub key: Option<PathBuf>,
    /// Directory of `.asc` and `.pem` public keys named after their fingerprint
    #[clap(long)]
    pub keyring: Option<PathBuf>,
    /// HKP key server to fetch unknown keys from
    #[clap(long)]
    pub keyserver: Option<String>,
    /// Verify the signatures covering this group
    #[clap(short, long, conflicts_with_all = ["object_id", "all", "legacy_insecure"])]
    pub group_id: Option<u32>,
    /// Verify the signatures covering this object
    #[clap(short = 'i', long, conflicts_with_all = ["all", "legacy_insecure"])]
    pub object_id: Option<u32>,
    /// Verify every signature of the image, the default
    #[clap(short, long)]
    pub all: bool,
    /// Accept per-partition signatures of older images
    #[clap(long)]
    pub legacy_insecure: bool,
    /// Fail unless one of these keys produced a valid signature
    #[clap(long = "fingerprint", value_delimiter = ',')]
    pub fingerprints: Vec<String>,
    /// Print a JSON report instead of text
    #[clap(short, long)]
    pub json: bool,

    /// Image file to verify
    #[clap(required = true)]
    pub image: PathBuf,
}

#[derive(Debug, Serialize)]
struct SignatureReport {
    signature: u32,
    covered: Vec<u32>,
    fingerprint: Option<String>,
    error: Option<String>,
}

impl From<&VerifyResult> for SignatureReport {
    fn from(result: &VerifyResult) -> Self {
        Self {
            signature: result.signature,
            covered: result.covered.clone(),
            fingerprint: result.fingerprint.map(|fp| fp.to_string()),
            error: result.error.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    signatures: Vec<SignatureReport>,
    verified: bool,
    error: Option<String>,
}

impl Verify {
    fn selection(&self) -> VerifySelection {
        if self.legacy_insecure {
            VerifySelection::Legacy
        } else if let Some(group) = self.group_id {
            VerifySelection::Group(group)
        } else if let Some(object) = self.object_id {
            VerifySelection::Object(object)
        } else {
            VerifySelection::All
        }
    }

    fn key_chain(&self) -> Result<KeyChain> {
        let mut chain = KeyChain::new();
        if let Some(path) = &self.key {
            chain = chain.with(KeySource::Key(PublicKey::load(path)?));
        }
        let keyring = self.keyring.clone().or_else(default_keyring);
        if let Some(dir) = keyring {
            chain = chain.with(KeySource::Keyring(LocalKeyring::new(dir)));
        }
        if let Some(server) = &self.keyserver {
            chain = chain.with(KeySource::Keyserver(HkpClient::new(server)?));
        }
        Ok(chain)
    }
}

fn default_keyring() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let dir = Path::new(&home).join(".sifbox/keys");
    dir.is_dir().then_some(dir)
}

pub fn verify(args: Verify) -> Result<()> {
    let required = args
        .fingerprints
        .iter()
        .map(|fp| fp.parse::<Fingerprint>())
        .collect::<Result<Vec<_>, _>>()?;
    let keys = args.key_chain()?;
    let image = Image::load(&args.image, LoadMode::ReadOnly)?;
    tracing::info!("Verifying image: {}", args.image.display());

    let reports = RefCell::new(Vec::new());
    let json = args.json;
    let outcome = Verifier::new(&keys)
        .selection(args.selection())
        .require_fingerprints(required)
        .callback(|result| {
            if !json {
                print_result(result);
            }
            reports.borrow_mut().push(SignatureReport::from(result));
            false
        })
        .verify(&image);

    if json {
        let report = Report {
            signatures: reports.into_inner(),
            verified: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };
        let mut stdout = io::stdout();
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
    }

    let signers = outcome.with_context(|| format!("failed to verify {}", args.image.display()))?;
    if !json {
        eprintln!(
            "Verified signature(s) from {}",
            signers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn print_result(result: &VerifyResult) {
    let covered = result
        .covered
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    match (&result.error, &result.fingerprint) {
        (None, Some(fp)) => eprintln!(
            "Signature {} covering objects [{covered}] signed by {fp}",
            result.signature
        ),
        (Some(SifError::KeyNotFound(fp)), _) => eprintln!(
            "Signature {}: no public key for {fp}, use --key, --keyring or --keyserver",
            result.signature
        ),
        (Some(err), _) => eprintln!("Signature {} failed: {err}", result.signature),
        (None, None) => eprintln!("Signature {} covering objects [{covered}]", result.signature),
    }
}
