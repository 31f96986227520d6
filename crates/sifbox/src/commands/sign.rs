//! Add signatures to an image file.
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libsif::key::Signer;
use libsif::sign::SignSelection;
use libsif::{Image, LoadMode};

/// Sign the objects of an image file
#[derive(Parser, Debug)]
pub struct Sign {
    /// Armored OpenPGP secret key, or an Ed25519 private key in PKCS#8
    /// PEM form for DSSE signatures
    #[clap(short, long, alias = "certificate-key")]
    pub key: PathBuf,
    /// File holding the passphrase of an OpenPGP secret key
    #[clap(long)]
    pub passphrase_file: Option<PathBuf>,
    /// Sign every object of this group
    #[clap(short, long, conflicts_with_all = ["object_id", "all"])]
    pub group_id: Option<u32>,
    /// Sign exactly these objects with one signature
    #[clap(short = 'i', long, value_delimiter = ',', conflicts_with = "all")]
    pub object_id: Vec<u32>,
    /// Sign every group of the image, the default
    #[clap(short, long)]
    pub all: bool,

    /// Image file to sign
    #[clap(required = true)]
    pub image: PathBuf,
}

impl Sign {
    fn selection(&self) -> SignSelection {
        if let Some(group) = self.group_id {
            SignSelection::Group(group)
        } else if !self.object_id.is_empty() {
            SignSelection::Objects(self.object_id.clone())
        } else {
            SignSelection::AllGroups
        }
    }

    fn passphrase(&self) -> Result<String> {
        let Some(path) = &self.passphrase_file else {
            return Ok(String::new());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read passphrase from {}", path.display()))?;
        Ok(text.trim_end_matches(['\r', '\n']).to_owned())
    }
}

pub fn sign(args: Sign) -> Result<()> {
    let signer = Signer::load(&args.key, args.passphrase()?)?;
    let mut image = Image::load(&args.image, LoadMode::ReadWrite)?;
    tracing::info!("Signing image with key {}", signer.fingerprint());
    let added = libsif::sign::sign(&mut image, &args.selection(), &signer)
        .with_context(|| format!("failed to sign {}", args.image.display()))?;
    tracing::debug!(?added, "signature objects");
    eprintln!("Signature created and applied to image '{}'", args.image.display());
    Ok(())
}
