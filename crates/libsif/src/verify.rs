use std::collections::BTreeSet;

use ed25519_dalek::Signature;

use crate::descriptor::{DataType, Descriptor, SignatureFormat};
use crate::digest::{self, DigestManifest};
use crate::envelope::{self, SignedMessage};
use crate::error::SifError;
use crate::image::Image;
use crate::key::{Fingerprint, PublicKey};
use crate::keyring::KeyChain;
use crate::openpgp::ClearSigned;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifySelection {
    All,
    Group(u32),
    Object(u32),
    /// Per-partition signatures written by older image revisions.
    Legacy,
}

/// Outcome of checking one signature descriptor.
#[derive(Debug)]
pub struct VerifyResult {
    pub signature: u32,
    pub covered: Vec<u32>,
    pub fingerprint: Option<Fingerprint>,
    pub error: Option<SifError>,
}

type Callback<'a> = Box<dyn FnMut(&VerifyResult) -> bool + 'a>;

/// A signature payload before its key is known.
enum Sealed {
    Dsse(SignedMessage),
    ClearSigned(ClearSigned),
}

impl Sealed {
    fn is_signed_by(&self, key: &PublicKey) -> bool {
        match self {
            Sealed::Dsse(signed) => {
                let Some(key) = key.as_ed25519() else {
                    return false;
                };
                Signature::from_slice(&signed.signature)
                    .map(|sig| key.verify_strict(&signed.signed_bytes, &sig).is_ok())
                    .unwrap_or(false)
            }
            Sealed::ClearSigned(block) => key.as_openpgp().map_or(false, |key| block.verify(key)),
        }
    }
}

pub struct Verifier<'a> {
    keys: &'a KeyChain,
    selection: VerifySelection,
    required: Vec<Fingerprint>,
    callback: Option<Callback<'a>>,
}

impl<'a> Verifier<'a> {
    pub fn new(keys: &'a KeyChain) -> Self {
        Verifier {
            keys,
            selection: VerifySelection::All,
            required: Vec::new(),
            callback: None,
        }
    }

    pub fn selection(mut self, selection: VerifySelection) -> Self {
        self.selection = selection;
        self
    }

    /// At least one valid signature must come from one of these keys.
    pub fn require_fingerprints(mut self, required: Vec<Fingerprint>) -> Self {
        self.required = required;
        self
    }

    /// Called once per signature. Returning `true` ignores a failure.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&VerifyResult) -> bool + 'a,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Checks every selected signature and returns the fingerprints that
    /// produced a valid one.
    #[tracing::instrument(skip_all, fields(image = %image.path().display()))]
    pub fn verify(&mut self, image: &Image) -> Result<Vec<Fingerprint>, SifError> {
        let candidates = self.candidates(image)?;
        if candidates.is_empty() {
            return Err(SifError::NoSignatures);
        }

        let mut signers = BTreeSet::new();
        for (desc, decoded) in candidates {
            let mut result = VerifyResult {
                signature: desc.id,
                covered: Vec::new(),
                fingerprint: None,
                error: None,
            };

            match decoded.and_then(|(sealed, manifest)| {
                result.covered = manifest.covered_ids();
                self.check(image, desc, &sealed, &manifest)
            }) {
                Ok(fp) => result.fingerprint = Some(fp),
                Err(err) => result.error = Some(err),
            }

            let ignored = match self.callback.as_mut() {
                Some(callback) => callback(&result),
                None => false,
            };
            match result.error {
                Some(err) if !ignored => return Err(err),
                Some(err) => tracing::warn!(signature = desc.id, "ignoring failure: {}", err),
                None => {
                    if let Some(fp) = result.fingerprint {
                        tracing::debug!(signature = desc.id, signer = %fp, "signature verified");
                        signers.insert(fp);
                    }
                }
            }
        }

        if !self.required.is_empty() && !self.required.iter().any(|fp| signers.contains(fp)) {
            return Err(SifError::NotSignedByRequired);
        }

        Ok(signers.into_iter().collect())
    }

    /// Selected signature descriptors with their decoded payloads. Decoding
    /// errors are kept so they reach the callback.
    #[allow(clippy::type_complexity)]
    fn candidates<'i>(
        &self,
        image: &'i Image,
    ) -> Result<Vec<(&'i Descriptor, Result<(Sealed, DigestManifest), SifError>)>, SifError>
    {
        let legacy = self.selection == VerifySelection::Legacy;
        let object_group = match &self.selection {
            VerifySelection::Object(id) => Some(image.get(*id)?.group),
            VerifySelection::Group(group) => {
                if image.group_objects(*group).is_empty() {
                    return Err(SifError::GroupNotFound(*group));
                }
                None
            }
            _ => None,
        };

        let mut out = Vec::new();
        for desc in image.descriptors() {
            let Some((format, _)) = desc.signature() else {
                continue;
            };
            if (format == SignatureFormat::Legacy) != legacy {
                continue;
            }

            let decoded = decode(image, desc, format);
            let keep = match &self.selection {
                VerifySelection::All | VerifySelection::Legacy => true,
                VerifySelection::Group(group) => desc.link_is_group && desc.link == *group,
                VerifySelection::Object(id) => {
                    (desc.link_is_group && Some(desc.link) == object_group)
                        || (!desc.link_is_group && desc.link == *id)
                        || decoded
                            .as_ref()
                            .map(|(_, m)| m.covered_ids().contains(id))
                            .unwrap_or(false)
                }
            };
            if keep {
                out.push((desc, decoded));
            }
        }

        Ok(out)
    }

    fn check(
        &self,
        image: &Image,
        desc: &Descriptor,
        sealed: &Sealed,
        manifest: &DigestManifest,
    ) -> Result<Fingerprint, SifError> {
        let Some((_, raw)) = desc.signature() else {
            return Err(SifError::MalformedSignature(format!(
                "object {} is not a signature",
                desc.id
            )));
        };
        let fingerprint = Fingerprint(raw);
        if let Sealed::Dsse(signed) = sealed {
            if signed.fingerprint.parse::<Fingerprint>()? != fingerprint {
                return Err(SifError::MalformedSignature(format!(
                    "signature {} names two different signers",
                    desc.id
                )));
            }
        }

        let key = self.keys.resolve(&fingerprint)?;
        if !sealed.is_signed_by(&key) {
            return Err(SifError::BadSignature { id: desc.id });
        }

        let legacy = matches!(desc.signature(), Some((SignatureFormat::Legacy, _)));
        if !legacy && manifest.image != image.header().uuid.to_string() {
            return Err(SifError::CoverageMismatch { id: desc.id });
        }

        if desc.link_is_group {
            let current: BTreeSet<u32> =
                image.group_objects(desc.link).iter().map(|d| d.id).collect();
            let signed_ids: BTreeSet<u32> = manifest.covered_ids().into_iter().collect();
            if current != signed_ids {
                return Err(SifError::CoverageMismatch { id: desc.id });
            }
        }

        for object in &manifest.objects {
            let target = image.get(object.id)?;
            let actual = if legacy {
                digest::payload_digest(image, target)?
            } else {
                digest::object_digest(image, target)?
            };
            if actual != object.digest {
                return Err(SifError::DigestMismatch { object: object.id });
            }
        }

        Ok(fingerprint)
    }
}

fn decode(
    image: &Image,
    desc: &Descriptor,
    format: SignatureFormat,
) -> Result<(Sealed, DigestManifest), SifError> {
    if desc.data_type != DataType::Signature {
        return Err(SifError::MalformedSignature(format!(
            "object {} is not a signature",
            desc.id
        )));
    }
    let payload = image.read_data(desc.id)?;
    let (sealed, message) = match format {
        SignatureFormat::Dsse => {
            let signed = envelope::open_dsse(&payload)?;
            let message = signed.message.clone();
            (Sealed::Dsse(signed), message)
        }
        SignatureFormat::Armored | SignatureFormat::Legacy => {
            let block = ClearSigned::parse(&payload)?;
            let message = block.text().into_bytes();
            (Sealed::ClearSigned(block), message)
        }
    };
    let manifest: DigestManifest = serde_json::from_slice(&message)?;
    Ok((sealed, manifest))
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use super::*;
    use crate::digest::{ObjectDigest, HASH_SHA256};
    use crate::image::tests::sample_image;
    use crate::image::{DescriptorInput, LoadMode};
    use crate::key::tests::test_key;
    use crate::key::{PemSigner, Signer};
    use crate::keyring::{KeySource, LocalKeyring};
    use crate::openpgp::tests::{test_signer, OTHER_PUBLIC, SIGNER_FINGERPRINT, SIGNER_PUBLIC};
    use crate::sign::{sign, SignSelection};

    fn pem_signer() -> (Signer, PublicKey) {
        let key = PemSigner::new(test_key(1));
        let public = PublicKey::ed25519(key.verifying_key());
        (Signer::Pem(key), public)
    }

    fn pgp_signer() -> (Signer, PublicKey) {
        (
            Signer::OpenPgp(test_signer()),
            PublicKey::parse(SIGNER_PUBLIC).unwrap(),
        )
    }

    fn signed_image(dir: &std::path::Path, signer: &Signer) -> Image {
        let mut image = sample_image(dir).unwrap();
        sign(&mut image, &SignSelection::AllGroups, signer).unwrap();
        image
    }

    #[test]
    fn test_sign_then_verify_both_formats() {
        for (signer, public) in [pgp_signer(), pem_signer()] {
            let tmp = tempfile::tempdir().unwrap();
            let image = signed_image(tmp.path(), &signer);
            let keys = KeyChain::new().with(KeySource::Key(public));

            let signers = Verifier::new(&keys).verify(&image).unwrap();
            assert_eq!(signers, vec![signer.fingerprint()]);
        }
    }

    #[test]
    fn test_required_fingerprints() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, public) = pgp_signer();
        let image = signed_image(tmp.path(), &signer);
        let keys = KeyChain::new().with(KeySource::Key(public));

        let required: Fingerprint = SIGNER_FINGERPRINT.parse().unwrap();
        Verifier::new(&keys)
            .require_fingerprints(vec![required])
            .verify(&image)
            .unwrap();

        let zero: Fingerprint = "0".repeat(40).parse().unwrap();
        let err = Verifier::new(&keys)
            .require_fingerprints(vec![zero])
            .verify(&image)
            .unwrap_err();
        assert!(matches!(err, SifError::NotSignedByRequired));
        assert_eq!(err.to_string(), "image not signed by required entity");
    }

    #[test]
    fn test_openpgp_key_from_keyring() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, public) = pgp_signer();
        let image = signed_image(tmp.path(), &signer);
        let keyring = LocalKeyring::new(tmp.path().join("keys"));
        keyring.add(&PublicKey::parse(OTHER_PUBLIC).unwrap()).unwrap();
        keyring.add(&public).unwrap();

        let keys = KeyChain::new().with(KeySource::Keyring(keyring));
        assert_eq!(
            Verifier::new(&keys).verify(&image).unwrap(),
            vec![signer.fingerprint()]
        );
    }

    #[test]
    fn test_wrong_key_type_does_not_verify() {
        let (_, pgp_public) = pgp_signer();
        let (_, ed25519) = pem_signer();
        let block = test_signer().clearsign(b"{}").unwrap();
        let sealed = Sealed::ClearSigned(ClearSigned::parse(&block).unwrap());
        assert!(sealed.is_signed_by(&pgp_public));
        assert!(!sealed.is_signed_by(&ed25519));
    }

    #[test]
    fn test_tampered_partition_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, public) = pem_signer();
        let image = signed_image(tmp.path(), &signer);
        let offset = image.primary_partition().unwrap().offset;
        let path = image.path().to_path_buf();
        drop(image);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(b"X").unwrap();
        drop(file);

        let image = Image::load(&path, LoadMode::ReadOnly).unwrap();
        let keys = KeyChain::new().with(KeySource::Key(public));
        assert!(matches!(
            Verifier::new(&keys).verify(&image),
            Err(SifError::DigestMismatch { object: 1 })
        ));
    }

    #[test]
    fn test_object_added_after_signing_breaks_group_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, public) = pgp_signer();
        let mut image = signed_image(tmp.path(), &signer);
        image
            .add_object(DescriptorInput::new(DataType::GenericJson, &b"{}"[..]))
            .unwrap();
        let keys = KeyChain::new().with(KeySource::Key(public));
        assert!(matches!(
            Verifier::new(&keys).verify(&image),
            Err(SifError::CoverageMismatch { .. })
        ));
    }

    #[test]
    fn test_callback_can_ignore_unknown_key() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, _) = pgp_signer();
        let image = signed_image(tmp.path(), &signer);
        let keys = KeyChain::new();

        let mut seen = Vec::new();
        let signers = Verifier::new(&keys)
            .callback(|result| {
                seen.push((result.signature, result.covered.clone()));
                matches!(result.error, Some(SifError::KeyNotFound(_)))
            })
            .verify(&image)
            .unwrap();
        assert!(signers.is_empty());
        assert_eq!(seen, vec![(3, vec![1, 2])]);
    }

    #[test]
    fn test_select_by_object_and_group() {
        let tmp = tempfile::tempdir().unwrap();
        let (signer, public) = pem_signer();
        let image = signed_image(tmp.path(), &signer);
        let keys = KeyChain::new().with(KeySource::Key(public));

        Verifier::new(&keys)
            .selection(VerifySelection::Object(2))
            .verify(&image)
            .unwrap();
        Verifier::new(&keys)
            .selection(VerifySelection::Group(crate::DEFAULT_GROUP))
            .verify(&image)
            .unwrap();
        assert!(matches!(
            Verifier::new(&keys)
                .selection(VerifySelection::Group(5))
                .verify(&image),
            Err(SifError::GroupNotFound(5))
        ));
    }

    #[test]
    fn test_unsigned_image() {
        let tmp = tempfile::tempdir().unwrap();
        let image = sample_image(tmp.path()).unwrap();
        let keys = KeyChain::new();
        assert!(matches!(
            Verifier::new(&keys).verify(&image),
            Err(SifError::NoSignatures)
        ));
    }

    #[test]
    fn test_legacy_partition_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        let signer = test_signer();
        let primary = image.primary_partition().unwrap().clone();

        let manifest = DigestManifest {
            hash: HASH_SHA256.into(),
            image: String::new(),
            objects: vec![ObjectDigest {
                id: primary.id,
                digest: digest::payload_digest(&image, &primary).unwrap(),
            }],
        };
        let block = signer.clearsign(&serde_json::to_vec(&manifest).unwrap()).unwrap();
        image
            .add_object(
                DescriptorInput::new(DataType::Signature, block.as_slice())
                    .group(0)
                    .link_object(primary.id)
                    .signature(SignatureFormat::Legacy, signer.fingerprint().0),
            )
            .unwrap();

        let keys = KeyChain::new().with(KeySource::Key(PublicKey::parse(SIGNER_PUBLIC).unwrap()));
        // legacy signatures are invisible unless asked for
        assert!(matches!(
            Verifier::new(&keys).verify(&image),
            Err(SifError::NoSignatures)
        ));
        let signers = Verifier::new(&keys)
            .selection(VerifySelection::Legacy)
            .verify(&image)
            .unwrap();
        assert_eq!(signers, vec![signer.fingerprint()]);
    }
}
