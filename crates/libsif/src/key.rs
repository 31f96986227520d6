use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use pgp::SignedPublicKey;
use sha2::{Digest, Sha256};

use crate::descriptor::{SignatureFormat, FINGERPRINT_LEN};
use crate::error::SifError;
use crate::openpgp::{self, PgpSigner};

/// 20 byte key identifier shown as 40 uppercase hex characters. OpenPGP
/// keys use their v4 fingerprint, raw Ed25519 keys the first 20 bytes of
/// the SHA-256 of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Fingerprint(fp)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = SifError;

    /// Accepts an optional `0x` prefix, any case and embedded spaces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .trim()
            .trim_start_matches("0x")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|err| SifError::MalformedSignature(format!("fingerprint {s:?}: {err}")))?;
        let fp: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|_| {
            SifError::MalformedSignature(format!(
                "fingerprint {s:?} must be {} hex characters",
                FINGERPRINT_LEN * 2
            ))
        })?;
        Ok(Fingerprint(fp))
    }
}

fn read_key_file(path: &Path) -> Result<String, SifError> {
    fs::read_to_string(path).map_err(|err| SifError::KeyLoad {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// An Ed25519 private key loaded from a PKCS#8 PEM file.
pub struct PemSigner {
    key: SigningKey,
    fingerprint: Fingerprint,
}

impl PemSigner {
    pub fn from_pem(pem: &str) -> Result<Self, String> {
        let key = SigningKey::from_pkcs8_pem(pem).map_err(|err| err.to_string())?;
        Ok(Self::new(key))
    }

    pub fn new(key: SigningKey) -> Self {
        let fingerprint = Fingerprint::of(&key.verifying_key());
        PemSigner { key, fingerprint }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }
}

/// Private key used by `sign`. OpenPGP keys produce clear-signed blocks,
/// PEM keys DSSE envelopes.
pub enum Signer {
    Pem(PemSigner),
    OpenPgp(PgpSigner),
}

impl Signer {
    /// Loads an armored OpenPGP secret key or a PKCS#8 PEM key. The
    /// passphrase only applies to protected OpenPGP keys.
    pub fn load<P: AsRef<Path>>(path: P, passphrase: String) -> Result<Self, SifError> {
        let path = path.as_ref();
        let text = read_key_file(path)?;
        let signer = if text.contains(openpgp::SECRET_KEY_HEADER) {
            PgpSigner::from_armored(&text, passphrase).map(Signer::OpenPgp)
        } else {
            PemSigner::from_pem(&text).map(Signer::Pem)
        };
        signer.map_err(|reason| SifError::KeyLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Signer::Pem(key) => key.fingerprint(),
            Signer::OpenPgp(key) => key.fingerprint(),
        }
    }

    pub fn format(&self) -> SignatureFormat {
        match self {
            Signer::Pem(_) => SignatureFormat::Dsse,
            Signer::OpenPgp(_) => SignatureFormat::Armored,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum KeyMaterial {
    Ed25519(VerifyingKey),
    OpenPgp(Box<SignedPublicKey>),
}

/// A public key a signature is checked against.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    fingerprint: Fingerprint,
    material: KeyMaterial,
}

impl PublicKey {
    pub fn ed25519(key: VerifyingKey) -> Self {
        PublicKey {
            fingerprint: Fingerprint::of(&key),
            material: KeyMaterial::Ed25519(key),
        }
    }

    pub fn openpgp(key: SignedPublicKey) -> Result<Self, String> {
        Ok(PublicKey {
            fingerprint: openpgp::fingerprint_of(&key)?,
            material: KeyMaterial::OpenPgp(Box::new(key)),
        })
    }

    /// Parses an armored OpenPGP public key block or a PEM public key.
    pub fn parse(text: &str) -> Result<Self, String> {
        if text.contains(openpgp::PUBLIC_KEY_HEADER) {
            Self::openpgp(openpgp::parse_public_key(text)?)
        } else {
            let key = VerifyingKey::from_public_key_pem(text).map_err(|err| err.to_string())?;
            Ok(Self::ed25519(key))
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SifError> {
        let path = path.as_ref();
        Self::parse(&read_key_file(path)?).map_err(|reason| SifError::KeyLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn as_ed25519(&self) -> Option<&VerifyingKey> {
        match &self.material {
            KeyMaterial::Ed25519(key) => Some(key),
            KeyMaterial::OpenPgp(_) => None,
        }
    }

    pub fn as_openpgp(&self) -> Option<&SignedPublicKey> {
        match &self.material {
            KeyMaterial::OpenPgp(key) => Some(key),
            KeyMaterial::Ed25519(_) => None,
        }
    }

    /// Text form of the key and the file extension it is stored under.
    pub fn export(&self) -> Result<(String, &'static str), SifError> {
        match &self.material {
            KeyMaterial::Ed25519(key) => {
                let pem = key
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|err| SifError::KeyEncoding(err.to_string()))?;
                Ok((pem, "pem"))
            }
            KeyMaterial::OpenPgp(key) => Ok((openpgp::armor_public_key(key)?, "asc")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use ed25519_dalek::Verifier;

    use super::*;
    use crate::openpgp::tests::{SIGNER_FINGERPRINT, SIGNER_PUBLIC, SIGNER_SECRET};

    pub(crate) fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = Fingerprint::of(&test_key(1).verifying_key());
        let text = fp.to_string();
        assert_eq!(text.len(), 40);
        assert!(text.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(text.to_lowercase().parse::<Fingerprint>().unwrap(), fp);
        assert_eq!(format!("0x{text}").parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn test_fingerprint_rejects_wrong_length() {
        assert!("ABCD".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(20).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_load_pem_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let key = test_key(3);
        let private = tmp.path().join("key.pem");
        let public = tmp.path().join("key.pub.pem");
        fs::write(&private, key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        fs::write(
            &public,
            key.verifying_key().to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        let signer = Signer::load(&private, String::new()).unwrap();
        assert_eq!(signer.format(), SignatureFormat::Dsse);
        let verifier = PublicKey::load(&public).unwrap();
        assert_eq!(signer.fingerprint(), verifier.fingerprint());

        let Signer::Pem(pem) = signer else {
            panic!("expected a PEM signer");
        };
        let sig = pem.sign(b"message");
        assert!(verifier.as_ed25519().unwrap().verify(b"message", &sig).is_ok());
        assert!(verifier.as_openpgp().is_none());
    }

    #[test]
    fn test_load_openpgp_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let private = tmp.path().join("signer.asc");
        let public = tmp.path().join("signer.pub.asc");
        fs::write(&private, SIGNER_SECRET).unwrap();
        fs::write(&public, SIGNER_PUBLIC).unwrap();

        let signer = Signer::load(&private, String::new()).unwrap();
        assert_eq!(signer.format(), SignatureFormat::Armored);
        assert_eq!(signer.fingerprint().to_string(), SIGNER_FINGERPRINT);

        let key = PublicKey::load(&public).unwrap();
        assert_eq!(key.fingerprint(), signer.fingerprint());
        assert!(key.as_openpgp().is_some());
        let (armored, ext) = key.export().unwrap();
        assert_eq!(ext, "asc");
        assert_eq!(PublicKey::parse(&armored).unwrap(), key);
    }

    #[test]
    fn test_load_garbage_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.pem");
        fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            Signer::load(&path, String::new()),
            Err(SifError::KeyLoad { .. })
        ));
        assert!(matches!(PublicKey::load(&path), Err(SifError::KeyLoad { .. })));
    }
}
