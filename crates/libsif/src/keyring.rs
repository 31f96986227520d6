use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::error::SifError;
use crate::key::{Fingerprint, PublicKey};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const KEY_EXTENSIONS: [&str; 2] = ["asc", "pem"];

/// A directory of public keys, armored OpenPGP (`.asc`) or PEM (`.pem`).
#[derive(Debug, Clone)]
pub struct LocalKeyring {
    dir: PathBuf,
}

impl LocalKeyring {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        LocalKeyring { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores a public key as `<FINGERPRINT>.asc` or `<FINGERPRINT>.pem`.
    pub fn add(&self, key: &PublicKey) -> Result<PathBuf, SifError> {
        fs::create_dir_all(&self.dir).map_err(|err| SifError::Create {
            path: self.dir.clone(),
            err,
        })?;
        let (text, ext) = key.export()?;
        let path = self.dir.join(format!("{}.{ext}", key.fingerprint()));
        fs::write(&path, text).map_err(|err| SifError::Create {
            path: path.clone(),
            err,
        })?;
        Ok(path)
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PublicKey>, SifError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SifError::Open {
                    path: self.dir.clone(),
                    err,
                })
            }
        };

        for entry in entries {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !KEY_EXTENSIONS.contains(&ext) {
                continue;
            }
            match PublicKey::load(&path) {
                Ok(key) if key.fingerprint() == *fingerprint => return Ok(Some(key)),
                Ok(_) => {}
                Err(err) => tracing::debug!("skipping {}: {}", path.display(), err),
            }
        }

        Ok(None)
    }
}

/// Client for an HKP keyserver. Machine readable `op=get` answers carry an
/// armored OpenPGP public key block.
#[derive(Debug, Clone)]
pub struct HkpClient {
    base: String,
    client: Client,
}

impl HkpClient {
    pub fn new(base: &str) -> Result<Self, SifError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sifbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HkpClient {
            base: base.trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn lookup_url(&self, fingerprint: &Fingerprint) -> String {
        format!(
            "{}/pks/lookup?op=get&options=mr&search=0x{}",
            self.base, fingerprint
        )
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PublicKey>, SifError> {
        let url = self.lookup_url(fingerprint);
        tracing::debug!(%url, "querying keyserver");
        let response = self.client.get(&url).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.text()?;
        key_from_response(&body, fingerprint).map_err(|reason| SifError::KeyLoad {
            path: PathBuf::from(url),
            reason,
        })
    }
}

/// Never trusts a key whose fingerprint differs from the one asked for.
fn key_from_response(body: &str, fingerprint: &Fingerprint) -> Result<Option<PublicKey>, String> {
    let key = PublicKey::parse(body)?;
    if key.fingerprint() != *fingerprint {
        tracing::warn!(got = %key.fingerprint(), wanted = %fingerprint, "keyserver returned another key");
        return Ok(None);
    }
    Ok(Some(key))
}

pub enum KeySource {
    Key(PublicKey),
    Keyring(LocalKeyring),
    Keyserver(HkpClient),
}

/// Ordered list of places a public key is looked up in.
#[derive(Default)]
pub struct KeyChain {
    sources: Vec<KeySource>,
}

impl KeyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: KeySource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn resolve(&self, fingerprint: &Fingerprint) -> Result<PublicKey, SifError> {
        for source in &self.sources {
            let found = match source {
                KeySource::Key(key) if key.fingerprint() == *fingerprint => Some(key.clone()),
                KeySource::Key(_) => None,
                KeySource::Keyring(keyring) => keyring.lookup(fingerprint)?,
                KeySource::Keyserver(server) => match server.lookup(fingerprint) {
                    Ok(found) => found,
                    Err(err) => {
                        tracing::warn!("keyserver lookup for {} failed: {}", fingerprint, err);
                        None
                    }
                },
            };
            if let Some(key) = found {
                return Ok(key);
            }
        }

        Err(SifError::KeyNotFound(fingerprint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::tests::test_key;
    use crate::openpgp::tests::{OTHER_PUBLIC, SIGNER_FINGERPRINT, SIGNER_PUBLIC};

    fn pem_key(seed: u8) -> PublicKey {
        PublicKey::ed25519(test_key(seed).verifying_key())
    }

    #[test]
    fn test_keyring_add_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = LocalKeyring::new(tmp.path().join("keys"));
        let key = pem_key(5);
        let other = pem_key(6);

        let path = keyring.add(&key).unwrap();
        assert!(path.ends_with(format!("{}.pem", key.fingerprint())));
        fs::write(tmp.path().join("keys/notes.txt"), "ignored").unwrap();

        assert_eq!(keyring.lookup(&key.fingerprint()).unwrap(), Some(key));
        assert_eq!(keyring.lookup(&other.fingerprint()).unwrap(), None);
    }

    #[test]
    fn test_keyring_holds_openpgp_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = LocalKeyring::new(tmp.path());
        let key = PublicKey::parse(SIGNER_PUBLIC).unwrap();

        let path = keyring.add(&key).unwrap();
        assert!(path.ends_with(format!("{SIGNER_FINGERPRINT}.asc")));
        let fp: Fingerprint = SIGNER_FINGERPRINT.parse().unwrap();
        assert_eq!(keyring.lookup(&fp).unwrap(), Some(key));
    }

    #[test]
    fn test_missing_keyring_dir_is_empty() {
        let keyring = LocalKeyring::new("/nonexistent/sifbox/keys");
        assert_eq!(keyring.lookup(&pem_key(1).fingerprint()).unwrap(), None);
    }

    #[test]
    fn test_hkp_lookup_url() {
        let client = HkpClient::new("https://keys.example.org/").unwrap();
        let fp: Fingerprint = "12045C8C0B1004D058DE4BEDA20C27EE7FF7BA84".parse().unwrap();
        assert_eq!(
            client.lookup_url(&fp),
            "https://keys.example.org/pks/lookup?op=get&options=mr&search=0x12045C8C0B1004D058DE4BEDA20C27EE7FF7BA84"
        );
    }

    #[test]
    fn test_hkp_response_is_an_armored_key() {
        let fp: Fingerprint = SIGNER_FINGERPRINT.parse().unwrap();
        let key = key_from_response(SIGNER_PUBLIC, &fp).unwrap().unwrap();
        assert!(key.as_openpgp().is_some());

        // a different key than requested is ignored
        assert_eq!(key_from_response(OTHER_PUBLIC, &fp).unwrap(), None);
        assert!(key_from_response("<html>no results</html>", &fp).is_err());
    }

    #[test]
    fn test_chain_order() {
        let key = pem_key(8);
        let chain = KeyChain::new()
            .with(KeySource::Key(pem_key(9)))
            .with(KeySource::Key(key.clone()));
        assert_eq!(chain.resolve(&key.fingerprint()).unwrap(), key);

        assert!(matches!(
            chain.resolve(&pem_key(10).fingerprint()),
            Err(SifError::KeyNotFound(_))
        ));
    }
}
