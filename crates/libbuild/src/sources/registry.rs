//! Minimal OCI distribution client: anonymous bearer token auth, manifest
//! resolution and blob downloads.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use reqwest::blocking::{Client, Response};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::SourceError;

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.docker.distribution.manifest.v2+json"
);

/// `[registry/]repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Empty when the reference names no registry; the default is applied
    /// when the client is built.
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidReference(s.to_owned());
        let s = s.trim().trim_start_matches("//");
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(invalid());
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid());
                }
                (rest, Some(digest.to_owned()))
            }
            None => (s, None),
        };

        let (registry, path) = match rest.split_once('/') {
            Some((first, path)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_owned(), path)
            }
            _ => (String::new(), rest),
        };

        // a ':' after the last '/' separates the tag
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_owned())),
            _ => (path, None),
        };
        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid());
        }
        let repository = if (registry.is_empty() || registry == "docker.io") && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Digest when pinned, otherwise the tag (default `latest`).
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    pub fn registry_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.registry.as_str() {
            "" | "docker.io" | "index.docker.io" => default,
            other => other,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Manifest bytes as served, with the digest they hash to.
#[derive(Debug)]
pub enum FetchedManifest {
    Index(ImageIndex),
    Manifest { manifest: ImageManifest, digest: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_challenge(value: &str) -> Option<AuthChallenge> {
    let rest = value.trim().strip_prefix("Bearer ")?;
    let mut challenge = AuthChallenge::default();
    for part in rest.split(',') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let val = val.trim_matches('"').to_owned();
        match key {
            "realm" => challenge.realm = val,
            "service" => challenge.service = Some(val),
            "scope" => challenge.scope = Some(val),
            _ => {}
        }
    }
    (!challenge.realm.is_empty()).then_some(challenge)
}

pub struct RegistryClient {
    client: Client,
    base: String,
    repository: String,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base", &self.base)
            .field("repository", &self.repository)
            .finish()
    }
}

impl RegistryClient {
    /// `default_registry` replaces Docker Hub for references without an
    /// explicit registry.
    pub fn new(reference: &Reference, default_registry: &str, user_agent: &str) -> Result<Self, SourceError> {
        let host = reference.registry_or(default_registry);
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_owned()
        } else if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{host}")
        } else {
            format!("https://{host}")
        };
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .map_err(|err| SourceError::Network {
                url: base.clone(),
                err,
            })?;
        Ok(Self {
            client,
            base,
            repository: reference.repository.clone(),
            token: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn send(&self, url: &str, accept: Option<&str>) -> Result<Response, SourceError> {
        let request = |token: Option<&str>| {
            let mut req = self.client.get(url);
            if let Some(accept) = accept {
                req = req.header(header::ACCEPT, accept);
            }
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            req.send().map_err(|err| SourceError::Network {
                url: url.to_owned(),
                err,
            })
        };

        let cached = self.token.lock().ok().and_then(|t| t.clone());
        let response = request(cached.as_deref())?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.check_status(url, response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| SourceError::AuthDenied {
                resource: url.to_owned(),
                reason: "registry requires authentication".to_owned(),
            })?;
        let token = self.fetch_token(&challenge)?;
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.clone());
        }
        let response = request(Some(&token))?;
        self.check_status(url, response)
    }

    fn check_status(&self, url: &str, response: Response) -> Result<Response, SourceError> {
        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::AuthDenied {
                resource: url.to_owned(),
                reason: format!("HTTP {}", response.status().as_u16()),
            }),
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(url.to_owned())),
            s => Err(SourceError::Status {
                url: url.to_owned(),
                status: s.as_u16(),
            }),
        }
    }

    fn fetch_token(&self, challenge: &AuthChallenge) -> Result<String, SourceError> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        query.push((
            "scope",
            challenge
                .scope
                .clone()
                .unwrap_or_else(|| format!("repository:{}:pull", self.repository)),
        ));
        tracing::debug!(realm = %challenge.realm, "requesting registry token");
        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .map_err(|err| SourceError::Network {
                url: challenge.realm.clone(),
                err,
            })?;
        if !response.status().is_success() {
            return Err(SourceError::AuthDenied {
                resource: self.repository.clone(),
                reason: format!("token request returned HTTP {}", response.status().as_u16()),
            });
        }
        let body: TokenResponse = response.json().map_err(|err| SourceError::Network {
            url: challenge.realm.clone(),
            err,
        })?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| SourceError::AuthDenied {
                resource: self.repository.clone(),
                reason: "token response carried no token".to_owned(),
            })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest, SourceError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repository, reference);
        let response = self.send(&url, Some(ACCEPT_MANIFEST))?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response.bytes().map_err(|err| SourceError::Network {
            url: url.clone(),
            err,
        })?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if reference.starts_with("sha256:") && reference != digest {
            return Err(SourceError::DigestMismatch {
                what: format!("manifest {reference}"),
                expected: reference.to_owned(),
                actual: digest,
            });
        }

        let media_type = if content_type.is_empty() {
            serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_owned))
                .unwrap_or_default()
        } else {
            content_type
        };
        if media_type.contains("index") || media_type.contains("manifest.list") {
            let index = serde_json::from_slice(&body).map_err(|err| SourceError::Json {
                what: "image index",
                err,
            })?;
            Ok(FetchedManifest::Index(index))
        } else if media_type.contains("manifest") || media_type.is_empty() {
            let manifest = serde_json::from_slice(&body).map_err(|err| SourceError::Json {
                what: "image manifest",
                err,
            })?;
            Ok(FetchedManifest::Manifest { manifest, digest })
        } else {
            Err(SourceError::UnsupportedMediaType(media_type))
        }
    }

    /// Streams blob `digest` into `dest`, verifying its sha256.
    #[tracing::instrument(level = "debug", skip(self, dest))]
    pub fn download_blob(&self, digest: &str, dest: &Path) -> Result<u64, SourceError> {
        let expected = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| SourceError::UnsupportedDigest(digest.to_owned()))?;
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.repository, digest);
        let mut response = self.send(&url, None)?;

        let file = File::create(dest).map_err(SourceError::io(dest))?;
        let mut writer = HashingWriter {
            inner: file,
            hasher: Sha256::new(),
        };
        let written = io::copy(&mut response, &mut writer).map_err(|err| SourceError::Io {
            path: dest.to_path_buf(),
            err,
        })?;
        writer.inner.sync_all().map_err(SourceError::io(dest))?;
        let actual = hex::encode(writer.hasher.finalize());
        if actual != expected {
            let _ = std::fs::remove_file(dest);
            return Err(SourceError::DigestMismatch {
                what: format!("blob {digest}"),
                expected: expected.to_owned(),
                actual,
            });
        }
        Ok(written)
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Picks the linux manifest for `arch` from an index.
pub fn select_platform<'a>(index: &'a ImageIndex, arch: &str) -> Option<&'a Descriptor> {
    index.manifests().iter().find(|d| {
        let is_manifest = matches!(
            d.media_type(),
            MediaType::ImageManifest | MediaType::Other(_)
        );
        is_manifest
            && d.platform().as_ref().map_or(false, |p| {
                p.os().to_string() == "linux" && p.architecture().to_string() == arch
            })
    })
}

/// Hex part of a `sha256:<hex>` digest, usable as a cache key.
pub fn digest_hex(digest: &str) -> Result<&str, SourceError> {
    digest
        .strip_prefix("sha256:")
        .filter(|h| h.len() == 64)
        .ok_or_else(|| SourceError::UnsupportedDigest(digest.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() -> anyhow::Result<()> {
        let r = Reference::parse("alpine:3.17")?;
        assert_eq!(r.registry, "");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference(), "3.17");
        assert_eq!(r.registry_or(DEFAULT_REGISTRY), DEFAULT_REGISTRY);

        let r = Reference::parse("ghcr.io/owner/tool")?;
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "owner/tool");
        assert_eq!(r.reference(), "latest");

        let r = Reference::parse("localhost:5000/team/app:v1@sha256:abcd")?;
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.reference(), "sha256:abcd");

        let r = Reference::parse("//ubuntu")?;
        assert_eq!(r.repository, "library/ubuntu");
        Ok(())
    }

    #[test]
    fn test_parse_reference_rejects() {
        for bad in ["", "alpine:", "alpine@latest", "two words"] {
            assert!(Reference::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_challenge() {
        let c = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/alpine:pull"));
        assert!(parse_challenge("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn test_select_platform() -> anyhow::Result<()> {
        let index: ImageIndex = serde_json::from_str(
            r#"{
              "schemaVersion": 2,
              "mediaType": "application/vnd.oci.image.index.v1+json",
              "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
                 "size": 100, "platform": {"architecture": "arm64", "os": "linux"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                 "size": 100, "platform": {"architecture": "amd64", "os": "linux"}}
              ]
            }"#,
        )?;
        let amd = select_platform(&index, "amd64").unwrap();
        assert!(amd.digest().ends_with("2222"));
        assert!(select_platform(&index, "s390x").is_none());
        Ok(())
    }

    #[test]
    fn test_digest_hex() {
        let hex64 = "a".repeat(64);
        assert_eq!(digest_hex(&format!("sha256:{hex64}")).unwrap(), hex64);
        assert!(digest_hex("sha512:abc").is_err());
    }
}
