//! HTTP(S) conveyor: downloads an image file into the cache, then treats it
//! like a local image.
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use sha2::{Digest, Sha256};

use super::local::extract_local;
use super::{BuildContext, SourceError};
use crate::bundle::Bundle;
use crate::cache::CacheType;
use crate::definition::Bootstrap;
use crate::retry::with_retry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
pub struct HttpConveyor {
    url: String,
}

impl HttpConveyor {
    pub fn new(bootstrap: Bootstrap, src: &str) -> Self {
        let url = if src.contains("://") {
            src.to_owned()
        } else {
            format!("{}://{}", bootstrap.as_str(), src.trim_start_matches("//"))
        };
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[tracing::instrument(level = "debug", skip_all, fields(url = %self.url))]
    pub fn get(&mut self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        let image = self.fetch(ctx)?;
        extract_local(&image, ctx, bundle)
    }

    /// Path of the downloaded image in the `http` cache.
    fn fetch(&self, ctx: &BuildContext) -> Result<PathBuf, SourceError> {
        let key = hex::encode(Sha256::digest(self.url.as_bytes()));
        let mut entry = ctx.cache.get_entry(CacheType::Http, &key)?;
        if entry.exists() {
            tracing::info!("Using image from cache");
            return Ok(entry.path().to_path_buf());
        }

        let client = Client::builder()
            .user_agent(ctx.user_agent.as_str())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .map_err(|err| SourceError::Network {
                url: self.url.clone(),
                err,
            })?;

        let staging = entry.tmp_path().to_path_buf();
        let handle = ctx.cleanup.push(format!("staging {}", staging.display()), move || {
            let _ = fs::remove_file(&staging);
        });
        let result = with_retry(&ctx.cancel, &format!("download of {}", self.url), || {
            self.download(&client, entry.tmp_path())
        })
        .and_then(|size| {
            tracing::debug!(size, "downloaded image");
            entry.finalize().map_err(SourceError::from)
        });
        ctx.cleanup.release(handle);
        result.map(|_| entry.path().to_path_buf())
    }

    fn download(&self, client: &Client, dest: &std::path::Path) -> Result<u64, SourceError> {
        let network = |err| SourceError::Network {
            url: self.url.clone(),
            err,
        };
        let mut response = client.get(&self.url).send().map_err(network)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(self.url.clone()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SourceError::AuthDenied {
                resource: self.url.clone(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        let expected = response.content_length();
        let mut file = File::create(dest).map_err(SourceError::io(dest))?;
        let written = io::copy(&mut response, &mut file).map_err(SourceError::io(dest))?;
        file.sync_all().map_err(SourceError::io(dest))?;
        if let Some(expected) = expected {
            if written != expected {
                return Err(SourceError::DigestMismatch {
                    what: format!("download of {}", self.url),
                    expected: format!("{expected} bytes"),
                    actual: format!("{written} bytes"),
                });
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::config::BuildEnv;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves `body` to exactly `count` requests.
    fn serve(body: &'static [u8], count: usize) -> anyhow::Result<(String, thread::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/images/demo.sif", listener.local_addr()?);
        let handle = thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let Ok(mut stream) = stream else { return };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).map_or(false, |n| n > 2) {
                    line.clear();
                }
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(body);
            }
        });
        Ok((url, handle))
    }

    #[test]
    fn test_url_from_source() {
        assert_eq!(
            HttpConveyor::new(Bootstrap::Https, "example.org/img.sif").url(),
            "https://example.org/img.sif"
        );
        assert_eq!(
            HttpConveyor::new(Bootstrap::Http, "//example.org/img.sif").url(),
            "http://example.org/img.sif"
        );
        assert_eq!(
            HttpConveyor::new(Bootstrap::Https, "http://mirror/img.sif").url(),
            "http://mirror/img.sif"
        );
    }

    #[test]
    fn test_download_is_cached() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (url, server) = serve(b"image payload", 1)?;
        let ctx = BuildContext::new(BuildEnv::default(), ImageCache::new(tmp.path())?);
        let conveyor = HttpConveyor::new(Bootstrap::Http, &url);

        let first = conveyor.fetch(&ctx)?;
        assert_eq!(fs::read(&first)?, b"image payload");
        server.join().unwrap();

        // the server is gone, a second fetch must be served from the cache
        let second = conveyor.fetch(&ctx)?;
        assert_eq!(first, second);
        assert!(ctx.cleanup.is_empty());
        Ok(())
    }
}
