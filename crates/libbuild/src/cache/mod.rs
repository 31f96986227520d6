//! Content addressed store for downloaded blobs and converted images.
//!
//! Every cache type owns a directory under the cache root. An artifact lives
//! at `<root>/<type>/<key>` where key is a lowercase hex SHA-256. Producers
//! write to a unique hidden staging file next to it and publish with
//! [`Entry::finalize`]; the first producer to finalize wins.
mod clean;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use nix::sys::signal::kill;
use nix::unistd::Pid;

pub use clean::{CacheEntryInfo, CacheListing, TypeTotal};

/// Staging files older than this are reaped even if their owner looks alive.
pub const STAGING_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key {0:?}: expected 64 lowercase hex characters")]
    InvalidKey(String),
    #[error("unknown cache type {0:?}")]
    UnknownType(String),
    #[error("cache io error on {path}: {err}")]
    Io { path: PathBuf, err: io::Error },
}

trait WrapCacheIo<T> {
    fn wrap_path<P: Into<PathBuf>>(self, path: P) -> Result<T, CacheError>;
}

impl<T> WrapCacheIo<T> for Result<T, io::Error> {
    fn wrap_path<P: Into<PathBuf>>(self, path: P) -> Result<T, CacheError> {
        self.map_err(|err| CacheError::Io {
            path: path.into(),
            err,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheType {
    OciBlob,
    OciTempSif,
    Library,
    Http,
    Ipfs,
    Shub,
    Oras,
}

impl CacheType {
    pub const ALL: [CacheType; 7] = [
        CacheType::OciBlob,
        CacheType::OciTempSif,
        CacheType::Library,
        CacheType::Http,
        CacheType::Ipfs,
        CacheType::Shub,
        CacheType::Oras,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::OciBlob => "oci-blob",
            CacheType::OciTempSif => "oci-temp-sif",
            CacheType::Library => "library",
            CacheType::Http => "http",
            CacheType::Ipfs => "ipfs",
            CacheType::Shub => "shub",
            CacheType::Oras => "oras",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `blob` and `oci-sif` are accepted as short forms on the command line
        match s {
            "blob" => return Ok(CacheType::OciBlob),
            "oci-sif" => return Ok(CacheType::OciTempSif),
            _ => {}
        }
        CacheType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CacheError::UnknownType(s.to_owned()))
    }
}

/// Handle on the image cache. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
    disabled: bool,
}

impl ImageCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).wrap_path(&root)?;
        Ok(Self {
            root,
            disabled: false,
        })
    }

    /// A cache living in a private directory under `parent`, removed by
    /// [`ImageCache::cleanup`]. Used when caching is disabled.
    pub fn throwaway(parent: &Path) -> Result<Self, CacheError> {
        let root = parent.join(format!(
            "sifbox-nocache-{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&root).wrap_path(&root)?;
        tracing::debug!(?root, "image cache disabled, using throwaway directory");
        Ok(Self {
            root,
            disabled: true,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Removes the throwaway directory of a disabled cache.
    pub fn cleanup(&self) {
        if self.disabled {
            if let Err(err) = fs::remove_dir_all(&self.root) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("could not remove {}: {err}", self.root.display());
                }
            }
        }
    }

    pub fn type_dir(&self, ty: CacheType) -> PathBuf {
        self.root.join(ty.as_str())
    }

    pub fn get_entry(&self, ty: CacheType, key: &str) -> Result<Entry, CacheError> {
        validate_key(key)?;
        let dir = self.type_dir(ty);
        fs::create_dir_all(&dir).wrap_path(&dir)?;
        reap_orphans(&dir);

        let path = dir.join(key);
        let tmp_path = dir.join(format!(
            ".{key}.tmp.{}.{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        Ok(Entry {
            ty,
            exists: path.is_file(),
            path,
            tmp_path,
        })
    }
}

/// One cache slot. Either the artifact exists at `path` or the caller writes
/// it to `tmp_path` and calls [`Entry::finalize`].
#[derive(Debug)]
pub struct Entry {
    ty: CacheType,
    exists: bool,
    path: PathBuf,
    tmp_path: PathBuf,
}

impl Entry {
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn cache_type(&self) -> CacheType {
        self.ty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Publishes the staging file. When another producer already published
    /// the same key the staging file is dropped and the call still succeeds.
    pub fn finalize(&mut self) -> Result<(), CacheError> {
        if self.exists {
            return Ok(());
        }

        match fs::hard_link(&self.tmp_path, &self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = ?self.path, "cache entry already finalized, discarding staging file");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(err).wrap_path(&self.tmp_path);
            }
            Err(_) if self.path.exists() => {}
            // filesystems without hard links
            Err(_) => fs::rename(&self.tmp_path, &self.path).wrap_path(&self.path)?,
        }
        self.clean_tmp()?;
        self.exists = true;
        Ok(())
    }

    pub fn clean_tmp(&self) -> Result<(), CacheError> {
        match fs::remove_file(&self.tmp_path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err).wrap_path(&self.tmp_path),
            _ => Ok(()),
        }
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_owned()))
    }
}

/// Pid encoded in a staging file name, `.<key>.tmp.<pid>.<n>`.
fn staging_owner(name: &str) -> Option<i32> {
    let rest = name.strip_prefix('.')?;
    let (_, tail) = rest.split_once(".tmp.")?;
    tail.split('.').next()?.parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(nix::errno::Errno::ESRCH))
}

/// Removes staging files left behind by dead processes or older than
/// [`STAGING_GRACE`].
fn reap_orphans(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(owner) = name.to_str().and_then(staging_owner) else {
            continue;
        };
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map_or(false, |age| age > STAGING_GRACE);
        if expired || !pid_alive(owner) {
            tracing::debug!(path = ?entry.path(), owner, "removing orphan staging file");
            if let Err(err) = fs::remove_file(entry.path()) {
                tracing::warn!("could not remove orphan {}: {err}", entry.path().display());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    pub(crate) const KEY: &str = "4bf8a5d0cf0f1a1b0ba6e0b0c2bd5a0d4c6bbf5d54f5fe5bd0e0b4a6c8a7d3e1";

    #[test]
    fn test_invalid_key() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;
        assert!(matches!(
            cache.get_entry(CacheType::OciBlob, "ABC"),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(cache
            .get_entry(CacheType::OciBlob, &KEY.to_uppercase())
            .is_err());
        Ok(())
    }

    #[test]
    fn test_entry_lifecycle() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;

        let mut entry = cache.get_entry(CacheType::Http, KEY)?;
        assert!(!entry.exists());
        fs::write(entry.tmp_path(), b"artifact")?;
        entry.finalize()?;
        assert!(entry.exists());
        assert!(!entry.tmp_path().exists());
        assert_eq!(fs::read(entry.path())?, b"artifact");

        let again = cache.get_entry(CacheType::Http, KEY)?;
        assert!(again.exists());
        assert_eq!(again.path(), cache.type_dir(CacheType::Http).join(KEY));
        Ok(())
    }

    #[test]
    fn test_concurrent_finalize_keeps_one_entry() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || -> anyhow::Result<PathBuf> {
                    let mut entry = cache.get_entry(CacheType::OciBlob, KEY)?;
                    if !entry.exists() {
                        fs::write(entry.tmp_path(), format!("writer {i}"))?;
                        entry.finalize()?;
                    }
                    Ok(entry.tmp_path().to_path_buf())
                })
            })
            .collect();
        let mut tmp_paths = Vec::new();
        for handle in handles {
            tmp_paths.push(handle.join().unwrap()?);
        }
        tmp_paths.sort();
        tmp_paths.dedup();
        assert_eq!(tmp_paths.len(), 4);

        let names: Vec<_> = fs::read_dir(cache.type_dir(CacheType::OciBlob))?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![KEY.to_owned()]);
        Ok(())
    }

    #[test]
    fn test_clean_tmp() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;
        let entry = cache.get_entry(CacheType::Library, KEY)?;
        fs::write(entry.tmp_path(), b"partial")?;
        entry.clean_tmp()?;
        assert!(!entry.tmp_path().exists());
        // second call is a no-op
        entry.clean_tmp()?;
        Ok(())
    }

    #[test]
    fn test_orphans_reaped_on_access() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;
        let dir = cache.type_dir(CacheType::OciBlob);
        fs::create_dir_all(&dir)?;

        // pid 0x7ffffffe is never a live process
        let orphan = dir.join(format!(".{KEY}.tmp.2147483646.0"));
        let ours = dir.join(format!(".{KEY}.tmp.{}.99", std::process::id()));
        fs::write(&orphan, b"x")?;
        fs::write(&ours, b"x")?;

        cache.get_entry(CacheType::OciBlob, KEY)?;
        assert!(!orphan.exists());
        assert!(ours.exists());
        Ok(())
    }

    #[test]
    fn test_throwaway_cache() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::throwaway(tmp.path())?;
        assert!(cache.is_disabled());
        assert!(cache.root().starts_with(tmp.path()));
        cache.cleanup();
        assert!(!cache.root().exists());
        Ok(())
    }

    #[test]
    fn test_cache_type_from_str() {
        assert_eq!("oci-temp-sif".parse::<CacheType>().unwrap(), CacheType::OciTempSif);
        assert_eq!("blob".parse::<CacheType>().unwrap(), CacheType::OciBlob);
        assert!("nope".parse::<CacheType>().is_err());
    }

    #[test]
    fn test_staging_owner() {
        assert_eq!(staging_owner(&format!(".{KEY}.tmp.123.4")), Some(123));
        assert_eq!(staging_owner(KEY), None);
    }
}
