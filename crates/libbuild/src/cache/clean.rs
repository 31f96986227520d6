use std::fs;
use std::io;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::{CacheError, CacheType, ImageCache, WrapCacheIo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryInfo {
    #[serde(rename = "type")]
    pub ty: String,
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeTotal {
    #[serde(rename = "type")]
    pub ty: String,
    pub count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheListing {
    pub entries: Vec<CacheEntryInfo>,
    pub totals: Vec<TypeTotal>,
}

impl CacheListing {
    pub fn total_size(&self) -> u64 {
        self.totals.iter().map(|t| t.size).sum()
    }
}

impl ImageCache {
    /// Finalized artifacts of the requested types; every type when empty.
    pub fn list(&self, types: &[CacheType]) -> Result<CacheListing, CacheError> {
        let types = if types.is_empty() {
            &CacheType::ALL[..]
        } else {
            types
        };

        let mut listing = CacheListing::default();
        for ty in types {
            let mut total = TypeTotal {
                ty: ty.to_string(),
                ..Default::default()
            };
            for entry in self.entries(*ty)? {
                total.count += 1;
                total.size += entry.size;
                listing.entries.push(entry);
            }
            listing.totals.push(total);
        }
        Ok(listing)
    }

    /// Deletes artifacts older than `older_than_days` (all of them when
    /// `None`). Returns what was, or with `dry_run` would be, removed.
    pub fn clean(
        &self,
        types: &[CacheType],
        older_than_days: Option<u64>,
        dry_run: bool,
    ) -> Result<Vec<CacheEntryInfo>, CacheError> {
        let cutoff = older_than_days
            .map(|days| SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60))
            .map(DateTime::<Local>::from);

        let listing = self.list(types)?;
        let mut removed = Vec::new();
        for entry in listing.entries {
            if matches!(cutoff, Some(cutoff) if entry.modified > cutoff) {
                continue;
            }
            let ty: CacheType = entry.ty.parse()?;
            let path = self.type_dir(ty).join(&entry.key);
            if dry_run {
                tracing::info!("would remove {}", path.display());
            } else {
                tracing::debug!("removing {}", path.display());
                match fs::remove_file(&path) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => {
                        return Err(err).wrap_path(&path)
                    }
                    _ => {}
                }
            }
            removed.push(entry);
        }
        Ok(removed)
    }

    fn entries(&self, ty: CacheType) -> Result<Vec<CacheEntryInfo>, CacheError> {
        let dir = self.type_dir(ty);
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).wrap_path(&dir),
        };
        super::reap_orphans(&dir);

        let mut entries = Vec::new();
        for dirent in read_dir {
            let dirent = dirent.wrap_path(&dir)?;
            let key = dirent.file_name().to_string_lossy().into_owned();
            if key.starts_with('.') {
                continue;
            }
            let meta = match dirent.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            entries.push(CacheEntryInfo {
                ty: ty.to_string(),
                key,
                size: meta.len(),
                modified: meta
                    .modified()
                    .map(DateTime::<Local>::from)
                    .unwrap_or_else(|_| Local::now()),
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::KEY;

    const OTHER: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    fn populate(cache: &ImageCache, ty: CacheType, key: &str, content: &[u8]) -> anyhow::Result<()> {
        let mut entry = cache.get_entry(ty, key)?;
        fs::write(entry.tmp_path(), content)?;
        entry.finalize()?;
        Ok(())
    }

    #[test]
    fn test_list_totals() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;
        populate(&cache, CacheType::OciBlob, KEY, b"12345")?;
        populate(&cache, CacheType::OciBlob, OTHER, b"123")?;
        populate(&cache, CacheType::Http, KEY, b"1")?;
        // staging files are not listed
        let staging = cache.get_entry(CacheType::Http, OTHER)?;
        fs::write(staging.tmp_path(), b"partial")?;

        let listing = cache.list(&[])?;
        assert_eq!(listing.entries.len(), 3);
        assert_eq!(listing.total_size(), 9);
        let blobs = listing
            .totals
            .iter()
            .find(|t| t.ty == "oci-blob")
            .unwrap();
        assert_eq!((blobs.count, blobs.size), (2, 8));

        let only_http = cache.list(&[CacheType::Http])?;
        assert_eq!(only_http.entries.len(), 1);
        assert_eq!(only_http.totals.len(), 1);
        Ok(())
    }

    #[test]
    fn test_clean_dry_run_and_age() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = ImageCache::new(tmp.path())?;
        populate(&cache, CacheType::Library, KEY, b"x")?;

        let would = cache.clean(&[], None, true)?;
        assert_eq!(would.len(), 1);
        assert!(cache.type_dir(CacheType::Library).join(KEY).exists());

        // fresh entries survive an age threshold
        assert!(cache.clean(&[], Some(30), false)?.is_empty());

        let removed = cache.clean(&[CacheType::Library], None, false)?;
        assert_eq!(removed[0].key, KEY);
        assert!(cache.list(&[])?.entries.is_empty());
        Ok(())
    }
}
