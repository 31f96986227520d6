//! Applies image layer tarballs to a rootfs.
//!
//! Whiteouts are honored before a layer's content is unpacked: `.wh.<name>`
//! removes `<name>` from lower layers and `.wh..wh..opq` empties its
//! directory.
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("failed to read layer {path}: {err}")]
    Read { path: PathBuf, err: io::Error },
    #[error("layer entry {0:?} escapes the root filesystem")]
    UnsafePath(PathBuf),
    #[error("failed to unpack {entry:?} from layer: {err}")]
    Unpack { entry: PathBuf, err: io::Error },
    #[error("failed to apply whiteout {path}: {err}")]
    Whiteout { path: PathBuf, err: io::Error },
    #[error("layer {0} uses an unsupported compression")]
    UnsupportedCompression(PathBuf),
}

enum Compression {
    None,
    Gzip,
}

fn detect(path: &Path) -> Result<Compression, LayerError> {
    let read_err = |err| LayerError::Read {
        path: path.to_path_buf(),
        err,
    };
    let mut magic = [0u8; 4];
    let n = File::open(path)
        .and_then(|mut f| f.read(&mut magic))
        .map_err(read_err)?;
    match &magic[..n] {
        [0x1f, 0x8b, ..] => Ok(Compression::Gzip),
        [0x28, 0xb5, 0x2f, 0xfd] => Err(LayerError::UnsupportedCompression(path.to_path_buf())),
        _ => Ok(Compression::None),
    }
}

fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>, LayerError> {
    let compression = detect(path)?;
    let file = File::open(path).map_err(|err| LayerError::Read {
        path: path.to_path_buf(),
        err,
    })?;
    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(file))),
        Compression::None => Box::new(BufReader::new(file)),
    };
    Ok(Archive::new(reader))
}

/// Normalizes a tar entry path to a relative path without `..`.
fn entry_path(raw: &Path) -> Result<PathBuf, LayerError> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(LayerError::UnsafePath(raw.to_path_buf()))
            }
        }
    }
    Ok(out)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Resolves `rel` inside `rootfs` without following links out of it.
fn scoped(rootfs: &Path, rel: &Path) -> Result<PathBuf, LayerError> {
    safe_path::scoped_join(rootfs, rel).map_err(|_| LayerError::UnsafePath(rel.to_path_buf()))
}

fn apply_whiteouts(layer: &Path, rootfs: &Path) -> Result<(), LayerError> {
    let mut archive = open_archive(layer)?;
    let read_err = |err| LayerError::Read {
        path: layer.to_path_buf(),
        err,
    };
    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let raw = entry.path().map_err(read_err)?.into_owned();
        let rel = entry_path(&raw)?;
        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let parent = rel.parent().unwrap_or(Path::new(""));
        if name == WHITEOUT_OPAQUE {
            let dir = scoped(rootfs, parent)?;
            tracing::trace!(dir = ?dir, "opaque whiteout");
            clear_dir(&dir).map_err(|err| LayerError::Whiteout { path: dir, err })?;
        } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let path = scoped(rootfs, &parent.join(target))?;
            tracing::trace!(path = ?path, "whiteout");
            remove_path(&path).map_err(|err| LayerError::Whiteout { path, err })?;
        }
    }
    Ok(())
}

/// Applies one layer on top of `rootfs`.
#[tracing::instrument(level = "debug", skip(rootfs))]
pub fn extract_layer(layer: &Path, rootfs: &Path) -> Result<(), LayerError> {
    apply_whiteouts(layer, rootfs)?;

    let mut archive = open_archive(layer)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);
    let read_err = |err| LayerError::Read {
        path: layer.to_path_buf(),
        err,
    };
    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let raw = entry.path().map_err(read_err)?.into_owned();
        let rel = entry_path(&raw)?;
        let is_whiteout = rel
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(WHITEOUT_PREFIX));
        if is_whiteout || rel.as_os_str().is_empty() {
            continue;
        }
        if matches!(
            entry.header().entry_type(),
            EntryType::Block | EntryType::Char
        ) {
            tracing::trace!(entry = ?rel, "skipping device node");
            continue;
        }

        // replacing a directory with a non-directory needs the old one gone
        let target = scoped(rootfs, &rel)?;
        if entry.header().entry_type() != EntryType::Directory {
            if let Ok(meta) = fs::symlink_metadata(&target) {
                if meta.is_dir() {
                    fs::remove_dir_all(&target).map_err(|err| LayerError::Unpack {
                        entry: rel.clone(),
                        err,
                    })?;
                }
            }
        }
        // unpack_in refuses entries whose parents resolve outside rootfs
        match entry.unpack_in(rootfs) {
            Ok(true) => {}
            Ok(false) => return Err(LayerError::UnsafePath(raw)),
            Err(err) => return Err(LayerError::Unpack { entry: rel, err }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use tar::{Builder, Header};

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
    }

    fn write_layer(path: &Path, items: &[Item], gzip: bool) -> anyhow::Result<()> {
        let mut data = Vec::new();
        {
            let mut builder = Builder::new(&mut data);
            for item in items {
                let mut header = Header::new_gnu();
                match item {
                    Item::File(name, content) => {
                        header.set_entry_type(EntryType::Regular);
                        header.set_size(content.len() as u64);
                        header.set_mode(0o644);
                        header.set_cksum();
                        builder.append_data(&mut header, name, *content)?;
                    }
                    Item::Dir(name) => {
                        header.set_entry_type(EntryType::Directory);
                        header.set_size(0);
                        header.set_mode(0o755);
                        header.set_cksum();
                        builder.append_data(&mut header, name, io::empty())?;
                    }
                }
            }
            builder.finish()?;
        }
        if gzip {
            let mut enc = GzEncoder::new(File::create(path)?, flate2::Compression::fast());
            io::Write::write_all(&mut enc, &data)?;
            enc.finish()?;
        } else {
            fs::write(path, data)?;
        }
        Ok(())
    }

    #[test]
    fn test_layers_with_whiteouts() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir(&rootfs)?;

        let base = tmp.path().join("base.tar.gz");
        write_layer(
            &base,
            &[
                Item::Dir("etc/"),
                Item::File("etc/motd", b"hello"),
                Item::File("etc/passwd", b"root:x:0:0"),
                Item::Dir("opt/app/"),
                Item::File("opt/app/old", b"old"),
            ],
            true,
        )?;
        let top = tmp.path().join("top.tar");
        write_layer(
            &top,
            &[
                Item::File("etc/.wh.motd", b""),
                Item::Dir("opt/app/"),
                Item::File("opt/app/.wh..wh..opq", b""),
                Item::File("opt/app/new", b"new"),
            ],
            false,
        )?;

        extract_layer(&base, &rootfs)?;
        assert_eq!(fs::read(rootfs.join("etc/motd"))?, b"hello");
        extract_layer(&top, &rootfs)?;

        assert!(!rootfs.join("etc/motd").exists());
        assert!(rootfs.join("etc/passwd").exists());
        assert!(!rootfs.join("opt/app/old").exists());
        assert_eq!(fs::read(rootfs.join("opt/app/new"))?, b"new");
        assert!(!rootfs.join("opt/app/.wh..wh..opq").exists());
        Ok(())
    }

    #[test]
    fn test_entry_path_rejects_parent() {
        assert!(entry_path(Path::new("../etc/shadow")).is_err());
        assert_eq!(
            entry_path(Path::new("/./usr/bin")).unwrap(),
            PathBuf::from("usr/bin")
        );
    }

    #[test]
    fn test_whiteout_cannot_escape() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir(&rootfs)?;
        fs::write(tmp.path().join("outside"), b"keep")?;
        std::os::unix::fs::symlink("/", rootfs.join("escape"))?;

        let layer = tmp.path().join("evil.tar");
        write_layer(&layer, &[Item::File("escape/.wh.outside", b"")], false)?;
        extract_layer(&layer, &rootfs)?;
        assert!(tmp.path().join("outside").exists());
        Ok(())
    }
}
