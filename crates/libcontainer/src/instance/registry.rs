use std::ffi::OsString;
use std::fs::{self, DirBuilder};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Pid, User};

use super::{io_err, validate_name, InstanceError, InstanceFile, Result};
use crate::utils;

/// Instances started from images.
pub const APP_SUBDIR: &str = "app";
/// OCI containers created through the lifecycle commands.
pub const OCI_SUBDIR: &str = "oci";

const EXTENSION: &str = "json";

/// The records of one user's instances on one host, one JSON file each.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    /// Registry of the calling user, below `$XDG_RUNTIME_DIR/sifbox/instances`
    /// or `$HOME/.sifbox/instances`.
    pub fn new(subdir: &str, user: &str, host: &str) -> Result<Self> {
        let base = base_dir(std::env::var_os("XDG_RUNTIME_DIR"), std::env::var_os("HOME"))?;
        Ok(Self::with_base(base, subdir, user, host))
    }

    /// Registry of another user, used by root to look at their instances.
    pub fn for_user(subdir: &str, user: &str, host: &str) -> Result<Self> {
        let account = User::from_name(user)
            .ok()
            .flatten()
            .ok_or_else(|| InstanceError::NotFound(format!("user {user}")))?;
        let runtime = PathBuf::from(format!("/run/user/{}", account.uid));
        let base = if runtime.is_dir() {
            base_dir(Some(runtime.into_os_string()), None)?
        } else {
            base_dir(None, Some(account.dir.into_os_string()))?
        };
        Ok(Self::with_base(base, subdir, user, host))
    }

    pub fn with_base(base: impl Into<PathBuf>, subdir: &str, user: &str, host: &str) -> Self {
        Self {
            dir: base.into().join(subdir).join(user).join(host),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    /// Records whose name matches the glob `pattern`, sorted by name.
    /// Records of processes that are gone are removed on the way.
    pub fn list(&self, pattern: &str) -> Result<Vec<InstanceFile>> {
        let pattern =
            glob::Pattern::new(pattern).map_err(|_| InstanceError::Pattern(pattern.to_owned()))?;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.dir)(err)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err(&self.dir))?.path();
            if path.extension().map_or(true, |e| e != EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !pattern.matches(name) {
                continue;
            }
            let record = match read_record(&path) {
                Ok(record) => record,
                // removed while listing
                Err(InstanceError::Io { err, .. }) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!(%err, "skipping instance file");
                    continue;
                }
            };
            if record.pid > 0 && !utils::process_alive(Pid::from_raw(record.pid)) {
                tracing::debug!(name = %record.name, pid = record.pid, "removing stale instance");
                if let Err(err) = self.delete(&record.name) {
                    tracing::warn!(%err, "failed to remove stale instance");
                }
                continue;
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Adds a record, refusing a name that belongs to a live instance.
    pub fn create(&self, record: &InstanceFile) -> Result<()> {
        validate_name(&record.name)?;
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .map_err(io_err(&self.dir))?;

        let path = self.path(&record.name);
        match read_record(&path) {
            Ok(existing) if existing.pid <= 0 || utils::process_alive(Pid::from_raw(existing.pid)) => {
                return Err(InstanceError::Exists(record.name.clone()));
            }
            Ok(_) => {
                tracing::debug!(name = %record.name, "replacing stale instance");
                self.delete(&record.name)?;
            }
            Err(_) => {}
        }

        let data = encode(&path, record)?;
        let tmp = utils::temp_sibling(&path);
        let written = fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(&data).and_then(|_| f.sync_all()))
            .and_then(|_| fs::hard_link(&tmp, &path));
        let _ = fs::remove_file(&tmp);
        match written {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(InstanceError::Exists(record.name.clone()))
            }
            Err(err) => Err(io_err(path)(err)),
        }
    }

    /// Replaces an existing record.
    pub fn update(&self, record: &InstanceFile) -> Result<()> {
        self.get(&record.name)?;
        let path = self.path(&record.name);
        let data = encode(&path, record)?;
        utils::write_atomic(&path, &data).map_err(io_err(path))
    }

    pub fn get(&self, name: &str) -> Result<InstanceFile> {
        validate_name(name)?;
        match read_record(&self.path(name)) {
            Err(InstanceError::Io { err, .. }) if err.kind() == ErrorKind::NotFound => {
                Err(InstanceError::NotFound(name.to_owned()))
            }
            other => other,
        }
    }

    /// Removes a record together with the sockets it names.
    pub fn delete(&self, name: &str) -> Result<()> {
        let record = self.get(name)?;
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(InstanceError::NotFound(name.to_owned()))
            }
            Err(err) => return Err(io_err(path)(err)),
        }
        let sockets = [
            Some(&record.start_socket),
            record.attach_socket.as_ref(),
            record.control_socket.as_ref(),
        ];
        for socket in sockets.into_iter().flatten() {
            if socket.as_os_str().is_empty() {
                continue;
            }
            if let Err(err) = fs::remove_file(socket) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(%err, ?socket, "failed to remove instance socket");
                }
            }
        }
        Ok(())
    }
}

fn base_dir(xdg_runtime_dir: Option<OsString>, home: Option<OsString>) -> Result<PathBuf> {
    match (xdg_runtime_dir, home) {
        (Some(xdg), _) if !xdg.is_empty() => Ok(PathBuf::from(xdg).join("sifbox/instances")),
        (_, Some(home)) if !home.is_empty() => Ok(PathBuf::from(home).join(".sifbox/instances")),
        _ => Err(InstanceError::NoBaseDir),
    }
}

fn read_record(path: &Path) -> Result<InstanceFile> {
    let data = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&data).map_err(|err| InstanceError::Json {
        path: path.to_owned(),
        err,
    })
}

fn encode(path: &Path, record: &InstanceFile) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|err| InstanceError::Json {
        path: path.to_owned(),
        err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn registry(dir: &Path) -> InstanceRegistry {
        InstanceRegistry::with_base(dir, APP_SUBDIR, "alice", "node1")
    }

    fn record(name: &str, pid: i32) -> InstanceFile {
        InstanceFile {
            name: name.to_owned(),
            pid,
            image: "/images/web.sif".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_dir() -> Result<()> {
        assert_eq!(
            base_dir(Some("/run/user/1000".into()), Some("/home/alice".into()))?,
            PathBuf::from("/run/user/1000/sifbox/instances")
        );
        assert_eq!(
            base_dir(Some("".into()), Some("/home/alice".into()))?,
            PathBuf::from("/home/alice/.sifbox/instances")
        );
        assert!(matches!(base_dir(None, None), Err(InstanceError::NoBaseDir)));
        Ok(())
    }

    #[test]
    fn test_layout() {
        let registry = InstanceRegistry::with_base("/run/user/1000/sifbox/instances", OCI_SUBDIR, "alice", "node1");
        assert_eq!(
            registry.path("web"),
            PathBuf::from("/run/user/1000/sifbox/instances/oci/alice/node1/web.json")
        );
    }

    #[test]
    fn test_create_refuses_live_duplicate() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = registry(tmp.path());
        let me = std::process::id() as i32;
        registry.create(&record("web", me))?;
        assert!(matches!(
            registry.create(&record("web", me)),
            Err(InstanceError::Exists(_))
        ));
        assert_eq!(registry.get("web")?.pid, me);
        Ok(())
    }

    #[test]
    fn test_create_replaces_stale_record() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = registry(tmp.path());
        registry.create(&record("web", i32::MAX))?;
        let me = std::process::id() as i32;
        registry.create(&record("web", me))?;
        assert_eq!(registry.get("web")?.pid, me);
        Ok(())
    }

    #[test]
    fn test_list_sorts_filters_and_reaps() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = registry(tmp.path());
        let me = std::process::id() as i32;
        for name in ["web2", "db", "web1"] {
            registry.create(&record(name, me))?;
        }
        registry.create(&record("webdead", i32::MAX))?;

        let names: Vec<String> = registry.list("*")?.into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["db", "web1", "web2"]);
        assert!(matches!(registry.get("webdead"), Err(InstanceError::NotFound(_))));

        let names: Vec<String> = registry.list("web*")?.into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["web1", "web2"]);
        assert!(matches!(registry.list("[a"), Err(InstanceError::Pattern(_))));
        Ok(())
    }

    #[test]
    fn test_list_missing_dir() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(registry(&tmp.path().join("nothing")).list("*")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_and_delete() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = registry(tmp.path());
        let socket = tmp.path().join("web.sock");
        fs::write(&socket, "")?;
        let mut web = record("web", 0);
        web.start_socket = socket.clone();
        registry.create(&web)?;

        web.pid = std::process::id() as i32;
        registry.update(&web)?;
        assert_eq!(registry.get("web")?, web);
        assert!(matches!(
            registry.update(&record("other", 1)),
            Err(InstanceError::NotFound(_))
        ));

        registry.delete("web")?;
        assert!(!socket.exists());
        assert!(matches!(registry.delete("web"), Err(InstanceError::NotFound(_))));
        Ok(())
    }
}
