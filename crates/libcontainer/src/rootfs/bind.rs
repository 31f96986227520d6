use std::path::{Path, PathBuf};

use super::{bind_mount, join_in_root, Result, RootfsError};

/// One `-B src[:dst[:ro|rw]]` entry. Without a destination the source path
/// is reused inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPath {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub readonly: bool,
}

impl BindPath {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || RootfsError::InvalidBind(spec.to_owned());
        let mut parts = spec.split(':');
        let source = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let destination = parts.next().filter(|s| !s.is_empty()).unwrap_or(source);
        let readonly = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(invalid()),
        };
        if parts.next().is_some() || !Path::new(destination).is_absolute() {
            return Err(invalid());
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            readonly,
        })
    }

    /// Parses a comma separated list, as accepted by one `-B` flag.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn mount(&self, rootfs: &Path) -> Result<()> {
        let target = join_in_root(rootfs, &self.destination)?;
        bind_mount(&self.source, &target, self.readonly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_path() {
        assert_eq!(
            BindPath::parse("/data:/mnt").unwrap(),
            BindPath {
                source: PathBuf::from("/data"),
                destination: PathBuf::from("/mnt"),
                readonly: false,
            }
        );
        let same = BindPath::parse("/usr/lib/libfakeroot/").unwrap();
        assert_eq!(same.source, same.destination);
        assert!(BindPath::parse("/opt:/opt:ro").unwrap().readonly);
        assert!(BindPath::parse("/opt:relative").is_err());
        assert!(BindPath::parse("/opt:/opt:rx").is_err());
        assert!(BindPath::parse("").is_err());
    }

    #[test]
    fn test_parse_bind_list() {
        let binds = BindPath::parse_list(
            "/opt/fakeroot/bin/fakeroot-sysv:/usr/bin/fakeroot,/usr/lib/libfakeroot/",
        )
        .unwrap();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].destination, PathBuf::from("/usr/bin/fakeroot"));
        assert_eq!(binds[1].destination, PathBuf::from("/usr/lib/libfakeroot/"));
    }
}
