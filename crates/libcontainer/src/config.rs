use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oci_spec::runtime::{Hooks, Spec};
use serde::{Deserialize, Serialize};

use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to save engine config to {path}: {err}")]
    Save {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to load engine config from {path}: {err}")]
    Load {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("malformed engine config {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Engine side settings of one container, kept next to its state so later
/// commands do not need the bundle any more.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub hooks: Option<Hooks>,
    /// Cgroup path relative to the hierarchy root, none when the container
    /// runs without resource control.
    pub cgroup_path: Option<PathBuf>,
    /// Seconds `delete` waits after SIGTERM before giving up on a created
    /// container.
    pub kill_timeout: u64,
}

impl EngineConfig {
    const FILE: &'static str = "engine.json";
    pub const DEFAULT_KILL_TIMEOUT: u64 = 2;

    pub fn from_spec(spec: &Spec, container_id: &str, with_cgroup: bool) -> Self {
        let cgroup_path = with_cgroup.then(|| {
            spec.linux()
                .as_ref()
                .and_then(|l| l.cgroups_path().clone())
                .unwrap_or_else(|| PathBuf::from(format!("sifbox/{container_id}")))
        });
        EngineConfig {
            hooks: spec.hooks().clone(),
            cgroup_path,
            kill_timeout: Self::DEFAULT_KILL_TIMEOUT,
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout)
    }

    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::FILE)
    }

    pub fn save(&self, container_root: &Path) -> Result<()> {
        let path = Self::file_path(container_root);
        let data = serde_json::to_vec(self).map_err(|err| ConfigError::Parse {
            path: path.clone(),
            err,
        })?;
        utils::write_atomic(&path, &data).map_err(|err| ConfigError::Save { path, err })
    }

    pub fn load(container_root: &Path) -> Result<Self> {
        let path = Self::file_path(container_root);
        let data = fs::read(&path).map_err(|err| ConfigError::Load {
            path: path.clone(),
            err,
        })?;
        serde_json::from_slice(&data).map_err(|err| ConfigError::Parse { path, err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use oci_spec::runtime::{HookBuilder, HooksBuilder, LinuxBuilder, SpecBuilder};

    #[test]
    fn test_engine_config_from_spec() -> Result<()> {
        let hook = HookBuilder::default().path("/bin/true").build()?;
        let spec = SpecBuilder::default()
            .hooks(HooksBuilder::default().poststop(vec![hook]).build()?)
            .linux(LinuxBuilder::default().cgroups_path("/custom/path").build()?)
            .build()?;
        let config = EngineConfig::from_spec(&spec, "abc", true);
        assert_eq!(config.cgroup_path, Some(PathBuf::from("/custom/path")));
        assert_eq!(config.hooks.and_then(|h| h.poststop().clone()).map(|p| p.len()), Some(1));

        let spec = SpecBuilder::default().linux(LinuxBuilder::default().build()?).build()?;
        assert_eq!(
            EngineConfig::from_spec(&spec, "abc", true).cgroup_path,
            Some(PathBuf::from("sifbox/abc"))
        );
        assert_eq!(EngineConfig::from_spec(&spec, "abc", false).cgroup_path, None);
        Ok(())
    }

    #[test]
    fn test_engine_config_save_and_load() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = EngineConfig {
            hooks: None,
            cgroup_path: Some(PathBuf::from("sifbox/one")),
            kill_timeout: 5,
        };
        config.save(tmp.path())?;
        assert_eq!(EngineConfig::load(tmp.path())?, config);
        assert!(matches!(
            EngineConfig::load(&tmp.path().join("missing")),
            Err(ConfigError::Load { .. })
        ));
        Ok(())
    }
}
