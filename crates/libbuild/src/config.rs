//! Build configuration: process environment read once into [`BuildEnv`] and
//! per build flags in [`BuildOptions`].
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::Uid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
    #[error("fakeroot needs user namespaces or a fakeroot helper, neither is available")]
    FakerootUnavailable,
    #[error("invalid --sections value {0:?}")]
    InvalidSections(String),
}

pub const ENV_MESSAGELEVEL: &str = "SIFBOX_MESSAGELEVEL";
pub const ENV_CACHEDIR: &str = "SIFBOX_CACHEDIR";
pub const ENV_TMPDIR: &str = "SIFBOX_TMPDIR";
pub const ENV_PULL_ARCH: &str = "SIFBOX_PULL_ARCH";
pub const ENV_FAKEROOT_PATH: &str = "SIFBOX_FAKEROOT_PATH";
pub const ENV_LIBRARY: &str = "SIFBOX_LIBRARY";
pub const ENV_DOCKER_HOST: &str = "SIFBOX_DOCKER_HOST";
pub const ENV_DISABLE_CACHE: &str = "SIFBOX_DISABLE_CACHE";
pub const ENV_ENV_PRECEDENCE: &str = "SIFBOX_ENV_PRECEDENCE";
pub const ENV_MKSQUASHFS_PROCS: &str = "SIFBOX_MKSQUASHFS_PROCS";
pub const ENV_MKSQUASHFS_MEM: &str = "SIFBOX_MKSQUASHFS_MEM";
pub const ENV_MKSQUASHFS_PATH: &str = "SIFBOX_MKSQUASHFS_PATH";

/// Which side wins when the source image config and the stage
/// `%environment` define the same variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvPrecedence {
    #[default]
    Stage,
    Image,
}

impl FromStr for EnvPrecedence {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stage" => Ok(EnvPrecedence::Stage),
            "image" => Ok(EnvPrecedence::Image),
            _ => Err(ConfigError::InvalidValue {
                var: ENV_ENV_PRECEDENCE,
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for EnvPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvPrecedence::Stage => f.write_str("stage"),
            EnvPrecedence::Image => f.write_str("image"),
        }
    }
}

/// Environment derived configuration. Read once at startup and passed down
/// explicitly so tests can construct it from a plain map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnv {
    pub message_level: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub pull_arch: Option<String>,
    pub fakeroot_path: Option<PathBuf>,
    pub library: Option<String>,
    pub docker_host: Option<String>,
    pub disable_cache: bool,
    pub env_precedence: EnvPrecedence,
    pub mksquashfs_procs: Option<u32>,
    pub mksquashfs_mem: Option<String>,
    pub mksquashfs_path: Option<PathBuf>,
    home: Option<PathBuf>,
    system_tmp: Option<PathBuf>,
}

impl BuildEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        let get = |key: &str| vars.get(key).cloned();
        let path = |key: &str| vars.get(key).map(PathBuf::from);

        let disable_cache = match get(ENV_DISABLE_CACHE) {
            None => false,
            Some(v) => parse_bool(&v).ok_or(ConfigError::InvalidValue {
                var: ENV_DISABLE_CACHE,
                value: v,
            })?,
        };
        let env_precedence = get(ENV_ENV_PRECEDENCE)
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();
        let mksquashfs_procs = get(ENV_MKSQUASHFS_PROCS)
            .map(|v| {
                v.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    var: ENV_MKSQUASHFS_PROCS,
                    value: v,
                })
            })
            .transpose()?;

        Ok(Self {
            message_level: get(ENV_MESSAGELEVEL),
            cache_dir: path(ENV_CACHEDIR),
            tmp_dir: path(ENV_TMPDIR),
            pull_arch: get(ENV_PULL_ARCH),
            fakeroot_path: path(ENV_FAKEROOT_PATH),
            library: get(ENV_LIBRARY),
            docker_host: get(ENV_DOCKER_HOST),
            disable_cache,
            env_precedence,
            mksquashfs_procs,
            mksquashfs_mem: get(ENV_MKSQUASHFS_MEM),
            mksquashfs_path: path(ENV_MKSQUASHFS_PATH),
            home: path("HOME"),
            system_tmp: path("TMPDIR"),
        })
    }

    /// Scratch directory for bundles: the override, then `$TMPDIR`, then `/tmp`.
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .or_else(|| self.system_tmp.clone())
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    pub fn cache_root(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        match &self.home {
            Some(home) => home.join(".sifbox").join("cache"),
            None => self.tmp_dir().join("sifbox-cache"),
        }
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    /// Architecture used when selecting a manifest from an image index,
    /// in OCI naming.
    pub fn pull_arch(&self) -> String {
        match &self.pull_arch {
            Some(arch) => arch.clone(),
            None => oci_arch(std::env::consts::ARCH).to_owned(),
        }
    }
}

pub fn oci_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        "arm" => "arm",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Sif,
    Sandbox,
}

/// Host sections selected with `--sections`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SectionSelection {
    #[default]
    All,
    None,
    List(Vec<String>),
}

impl SectionSelection {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            SectionSelection::All => true,
            SectionSelection::None => false,
            SectionSelection::List(names) => names.iter().any(|n| n == name),
        }
    }
}

impl FromStr for SectionSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<String> = s
            .split(',')
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(ConfigError::InvalidSections(s.to_owned()));
        }
        if names.iter().any(|n| n == "none") {
            return Ok(SectionSelection::None);
        }
        if names.iter().any(|n| n == "all") {
            return Ok(SectionSelection::All);
        }
        Ok(SectionSelection::List(names))
    }
}

/// How `%post` and `%test` gain root inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Fakeroot {
    #[default]
    Disabled,
    /// Root mapped user namespace set up by the exec entry point.
    UserNamespace,
    /// External LD_PRELOAD based helper bound into the rootfs.
    Helper(PathBuf),
}

impl Fakeroot {
    /// Picks the mechanism for a build that asked for fakeroot. User
    /// namespaces win; the helper is only used on hosts without them.
    pub fn select(requested: bool, support: FakerootSupport) -> Result<Self, ConfigError> {
        if !requested {
            return Ok(Fakeroot::Disabled);
        }
        if support.user_namespaces {
            if let Some(helper) = &support.helper {
                tracing::debug!(helper = %helper.display(), "user namespaces available, fakeroot helper unused");
            }
            return Ok(Fakeroot::UserNamespace);
        }
        match support.helper {
            Some(helper) => {
                tracing::info!("User namespaces unavailable, using fakeroot helper {}", helper.display());
                Ok(Fakeroot::Helper(helper))
            }
            None => Err(ConfigError::FakerootUnavailable),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Fakeroot::Disabled)
    }
}

const PROC_SYS: &str = "/proc/sys";

/// What the host offers for running `%post` as a fake root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakerootSupport {
    pub user_namespaces: bool,
    pub helper: Option<PathBuf>,
}

impl FakerootSupport {
    /// Inspects the running kernel. A helper given by flag or environment is
    /// preferred over a `fakeroot` found in `PATH`.
    pub fn detect(helper: Option<PathBuf>) -> Self {
        FakerootSupport {
            user_namespaces: user_namespaces_available(Path::new(PROC_SYS), Uid::effective().is_root()),
            helper: helper.or_else(|| which::which("fakeroot").ok()),
        }
    }
}

/// Kernels built without user namespaces lack `max_user_namespaces`, and
/// some distributions gate unprivileged use behind `unprivileged_userns_clone`.
fn user_namespaces_available(proc_sys: &Path, is_root: bool) -> bool {
    let read = |name: &str| {
        fs::read_to_string(proc_sys.join(name))
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if !read("user/max_user_namespaces").is_some_and(|max| max > 0) {
        return false;
    }
    is_root || read("kernel/unprivileged_userns_clone") != Some(0)
}

/// Options of one `build` invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub format: OutputFormat,
    pub force: bool,
    pub no_cleanup: bool,
    pub update: bool,
    pub notest: bool,
    pub fix_perms: bool,
    pub sections: SectionSelection,
    pub fakeroot: Fakeroot,
    pub writable_overlay_mib: Option<u64>,
    /// `src[:dst]` bind specs forwarded to `%post` and `%test`.
    pub binds: Vec<String>,
    /// Path of the running binary, re-executed for `%post` and `%test`.
    pub exe: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let env = BuildEnv::from_vars([("HOME", "/home/alice")])?;
        assert_eq!(env.tmp_dir(), PathBuf::from("/tmp"));
        assert_eq!(env.cache_root(), PathBuf::from("/home/alice/.sifbox/cache"));
        assert_eq!(env.env_precedence, EnvPrecedence::Stage);
        assert!(!env.disable_cache);
        Ok(())
    }

    #[test]
    fn test_overrides() -> anyhow::Result<()> {
        let env = BuildEnv::from_vars([
            ("TMPDIR", "/var/tmp"),
            (ENV_CACHEDIR, "/scratch/cache"),
            (ENV_PULL_ARCH, "arm64"),
            (ENV_DISABLE_CACHE, "true"),
            (ENV_ENV_PRECEDENCE, "image"),
            (ENV_MKSQUASHFS_PROCS, "4"),
            (ENV_MKSQUASHFS_MEM, "1G"),
        ])?;
        assert_eq!(env.tmp_dir(), PathBuf::from("/var/tmp"));
        assert_eq!(env.cache_root(), PathBuf::from("/scratch/cache"));
        assert_eq!(env.pull_arch(), "arm64");
        assert!(env.disable_cache);
        assert_eq!(env.env_precedence, EnvPrecedence::Image);
        assert_eq!(env.mksquashfs_procs, Some(4));

        let env = BuildEnv::from_vars([("TMPDIR", "/var/tmp"), (ENV_TMPDIR, "/fast")])?;
        assert_eq!(env.tmp_dir(), PathBuf::from("/fast"));
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            BuildEnv::from_vars([(ENV_MKSQUASHFS_PROCS, "many")]),
            Err(ConfigError::InvalidValue {
                var: ENV_MKSQUASHFS_PROCS,
                value: "many".into()
            })
        );
        assert!(BuildEnv::from_vars([(ENV_ENV_PRECEDENCE, "both")]).is_err());
        assert!(BuildEnv::from_vars([(ENV_DISABLE_CACHE, "maybe")]).is_err());
    }

    #[test]
    fn test_sections() {
        assert_eq!("all".parse(), Ok(SectionSelection::All));
        assert_eq!("post,none".parse(), Ok(SectionSelection::None));
        let list: SectionSelection = "Post, test".parse().unwrap();
        assert!(list.includes("post"));
        assert!(list.includes("test"));
        assert!(!list.includes("setup"));
        assert!(",".parse::<SectionSelection>().is_err());
    }

    #[test]
    fn test_fakeroot_prefers_user_namespaces() {
        let helper = PathBuf::from("/usr/bin/fakeroot");
        let support = FakerootSupport {
            user_namespaces: true,
            helper: Some(helper.clone()),
        };
        assert_eq!(Fakeroot::select(true, support.clone()), Ok(Fakeroot::UserNamespace));
        assert_eq!(Fakeroot::select(false, support), Ok(Fakeroot::Disabled));

        let support = FakerootSupport {
            user_namespaces: false,
            helper: Some(helper.clone()),
        };
        assert_eq!(Fakeroot::select(true, support), Ok(Fakeroot::Helper(helper)));
    }

    #[test]
    fn test_fakeroot_unavailable() {
        assert_eq!(
            Fakeroot::select(true, FakerootSupport::default()),
            Err(ConfigError::FakerootUnavailable)
        );
        assert!(!Fakeroot::select(false, FakerootSupport::default())
            .unwrap()
            .is_enabled());
    }

    #[test]
    fn test_helper_from_environment_with_fakeroot() -> anyhow::Result<()> {
        let env = BuildEnv::from_vars([(ENV_FAKEROOT_PATH, "/usr/bin/fakeroot")])?;
        let support = FakerootSupport {
            user_namespaces: false,
            helper: env.fakeroot_path.clone(),
        };
        assert_eq!(
            Fakeroot::select(true, support),
            Ok(Fakeroot::Helper(PathBuf::from("/usr/bin/fakeroot")))
        );
        Ok(())
    }

    #[test]
    fn test_user_namespaces_available() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let proc_sys = tmp.path();
        // no user namespace support compiled in
        assert!(!user_namespaces_available(proc_sys, true));

        fs::create_dir_all(proc_sys.join("user"))?;
        fs::create_dir_all(proc_sys.join("kernel"))?;
        fs::write(proc_sys.join("user/max_user_namespaces"), "0\n")?;
        assert!(!user_namespaces_available(proc_sys, true));

        fs::write(proc_sys.join("user/max_user_namespaces"), "63432\n")?;
        assert!(user_namespaces_available(proc_sys, false));

        fs::write(proc_sys.join("kernel/unprivileged_userns_clone"), "0\n")?;
        assert!(!user_namespaces_available(proc_sys, false));
        assert!(user_namespaces_available(proc_sys, true));
        Ok(())
    }

    #[test]
    fn test_oci_arch() {
        assert_eq!(oci_arch("x86_64"), "amd64");
        assert_eq!(oci_arch("aarch64"), "arm64");
        assert_eq!(oci_arch("mips"), "mips");
    }
}
