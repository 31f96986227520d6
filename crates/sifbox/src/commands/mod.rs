use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libcontainer::container::Container;
use libcontainer::instance::InstanceRegistry;
use libcontainer::utils;

pub mod build;
pub mod cache;
pub mod exec;
pub mod instance;
pub mod oci;
pub mod sign;
pub mod verify;

fn load_container(root_path: &Path, container_id: &str) -> Result<Container> {
    Container::load_by_id(root_path, container_id)
        .with_context(|| format!("could not load state for container {container_id}"))
}

/// Registry of the calling user on this host, or of `user` when given.
fn registry(subdir: &str, user: Option<&str>) -> Result<InstanceRegistry> {
    let host = utils::hostname();
    let me = utils::current_user_name();
    let registry = match user {
        Some(user) if user != me => {
            if !nix::unistd::geteuid().is_root() {
                bail!("only root can access the instances of user {user}");
            }
            InstanceRegistry::for_user(subdir, user, &host)?
        }
        _ => InstanceRegistry::new(subdir, &me, &host)?,
    };
    Ok(registry)
}

/// The running binary, re-executed for build stages, instances and monitors.
fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().context("failed to locate the sifbox binary")
}
