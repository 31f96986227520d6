pub mod config;
pub mod container;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod namespaces;
pub mod rootfs;
pub mod rootfs_exec;
pub mod signal;
pub mod start_socket;
pub mod stats;
pub mod utils;
