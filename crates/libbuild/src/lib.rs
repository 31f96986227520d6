//! The build pipeline: recipes are parsed and expanded, every stage gets a
//! scratch bundle filled by its source conveyor, the stage sections run and
//! the final rootfs is assembled into an image file or sandbox directory.
pub mod args;
pub mod assemble;
pub mod build;
pub mod bundle;
pub mod cache;
pub mod cancel;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod definition;
pub mod error;
pub mod fsutil;
pub mod mountinfo;
pub mod retry;
pub mod sources;
pub mod squashfs;
pub mod stage;

pub use build::{build, BuildSpec};
pub use error::{BuildError, ErrorKind};
