//! The single-file image container: a fixed header, a table of descriptors
//! and a data region holding partitions, metadata and signatures.
pub mod descriptor;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod header;
pub mod image;
pub mod key;
pub mod keyring;
pub mod openpgp;
pub mod sign;
pub mod verify;

pub use descriptor::{Arch, DataType, Descriptor, FsType, PartType};
pub use error::SifError;
pub use image::{DescriptorInput, Image, LoadMode};

/// Group every object created by the build pipeline belongs to.
pub const DEFAULT_GROUP: u32 = 1;
