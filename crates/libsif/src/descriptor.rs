use std::fmt;

use crate::error::SifError;
use crate::header::{read_i64, read_u32, read_u64};

pub const DESCRIPTOR_LEN: usize = 256;
pub const NAME_LEN: usize = 128;
pub const FINGERPRINT_LEN: usize = 20;

const FLAG_USED: u32 = 1;
const FLAG_LINK_GROUP: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Deffile,
    Labels,
    Partition,
    Signature,
    GenericJson,
}

impl DataType {
    fn code(self) -> u32 {
        match self {
            DataType::Deffile => 0x4001,
            DataType::Labels => 0x4003,
            DataType::Partition => 0x4004,
            DataType::Signature => 0x4005,
            DataType::GenericJson => 0x4006,
        }
    }

    fn from_code(code: u32) -> Result<Self, SifError> {
        Ok(match code {
            0x4001 => DataType::Deffile,
            0x4003 => DataType::Labels,
            0x4004 => DataType::Partition,
            0x4005 => DataType::Signature,
            0x4006 => DataType::GenericJson,
            other => {
                return Err(SifError::InvalidImage(format!(
                    "unknown descriptor type {other:#x}"
                )))
            }
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Deffile => "Def.FILE",
            DataType::Labels => "JSON.Labels",
            DataType::Partition => "FS",
            DataType::Signature => "Signature",
            DataType::GenericJson => "JSON.Generic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
    Squashfs,
    Ext3,
    EncryptedSquashfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartType {
    Primary,
    Overlay,
    System,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Arch(pub String);

impl Arch {
    /// Architecture of the running host in image naming (amd64, arm64, ...).
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Arch(arch.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFormat {
    Armored,
    Dsse,
    /// Per-partition signature over payload bytes only. Read-only.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extra {
    None,
    Partition {
        fs_type: FsType,
        part_type: PartType,
        arch: Arch,
    },
    Signature {
        format: SignatureFormat,
        fingerprint: [u8; FINGERPRINT_LEN],
    },
}

/// One record of the descriptor table.
///
/// `link` points either to an object or, when `link_is_group` is set, to a
/// whole group. Signatures use it to name what they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub data_type: DataType,
    pub id: u32,
    pub group: u32,
    pub link: u32,
    pub link_is_group: bool,
    pub offset: u64,
    pub size: u64,
    pub created: i64,
    pub modified: i64,
    pub name: String,
    pub extra: Extra,
}

impl Descriptor {
    pub fn partition(&self) -> Option<(FsType, PartType, &Arch)> {
        match &self.extra {
            Extra::Partition {
                fs_type,
                part_type,
                arch,
            } => Some((*fs_type, *part_type, arch)),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<(SignatureFormat, [u8; FINGERPRINT_LEN])> {
        match &self.extra {
            Extra::Signature {
                format,
                fingerprint,
            } => Some((*format, *fingerprint)),
            _ => None,
        }
    }

    pub fn is_overlay(&self) -> bool {
        matches!(
            self.partition(),
            Some((FsType::Ext3, PartType::Overlay, _))
        )
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        let mut flags = FLAG_USED;
        if self.link_is_group {
            flags |= FLAG_LINK_GROUP;
        }

        buf[0..4].copy_from_slice(&self.data_type.code().to_le_bytes());
        buf[4..8].copy_from_slice(&flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.group.to_le_bytes());
        buf[16..20].copy_from_slice(&self.link.to_le_bytes());
        buf[24..32].copy_from_slice(&self.offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.created.to_le_bytes());
        buf[48..56].copy_from_slice(&self.modified.to_le_bytes());

        let name = self.name.as_bytes();
        let n = name.len().min(NAME_LEN - 1);
        buf[56..56 + n].copy_from_slice(&name[..n]);

        match &self.extra {
            Extra::None => {}
            Extra::Partition {
                fs_type,
                part_type,
                arch,
            } => {
                let fs: u32 = match fs_type {
                    FsType::Squashfs => 1,
                    FsType::Ext3 => 2,
                    FsType::EncryptedSquashfs => 5,
                };
                let part: u32 = match part_type {
                    PartType::System => 1,
                    PartType::Primary => 2,
                    PartType::Data => 3,
                    PartType::Overlay => 4,
                };
                buf[184..188].copy_from_slice(&fs.to_le_bytes());
                buf[188..192].copy_from_slice(&part.to_le_bytes());
                let arch = arch.0.as_bytes();
                let n = arch.len().min(7);
                buf[192..192 + n].copy_from_slice(&arch[..n]);
            }
            Extra::Signature {
                format,
                fingerprint,
            } => {
                let code: u32 = match format {
                    SignatureFormat::Armored => 1,
                    SignatureFormat::Dsse => 2,
                    SignatureFormat::Legacy => 3,
                };
                // hash type, always SHA-256
                buf[184..188].copy_from_slice(&1u32.to_le_bytes());
                buf[188..192].copy_from_slice(&code.to_le_bytes());
                buf[192..192 + FINGERPRINT_LEN].copy_from_slice(fingerprint);
            }
        }

        buf
    }

    /// Returns `None` for an unused slot.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, SifError> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(SifError::InvalidImage("truncated descriptor".into()));
        }
        let flags = read_u32(buf, 4);
        if flags & FLAG_USED == 0 {
            return Ok(None);
        }

        let data_type = DataType::from_code(read_u32(buf, 0))?;
        let name_end = buf[56..56 + NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&buf[56..56 + name_end]).into_owned();

        let extra = match data_type {
            DataType::Partition => {
                let fs_type = match read_u32(buf, 184) {
                    1 => FsType::Squashfs,
                    2 => FsType::Ext3,
                    5 => FsType::EncryptedSquashfs,
                    other => {
                        return Err(SifError::InvalidImage(format!("unknown fs type {other}")))
                    }
                };
                let part_type = match read_u32(buf, 188) {
                    1 => PartType::System,
                    2 => PartType::Primary,
                    3 => PartType::Data,
                    4 => PartType::Overlay,
                    other => {
                        return Err(SifError::InvalidImage(format!(
                            "unknown partition type {other}"
                        )))
                    }
                };
                let arch_end = buf[192..200].iter().position(|b| *b == 0).unwrap_or(8);
                Extra::Partition {
                    fs_type,
                    part_type,
                    arch: Arch(String::from_utf8_lossy(&buf[192..192 + arch_end]).into_owned()),
                }
            }
            DataType::Signature => {
                let format = match read_u32(buf, 188) {
                    1 => SignatureFormat::Armored,
                    2 => SignatureFormat::Dsse,
                    3 => SignatureFormat::Legacy,
                    other => {
                        return Err(SifError::InvalidImage(format!(
                            "unknown signature format {other}"
                        )))
                    }
                };
                let mut fingerprint = [0u8; FINGERPRINT_LEN];
                fingerprint.copy_from_slice(&buf[192..192 + FINGERPRINT_LEN]);
                Extra::Signature {
                    format,
                    fingerprint,
                }
            }
            _ => Extra::None,
        };

        Ok(Some(Descriptor {
            data_type,
            id: read_u32(buf, 8),
            group: read_u32(buf, 12),
            link: read_u32(buf, 16),
            link_is_group: flags & FLAG_LINK_GROUP != 0,
            offset: read_u64(buf, 24),
            size: read_u64(buf, 32),
            created: read_i64(buf, 40),
            modified: read_i64(buf, 48),
            name,
            extra,
        }))
    }

    /// Descriptor bytes covered by a signature. Placement and timestamps are
    /// left out so the record can be moved without invalidating signatures.
    pub fn canonical_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut canonical = self.clone();
        canonical.offset = 0;
        canonical.created = 0;
        canonical.modified = 0;
        canonical.encode()
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsType::Squashfs => "Squashfs",
            FsType::Ext3 => "Ext3",
            FsType::EncryptedSquashfs => "Encrypted squashfs",
        })
    }
}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartType::Primary => "Primary",
            PartType::Overlay => "Overlay",
            PartType::System => "System",
            PartType::Data => "Data",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Descriptor {
        Descriptor {
            data_type: DataType::Partition,
            id: 1,
            group: 1,
            link: 0,
            link_is_group: false,
            offset: 8192,
            size: 4096,
            created: 10,
            modified: 10,
            name: "rootfs".into(),
            extra: Extra::Partition {
                fs_type: FsType::Squashfs,
                part_type: PartType::Primary,
                arch: Arch("amd64".into()),
            },
        }
    }

    #[test]
    fn test_partition_descriptor_decodes_back() {
        let desc = partition();
        let decoded = Descriptor::decode(&desc.encode()).unwrap().unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn test_signature_descriptor_keeps_link_kind() {
        let desc = Descriptor {
            data_type: DataType::Signature,
            id: 4,
            group: 0,
            link: 1,
            link_is_group: true,
            offset: 0,
            size: 100,
            created: 0,
            modified: 0,
            name: String::new(),
            extra: Extra::Signature {
                format: SignatureFormat::Dsse,
                fingerprint: [0xab; FINGERPRINT_LEN],
            },
        };
        let decoded = Descriptor::decode(&desc.encode()).unwrap().unwrap();
        assert!(decoded.link_is_group);
        assert_eq!(
            decoded.signature(),
            Some((SignatureFormat::Dsse, [0xab; FINGERPRINT_LEN]))
        );
    }

    #[test]
    fn test_unused_slot() {
        assert_eq!(Descriptor::decode(&[0u8; DESCRIPTOR_LEN]).unwrap(), None);
    }

    #[test]
    fn test_canonical_bytes_ignore_placement() {
        let a = partition();
        let mut b = partition();
        b.offset = 1 << 20;
        b.modified = 99;
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());

        b.size += 1;
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }
}
