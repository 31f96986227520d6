use uuid::Uuid;

use crate::descriptor::DESCRIPTOR_LEN;
use crate::error::SifError;

pub const HEADER_LEN: usize = 128;
pub const LAUNCH_LEN: usize = 32;
pub const DEFAULT_LAUNCH: &str = "#!/usr/bin/env run-singularity\n";
pub const MAGIC: &[u8; 10] = b"SIF_MAGIC\0";
pub const VERSION: &[u8; 3] = b"02\0";
/// Default number of descriptor slots reserved at creation.
pub const DEFAULT_CAPACITY: u64 = 48;

/// Global header at offset 0 of every image.
///
/// ```text
///   0  launch line           32
///  32  magic                 10
///  42  format revision        3
///  48  uuid                  16
///  64  created               i64
///  72  modified              i64
///  80  descriptor offset     u64
///  88  descriptor capacity   u64
///  96  descriptors in use    u64
/// 104  data offset           u64
/// 112  data length           u64
/// 120  next object id        u32
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub launch: String,
    pub uuid: Uuid,
    pub created: i64,
    pub modified: i64,
    pub descriptor_offset: u64,
    pub descriptor_capacity: u64,
    pub descriptors_used: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub next_id: u32,
}

impl Header {
    pub fn new(capacity: u64, data_offset: u64, now: i64) -> Self {
        Header {
            launch: DEFAULT_LAUNCH.to_owned(),
            uuid: Uuid::new_v4(),
            created: now,
            modified: now,
            descriptor_offset: HEADER_LEN as u64,
            descriptor_capacity: capacity,
            descriptors_used: 0,
            data_offset,
            data_len: 0,
            next_id: 1,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let launch = self.launch.as_bytes();
        let n = launch.len().min(LAUNCH_LEN);
        buf[..n].copy_from_slice(&launch[..n]);
        buf[32..42].copy_from_slice(MAGIC);
        buf[42..45].copy_from_slice(VERSION);
        buf[48..64].copy_from_slice(self.uuid.as_bytes());
        buf[64..72].copy_from_slice(&self.created.to_le_bytes());
        buf[72..80].copy_from_slice(&self.modified.to_le_bytes());
        buf[80..88].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[88..96].copy_from_slice(&self.descriptor_capacity.to_le_bytes());
        buf[96..104].copy_from_slice(&self.descriptors_used.to_le_bytes());
        buf[104..112].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[112..120].copy_from_slice(&self.data_len.to_le_bytes());
        buf[120..124].copy_from_slice(&self.next_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SifError> {
        if buf.len() < HEADER_LEN {
            return Err(SifError::InvalidImage("truncated header".into()));
        }
        if &buf[32..42] != MAGIC {
            return Err(SifError::InvalidImage("bad magic".into()));
        }
        if &buf[42..45] != VERSION {
            let found = String::from_utf8_lossy(&buf[42..44]).into_owned();
            return Err(SifError::UnsupportedVersion(found));
        }

        let launch_end = buf[..LAUNCH_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(LAUNCH_LEN);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[48..64]);

        Ok(Header {
            launch: String::from_utf8_lossy(&buf[..launch_end]).into_owned(),
            uuid: Uuid::from_bytes(uuid),
            created: read_i64(buf, 64),
            modified: read_i64(buf, 72),
            descriptor_offset: read_u64(buf, 80),
            descriptor_capacity: read_u64(buf, 88),
            descriptors_used: read_u64(buf, 96),
            data_offset: read_u64(buf, 104),
            data_len: read_u64(buf, 112),
            next_id: read_u32(buf, 120),
        })
    }

    /// End of the descriptor table, `None` when the capacity does not fit.
    pub fn table_end(&self) -> Option<u64> {
        self.descriptor_capacity
            .checked_mul(DESCRIPTOR_LEN as u64)?
            .checked_add(self.descriptor_offset)
    }

    /// Checks that the table and the data region lie inside a file of
    /// `file_len` bytes, in that order.
    pub fn check_bounds(&self, file_len: u64) -> Result<(), SifError> {
        if self.descriptor_offset != HEADER_LEN as u64 {
            return Err(SifError::InvalidImage(format!(
                "unexpected descriptor table offset {}",
                self.descriptor_offset
            )));
        }
        let table_end = self.table_end().ok_or_else(|| {
            SifError::InvalidImage(format!(
                "descriptor capacity {} out of range",
                self.descriptor_capacity
            ))
        })?;
        if table_end > self.data_offset {
            return Err(SifError::InvalidImage(format!(
                "descriptor table overlaps the data region at {}",
                self.data_offset
            )));
        }
        match self.data_offset.checked_add(self.data_len) {
            Some(end) if end <= file_len => Ok(()),
            _ => Err(SifError::InvalidImage(format!(
                "data region exceeds the file length {file_len}"
            ))),
        }
    }
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header::new(DEFAULT_CAPACITY, 16384, 1_700_000_000);
        let buf = header.encode();
        assert!(buf.starts_with(b"#!/usr/bin/env run-singularity\n"));
        assert_eq!(&buf[32..41], b"SIF_MAGIC");
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Header::new(4, 4096, 0).encode();
        buf[32] = b'X';
        assert!(matches!(
            Header::decode(&buf),
            Err(SifError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_check_bounds() {
        let header = Header::new(DEFAULT_CAPACITY, 16384, 0);
        assert!(header.check_bounds(16384).is_ok());
        assert!(header.check_bounds(16383).is_err());

        let huge = Header {
            descriptor_capacity: 1 << 60,
            ..header.clone()
        };
        assert!(huge.table_end().is_none());
        assert!(matches!(
            huge.check_bounds(u64::MAX),
            Err(SifError::InvalidImage(_))
        ));

        let overlapping = Header {
            descriptor_capacity: 1024,
            ..header
        };
        assert!(matches!(
            overlapping.check_bounds(1 << 20),
            Err(SifError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_unknown_revision() {
        let mut buf = Header::new(4, 4096, 0).encode();
        buf[42..45].copy_from_slice(b"09\0");
        assert!(matches!(
            Header::decode(&buf),
            Err(SifError::UnsupportedVersion(v)) if v == "09"
        ));
    }
}
