use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::descriptor::{
    Arch, DataType, Descriptor, Extra, FsType, PartType, SignatureFormat, DESCRIPTOR_LEN,
    FINGERPRINT_LEN,
};
use crate::error::SifError;
use crate::header::{Header, DEFAULT_CAPACITY, HEADER_LEN};
use crate::DEFAULT_GROUP;

const PARTITION_ALIGN: u64 = 4096;
const DATA_ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    ReadOnly,
    ReadWrite,
}

/// Everything needed to append one object to an image.
pub struct DescriptorInput<'a> {
    data_type: DataType,
    group: u32,
    link: u32,
    link_is_group: bool,
    name: String,
    extra: Extra,
    reader: Box<dyn Read + 'a>,
}

impl<'a> DescriptorInput<'a> {
    pub fn new<R: Read + 'a>(data_type: DataType, reader: R) -> Self {
        DescriptorInput {
            data_type,
            group: DEFAULT_GROUP,
            link: 0,
            link_is_group: false,
            name: String::new(),
            extra: Extra::None,
            reader: Box::new(reader),
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Group 0 means the object belongs to no group.
    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    pub fn link_object(mut self, id: u32) -> Self {
        self.link = id;
        self.link_is_group = false;
        self
    }

    pub fn link_group(mut self, group: u32) -> Self {
        self.link = group;
        self.link_is_group = true;
        self
    }

    pub fn partition(mut self, fs_type: FsType, part_type: PartType, arch: Arch) -> Self {
        self.extra = Extra::Partition {
            fs_type,
            part_type,
            arch,
        };
        self
    }

    pub fn signature(mut self, format: SignatureFormat, fingerprint: [u8; FINGERPRINT_LEN]) -> Self {
        self.extra = Extra::Signature {
            format,
            fingerprint,
        };
        self
    }
}

/// An image file opened for reading or for appending objects.
pub struct Image {
    path: PathBuf,
    file: File,
    header: Header,
    slots: Vec<Option<Descriptor>>,
    mode: LoadMode,
}

impl Image {
    /// Creates an empty image, replacing any file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SifError> {
        Self::create_with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Creates an empty image, failing when `path` already exists.
    pub fn create_new<P: AsRef<Path>>(path: P) -> Result<Self, SifError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        Self::create_from(path.as_ref(), &options, DEFAULT_CAPACITY)
    }

    pub fn create_with_capacity<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self, SifError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        Self::create_from(path.as_ref(), &options, capacity)
    }

    fn create_from(path: &Path, options: &OpenOptions, capacity: u64) -> Result<Self, SifError> {
        let file = options
            .open(path)
            .map_err(|err| SifError::Create {
                path: path.to_path_buf(),
                err,
            })?;

        let mut header = Header::new(capacity, 0, now());
        let table_end = header.table_end().ok_or_else(|| {
            SifError::InvalidImage(format!("descriptor capacity {capacity} out of range"))
        })?;
        header.data_offset = align_up(table_end, PARTITION_ALIGN);
        let mut image = Image {
            path: path.to_path_buf(),
            file,
            header,
            slots: vec![None; capacity as usize],
            mode: LoadMode::ReadWrite,
        };

        image.file.set_len(image.header.data_offset)?;
        image.write_header()?;
        tracing::debug!(path = %path.display(), "created image");
        Ok(image)
    }

    pub fn load<P: AsRef<Path>>(path: P, mode: LoadMode) -> Result<Self, SifError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == LoadMode::ReadWrite)
            .open(path)
            .map_err(|err| SifError::Open {
                path: path.to_path_buf(),
                err,
            })?;

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|_| SifError::InvalidImage("file too short for a header".into()))?;
        let header = Header::decode(&buf)?;
        header.check_bounds(file.metadata()?.len())?;

        // bounded by the data offset, which lies inside the file
        let mut table = vec![0u8; (header.descriptor_capacity as usize) * DESCRIPTOR_LEN];
        file.seek(SeekFrom::Start(header.descriptor_offset))?;
        file.read_exact(&mut table)
            .map_err(|_| SifError::InvalidImage("truncated descriptor table".into()))?;
        let slots = table
            .chunks_exact(DESCRIPTOR_LEN)
            .map(Descriptor::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Image {
            path: path.to_path_buf(),
            file,
            header,
            slots,
            mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.slots.iter().flatten()
    }

    pub fn get(&self, id: u32) -> Result<&Descriptor, SifError> {
        self.descriptors()
            .find(|d| d.id == id)
            .ok_or(SifError::ObjectNotFound(id))
    }

    pub fn primary_partition(&self) -> Result<&Descriptor, SifError> {
        self.descriptors()
            .find(|d| matches!(d.partition(), Some((_, PartType::Primary, _))))
            .ok_or(SifError::NoPrimaryPartition)
    }

    /// Ids of every group holding at least one non-signature object.
    pub fn groups(&self) -> BTreeSet<u32> {
        self.descriptors()
            .filter(|d| d.group != 0 && d.data_type != DataType::Signature)
            .map(|d| d.group)
            .collect()
    }

    /// Objects of a group that a group signature covers.
    pub fn group_objects(&self, group: u32) -> Vec<&Descriptor> {
        self.descriptors()
            .filter(|d| d.group == group && d.data_type != DataType::Signature)
            .collect()
    }

    pub fn has_overlay(&self) -> bool {
        self.descriptors().any(Descriptor::is_overlay)
    }

    pub fn read_data(&self, id: u32) -> Result<Vec<u8>, SifError> {
        let mut data = Vec::new();
        self.copy_data(id, &mut data)?;
        Ok(data)
    }

    /// Streams the payload of an object, used for partitions too large to
    /// hold in memory.
    pub fn copy_data<W: Write>(&self, id: u32, writer: &mut W) -> Result<u64, SifError> {
        let desc = self.get(id)?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(desc.offset))?;
        let copied = io::copy(&mut file.take(desc.size), writer)?;
        if copied != desc.size {
            return Err(SifError::InvalidImage(format!(
                "payload of object {id} is truncated"
            )));
        }
        Ok(copied)
    }

    /// Appends an object and returns its id.
    pub fn add_object(&mut self, mut input: DescriptorInput<'_>) -> Result<u32, SifError> {
        self.ensure_writable()?;
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SifError::DescriptorTableFull(self.slots.len()))?;

        let align = if input.data_type == DataType::Partition {
            PARTITION_ALIGN
        } else {
            DATA_ALIGN
        };
        let offset = align_up(self.header.data_offset + self.header.data_len, align);
        self.file.seek(SeekFrom::Start(offset))?;
        let size = io::copy(&mut input.reader, &mut self.file)?;

        let now = now();
        let desc = Descriptor {
            data_type: input.data_type,
            id: self.header.next_id,
            group: input.group,
            link: input.link,
            link_is_group: input.link_is_group,
            offset,
            size,
            created: now,
            modified: now,
            name: input.name,
            extra: input.extra,
        };
        let id = desc.id;
        let data_type = desc.data_type;

        self.write_slot(slot, Some(&desc))?;
        self.slots[slot] = Some(desc);
        self.header.next_id += 1;
        self.header.descriptors_used += 1;
        self.header.data_len = offset + size - self.header.data_offset;
        self.header.modified = now;
        self.write_header()?;

        tracing::debug!(id, %data_type, size, "added object");
        Ok(id)
    }

    /// Removes an object. Its payload is zeroed, or cut off when it is the
    /// last thing in the data region.
    pub fn delete_object(&mut self, id: u32) -> Result<(), SifError> {
        self.ensure_writable()?;
        let slot = self
            .slots
            .iter()
            .position(|d| d.as_ref().map(|d| d.id) == Some(id))
            .ok_or(SifError::ObjectNotFound(id))?;
        let Some(desc) = self.slots[slot].take() else {
            return Err(SifError::ObjectNotFound(id));
        };

        let data_end = self.header.data_offset + self.header.data_len;
        if desc.offset + desc.size == data_end {
            let new_end = self
                .descriptors()
                .map(|d| d.offset + d.size)
                .max()
                .unwrap_or(self.header.data_offset)
                .max(self.header.data_offset);
            self.header.data_len = new_end - self.header.data_offset;
            self.file.set_len(new_end)?;
        } else {
            self.file.seek(SeekFrom::Start(desc.offset))?;
            io::copy(&mut io::repeat(0).take(desc.size), &mut self.file)?;
        }

        self.write_slot(slot, None)?;
        self.header.descriptors_used -= 1;
        self.header.modified = now();
        self.write_header()?;
        tracing::debug!(id, "deleted object");
        Ok(())
    }

    /// Adds a writable ext3 overlay partition next to the primary partition.
    pub fn add_overlay<R: Read>(&mut self, ext3: R) -> Result<u32, SifError> {
        let (group, arch) = {
            let primary = self.primary_partition()?;
            let Some((fs_type, _, arch)) = primary.partition() else {
                return Err(SifError::NoPrimaryPartition);
            };
            if fs_type == FsType::EncryptedSquashfs {
                return Err(SifError::EncryptedPrimary);
            }
            (primary.group, arch.clone())
        };

        self.add_object(
            DescriptorInput::new(DataType::Partition, ext3)
                .group(group)
                .name("overlay")
                .partition(FsType::Ext3, PartType::Overlay, arch),
        )
    }

    fn ensure_writable(&self) -> Result<(), SifError> {
        match self.mode {
            LoadMode::ReadWrite => Ok(()),
            LoadMode::ReadOnly => Err(SifError::ReadOnly),
        }
    }

    fn write_header(&mut self) -> Result<(), SifError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.flush()?;
        Ok(())
    }

    fn write_slot(&mut self, slot: usize, desc: Option<&Descriptor>) -> Result<(), SifError> {
        let at = self.header.descriptor_offset + (slot * DESCRIPTOR_LEN) as u64;
        let bytes = desc.map(Descriptor::encode).unwrap_or([0u8; DESCRIPTOR_LEN]);
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::Result;

    use super::*;

    /// An image with a fake squashfs primary partition and a labels object.
    pub(crate) fn sample_image(dir: &Path) -> Result<Image> {
        let mut image = Image::create(dir.join("test.sif"))?;
        image.add_object(
            DescriptorInput::new(DataType::Partition, &b"hsqs fake squashfs payload"[..])
                .name("rootfs")
                .partition(FsType::Squashfs, PartType::Primary, Arch::host()),
        )?;
        image.add_object(
            DescriptorInput::new(DataType::Labels, &br#"{"maintainer":"sifbox"}"#[..]),
        )?;
        Ok(image)
    }

    #[test]
    fn test_create_add_and_reload() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let image = sample_image(tmp.path())?;
        let uuid = image.header().uuid;
        drop(image);

        let image = Image::load(tmp.path().join("test.sif"), LoadMode::ReadOnly)?;
        assert_eq!(image.header().uuid, uuid);
        assert_eq!(image.descriptors().count(), 2);

        let primary = image.primary_partition()?;
        assert_eq!(primary.offset % PARTITION_ALIGN, 0);
        assert_eq!(image.read_data(primary.id)?, b"hsqs fake squashfs payload");
        assert_eq!(image.read_data(2)?, br#"{"maintainer":"sifbox"}"#);
        assert_eq!(image.groups(), BTreeSet::from([DEFAULT_GROUP]));
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_writes() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        drop(sample_image(tmp.path())?);
        let mut image = Image::load(tmp.path().join("test.sif"), LoadMode::ReadOnly)?;
        assert!(matches!(image.delete_object(1), Err(SifError::ReadOnly)));
        Ok(())
    }

    #[test]
    fn test_delete_last_object_shrinks_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut image = sample_image(tmp.path())?;
        let before = fs_len(image.path());
        image.delete_object(2)?;
        assert!(fs_len(image.path()) < before);
        assert!(matches!(image.get(2), Err(SifError::ObjectNotFound(2))));

        // ids are never reused
        let id = image.add_object(DescriptorInput::new(DataType::GenericJson, &b"{}"[..]))?;
        assert_eq!(id, 3);
        Ok(())
    }

    #[test]
    fn test_descriptor_table_full() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut image = Image::create_with_capacity(tmp.path().join("small.sif"), 1)?;
        image.add_object(DescriptorInput::new(DataType::GenericJson, &b"{}"[..]))?;
        assert!(matches!(
            image.add_object(DescriptorInput::new(DataType::GenericJson, &b"{}"[..])),
            Err(SifError::DescriptorTableFull(1))
        ));
        Ok(())
    }

    #[test]
    fn test_add_overlay_refused_on_encrypted_primary() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut image = Image::create(tmp.path().join("enc.sif"))?;
        image.add_object(
            DescriptorInput::new(DataType::Partition, &b"encrypted"[..])
                .partition(FsType::EncryptedSquashfs, PartType::Primary, Arch::host()),
        )?;
        assert!(matches!(
            image.add_overlay(&b"ext3"[..]),
            Err(SifError::EncryptedPrimary)
        ));
        Ok(())
    }

    #[test]
    fn test_add_overlay() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut image = sample_image(tmp.path())?;
        assert!(!image.has_overlay());
        let id = image.add_overlay(&b"ext3 image"[..])?;
        assert!(image.get(id)?.is_overlay());
        assert!(image.has_overlay());
        Ok(())
    }

    #[test]
    fn test_load_rejects_oversized_capacity() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        drop(sample_image(tmp.path())?);
        let path = tmp.path().join("test.sif");

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(88))?;
        file.write_all(&(1u64 << 60).to_le_bytes())?;
        drop(file);

        assert!(matches!(
            Image::load(&path, LoadMode::ReadOnly),
            Err(SifError::InvalidImage(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_rejects_truncated_data() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let image = sample_image(tmp.path())?;
        let data_offset = image.header().data_offset;
        drop(image);

        let path = tmp.path().join("test.sif");
        OpenOptions::new().write(true).open(&path)?.set_len(data_offset + 1)?;
        assert!(matches!(
            Image::load(&path, LoadMode::ReadOnly),
            Err(SifError::InvalidImage(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_new_keeps_existing_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("taken.sif");
        std::fs::write(&path, b"not ours")?;
        match Image::create_new(&path) {
            Err(SifError::Create { err, .. }) => {
                assert_eq!(err.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        assert_eq!(std::fs::read(&path)?, b"not ours");

        let image = Image::create_new(tmp.path().join("fresh.sif"))?;
        assert_eq!(image.descriptors().count(), 0);
        Ok(())
    }

    fn fs_len(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().len()
    }
}
