use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::descriptor::Descriptor;
use crate::error::SifError;
use crate::image::Image;

pub const HASH_SHA256: &str = "sha256";

/// The message that gets signed: one digest per covered object, bound to
/// the image by its UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestManifest {
    pub hash: String,
    pub image: String,
    pub objects: Vec<ObjectDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDigest {
    pub id: u32,
    pub digest: String,
}

impl DigestManifest {
    pub fn covered_ids(&self) -> Vec<u32> {
        self.objects.iter().map(|o| o.id).collect()
    }
}

/// SHA-256 over the canonical descriptor record followed by the payload.
pub fn object_digest(image: &Image, desc: &Descriptor) -> Result<String, SifError> {
    let mut hasher = Sha256::new();
    hasher.update(desc.canonical_bytes());
    image.copy_data(desc.id, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over the payload only, as used by per-partition signatures.
pub fn payload_digest(image: &Image, desc: &Descriptor) -> Result<String, SifError> {
    let mut hasher = Sha256::new();
    image.copy_data(desc.id, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn manifest_for(image: &Image, ids: &[u32]) -> Result<DigestManifest, SifError> {
    let objects = ids
        .iter()
        .map(|id| {
            let desc = image.get(*id)?;
            Ok(ObjectDigest {
                id: *id,
                digest: object_digest(image, desc)?,
            })
        })
        .collect::<Result<Vec<_>, SifError>>()?;

    Ok(DigestManifest {
        hash: HASH_SHA256.to_owned(),
        image: image.header().uuid.to_string(),
        objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::sample_image;

    #[test]
    fn test_digest_depends_on_descriptor_and_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let image = sample_image(tmp.path()).unwrap();
        let primary = image.primary_partition().unwrap();

        let full = object_digest(&image, primary).unwrap();
        let payload = payload_digest(&image, primary).unwrap();
        assert_ne!(full, payload);
        assert_eq!(payload, hex::encode(Sha256::digest(b"hsqs fake squashfs payload")));
    }

    #[test]
    fn test_manifest_lists_objects_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let image = sample_image(tmp.path()).unwrap();
        let manifest = manifest_for(&image, &[2, 1]).unwrap();
        assert_eq!(manifest.covered_ids(), vec![2, 1]);
        assert_eq!(manifest.image, image.header().uuid.to_string());
        assert!(matches!(
            manifest_for(&image, &[9]),
            Err(SifError::ObjectNotFound(9))
        ));
    }
}
