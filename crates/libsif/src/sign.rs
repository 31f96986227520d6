use crate::descriptor::DataType;
use crate::digest;
use crate::envelope;
use crate::error::SifError;
use crate::image::{DescriptorInput, Image};
use crate::key::Signer;

/// What a signing run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignSelection {
    /// One signature per group.
    AllGroups,
    Group(u32),
    /// A single signature over exactly these objects.
    Objects(Vec<u32>),
    /// The whole group the object belongs to.
    GroupOf(u32),
}

enum Target {
    Group(u32, Vec<u32>),
    Objects(Vec<u32>),
}

/// Adds signature descriptors to the image and returns their ids. OpenPGP
/// keys write clear-signed blocks, PEM keys DSSE envelopes.
///
/// Nothing is written when the image carries a writable overlay since its
/// content changes after signing.
#[tracing::instrument(skip_all, fields(image = %image.path().display(), signer = %signer.fingerprint()))]
pub fn sign(image: &mut Image, selection: &SignSelection, signer: &Signer) -> Result<Vec<u32>, SifError> {
    if image.has_overlay() {
        return Err(SifError::OverlayPresent);
    }

    let targets = resolve_targets(image, selection)?;
    let fingerprint = signer.fingerprint();
    let mut added = Vec::new();

    for target in targets {
        let ids = match &target {
            Target::Group(_, ids) | Target::Objects(ids) => ids,
        };
        let manifest = digest::manifest_for(image, ids)?;
        let message = serde_json::to_vec(&manifest)?;

        let payload = match signer {
            Signer::OpenPgp(key) => key.clearsign(&message)?,
            Signer::Pem(key) => {
                let pae = envelope::pae(envelope::DSSE_PAYLOAD_TYPE, &message);
                let sig = key.sign(&pae);
                envelope::dsse_envelope(&message, &sig.to_bytes(), &fingerprint.to_string())?
            }
        };

        let input = DescriptorInput::new(DataType::Signature, payload.as_slice())
            .group(0)
            .signature(signer.format(), fingerprint.0);
        let input = match target {
            Target::Group(group, _) => input.link_group(group),
            Target::Objects(ids) => input.link_object(ids[0]),
        };
        let id = image.add_object(input)?;
        tracing::info!(signature = id, "added signature");
        added.push(id);
    }

    Ok(added)
}

fn resolve_targets(image: &Image, selection: &SignSelection) -> Result<Vec<Target>, SifError> {
    let group_target = |group: u32| -> Result<Target, SifError> {
        let ids: Vec<u32> = image.group_objects(group).iter().map(|d| d.id).collect();
        if ids.is_empty() {
            return Err(SifError::GroupNotFound(group));
        }
        Ok(Target::Group(group, ids))
    };

    match selection {
        SignSelection::AllGroups => {
            let groups = image.groups();
            if groups.is_empty() {
                return Err(SifError::GroupNotFound(crate::DEFAULT_GROUP));
            }
            groups.into_iter().map(group_target).collect()
        }
        SignSelection::Group(group) => Ok(vec![group_target(*group)?]),
        SignSelection::GroupOf(id) => {
            let desc = image.get(*id)?;
            if desc.group == 0 {
                return Ok(vec![Target::Objects(vec![*id])]);
            }
            Ok(vec![group_target(desc.group)?])
        }
        SignSelection::Objects(ids) => {
            if ids.is_empty() {
                return Err(SifError::NoSignatures);
            }
            for id in ids {
                if image.get(*id)?.data_type == DataType::Signature {
                    return Err(SifError::MalformedSignature(format!(
                        "object {id} is a signature and cannot be signed"
                    )));
                }
            }
            Ok(vec![Target::Objects(ids.clone())])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SignatureFormat;
    use crate::image::tests::sample_image;
    use crate::key::tests::test_key;
    use crate::key::PemSigner;
    use crate::openpgp::tests::test_signer;

    #[test]
    fn test_sign_all_groups_adds_one_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        let signer = Signer::Pem(PemSigner::new(test_key(1)));

        let ids = sign(&mut image, &SignSelection::AllGroups, &signer).unwrap();
        assert_eq!(ids.len(), 1);
        let desc = image.get(ids[0]).unwrap();
        assert!(desc.link_is_group);
        assert_eq!(desc.link, crate::DEFAULT_GROUP);
        assert_eq!(desc.group, 0);
        assert_eq!(
            desc.signature(),
            Some((SignatureFormat::Dsse, signer.fingerprint().0))
        );
    }

    #[test]
    fn test_openpgp_key_writes_clearsigned_block() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        let signer = Signer::OpenPgp(test_signer());

        let ids = sign(&mut image, &SignSelection::AllGroups, &signer).unwrap();
        let desc = image.get(ids[0]).unwrap();
        assert_eq!(
            desc.signature(),
            Some((SignatureFormat::Armored, signer.fingerprint().0))
        );
        let payload = String::from_utf8(image.read_data(ids[0]).unwrap()).unwrap();
        assert!(payload.starts_with("-----BEGIN PGP SIGNED MESSAGE-----"));
    }

    #[test]
    fn test_overlay_refuses_signing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        image.add_overlay(&b"ext3"[..]).unwrap();
        let before = image.descriptors().count();

        let signer = Signer::OpenPgp(test_signer());
        let result = sign(&mut image, &SignSelection::AllGroups, &signer);
        assert!(matches!(result, Err(SifError::OverlayPresent)));
        assert_eq!(image.descriptors().count(), before);
    }

    #[test]
    fn test_sign_unknown_group() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        let signer = Signer::Pem(PemSigner::new(test_key(1)));
        assert!(matches!(
            sign(&mut image, &SignSelection::Group(7), &signer),
            Err(SifError::GroupNotFound(7))
        ));
    }

    #[test]
    fn test_sign_objects_links_first_object() {
        let tmp = tempfile::tempdir().unwrap();
        let mut image = sample_image(tmp.path()).unwrap();
        let signer = Signer::Pem(PemSigner::new(test_key(2)));
        let ids = sign(&mut image, &SignSelection::Objects(vec![2]), &signer).unwrap();
        let desc = image.get(ids[0]).unwrap();
        assert!(!desc.link_is_group);
        assert_eq!(desc.link, 2);
    }
}
