//! Storing signature envelopes in images.

use log::debug;

use crate::{
    error::Result,
    keystore::Fingerprint,
    sif::{DataObject, HashType, SifImage},
};

/// Add `envelope` to `image` as a signature object linked to the default group partition.
///
/// The descriptor records SHA-384 as the hash type and the signer's fingerprint.  Returns the ID
/// of the new object.
pub fn embed_signature(
    fingerprint: &Fingerprint,
    image: &mut SifImage,
    envelope: &[u8],
) -> Result<u32> {
    let link = image.default_group_partition()?.id.get();
    let object = DataObject::signature(
        HashType::Sha384,
        *fingerprint.as_bytes(),
        link,
        envelope.to_vec(),
    );
    let id = image.put_data_object(object)?;
    debug!(
        "embedded {} byte signature by {fingerprint} as object {id}, linked to {link}",
        envelope.len()
    );
    Ok(id)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        error::ErrorKind,
        sif::{DataType, OpenMode, SifBuilder},
        test::write_image,
    };

    #[test]
    fn test_embed() {
        let dir = crate::test::tempdir();
        let path = write_image(dir.path(), b"rootfs");
        let fingerprint = Fingerprint::from([0xab; 20]);

        let mut image = SifImage::load(&path, OpenMode::ReadWrite).unwrap();
        let part = image.default_group_partition().unwrap().id.get();
        let id = embed_signature(&fingerprint, &mut image, b"envelope").unwrap();
        image.unload();

        let image = SifImage::load(&path, OpenMode::ReadOnly).unwrap();
        let sig = image.signature().unwrap();
        assert_eq!(sig.id.get(), id);
        assert_eq!(sig.link.get(), part);
        assert_eq!(sig.data_type(), Ok(DataType::Signature));

        let extra = sig.signature_extra();
        assert_eq!(extra.hashtype.get(), HashType::Sha384 as u32);
        assert_eq!(Fingerprint::from(extra.entity), fingerprint);
        assert_eq!(image.object_data(sig).unwrap(), b"envelope");
    }

    #[test]
    fn test_embed_no_partition() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("empty.sif");
        SifBuilder::new().write(&path).unwrap();

        let mut image = SifImage::load(&path, OpenMode::ReadWrite).unwrap();
        let err = embed_signature(&Fingerprint::from([1; 20]), &mut image, b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(image.signatures().count(), 0);
    }
}
