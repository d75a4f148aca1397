//! Content digest of a SIF image.
//!
//! The digest covers the byte range of the default group's partition and is rendered as a small
//! text message, which is what actually gets signed:
//!
//! ```text
//! SIFHASH:
//! 0f3a...  (96 lowercase hex digits of SHA-384)
//! ```
//!
//! There is no trailing newline.  Verification recomputes this message and compares it
//! byte-for-byte with the plaintext of the stored signature envelope.

use std::fmt;

use sha2::{Digest, Sha384};

use crate::{error::Result, sif::SifImage};

pub const DIGEST_LABEL: &str = "SIFHASH:\n";

/// The canonical signed form of an image digest.
#[derive(Clone, PartialEq, Eq)]
pub struct DigestMessage(String);

impl DigestMessage {
    /// Hash `data` and format the result.
    pub fn from_data(data: &[u8]) -> Self {
        DigestMessage(format!(
            "{DIGEST_LABEL}{}",
            hex::encode(Sha384::digest(data))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for DigestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for DigestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the digest message of the default group partition of `image`.
pub fn compute_image_digest(image: &SifImage) -> Result<DigestMessage> {
    let part = image.default_group_partition()?;
    let data = image.object_data(part)?;
    log::debug!(
        "hashing partition {} ({} bytes @{})",
        part.id.get(),
        part.filelen.get(),
        part.fileoff.get()
    );
    Ok(DigestMessage::from_data(data))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        error::ErrorKind,
        sif::{DataObject, FsType, OpenMode, PartType, SifBuilder},
    };

    #[test]
    fn test_known_digest() {
        // sha384 of the empty string
        assert_eq!(
            DigestMessage::from_data(b"").as_str(),
            "SIFHASH:\n38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b"
        );
    }

    #[test]
    fn test_image_digest() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("image.sif");
        SifBuilder::new()
            .add(DataObject::generic("ignored", b"abc".to_vec()))
            .add(DataObject::partition(
                b"partition".to_vec(),
                FsType::Squash,
                PartType::PrimSys,
            ))
            .write(&path)
            .unwrap();

        let image = SifImage::load(&path, OpenMode::ReadOnly).unwrap();
        let first = compute_image_digest(&image).unwrap();
        let second = compute_image_digest(&image).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, DigestMessage::from_data(b"partition"));
        assert!(!first.as_str().ends_with('\n'));
        assert_eq!(first.as_str().len(), DIGEST_LABEL.len() + 96);
    }

    #[test]
    fn test_no_partition() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("image.sif");
        SifBuilder::new().write(&path).unwrap();

        let image = SifImage::load(&path, OpenMode::ReadOnly).unwrap();
        let err = compute_image_digest(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
