//! Verifying signed images.
//!
//! Verification recomputes the image digest and compares it with the plaintext of the stored
//! envelope before any key material is looked at.  A modified image therefore fails at
//! [`Stage::CompareDigest`] with an integrity error, and only an intact digest signed by an
//! unknown key fails at [`Stage::CheckSignature`].

use std::path::Path;

use log::{debug, info, warn};
use sequoia_openpgp::cert::Cert;

use crate::{
    digest::compute_image_digest,
    envelope::Envelope,
    error::{AtStage, Error, Stage, StageError},
    keystore::{Fingerprint, KeyStore},
    sif::{OpenMode, SifImage},
};

/// The entity that produced a valid signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerIdentity {
    pub fingerprint: Fingerprint,
    /// User IDs of the entity, `Name (comment) <email>`.
    pub user_ids: Vec<String>,
    /// The fingerprint recorded in the signature descriptor.
    pub recorded_fingerprint: Fingerprint,
}

impl SignerIdentity {
    fn new(cert: &Cert, recorded_fingerprint: Fingerprint) -> Result<Self, Error> {
        Ok(SignerIdentity {
            fingerprint: Fingerprint::of(cert)?,
            user_ids: cert
                .userids()
                .map(|ua| String::from_utf8_lossy(ua.userid().value()).into_owned())
                .collect(),
            recorded_fingerprint,
        })
    }
}

/// Verifies image signatures against the public keyring of a [`KeyStore`].
#[derive(Clone, Copy, Debug)]
pub struct ImageVerifier<'a> {
    store: &'a KeyStore,
}

impl<'a> ImageVerifier<'a> {
    pub fn new(store: &'a KeyStore) -> Self {
        ImageVerifier { store }
    }

    /// Verify the first signature of the image at `path`.
    pub fn verify(&self, path: impl AsRef<Path>) -> Result<SignerIdentity, StageError> {
        let path = path.as_ref();

        let image = SifImage::load(path, OpenMode::ReadOnly).at(Stage::LoadImage)?;
        let digest = compute_image_digest(&image).at(Stage::Digest)?;
        let (data, recorded) = image
            .signature()
            .and_then(|desc| {
                let entity = desc.signature_extra().entity;
                Ok((image.object_data(desc)?.to_vec(), Fingerprint::from(entity)))
            })
            .at(Stage::ExtractSignature)?;
        image.unload();

        let envelope = Envelope::decode(&data).at(Stage::DecodeEnvelope)?;

        let plaintext = envelope.plaintext();
        let signed = plaintext.trim_end_matches('\n');
        if signed != digest.as_str() {
            let source = Error::Integrity {
                signed: signed.to_string(),
                calculated: digest.to_string(),
            };
            debug!("{} failed: {source}", Stage::CompareDigest);
            return Err(StageError {
                stage: Stage::CompareDigest,
                source,
            });
        }
        debug!("digest of {} matches signed digest", path.display());

        let certs = self.store.load_public().at(Stage::LoadPublicKeys)?;
        let identity = envelope
            .verify(&certs)
            .and_then(|cert| SignerIdentity::new(cert, recorded))
            .at(Stage::CheckSignature)?;

        if identity.fingerprint != identity.recorded_fingerprint {
            warn!(
                "signature descriptor names key {} but {} made the signature",
                identity.recorded_fingerprint, identity.fingerprint
            );
        }
        info!("{} signed by {}", path.display(), identity.fingerprint);
        Ok(identity)
    }
}

/// Verify the image at `path` against the public keyring of `store`.
pub fn verify(store: &KeyStore, path: impl AsRef<Path>) -> Result<SignerIdentity, StageError> {
    ImageVerifier::new(store).verify(path)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        embed::embed_signature,
        error::ErrorKind,
        sign::sign,
        test::{generate_cert, write_image},
    };

    #[test]
    fn test_round_trip() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let cert = generate_cert("Signer (test) <signer@example.com>");
        store.persist_pair(&cert).unwrap();

        let image = write_image(dir.path(), b"root filesystem");
        sign(&store, &image).unwrap();

        let identity = verify(&store, &image).unwrap();
        let fingerprint = Fingerprint::of(&cert).unwrap();
        assert_eq!(
            identity,
            SignerIdentity {
                fingerprint,
                user_ids: vec!["Signer (test) <signer@example.com>".into()],
                recorded_fingerprint: fingerprint,
            }
        );
    }

    #[test]
    fn test_unsigned() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let image = write_image(dir.path(), b"root filesystem");

        let err = verify(&store, &image).unwrap_err();
        assert_eq!(err.stage, Stage::ExtractSignature);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_malformed_envelope() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let image = write_image(dir.path(), b"root filesystem");

        let mut handle = SifImage::load(&image, OpenMode::ReadWrite).unwrap();
        embed_signature(
            &Fingerprint::from([7; 20]),
            &mut handle,
            b"SIFHASH:\nnot an envelope",
        )
        .unwrap();
        handle.unload();

        let err = verify(&store, &image).unwrap_err();
        assert_eq!(err.stage, Stage::DecodeEnvelope);
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_recorded_fingerprint_mismatch() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let cert = generate_cert("Signer <signer@example.com>");
        store.persist_pair(&cert).unwrap();

        // sign one image, then copy its envelope into another under a bogus fingerprint
        let signed = write_image(dir.path(), b"root filesystem");
        sign(&store, &signed).unwrap();
        let envelope = {
            let handle = SifImage::load(&signed, OpenMode::ReadOnly).unwrap();
            let data = handle.object_data(handle.signature().unwrap()).unwrap();
            data.to_vec()
        };

        let other = dir.path().join("other");
        std::fs::create_dir(&other).unwrap();
        let unsigned = write_image(&other, b"root filesystem");
        let mut handle = SifImage::load(&unsigned, OpenMode::ReadWrite).unwrap();
        embed_signature(&Fingerprint::from([7; 20]), &mut handle, &envelope).unwrap();
        handle.unload();

        let identity = verify(&store, &unsigned).unwrap();
        assert_eq!(identity.fingerprint, Fingerprint::of(&cert).unwrap());
        assert_eq!(identity.recorded_fingerprint, Fingerprint::from([7; 20]));
    }
}
