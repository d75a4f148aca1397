//! Signing images.
//!
//! [`ImageSigner`] walks through the signing steps in order, tagging any failure with the
//! [`Stage`] it happened in:
//!
//!  1. load the secret keyring, generating a first key pair if it is empty
//!  2. select the signing entity ([`KeySelector`])
//!  3. unlock its secret key if it is encrypted ([`CredentialProvider`])
//!  4. open the image, compute its digest, sign it and embed the envelope
//!
//! The image is opened last and closed on every exit path.

use std::path::Path;

use log::{debug, info};
use sequoia_openpgp::{
    cert::Cert,
    crypto::{KeyPair, Password},
    packet::{
        key::{SecretParts, UnspecifiedRole},
        Key,
    },
    policy::StandardPolicy,
};

use crate::{
    digest::compute_image_digest,
    embed::embed_signature,
    envelope,
    error::{AtStage, Error, Result, Stage, StageError},
    keygen::{IdentityPrompt, KeyGenOptions, KeyPairGenerator, TerminalPrompt},
    keystore::{Fingerprint, KeyStore},
    sif::{OpenMode, SifImage},
};

/// Chooses the signing entity from the secret keyring.
pub trait KeySelector {
    /// Return the index of the entity to sign with.  `certs` is never empty.
    fn select(&mut self, certs: &[Cert]) -> Result<usize>;
}

/// Selects the first entity in keyring order.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstKey;

impl KeySelector for FirstKey {
    fn select(&mut self, _certs: &[Cert]) -> Result<usize> {
        Ok(0)
    }
}

/// Selects the entity with the given primary key fingerprint.
#[derive(Clone, Copy, Debug)]
pub struct ByFingerprint(pub Fingerprint);

impl KeySelector for ByFingerprint {
    fn select(&mut self, certs: &[Cert]) -> Result<usize> {
        certs
            .iter()
            .position(|cert| self.0.matches(cert))
            .ok_or_else(|| Error::NotFound(format!("key {}", self.0)))
    }
}

/// Supplies the password protecting a secret key.
pub trait CredentialProvider {
    /// Only called for entities whose signing key is encrypted.
    fn passphrase(&mut self, cert: &Cert) -> Result<Password>;
}

/// Answers every request with the same password.
#[derive(Clone)]
pub struct FixedPassphrase(Password);

impl FixedPassphrase {
    pub fn new(password: impl Into<Password>) -> Self {
        FixedPassphrase(password.into())
    }

    /// The placeholder password for development keys.
    pub fn development() -> Self {
        FixedPassphrase::new("devkeys")
    }
}

impl CredentialProvider for FixedPassphrase {
    fn passphrase(&mut self, _cert: &Cert) -> Result<Password> {
        Ok(self.0.clone())
    }
}

/// The result of a successful [`ImageSigner::sign`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignOutcome {
    /// The primary key fingerprint of the signing entity.
    pub fingerprint: Fingerprint,
    /// Whether the signing entity was generated by this call.
    pub generated_key: bool,
    /// The data object ID of the embedded signature.
    pub signature_id: u32,
}

/// The first valid signing-capable key of `cert` that has secret material.
fn signing_key(cert: &Cert) -> Result<Key<SecretParts, UnspecifiedRole>> {
    let policy = StandardPolicy::new();
    cert.keys()
        .with_policy(&policy, None)
        .alive()
        .revoked(false)
        .for_signing()
        .secret()
        .next()
        .map(|ka| ka.key().clone())
        .ok_or_else(|| Error::NotFound(format!("signing key of {}", cert.fingerprint())))
}

/// Signs images with keys from a [`KeyStore`].
pub struct ImageSigner<'a> {
    store: &'a KeyStore,
    selector: Box<dyn KeySelector + 'a>,
    credentials: Box<dyn CredentialProvider + 'a>,
    prompt: Option<Box<dyn IdentityPrompt + 'a>>,
    keygen: KeyGenOptions,
}

impl<'a> ImageSigner<'a> {
    /// A signer using [`FirstKey`], [`FixedPassphrase::development`] and, should the store be
    /// empty, a [`TerminalPrompt`] on stdio.
    pub fn new(store: &'a KeyStore) -> Self {
        ImageSigner {
            store,
            selector: Box::new(FirstKey),
            credentials: Box::new(FixedPassphrase::development()),
            prompt: None,
            keygen: KeyGenOptions::default(),
        }
    }

    pub fn key_selector(mut self, selector: impl KeySelector + 'a) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn credentials(mut self, credentials: impl CredentialProvider + 'a) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    pub fn identity_prompt(mut self, prompt: impl IdentityPrompt + 'a) -> Self {
        self.prompt = Some(Box::new(prompt));
        self
    }

    pub fn key_generation(mut self, options: KeyGenOptions) -> Self {
        self.keygen = options;
        self
    }

    fn load_keys(&mut self) -> std::result::Result<(Vec<Cert>, bool), StageError> {
        let certs = self.store.load_private().at(Stage::LoadKeys)?;
        if !certs.is_empty() {
            return Ok((certs, false));
        }

        info!("no private keys in {}, generating one", self.store.dir().display());
        let generator = KeyPairGenerator::new(self.store, self.keygen.clone());
        let generated = match &mut self.prompt {
            Some(prompt) => generator.generate(prompt.as_mut()),
            None => generator.generate(&mut TerminalPrompt::stdio()),
        };
        generated.at(Stage::EnsureKeyExists)?;

        let certs = self.store.load_private().at(Stage::LoadKeys)?;
        if certs.is_empty() {
            return Err(StageError {
                stage: Stage::EnsureKeyExists,
                source: Error::NotFound("private key after generation".into()),
            });
        }
        Ok((certs, true))
    }

    fn unlock(&mut self, cert: &Cert) -> Result<KeyPair> {
        let mut key = signing_key(cert)?;
        if key.secret().is_encrypted() {
            let password = self.credentials.passphrase(cert)?;
            key = key.decrypt_secret(&password).map_err(|e| {
                Error::Auth(format!("cannot decrypt key {}: {e}", cert.fingerprint()))
            })?;
        }
        key.into_keypair()
            .map_err(|e| Error::crypto("preparing signing key", e))
    }

    /// Sign the image at `path` and embed the signature in it.
    pub fn sign(
        &mut self,
        path: impl AsRef<Path>,
    ) -> std::result::Result<SignOutcome, StageError> {
        let path = path.as_ref();
        let (certs, generated_key) = self.load_keys()?;

        let index = self.selector.select(&certs).at(Stage::SelectKey)?;
        let cert = certs
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("key #{index}")))
            .at(Stage::SelectKey)?;
        let fingerprint = Fingerprint::of(cert).at(Stage::SelectKey)?;
        debug!("selected key {fingerprint} of {}", certs.len());

        let keypair = self.unlock(cert).at(Stage::DecryptKey)?;

        let mut image = SifImage::load(path, OpenMode::ReadWrite).at(Stage::LoadImage)?;
        let digest = compute_image_digest(&image).at(Stage::Digest)?;
        let signed = envelope::sign(keypair, &digest).at(Stage::Sign)?;
        let signature_id =
            embed_signature(&fingerprint, &mut image, &signed).at(Stage::Embed)?;
        image.unload();

        info!("signed {} with key {fingerprint}", path.display());
        Ok(SignOutcome {
            fingerprint,
            generated_key,
            signature_id,
        })
    }
}

/// Sign the image at `path` with the default strategies of [`ImageSigner::new`].
pub fn sign(
    store: &KeyStore,
    path: impl AsRef<Path>,
) -> std::result::Result<SignOutcome, StageError> {
    ImageSigner::new(store).sign(path)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        error::ErrorKind,
        keygen::FixedIdentity,
        test::{fast_keygen, generate_cert, test_identity, write_image},
    };

    #[test]
    fn test_selectors() {
        let certs = [
            generate_cert("One <one@example.com>"),
            generate_cert("Two <two@example.com>"),
        ];
        assert_eq!(FirstKey.select(&certs).unwrap(), 0);

        let second = Fingerprint::of(&certs[1]).unwrap();
        assert_eq!(ByFingerprint(second).select(&certs).unwrap(), 1);

        let err = ByFingerprint(Fingerprint::from([0; 20]))
            .select(&certs)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_bootstrap_once() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let image = write_image(dir.path(), b"payload");

        let first = ImageSigner::new(&store)
            .identity_prompt(FixedIdentity(test_identity()))
            .key_generation(fast_keygen())
            .sign(&image)
            .unwrap();
        assert!(first.generated_key);

        // a second run must not need an identity
        let second = ImageSigner::new(&store)
            .identity_prompt(crate::test::FailingPrompt)
            .sign(&image)
            .unwrap();
        assert!(!second.generated_key);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(store.load_private().unwrap().len(), 1);

        let image = SifImage::load(&image, OpenMode::ReadOnly).unwrap();
        assert_eq!(image.signatures().count(), 2);
    }

    #[test]
    fn test_select_by_fingerprint() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let image = write_image(dir.path(), b"payload");

        let one = generate_cert("One <one@example.com>");
        let two = generate_cert("Two <two@example.com>");
        store.persist_pair(&one).unwrap();
        store.persist_pair(&two).unwrap();

        let two = Fingerprint::of(&two).unwrap();
        let outcome = ImageSigner::new(&store)
            .key_selector(ByFingerprint(two))
            .sign(&image)
            .unwrap();
        assert_eq!(outcome.fingerprint, two);

        let outcome = sign(&store, &image).unwrap();
        assert_eq!(outcome.fingerprint, Fingerprint::of(&one).unwrap());
    }

    #[test]
    fn test_encrypted_key() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        let image = write_image(dir.path(), b"payload");
        let options = KeyGenOptions {
            password: Some("devkeys".into()),
            ..fast_keygen()
        };
        let cert = KeyPairGenerator::new(&store, options)
            .generate(&mut FixedIdentity(test_identity()))
            .unwrap();

        let err = ImageSigner::new(&store)
            .credentials(FixedPassphrase::new("wrong"))
            .sign(&image)
            .unwrap_err();
        assert_eq!(err.stage, Stage::DecryptKey);
        assert_eq!(err.kind(), ErrorKind::Auth);
        let untouched = SifImage::load(&image, OpenMode::ReadOnly).unwrap();
        assert_eq!(untouched.signatures().count(), 0);
        untouched.unload();

        let outcome = sign(&store, &image).unwrap();
        assert_eq!(outcome.fingerprint, Fingerprint::of(&cert).unwrap());
    }

    #[test]
    fn test_bad_image() {
        let dir = crate::test::tempdir();
        let store = KeyStore::open_path(dir.path().join("sypgp"));
        store
            .persist_pair(&generate_cert("One <one@example.com>"))
            .unwrap();

        let path = dir.path().join("garbage.sif");
        std::fs::write(&path, b"definitely not an image").unwrap();
        let err = sign(&store, &path).unwrap_err();
        assert_eq!(err.stage, Stage::LoadImage);
        assert_eq!(err.kind(), ErrorKind::Format);

        let err = sign(&store, dir.path().join("missing.sif")).unwrap_err();
        assert_eq!(err.stage, Stage::LoadImage);
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
