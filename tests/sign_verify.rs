use std::{fs::OpenOptions, os::unix::fs::FileExt, path::Path};

use similar_asserts::assert_eq;

use sifsig::{
    digest::compute_image_digest,
    keygen::FixedIdentity,
    keystore::{Fingerprint, KeyStore},
    sif::{OpenMode, SifImage},
    test::{fast_keygen, generate_cert, tempdir, test_identity, write_image, FailingPrompt},
    ErrorKind, ImageSigner, Stage,
};

fn bootstrap_signer(store: &KeyStore) -> ImageSigner<'_> {
    ImageSigner::new(store)
        .identity_prompt(FixedIdentity(test_identity()))
        .key_generation(fast_keygen())
}

fn flip_payload_bit(path: &Path) {
    let (offset, len) = {
        let image = SifImage::load(path, OpenMode::ReadOnly).unwrap();
        let range = image.default_group_partition().unwrap().range();
        range
    };
    assert!(len > 0);

    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8];
    file.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0x01;
    file.write_all_at(&byte, offset).unwrap();
}

fn store_in(dir: &Path, name: &str) -> KeyStore {
    KeyStore::open_path(dir.join(name))
}

#[test]
fn test_round_trip() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let image = write_image(dir.path(), b"a squashfs filesystem");

    let outcome = bootstrap_signer(&store).sign(&image).unwrap();
    assert!(outcome.generated_key);

    let identity = sifsig::verify(&store, &image).unwrap();
    assert_eq!(identity.fingerprint, outcome.fingerprint);
    assert_eq!(identity.recorded_fingerprint, outcome.fingerprint);
    assert_eq!(identity.user_ids, vec![test_identity().user_id()]);
}

#[test]
fn test_tamper_detection() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let image = write_image(dir.path(), b"a squashfs filesystem");
    bootstrap_signer(&store).sign(&image).unwrap();

    flip_payload_bit(&image);
    let err = sifsig::verify(&store, &image).unwrap_err();
    assert_eq!(err.stage, Stage::CompareDigest);
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("SIF hash string mismatch"), "{err}");
}

#[test]
fn test_unsigned_image() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let image = write_image(dir.path(), b"never signed");

    let err = sifsig::verify(&store, &image).unwrap_err();
    assert_eq!(err.stage, Stage::ExtractSignature);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_unknown_signer() {
    let dir = tempdir();
    let signing = store_in(dir.path(), "signing");
    let other = store_in(dir.path(), "other");
    let image = write_image(dir.path(), b"a squashfs filesystem");

    bootstrap_signer(&signing).sign(&image).unwrap();
    other
        .append_public(&generate_cert("Someone Else <else@example.com>"))
        .unwrap();

    let err = sifsig::verify(&other, &image).unwrap_err();
    assert_eq!(err.stage, Stage::CheckSignature);
    assert_eq!(err.kind(), ErrorKind::Auth);

    // an empty keyring can't vouch for anything either
    let empty = store_in(dir.path(), "empty");
    let err = sifsig::verify(&empty, &image).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[test]
fn test_bootstrap_exactly_once() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let image = write_image(dir.path(), b"payload");

    let first = bootstrap_signer(&store).sign(&image).unwrap();
    assert!(first.generated_key);
    assert_eq!(store.load_private().unwrap().len(), 1);
    assert_eq!(store.load_public().unwrap().len(), 1);

    let second = ImageSigner::new(&store)
        .identity_prompt(FailingPrompt)
        .sign(&image)
        .unwrap();
    assert!(!second.generated_key);
    assert_eq!(second.fingerprint, first.fingerprint);
    assert_eq!(store.load_private().unwrap().len(), 1);
    assert_eq!(store.load_public().unwrap().len(), 1);
}

#[test]
fn test_bootstrap_failure() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let image = write_image(dir.path(), b"payload");

    let err = ImageSigner::new(&store)
        .identity_prompt(FailingPrompt)
        .sign(&image)
        .unwrap_err();
    assert_eq!(err.stage, Stage::EnsureKeyExists);
    assert_eq!(err.kind(), ErrorKind::Io);

    let image = SifImage::load(&image, OpenMode::ReadOnly).unwrap();
    assert_eq!(image.signatures().count(), 0);
}

#[test]
fn test_digest_determinism() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let path = write_image(dir.path(), b"payload");

    let before = {
        let image = SifImage::load(&path, OpenMode::ReadOnly).unwrap();
        let first = compute_image_digest(&image).unwrap();
        assert_eq!(first, compute_image_digest(&image).unwrap());
        first
    };

    // appending the signature doesn't touch the signed range
    bootstrap_signer(&store).sign(&path).unwrap();
    let image = SifImage::load(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(compute_image_digest(&image).unwrap(), before);
}

#[test]
fn test_bad_image() {
    let dir = tempdir();
    let store = store_in(dir.path(), "sypgp");
    let path = dir.path().join("truncated.sif");
    let image = write_image(dir.path(), b"payload");
    let data = std::fs::read(&image).unwrap();
    std::fs::write(&path, &data[..data.len() - 1]).unwrap();

    let err = sifsig::verify(&store, &path).unwrap_err();
    assert_eq!(err.stage, Stage::LoadImage);
    assert_eq!(err.kind(), ErrorKind::Format);
}

/// Sign with a fresh key K1, tamper and restore the payload, then check against a keyring that
/// only knows some other key K2.
#[test]
fn test_scenario() {
    let dir = tempdir();
    let store = store_in(dir.path(), "k1");
    let image = write_image(dir.path(), b"P: the default group payload");

    let k1 = bootstrap_signer(&store).sign(&image).unwrap().fingerprint;
    assert_eq!(sifsig::verify(&store, &image).unwrap().fingerprint, k1);

    flip_payload_bit(&image);
    assert_eq!(
        sifsig::verify(&store, &image).unwrap_err().kind(),
        ErrorKind::Integrity
    );

    flip_payload_bit(&image);
    assert_eq!(sifsig::verify(&store, &image).unwrap().fingerprint, k1);

    let k2_store = store_in(dir.path(), "k2");
    let k2 = generate_cert("K2 <k2@example.com>");
    k2_store.append_public(&k2).unwrap();
    assert_ne!(Fingerprint::of(&k2).unwrap(), k1);

    let err = sifsig::verify(&k2_store, &image).unwrap_err();
    assert_eq!(err.stage, Stage::CheckSignature);
    assert_eq!(err.kind(), ErrorKind::Auth);
}
