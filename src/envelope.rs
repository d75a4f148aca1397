//! Signature envelopes.
//!
//! An envelope is an OpenPGP cleartext-signed message (RFC 4880, section 7): the digest message
//! stays readable, followed by an armored signature block.
//!
//! ```text
//! -----BEGIN PGP SIGNED MESSAGE-----
//! Hash: SHA384
//!
//! SIFHASH:
//! 5c1b...
//! -----BEGIN PGP SIGNATURE-----
//!
//! wsBzBAEBCQAnBYJ...
//! -----END PGP SIGNATURE-----
//! ```
//!
//! Decoding is split from checking the signature so that the plaintext can be compared against a
//! freshly computed digest before any key material is consulted.

use std::io::Write;

use log::debug;
use sequoia_openpgp::{
    cert::Cert,
    crypto::KeyPair,
    parse::{
        stream::{
            DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
        },
        Parse,
    },
    policy::StandardPolicy,
    serialize::stream::{Message, Signer},
    types::HashAlgorithm,
    KeyHandle, Packet, PacketPile,
};

use crate::{
    digest::DigestMessage,
    error::{Error, Result},
};

const SIGNED_MESSAGE_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_FOOTER: &str = "-----END PGP SIGNATURE-----";

/// Produce a cleartext-signed envelope around `message`.
pub fn sign(keypair: KeyPair, message: &DigestMessage) -> Result<Vec<u8>> {
    let mut envelope = vec![];

    let sink = Message::new(&mut envelope);
    let mut signer = Signer::new(sink, keypair)
        .hash_algo(HashAlgorithm::SHA384)
        .and_then(|signer| signer.cleartext().build())
        .map_err(|e| Error::crypto("setting up signer", e))?;
    signer
        .write_all(message.as_bytes())
        .map_err(|e| Error::crypto("signing digest", e.into()))?;
    signer
        .finalize()
        .map_err(|e| Error::crypto("signing digest", e))?;

    Ok(envelope)
}

/// A decoded signature envelope.
#[derive(Clone, Debug)]
pub struct Envelope {
    hashes: Vec<String>,
    lines: Vec<String>,
    signature: String,
}

/// Split a buffer into lines, accepting both LF and CRLF endings.
fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line))
}

impl Envelope {
    /// Parse a cleartext-signed message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::format("signature envelope", e.to_string()))?;
        let mut lines = lines(text).skip_while(|line| line.trim_end() != SIGNED_MESSAGE_HEADER);
        if lines.next().is_none() {
            return Err(Error::format(
                "signature envelope",
                "no cleartext signed message found",
            ));
        }

        let mut hashes = vec![];
        loop {
            match lines.next() {
                None => {
                    return Err(Error::format(
                        "signature envelope",
                        "unterminated armor headers",
                    ))
                }
                Some("") => break,
                Some(header) => {
                    let (key, value) = header.split_once(": ").ok_or_else(|| {
                        Error::format("signature envelope", format!("bad armor header {header:?}"))
                    })?;
                    if key == "Hash" {
                        hashes.extend(value.split(',').map(|h| h.trim().to_string()));
                    }
                }
            }
        }

        let mut plaintext = vec![];
        loop {
            match lines.next() {
                None => {
                    return Err(Error::format(
                        "signature envelope",
                        "missing signature block",
                    ))
                }
                Some(line) if line.trim_end() == SIGNATURE_HEADER => break,
                Some(line) => {
                    plaintext.push(line.strip_prefix("- ").unwrap_or(line).to_string());
                }
            }
        }

        let mut signature = String::from(SIGNATURE_HEADER);
        signature.push('\n');
        loop {
            match lines.next() {
                None => {
                    return Err(Error::format(
                        "signature envelope",
                        "unterminated signature block",
                    ))
                }
                Some(line) => {
                    signature.push_str(line);
                    signature.push('\n');
                    if line.trim_end() == SIGNATURE_FOOTER {
                        break;
                    }
                }
            }
        }

        let pile = PacketPile::from_bytes(signature.as_bytes())
            .map_err(|e| Error::format("signature envelope", format!("{e:#}")))?;
        if !pile.children().any(|p| matches!(p, Packet::Signature(_))) {
            return Err(Error::format(
                "signature envelope",
                "signature block contains no signature",
            ));
        }

        Ok(Envelope {
            hashes,
            lines: plaintext,
            signature,
        })
    }

    /// The hash algorithms named in the armor headers.
    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }

    /// The signed text, with LF line endings and no final line ending.
    pub fn plaintext(&self) -> String {
        self.lines.join("\n")
    }

    /// The armored signature block.
    pub fn armored_signature(&self) -> &str {
        &self.signature
    }

    /// The canonical form the signature was computed over: trailing whitespace removed from
    /// every line, CRLF line endings, no final line ending.
    fn signed_bytes(&self) -> Vec<u8> {
        self.lines
            .iter()
            .map(|line| line.trim_end_matches([' ', '\t']))
            .collect::<Vec<_>>()
            .join("\r\n")
            .into_bytes()
    }

    /// Check the signature against `certs`, returning the certificate that made it.
    pub fn verify<'c>(&self, certs: &'c [Cert]) -> Result<&'c Cert> {
        let policy = StandardPolicy::new();
        let helper = KeyringHelper {
            certs,
            signer: None,
        };

        let mut verifier = DetachedVerifierBuilder::from_bytes(self.signature.as_bytes())
            .and_then(|builder| builder.with_policy(&policy, None, helper))
            .map_err(|e| Error::Auth(format!("{e:#}")))?;
        verifier
            .verify_bytes(self.signed_bytes())
            .map_err(|e| Error::Auth(format!("{e:#}")))?;

        verifier
            .into_helper()
            .signer
            .ok_or_else(|| Error::Auth("no signer recorded".into()))
    }
}

/// Supplies keyring certificates to the verifier and remembers which one produced a good
/// signature.
struct KeyringHelper<'c> {
    certs: &'c [Cert],
    signer: Option<&'c Cert>,
}

impl VerificationHelper for KeyringHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> sequoia_openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    match result {
                        Ok(good) => {
                            let fingerprint = good.ka.key().fingerprint();
                            self.signer = self.certs.iter().find(|cert| {
                                cert.keys().any(|ka| ka.key().fingerprint() == fingerprint)
                            });
                            if self.signer.is_some() {
                                return Ok(());
                            }
                        }
                        Err(e) => debug!("rejected signature: {e}"),
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "no entity in the public keyring produced a valid signature"
        ))
    }
}
