//! Key pair generation.
//!
//! New key pairs are bound to an identity collected from the operator through an
//! [`IdentityPrompt`].  [`TerminalPrompt`] asks interactively; [`FixedIdentity`] answers from
//! values known in advance.

use std::io::{self, BufRead, Write};

use log::info;
use sequoia_openpgp::{
    cert::{Cert, CertBuilder, CipherSuite},
    crypto::Password,
};

use crate::{
    error::{Error, Result},
    keystore::KeyStore,
};

/// The identity fields bound to a new key pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub comment: String,
}

impl Identity {
    /// The OpenPGP user ID, `Name (comment) <email>`.
    pub fn user_id(&self) -> String {
        let mut uid = self.name.trim().to_string();
        let comment = self.comment.trim();
        if !comment.is_empty() {
            uid.push_str(&format!(" ({comment})"));
        }
        let email = self.email.trim();
        if !email.is_empty() {
            uid.push_str(&format!(" <{email}>"));
        }
        uid.trim_start().to_string()
    }
}

/// A source of identity fields for key generation.
pub trait IdentityPrompt {
    fn read_identity(&mut self) -> io::Result<Identity>;
}

/// Asks for the identity on a text stream, one line per field.
#[derive(Debug)]
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
}

impl TerminalPrompt<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        TerminalPrompt::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        TerminalPrompt { input, output }
    }

    fn ask(&mut self, prompt: &str) -> io::Result<String> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of input while reading identity",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl<R: BufRead, W: Write> IdentityPrompt for TerminalPrompt<R, W> {
    fn read_identity(&mut self) -> io::Result<Identity> {
        let name = self.ask("Enter your name (e.g., John Doe) : ")?;
        let email = self.ask("Enter your email address (e.g., john.doe@example.com) : ")?;
        let comment = self.ask("Enter optional comment (e.g., development keys) : ")?;
        Ok(Identity {
            name,
            email,
            comment,
        })
    }
}

/// Supplies a predetermined identity.
#[derive(Clone, Debug)]
pub struct FixedIdentity(pub Identity);

impl IdentityPrompt for FixedIdentity {
    fn read_identity(&mut self) -> io::Result<Identity> {
        Ok(self.0.clone())
    }
}

/// Parameters for new key pairs.
///
/// Binding signatures are made with sequoia's default hash algorithm, SHA-512.  Image signatures
/// always use SHA-384 regardless of these options.
#[derive(Clone, Debug)]
pub struct KeyGenOptions {
    pub cipher_suite: CipherSuite,
    /// Protect the secret key material with this password.
    pub password: Option<Password>,
}

impl Default for KeyGenOptions {
    fn default() -> Self {
        KeyGenOptions {
            cipher_suite: CipherSuite::RSA4k,
            password: None,
        }
    }
}

/// Generates key pairs and stores them in a [`KeyStore`].
#[derive(Debug)]
pub struct KeyPairGenerator<'a> {
    store: &'a KeyStore,
    options: KeyGenOptions,
}

impl<'a> KeyPairGenerator<'a> {
    pub fn new(store: &'a KeyStore, options: KeyGenOptions) -> Self {
        KeyPairGenerator { store, options }
    }

    /// Create a certificate for `identity` without storing it.
    pub fn build(&self, identity: &Identity) -> Result<Cert> {
        let (cert, _revocation) = CertBuilder::general_purpose(
            self.options.cipher_suite.clone(),
            Some(identity.user_id()),
        )
        .set_password(self.options.password.clone())
        .generate()
        .map_err(|e| Error::crypto("generating key pair", e))?;
        Ok(cert)
    }

    /// Ask for an identity, generate a key pair for it and add it to both keyrings.
    pub fn generate(&self, prompt: &mut dyn IdentityPrompt) -> Result<Cert> {
        self.store.ensure_store()?;
        let identity = prompt
            .read_identity()
            .map_err(|e| Error::io("reading identity", e))?;

        info!(
            "generating {:?} key pair for {:?}",
            self.options.cipher_suite,
            identity.user_id()
        );
        let cert = self.build(&identity)?;
        self.store.persist_pair(&cert)?;
        info!("generated key {}", cert.fingerprint());

        Ok(cert)
    }
}
