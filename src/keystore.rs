//! Local OpenPGP key store.
//!
//! The key store is a directory holding two keyrings, each a plain concatenation of binary
//! OpenPGP certificates:
//!
//! ```text
//! ~/.sypgp/           (0700)
//! ├── pgp-secret      (0600) certificates with their secret key material
//! ├── pgp-public      (0600) the same certificates, public parts only
//! └── pgp-journal     only present while a key pair is being stored
//! ```
//!
//! Keyrings are append-only: entries are never modified or removed.  Each append rewrites the
//! keyring into a temporary file in the same directory and renames it over the original, so a
//! single keyring is never left half-written.
//!
//! A new key pair has to land in both keyrings.  [`KeyStore::persist_pair`] records the
//! fingerprint in a journal before touching either keyring and removes it afterwards; a journal
//! left behind by an interrupted run is replayed the next time the store is opened.
//!
//! There is no locking: concurrent writers from independent processes are not coordinated.

use std::{
    fmt,
    fs::{self, DirBuilder},
    io::{ErrorKind, Write},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, warn};
use rustix::{
    fs::{mkdirat, openat, Mode, OFlags, CWD},
    io::Errno,
};
use sequoia_openpgp::{
    cert::{Cert, CertParser},
    parse::Parse,
    serialize::Serialize,
};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub const SECRET_KEYRING: &str = "pgp-secret";
pub const PUBLIC_KEYRING: &str = "pgp-public";
const JOURNAL: &str = "pgp-journal";

/// The 20-byte fingerprint of a certificate's primary key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// The fingerprint of `cert`.  Only version 4 keys have 20-byte fingerprints.
    pub fn of(cert: &Cert) -> Result<Self> {
        let fpr = cert.fingerprint();
        <[u8; 20]>::try_from(fpr.as_bytes())
            .map(Fingerprint)
            .map_err(|_| Error::format("key", format!("unsupported fingerprint {fpr}")))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this is the fingerprint of `cert`.
    pub fn matches(&self, cert: &Cert) -> bool {
        cert.fingerprint().as_bytes() == self.0
    }

    /// The low 32 bits, in the style of a short key ID.
    pub fn short_id(&self) -> String {
        hex::encode_upper(&self.0[16..])
    }
}

impl From<[u8; 20]> for Fingerprint {
    fn from(value: [u8; 20]) -> Self {
        Fingerprint(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = hex::FromHexError;

    /// Parse 40 hex digits; whitespace between groups is ignored.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut value = [0u8; 20];
        hex::decode_to_slice(digits, &mut value)?;
        Ok(Fingerprint(value))
    }
}

fn serialize_error(cert: &Cert, e: anyhow::Error) -> Error {
    Error::io(
        format!("serializing {}", cert.fingerprint()),
        std::io::Error::other(e),
    )
}

fn find<'c>(certs: &'c [Cert], fingerprint: &Fingerprint) -> Option<&'c Cert> {
    certs.iter().find(|cert| fingerprint.matches(cert))
}

/// A key store directory containing a secret and a public keyring.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Use the key store in `dir`.  Nothing is created until the store is first accessed.
    pub fn open_path(dir: impl Into<PathBuf>) -> Self {
        KeyStore { dir: dir.into() }
    }

    /// Use the default per-user key store, `$HOME/.sypgp`.
    pub fn open_user() -> Result<Self> {
        let home = std::env::var_os("HOME").ok_or_else(|| {
            Error::io(
                "locating the user key store",
                std::io::Error::new(ErrorKind::NotFound, "$HOME is not set"),
            )
        })?;
        Ok(Self::open_path(PathBuf::from(home).join(".sypgp")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn secret_path(&self) -> PathBuf {
        self.dir.join(SECRET_KEYRING)
    }

    pub fn public_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEYRING)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL)
    }

    /// Create the store directory and both keyring files, if they don't exist yet.
    fn ensure_files(&self) -> Result<()> {
        if let Some(parent) = self.dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }

        match mkdirat(CWD, self.dir.as_path(), Mode::from_raw_mode(0o700)) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(e) => {
                return Err(Error::io(
                    format!("creating key store directory {}", self.dir.display()),
                    e.into(),
                ))
            }
        }

        for path in [self.secret_path(), self.public_path()] {
            openat(
                CWD,
                path.as_path(),
                OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
                Mode::from_raw_mode(0o600),
            )
            .map_err(|e| Error::io(format!("creating keyring {}", path.display()), e.into()))?;
        }

        Ok(())
    }

    /// Create the store if needed and finish any interrupted key pair write.
    pub fn ensure_store(&self) -> Result<()> {
        self.ensure_files()?;
        self.replay_journal()
    }

    fn read_keyring(&self, path: &Path) -> Result<Vec<Cert>> {
        let data = fs::read(path)
            .map_err(|e| Error::io(format!("reading keyring {}", path.display()), e))?;
        if data.is_empty() {
            return Ok(vec![]);
        }

        let certs = CertParser::from_bytes(&data)
            .and_then(|parser| parser.collect::<sequoia_openpgp::Result<Vec<_>>>())
            .map_err(|e| Error::format("keyring", format!("{}: {e:#}", path.display())))?;
        debug!("read {} entities from {}", certs.len(), path.display());
        Ok(certs)
    }

    /// Load all entities of the secret keyring.
    pub fn load_private(&self) -> Result<Vec<Cert>> {
        self.ensure_store()?;
        self.read_keyring(&self.secret_path())
    }

    /// Load all entities of the public keyring.
    pub fn load_public(&self) -> Result<Vec<Cert>> {
        self.ensure_store()?;
        self.read_keyring(&self.public_path())
    }

    fn append(
        &self,
        path: &Path,
        write: impl FnOnce(&mut NamedTempFile) -> Result<()>,
    ) -> Result<()> {
        let context = || format!("appending to keyring {}", path.display());
        self.ensure_files()?;

        let existing = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => vec![],
            Err(e) => return Err(Error::io(context(), e)),
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(context(), e))?;
        tmp.write_all(&existing)
            .map_err(|e| Error::io(context(), e))?;
        write(&mut tmp)?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(context(), e))?;
        tmp.persist(path)
            .map_err(|e| Error::io(context(), e.error))?;
        Ok(())
    }

    /// Append the secret form of `cert` (including its possibly encrypted secret key material) to
    /// the secret keyring.
    pub fn append_private(&self, cert: &Cert) -> Result<()> {
        let path = self.secret_path();
        self.append(&path, |out| {
            cert.as_tsk()
                .serialize(out)
                .map_err(|e| serialize_error(cert, e))
        })
    }

    /// Append the public form of `cert` to the public keyring.
    pub fn append_public(&self, cert: &Cert) -> Result<()> {
        let path = self.public_path();
        self.append(&path, |out| cert.serialize(out).map_err(|e| serialize_error(cert, e)))
    }

    /// Store a newly generated key pair in both keyrings.
    ///
    /// The write is journaled: if the process dies between the two appends, the next
    /// [`KeyStore::ensure_store`] completes it.  An error from either append is returned as is; in
    /// that case the journal stays behind as well.
    pub fn persist_pair(&self, cert: &Cert) -> Result<()> {
        let fingerprint = Fingerprint::of(cert)?;
        self.ensure_store()?;

        let journal = self.journal_path();
        let context = || format!("writing journal {}", journal.display());
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(context(), e))?;
        writeln!(tmp, "{fingerprint}").map_err(|e| Error::io(context(), e))?;
        tmp.persist(&journal)
            .map_err(|e| Error::io(context(), e.error))?;

        self.append_private(cert)?;
        self.append_public(cert)?;

        fs::remove_file(&journal).map_err(|e| Error::io(context(), e))?;
        debug!("stored key pair {fingerprint} in {}", self.dir.display());
        Ok(())
    }

    fn replay_journal(&self) -> Result<()> {
        let journal = self.journal_path();
        let content = match fs::read_to_string(&journal) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(format!("reading journal {}", journal.display()), e)),
        };

        match content.trim().parse::<Fingerprint>() {
            Ok(fingerprint) => {
                let secret = self.read_keyring(&self.secret_path())?;
                let public = self.read_keyring(&self.public_path())?;
                match find(&secret, &fingerprint) {
                    Some(cert) if find(&public, &fingerprint).is_none() => {
                        warn!("completing interrupted write of key pair {fingerprint}");
                        self.append_public(cert)?;
                    }
                    Some(_) => {}
                    None => warn!("discarding interrupted write of key pair {fingerprint}"),
                }
            }
            Err(e) => warn!("discarding corrupt journal {}: {e}", journal.display()),
        }

        fs::remove_file(&journal)
            .map_err(|e| Error::io(format!("removing journal {}", journal.display()), e))
    }
}
