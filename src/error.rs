//! Error types for sifsig.
//!
//! Every fallible operation in the library returns [`Result<T>`], an alias for
//! `Result<T, Error>`.  The variants of [`Error`] form a closed taxonomy so that callers can tell
//! apart an image that was never signed, an image that was modified after signing, and an image
//! signed by a key that isn't trusted.
//!
//! The signing and verification orchestrators additionally wrap failures in a [`StageError`]
//! recording which step of the operation failed.

use std::fmt;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The broad category of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Format,
    NotFound,
    Integrity,
    Auth,
    Crypto,
}

/// Error type for signing, verification and key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening, reading, writing or creating a file failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// An image, keyring or signature envelope could not be parsed.
    #[error("malformed {what}: {reason}")]
    Format { what: &'static str, reason: String },

    /// A required data object (default group partition, signature) is missing.
    #[error("{0} not found")]
    NotFound(String),

    /// The digest recorded in the signature doesn't match the image content.
    #[error("SIF hash string mismatch: signed {signed:?}, calculated {calculated:?}")]
    Integrity { signed: String, calculated: String },

    /// A credential was rejected, or no trusted key produced the signature.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Key generation or a signing primitive failed.
    #[error("{context}: {source}")]
    Crypto {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } => ErrorKind::Io,
            Error::Format { .. } => ErrorKind::Format,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Crypto { .. } => ErrorKind::Crypto,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn format(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Format {
            what,
            reason: reason.into(),
        }
    }

    pub(crate) fn crypto(context: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Crypto {
            context: context.into(),
            source,
        }
    }
}

/// A step of the signing or verification state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    LoadKeys,
    EnsureKeyExists,
    SelectKey,
    DecryptKey,
    LoadImage,
    Digest,
    Sign,
    Embed,
    ExtractSignature,
    DecodeEnvelope,
    CompareDigest,
    LoadPublicKeys,
    CheckSignature,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::LoadKeys => "loading private keyring",
            Stage::EnsureKeyExists => "generating key pair",
            Stage::SelectKey => "selecting signing key",
            Stage::DecryptKey => "decrypting signing key",
            Stage::LoadImage => "loading image",
            Stage::Digest => "computing image digest",
            Stage::Sign => "signing digest",
            Stage::Embed => "embedding signature",
            Stage::ExtractSignature => "extracting signature",
            Stage::DecodeEnvelope => "decoding signature envelope",
            Stage::CompareDigest => "comparing digests",
            Stage::LoadPublicKeys => "loading public keyring",
            Stage::CheckSignature => "checking signature",
        })
    }
}

/// An [`Error`] tagged with the [`Stage`] at which a sign or verify operation failed.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Attach a [`Stage`] to the error of a fallible step.
pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|source| {
            log::debug!("{stage} failed: {source}");
            StageError { stage, source }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stage_error_message() {
        let err: std::result::Result<(), _> =
            Err(Error::NotFound("signature object".into())).at(Stage::ExtractSignature);
        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "extracting signature failed: signature object not found"
        );
    }

    #[test]
    fn test_kinds() {
        let io = Error::io("reading", std::io::ErrorKind::NotFound.into());
        assert_eq!(io.kind(), ErrorKind::Io);
        assert_eq!(Error::format("image", "short").kind(), ErrorKind::Format);
        assert_eq!(Error::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(
            Error::crypto("keygen", anyhow::anyhow!("boom")).kind(),
            ErrorKind::Crypto
        );
    }
}
