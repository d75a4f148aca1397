pub mod digest;
pub mod display;
pub mod embed;
pub mod envelope;
pub mod error;
pub mod keygen;
pub mod keystore;
pub mod sif;
pub mod sign;
pub mod verify;


pub use error::{Error, ErrorKind, Result, Stage, StageError};
pub use sign::{sign, ImageSigner, SignOutcome};
pub use verify::{verify, ImageVerifier, SignerIdentity};
