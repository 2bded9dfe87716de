//! Error types for kdbx-vault

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for kdbx-vault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading, writing or mutating a database
#[derive(Error, Debug)]
pub enum Error {
    /// The file does not start with the KDB/KDBX magic bytes
    #[error("invalid file signature")]
    InvalidSignature,

    /// The file signature is known but the version is outside the supported range
    #[error("unsupported format version: {0:#010x}")]
    UnsupportedVersion(u32),

    /// The outer cipher (or v3 algorithm flag) is not one we implement
    #[error("unknown or unsupported cipher: {0}")]
    UnknownCipher(Uuid),

    /// The KDF UUID in the header does not match any registered engine
    #[error("unknown key derivation function: {0}")]
    UnknownKdf(Uuid),

    /// Decryption produced data that fails its integrity check.
    ///
    /// Wrong credentials and file corruption are indistinguishable here
    /// and are intentionally reported as a single kind.
    #[error("integrity check failed: wrong credentials or corrupt file")]
    IntegrityCheckFailed,

    /// Truncated or structurally invalid binary record or XML element
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// KDF parameters outside their documented bounds
    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParameters(String),

    /// Entry not found in the tree
    #[error("entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Group not found in the tree
    #[error("group not found: {0}")]
    GroupNotFound(Uuid),

    /// A structural mutation was rejected (cycle, root deletion, ...)
    #[error("invalid tree operation: {0}")]
    InvalidMove(String),

    /// Underlying stream error
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Shorthand for `MalformedRecord` from anything displayable.
    pub(crate) fn malformed(msg: impl std::fmt::Display) -> Self {
        Error::MalformedRecord(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
