//! kdbx-vault - KeePass-compatible encrypted vault engine
//!
//! This crate reads and writes the KDB (KeePass 1.x) and KDBX 3.1/4.x
//! (KeePass 2.x) file formats: versioned headers, AES-KDF and Argon2 key
//! derivation, authenticated block streams, the inner stream protecting
//! individual fields, plus an in-memory tree model with transactional
//! mutations, field-selective search and `{REF:…}` resolution.

pub mod codec;
pub mod crypto;
pub mod db;
pub mod error;
pub mod format;
pub mod keys;
pub mod search;
pub mod session;
pub mod spr;
pub mod variant;

pub use db::{Database, Entry, EntryBuilder, FormatVersion, Group};
pub use error::{Error, Result};
pub use keys::MasterCredential;
pub use search::{search, SearchParameters};
pub use session::Session;

// Re-export types that users might need
pub use uuid::Uuid;

/// Decrypt a database from raw bytes, auto-detecting the format.
pub fn open_database(data: &[u8], credential: &MasterCredential) -> Result<Database> {
    format::open(data, credential)
}

/// Encrypt a database to bytes in its configured format version.
pub fn save_database(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    format::save(database, credential)
}
