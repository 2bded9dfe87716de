//! File format detection and the import/export entry points.

pub mod kdb;
pub mod kdbx;

use crate::codec;
use crate::db::{Database, FormatVersion};
use crate::error::{Error, Result};
use crate::keys::MasterCredential;

/// Common first signature of every KeePass file.
pub const SIG1: u32 = 0x9AA2_D903;
/// Second signature of KDBX (2.x) files.
pub const SIG2_KDBX: u32 = 0xB54B_FB67;
/// Second signature of legacy KDB (1.x) files.
pub const SIG2_KDB: u32 = 0xB54B_FB65;

/// Identify the container format from the leading signature pair.
pub fn detect(data: &[u8]) -> Result<FormatVersion> {
    let mut cursor = data;
    let sig1 = codec::read_u32(codec::take(&mut cursor, 4)?);
    let sig2 = codec::read_u32(codec::take(&mut cursor, 4)?);
    if sig1 != SIG1 {
        return Err(Error::InvalidSignature);
    }
    match sig2 {
        SIG2_KDB => Ok(FormatVersion::Kdb),
        SIG2_KDBX => kdbx::peek_version(data),
        _ => Err(Error::InvalidSignature),
    }
}

/// Decrypt and parse a database in whichever format the bytes carry.
pub fn open(data: &[u8], credential: &MasterCredential) -> Result<Database> {
    match detect(data)? {
        FormatVersion::Kdb => kdb::open(data, credential),
        _ => kdbx::open(data, credential),
    }
}

/// Serialize and encrypt a database in its configured format.
pub fn save(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    match database.settings.version {
        FormatVersion::Kdb => kdb::save(database, credential),
        _ => kdbx::save(database, credential),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_rejected() {
        assert!(detect(&[0x03, 0xD9]).is_err());
    }

    #[test]
    fn wrong_first_signature_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(&SIG2_KDBX.to_le_bytes());
        assert!(matches!(detect(&data), Err(Error::InvalidSignature)));
    }

    #[test]
    fn kdb_signature_is_detected() {
        let mut data = Vec::new();
        data.extend_from_slice(&SIG1.to_le_bytes());
        data.extend_from_slice(&SIG2_KDB.to_le_bytes());
        data.extend_from_slice(&[0u8; 116]);
        assert_eq!(detect(&data).unwrap(), FormatVersion::Kdb);
    }
}
