//! Outer data cipher and the key schedule around it.
//!
//! The database body is AES-256-CBC with PKCS#7 padding. The final
//! symmetric key is SHA-256(master seed ‖ transformed key); KDBX 4
//! additionally derives an HMAC base key with SHA-512.

use aes::Aes256;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keys::SecretKey;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256-CBC: 31c1f2e6-bf71-4350-be58-05216afc5aff
pub const CIPHER_AES256: Uuid = Uuid::from_bytes([
    0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A,
    0xFF,
]);

/// The outer data cipher. Only AES-256 is implemented; any other UUID is
/// rejected rather than defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCipher {
    Aes256,
}

impl DataCipher {
    pub fn from_uuid(uuid: &Uuid) -> Result<Self> {
        if *uuid == CIPHER_AES256 {
            Ok(DataCipher::Aes256)
        } else {
            Err(Error::UnknownCipher(*uuid))
        }
    }

    pub fn uuid(&self) -> Uuid {
        CIPHER_AES256
    }

    pub fn iv_len(&self) -> usize {
        16
    }
}

/// Final symmetric key: SHA-256(master seed ‖ transformed key).
pub fn master_key(master_seed: &[u8], transformed: &SecretKey) -> SecretKey {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed.0);
    SecretKey(hasher.finalize().into())
}

/// KDBX 4 HMAC base key: SHA-512(master seed ‖ transformed key ‖ 0x01).
pub fn hmac_base_key(master_seed: &[u8], transformed: &SecretKey) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed.0);
    hasher.update([0x01]);
    hasher.finalize().into()
}

pub fn encrypt(cipher: DataCipher, key: &SecretKey, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        DataCipher::Aes256 => {
            let enc = Aes256CbcEnc::new_from_slices(&key.0, iv)
                .map_err(|_| Error::malformed("bad AES key/IV length"))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
    }
}

/// Decrypt the body. A padding failure here means wrong credentials or a
/// corrupt file; the two are indistinguishable.
pub fn decrypt(cipher: DataCipher, key: &SecretKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        DataCipher::Aes256 => {
            let dec = Aes256CbcDec::new_from_slices(&key.0, iv)
                .map_err(|_| Error::malformed("bad AES key/IV length"))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::IntegrityCheckFailed)
        }
    }
}
