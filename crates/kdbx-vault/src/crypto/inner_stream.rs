//! Inner keystream for protected fields.
//!
//! Protected values are XOR'd with a stateful keystream seeded from the
//! header's inner-stream key. The stream cannot be seeked: fields must be
//! processed in the exact order they appear in the document, on both the
//! read and the write side. A single `InnerStream` instance is therefore
//! threaded through an entire import or export pass.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Fixed Salsa20 nonce used by the KDBX 3.1 inner stream.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner stream algorithm ids as stored in the header.
pub const STREAM_ID_NONE: u32 = 0;
pub const STREAM_ID_ARC4: u32 = 1;
pub const STREAM_ID_SALSA20: u32 = 2;
pub const STREAM_ID_CHACHA20: u32 = 3;

/// The stateful protected-field cipher.
pub enum InnerStream {
    /// Fields are stored in the clear (allowed, discouraged).
    Plain,
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

impl InnerStream {
    /// Construct from the header's stream id and key material.
    ///
    /// ARC4 is obsolete and rejected outright.
    pub fn new(stream_id: u32, key: &[u8]) -> Result<Self> {
        match stream_id {
            STREAM_ID_NONE => Ok(InnerStream::Plain),
            STREAM_ID_SALSA20 => {
                let key: [u8; 32] = Sha256::digest(key).into();
                Ok(InnerStream::Salsa20(Box::new(Salsa20::new(
                    &key.into(),
                    &SALSA20_NONCE.into(),
                ))))
            }
            STREAM_ID_CHACHA20 => {
                let hash: [u8; 64] = Sha512::digest(key).into();
                let key: [u8; 32] = hash[0..32].try_into().unwrap();
                let nonce: [u8; 12] = hash[32..44].try_into().unwrap();
                Ok(InnerStream::ChaCha20(Box::new(ChaCha20::new(
                    &key.into(),
                    &nonce.into(),
                ))))
            }
            // No UUID exists for inner streams; report the id in the nil slot.
            _ => Err(Error::UnknownCipher(Uuid::from_u128(stream_id as u128))),
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`, advancing
    /// the stream position.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            InnerStream::Plain => {}
            InnerStream::Salsa20(cipher) => cipher.apply_keystream(data),
            InnerStream::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salsa20_round_trip_in_order() {
        let key = [0x33u8; 64];
        let mut enc = InnerStream::new(STREAM_ID_SALSA20, &key).unwrap();
        let mut dec = InnerStream::new(STREAM_ID_SALSA20, &key).unwrap();

        let mut first = b"password-one".to_vec();
        let mut second = b"password-two".to_vec();
        enc.apply(&mut first);
        enc.apply(&mut second);

        dec.apply(&mut first);
        dec.apply(&mut second);
        assert_eq!(first, b"password-one");
        assert_eq!(second, b"password-two");
    }

    #[test]
    fn out_of_order_decryption_garbles() {
        let key = [0x33u8; 64];
        let mut enc = InnerStream::new(STREAM_ID_CHACHA20, &key).unwrap();
        let mut dec = InnerStream::new(STREAM_ID_CHACHA20, &key).unwrap();

        let mut first = b"aaaaaa".to_vec();
        let mut second = b"bbbbbb".to_vec();
        enc.apply(&mut first);
        enc.apply(&mut second);

        // Decrypt in the wrong order: positions no longer line up.
        dec.apply(&mut second);
        assert_ne!(second, b"bbbbbb");
    }

    #[test]
    fn arc4_is_rejected() {
        assert!(InnerStream::new(STREAM_ID_ARC4, &[0u8; 32]).is_err());
    }

    #[test]
    fn plain_stream_is_identity() {
        let mut stream = InnerStream::new(STREAM_ID_NONE, &[]).unwrap();
        let mut data = b"visible".to_vec();
        stream.apply(&mut data);
        assert_eq!(data, b"visible");
    }
}
