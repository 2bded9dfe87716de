//! Block integrity streams.
//!
//! KDBX 3.1 splits the decrypted plaintext into hashed blocks
//! (index, SHA-256, length, data). KDBX 4 splits the ciphertext into
//! HMAC'd blocks (HMAC, length, data) keyed per block index, so
//! truncation or tampering is detected before the parser ever runs.
//! Both streams end with a zero-length block.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::codec;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// 1 MiB, the block size KeePass writes.
const BLOCK_SIZE: usize = 1024 * 1024;

/// Decode a KDBX 3.1 hashed block stream, verifying each block digest.
pub fn read_hashed_blocks(data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = data;
    let mut out = Vec::new();
    let mut expected_index = 0u32;

    loop {
        let index = codec::read_u32(codec::take(&mut cursor, 4)?);
        if index != expected_index {
            return Err(Error::IntegrityCheckFailed);
        }
        let hash: [u8; 32] = codec::take(&mut cursor, 32)?.try_into().unwrap();
        let size = codec::read_u32(codec::take(&mut cursor, 4)?) as usize;

        if size == 0 {
            if hash != [0u8; 32] {
                return Err(Error::IntegrityCheckFailed);
            }
            break;
        }

        let block = codec::take(&mut cursor, size)?;
        let digest: [u8; 32] = Sha256::digest(block).into();
        if digest != hash {
            return Err(Error::IntegrityCheckFailed);
        }
        out.extend_from_slice(block);
        expected_index += 1;
    }
    Ok(out)
}

/// Encode plaintext as a KDBX 3.1 hashed block stream.
pub fn write_hashed_blocks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 64);
    for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        out.extend_from_slice(&codec::write_u32(index as u32));
        let digest: [u8; 32] = Sha256::digest(chunk).into();
        out.extend_from_slice(&digest);
        out.extend_from_slice(&codec::write_u32(chunk.len() as u32));
        out.extend_from_slice(chunk);
    }
    let final_index = data.chunks(BLOCK_SIZE).count() as u32;
    out.extend_from_slice(&codec::write_u32(final_index));
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&codec::write_u32(0));
    out
}

/// Per-block HMAC key: SHA-512(block index ‖ base key).
///
/// Index `u64::MAX` yields the header HMAC key.
pub fn hmac_block_key(block_index: u64, base_key: &[u8; 64]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(base_key);
    hasher.finalize().into()
}

fn block_mac(block_index: u64, base_key: &[u8; 64], size: u32, data: &[u8]) -> [u8; 32] {
    let key = hmac_block_key(block_index, base_key);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(&block_index.to_le_bytes());
    mac.update(&size.to_le_bytes());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HMAC over arbitrary bytes with the key for index `u64::MAX`,
/// used to authenticate the KDBX 4 header.
pub fn header_mac(base_key: &[u8; 64], header: &[u8]) -> [u8; 32] {
    let key = hmac_block_key(u64::MAX, base_key);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(header);
    mac.finalize().into_bytes().into()
}

/// Decode a KDBX 4 HMAC block stream, verifying each block.
pub fn read_hmac_blocks(data: &[u8], base_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut cursor = data;
    let mut out = Vec::new();
    let mut block_index = 0u64;

    loop {
        let stored_mac: [u8; 32] = codec::take(&mut cursor, 32)?.try_into().unwrap();
        let size = codec::read_u32(codec::take(&mut cursor, 4)?) as usize;
        let block = codec::take(&mut cursor, size)?;

        let computed = block_mac(block_index, base_key, size as u32, block);
        if computed != stored_mac {
            return Err(Error::IntegrityCheckFailed);
        }
        if size == 0 {
            break;
        }
        out.extend_from_slice(block);
        block_index += 1;
    }
    Ok(out)
}

/// Encode ciphertext as a KDBX 4 HMAC block stream.
pub fn write_hmac_blocks(data: &[u8], base_key: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 64);
    let mut block_index = 0u64;
    for chunk in data.chunks(BLOCK_SIZE) {
        let mac = block_mac(block_index, base_key, chunk.len() as u32, chunk);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&codec::write_u32(chunk.len() as u32));
        out.extend_from_slice(chunk);
        block_index += 1;
    }
    let mac = block_mac(block_index, base_key, 0, &[]);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&codec::write_u32(0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_blocks_round_trip() {
        let data = vec![0xABu8; 5000];
        let stream = write_hashed_blocks(&data);
        assert_eq!(read_hashed_blocks(&stream).unwrap(), data);
    }

    #[test]
    fn hashed_blocks_detect_flip() {
        let data = vec![0xABu8; 5000];
        let mut stream = write_hashed_blocks(&data);
        stream[100] ^= 0x01;
        assert!(matches!(
            read_hashed_blocks(&stream),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn hmac_blocks_round_trip() {
        let base_key = [0x55u8; 64];
        let data = vec![0x10u8; 3000];
        let stream = write_hmac_blocks(&data, &base_key);
        assert_eq!(read_hmac_blocks(&stream, &base_key).unwrap(), data);
    }

    #[test]
    fn hmac_blocks_detect_flip_anywhere() {
        let base_key = [0x55u8; 64];
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let clean = write_hmac_blocks(&data, &base_key);
        for pos in [0, 40, clean.len() / 2, clean.len() - 1] {
            let mut stream = clean.clone();
            stream[pos] ^= 0x80;
            assert!(
                read_hmac_blocks(&stream, &base_key).is_err(),
                "flip at {pos} went undetected"
            );
        }
    }

    #[test]
    fn hmac_blocks_reject_wrong_key() {
        let data = vec![1u8; 100];
        let stream = write_hmac_blocks(&data, &[0u8; 64]);
        assert!(read_hmac_blocks(&stream, &[1u8; 64]).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let stream = write_hashed_blocks(&[1, 2, 3]);
        assert!(read_hashed_blocks(&stream[..stream.len() - 10]).is_err());
    }

    #[test]
    fn empty_payload_round_trips() {
        let base_key = [9u8; 64];
        let stream = write_hmac_blocks(&[], &base_key);
        assert_eq!(read_hmac_blocks(&stream, &base_key).unwrap(), Vec::<u8>::new());
    }
}
