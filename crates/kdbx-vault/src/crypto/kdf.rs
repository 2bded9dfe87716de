//! Key derivation engines and their UUID registry.
//!
//! Engine selection is strictly by UUID: an unrecognized UUID is a fatal
//! [`Error::UnknownKdf`], never a guessed fallback.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keys::SecretKey;
use crate::variant::VariantDictionary;

/// AES-KDF (KDBX 3.x default): c9d9f39a-628a-4460-bf74-0d08c18a4fea
pub const KDF_AES: Uuid = Uuid::from_bytes([
    0xC9, 0xD9, 0xF3, 0x9A, 0x62, 0x8A, 0x44, 0x60, 0xBF, 0x74, 0x0D, 0x08, 0xC1, 0x8A, 0x4F,
    0xEA,
]);

/// Argon2d: ef636ddf-8c29-444b-91f7-a9a403e30a0c
pub const KDF_ARGON2D: Uuid = Uuid::from_bytes([
    0xEF, 0x63, 0x6D, 0xDF, 0x8C, 0x29, 0x44, 0x4B, 0x91, 0xF7, 0xA9, 0xA4, 0x03, 0xE3, 0x0A,
    0x0C,
]);

/// Argon2id: 9e298b19-56db-4773-b23d-fc3ec6f0a1e6
pub const KDF_ARGON2ID: Uuid = Uuid::from_bytes([
    0x9E, 0x29, 0x8B, 0x19, 0x56, 0xDB, 0x47, 0x73, 0xB2, 0x3D, 0xFC, 0x3E, 0xC6, 0xF0, 0xA1,
    0xE6,
]);

// VariantDictionary keys, as written by KeePass 2.x.
const PARAM_UUID: &str = "$UUID";
const PARAM_ROUNDS: &str = "R"; // AES-KDF, UInt64
const PARAM_SEED: &str = "S"; // AES-KDF, 32 bytes (shared name with Argon2 salt)
const PARAM_SALT: &str = "S"; // Argon2, byte array
const PARAM_PARALLELISM: &str = "P"; // Argon2, UInt32
const PARAM_MEMORY: &str = "M"; // Argon2, UInt64, bytes
const PARAM_ITERATIONS: &str = "I"; // Argon2, UInt64
const PARAM_VERSION: &str = "V"; // Argon2, UInt32
const PARAM_SECRET_KEY: &str = "K"; // Argon2, byte array, optional
const PARAM_ASSOC_DATA: &str = "A"; // Argon2, byte array, optional

pub const DEFAULT_AES_ROUNDS: u64 = 6000;
const DEFAULT_ARGON2_ITERATIONS: u64 = 3;
const DEFAULT_ARGON2_MEMORY_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_ARGON2_PARALLELISM: u32 = 2;

const MIN_ARGON2_MEMORY_KIB: u64 = 8192;
const MAX_ARGON2_MEMORY_KIB: u64 = i32::MAX as u64;
const MAX_ARGON2_PARALLELISM: u32 = (1 << 24) - 1;

/// KDF parameters: the engine UUID plus its algorithm-specific scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParameters {
    pub uuid: Uuid,
    pub dict: VariantDictionary,
}

impl KdfParameters {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            dict: VariantDictionary::new(),
        }
    }

    /// Parse from the VariantDictionary wire form in a KDBX 4 header.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let dict = VariantDictionary::deserialize(data)?;
        let uuid_bytes = dict
            .get_bytes(PARAM_UUID)
            .ok_or_else(|| Error::malformed("KDF parameters lack $UUID"))?;
        let uuid = crate::codec::uuid_from_bytes(uuid_bytes)?;
        Ok(Self { uuid, dict })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut dict = self.dict.clone();
        dict.set_bytes(PARAM_UUID, self.uuid.as_bytes().to_vec());
        dict.serialize()
    }
}

/// A key derivation engine.
///
/// `derive` must be deterministic: identical inputs always produce the
/// identical 32-byte key.
pub trait KdfEngine: Sync {
    fn uuid(&self) -> Uuid;

    /// Stretch the composite key into the 32-byte transformed key.
    fn derive(&self, composite: &SecretKey, params: &KdfParameters) -> Result<SecretKey>;

    /// Sensible default cost parameters for newly created databases.
    fn default_parameters(&self) -> KdfParameters;

    /// Re-fill the salt/seed fields with fresh CSPRNG output.
    fn randomize(&self, params: &mut KdfParameters);
}

/// AES-KDF: encrypt the composite key `rounds` times with AES-256-ECB
/// keyed by the transform seed, then SHA-256 the result.
pub struct AesKdf;

impl KdfEngine for AesKdf {
    fn uuid(&self) -> Uuid {
        KDF_AES
    }

    fn derive(&self, composite: &SecretKey, params: &KdfParameters) -> Result<SecretKey> {
        let seed = params
            .dict
            .get_bytes(PARAM_SEED)
            .ok_or_else(|| Error::InvalidKdfParameters("AES-KDF seed missing".into()))?;
        let rounds = params
            .dict
            .get_u64(PARAM_ROUNDS)
            .ok_or_else(|| Error::InvalidKdfParameters("AES-KDF rounds missing".into()))?;
        if seed.len() != 32 {
            return Err(Error::InvalidKdfParameters(
                "AES-KDF seed must be 32 bytes".into(),
            ));
        }
        Ok(transform_aes(composite, seed, rounds))
    }

    fn default_parameters(&self) -> KdfParameters {
        let mut params = KdfParameters::new(KDF_AES);
        params.dict.set_u64(PARAM_ROUNDS, DEFAULT_AES_ROUNDS);
        params.dict.set_bytes(PARAM_SEED, vec![0u8; 32]);
        params
    }

    fn randomize(&self, params: &mut KdfParameters) {
        let mut seed = vec![0u8; 32];
        OsRng.fill_bytes(&mut seed);
        params.dict.set_bytes(PARAM_SEED, seed);
    }
}

pub(crate) fn transform_aes(composite: &SecretKey, seed: &[u8], rounds: u64) -> SecretKey {
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut data = composite.0;
    for _ in 0..rounds {
        let (lo, hi) = data.split_at_mut(16);
        cipher.encrypt_block(GenericArray::from_mut_slice(lo));
        cipher.encrypt_block(GenericArray::from_mut_slice(hi));
    }
    SecretKey(Sha256::digest(data).into())
}

/// Argon2 in its d or id variant, via the `argon2` crate.
pub struct Argon2Kdf {
    algorithm: Algorithm,
}

impl Argon2Kdf {
    pub const fn argon2d() -> Self {
        Self {
            algorithm: Algorithm::Argon2d,
        }
    }

    pub const fn argon2id() -> Self {
        Self {
            algorithm: Algorithm::Argon2id,
        }
    }
}

impl KdfEngine for Argon2Kdf {
    fn uuid(&self) -> Uuid {
        match self.algorithm {
            Algorithm::Argon2id => KDF_ARGON2ID,
            _ => KDF_ARGON2D,
        }
    }

    fn derive(&self, composite: &SecretKey, params: &KdfParameters) -> Result<SecretKey> {
        let salt = params
            .dict
            .get_bytes(PARAM_SALT)
            .ok_or_else(|| Error::InvalidKdfParameters("Argon2 salt missing".into()))?;
        let memory_bytes = params
            .dict
            .get_u64(PARAM_MEMORY)
            .ok_or_else(|| Error::InvalidKdfParameters("Argon2 memory missing".into()))?;
        let iterations = params
            .dict
            .get_u64(PARAM_ITERATIONS)
            .ok_or_else(|| Error::InvalidKdfParameters("Argon2 iterations missing".into()))?;
        let parallelism = params
            .dict
            .get_u32(PARAM_PARALLELISM)
            .unwrap_or(DEFAULT_ARGON2_PARALLELISM);
        let version = params.dict.get_u32(PARAM_VERSION).unwrap_or(0x13);

        // Bounds are hard failures, never silently clamped.
        let memory_kib = memory_bytes / 1024;
        if !(MIN_ARGON2_MEMORY_KIB..=MAX_ARGON2_MEMORY_KIB).contains(&memory_kib) {
            return Err(Error::InvalidKdfParameters(format!(
                "Argon2 memory {memory_kib} KiB outside [{MIN_ARGON2_MEMORY_KIB}, {MAX_ARGON2_MEMORY_KIB}]"
            )));
        }
        if iterations < 1 || iterations > u64::from(u32::MAX) {
            return Err(Error::InvalidKdfParameters(format!(
                "Argon2 iterations {iterations} out of range"
            )));
        }
        if parallelism < 1 || parallelism > MAX_ARGON2_PARALLELISM {
            return Err(Error::InvalidKdfParameters(format!(
                "Argon2 parallelism {parallelism} out of range"
            )));
        }
        let version = match version {
            0x10 => Version::V0x10,
            0x13 => Version::V0x13,
            other => {
                return Err(Error::InvalidKdfParameters(format!(
                    "Argon2 version {other:#x} not supported"
                )))
            }
        };
        if params.dict.get_bytes(PARAM_SECRET_KEY).is_some()
            || params.dict.get_bytes(PARAM_ASSOC_DATA).is_some()
        {
            // KeePass never writes these; refuse rather than ignore them.
            return Err(Error::InvalidKdfParameters(
                "Argon2 secret key / associated data not supported".into(),
            ));
        }

        let argon_params = Params::new(
            memory_kib as u32,
            iterations as u32,
            parallelism,
            Some(32),
        )
        .map_err(|e| Error::InvalidKdfParameters(e.to_string()))?;
        let argon2 = Argon2::new(self.algorithm, version, argon_params);

        let mut output = [0u8; 32];
        argon2
            .hash_password_into(&composite.0, salt, &mut output)
            .map_err(|e| Error::InvalidKdfParameters(e.to_string()))?;
        Ok(SecretKey(output))
    }

    fn default_parameters(&self) -> KdfParameters {
        let mut params = KdfParameters::new(self.uuid());
        params
            .dict
            .set_u32(PARAM_PARALLELISM, DEFAULT_ARGON2_PARALLELISM);
        params.dict.set_u64(PARAM_MEMORY, DEFAULT_ARGON2_MEMORY_BYTES);
        params
            .dict
            .set_u64(PARAM_ITERATIONS, DEFAULT_ARGON2_ITERATIONS);
        params.dict.set_u32(PARAM_VERSION, 0x13);
        params.dict.set_bytes(PARAM_SALT, vec![0u8; 32]);
        params
    }

    fn randomize(&self, params: &mut KdfParameters) {
        let mut salt = vec![0u8; 32];
        OsRng.fill_bytes(&mut salt);
        params.dict.set_bytes(PARAM_SALT, salt);
    }
}

static AES_KDF: AesKdf = AesKdf;
static ARGON2D_KDF: Argon2Kdf = Argon2Kdf::argon2d();
static ARGON2ID_KDF: Argon2Kdf = Argon2Kdf::argon2id();

/// Look up the engine for a KDF UUID.
pub fn engine_for(uuid: &Uuid) -> Result<&'static dyn KdfEngine> {
    if *uuid == KDF_AES {
        Ok(&AES_KDF)
    } else if *uuid == KDF_ARGON2D {
        Ok(&ARGON2D_KDF)
    } else if *uuid == KDF_ARGON2ID {
        Ok(&ARGON2ID_KDF)
    } else {
        Err(Error::UnknownKdf(*uuid))
    }
}

/// Derive the transformed key for a parameter set.
pub fn derive_key(composite: &SecretKey, params: &KdfParameters) -> Result<SecretKey> {
    let engine = engine_for(&params.uuid)?;
    tracing::debug!(kdf = %params.uuid, "deriving transformed key");
    engine.derive(composite, params)
}

/// Build AES-KDF parameters from the raw v3 header fields.
pub fn aes_params_from_header(transform_seed: &[u8], rounds: u64) -> KdfParameters {
    let mut params = KdfParameters::new(KDF_AES);
    params.dict.set_bytes(PARAM_SEED, transform_seed.to_vec());
    params.dict.set_u64(PARAM_ROUNDS, rounds);
    params
}

/// Read back the AES-KDF fields for v3-style headers.
pub fn aes_header_fields(params: &KdfParameters) -> Result<(&[u8], u64)> {
    let seed = params
        .dict
        .get_bytes(PARAM_SEED)
        .ok_or_else(|| Error::InvalidKdfParameters("AES-KDF seed missing".into()))?;
    let rounds = params
        .dict
        .get_u64(PARAM_ROUNDS)
        .ok_or_else(|| Error::InvalidKdfParameters("AES-KDF rounds missing".into()))?;
    Ok((seed, rounds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite() -> SecretKey {
        SecretKey([0x42; 32])
    }

    #[test]
    fn aes_kdf_is_deterministic() {
        let mut params = AES_KDF.default_parameters();
        AES_KDF.randomize(&mut params);
        let a = AES_KDF.derive(&composite(), &params).unwrap();
        let b = AES_KDF.derive(&composite(), &params).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn aes_kdf_rounds_change_output() {
        let mut params = aes_params_from_header(&[1u8; 32], 10);
        let a = AES_KDF.derive(&composite(), &params).unwrap();
        params.dict.set_u64("R", 11);
        let b = AES_KDF.derive(&composite(), &params).unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn argon2_low_memory_is_rejected() {
        let mut params = ARGON2D_KDF.default_parameters();
        ARGON2D_KDF.randomize(&mut params);
        // 4 MiB, below the 8192 KiB floor
        params.dict.set_u64("M", 4 * 1024 * 1024);
        let err = ARGON2D_KDF.derive(&composite(), &params).unwrap_err();
        assert!(matches!(err, Error::InvalidKdfParameters(_)));
    }

    #[test]
    fn argon2_bad_version_is_rejected() {
        let mut params = ARGON2ID_KDF.default_parameters();
        ARGON2ID_KDF.randomize(&mut params);
        params.dict.set_u32("V", 0x12);
        assert!(ARGON2ID_KDF.derive(&composite(), &params).is_err());
    }

    #[test]
    fn argon2_derives_32_bytes_deterministically() {
        let mut params = ARGON2D_KDF.default_parameters();
        params.dict.set_bytes("S", vec![7u8; 32]);
        // Keep the test fast
        params.dict.set_u64("M", 8192 * 1024);
        params.dict.set_u64("I", 1);
        let a = ARGON2D_KDF.derive(&composite(), &params).unwrap();
        let b = ARGON2D_KDF.derive(&composite(), &params).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn unknown_uuid_is_fatal() {
        let uuid = Uuid::new_v4();
        assert!(matches!(engine_for(&uuid), Err(Error::UnknownKdf(u)) if u == uuid));
    }

    #[test]
    fn params_round_trip_through_wire_form() {
        let mut params = ARGON2ID_KDF.default_parameters();
        ARGON2ID_KDF.randomize(&mut params);
        let wire = params.serialize();
        let back = KdfParameters::deserialize(&wire).unwrap();
        assert_eq!(back.uuid, KDF_ARGON2ID);
        assert_eq!(back.dict.get_u64("I"), params.dict.get_u64("I"));
        assert_eq!(back.dict.get_bytes("S"), params.dict.get_bytes("S"));
    }
}
