//! KDBX (KeePass 2.x) container format, versions 3.1, 4.0 and 4.1.
//!
//! KDBX 3.1 authenticates the plaintext (stream start bytes plus a hashed
//! block stream, header hash bound into the XML). KDBX 4 authenticates
//! header and ciphertext directly with HMAC-SHA-256 keys derived from the
//! credentials, and moves the inner stream parameters into an encrypted
//! inner header.

mod xml;

use std::collections::HashMap;
use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{SIG1, SIG2_KDBX};
use crate::codec;
use crate::crypto::inner_stream::{InnerStream, STREAM_ID_CHACHA20, STREAM_ID_SALSA20};
use crate::crypto::kdf::{self, KdfParameters, KDF_AES};
use crate::crypto::{block_stream, cipher};
use crate::db::{Binary, BinaryPool, Database, FormatVersion, HeaderSettings};
use crate::error::{Error, Result};
use crate::keys::MasterCredential;
use crate::variant::VariantDictionary;

const VERSION_3_1: u32 = 0x0003_0001;
const VERSION_4_0: u32 = 0x0004_0000;
const VERSION_4_1: u32 = 0x0004_0001;

// Outer header field ids.
const HEADER_END: u8 = 0;
const HEADER_COMMENT: u8 = 1;
const HEADER_CIPHER_ID: u8 = 2;
const HEADER_COMPRESSION: u8 = 3;
const HEADER_MASTER_SEED: u8 = 4;
const HEADER_TRANSFORM_SEED: u8 = 5;
const HEADER_TRANSFORM_ROUNDS: u8 = 6;
const HEADER_ENCRYPTION_IV: u8 = 7;
const HEADER_PROTECTED_STREAM_KEY: u8 = 8;
const HEADER_STREAM_START_BYTES: u8 = 9;
const HEADER_INNER_STREAM_ID: u8 = 10;
const HEADER_KDF_PARAMETERS: u8 = 11;
const HEADER_PUBLIC_CUSTOM_DATA: u8 = 12;

// Inner header field ids (KDBX 4).
const INNER_END: u8 = 0;
const INNER_STREAM_ID: u8 = 1;
const INNER_STREAM_KEY: u8 = 2;
const INNER_BINARY: u8 = 3;

const BINARY_FLAG_PROTECTED: u8 = 0x01;
const END_FIELD_DATA: &[u8] = b"\r\n\r\n";

/// Map the raw version word onto a supported [`FormatVersion`].
pub(super) fn peek_version(data: &[u8]) -> Result<FormatVersion> {
    let mut cursor = data;
    codec::take(&mut cursor, 8)?; // signatures, already checked
    let version = codec::read_u32(codec::take(&mut cursor, 4)?);
    match version >> 16 {
        3 => Ok(FormatVersion::Kdbx31),
        4 if version & 0xFFFF == 0 => Ok(FormatVersion::Kdbx4),
        4 => Ok(FormatVersion::Kdbx41),
        _ => Err(Error::UnsupportedVersion(version)),
    }
}

struct OuterHeader {
    version: FormatVersion,
    raw: Vec<u8>,
    cipher: cipher::DataCipher,
    compression: bool,
    master_seed: Vec<u8>,
    encryption_iv: Vec<u8>,
    kdf: KdfParameters,
    // KDBX 3.1 only
    protected_stream_key: Vec<u8>,
    stream_start_bytes: Vec<u8>,
    inner_stream_id: u32,
    public_custom_data: VariantDictionary,
}

fn parse_outer(data: &[u8]) -> Result<(OuterHeader, usize)> {
    let version = peek_version(data)?;
    let mut cursor = &data[12..];

    let mut cipher_uuid = None;
    let mut compression = true;
    let mut master_seed = Vec::new();
    let mut encryption_iv = Vec::new();
    let mut kdf_params = None;
    let mut transform_seed = Vec::new();
    let mut transform_rounds = kdf::DEFAULT_AES_ROUNDS;
    let mut protected_stream_key = Vec::new();
    let mut stream_start_bytes = Vec::new();
    let mut inner_stream_id = STREAM_ID_SALSA20;
    let mut public_custom_data = VariantDictionary::new();

    loop {
        let field_id = codec::take(&mut cursor, 1)?[0];
        let size = if version.is_kdbx4() {
            codec::read_u32(codec::take(&mut cursor, 4)?) as usize
        } else {
            codec::read_u16(codec::take(&mut cursor, 2)?) as usize
        };
        let field = codec::take(&mut cursor, size)?;

        match field_id {
            HEADER_END => break,
            HEADER_COMMENT => {}
            HEADER_CIPHER_ID => cipher_uuid = Some(codec::uuid_from_bytes(field)?),
            HEADER_COMPRESSION => compression = codec::read_u32(int_field(field, 4)?) != 0,
            HEADER_MASTER_SEED => master_seed = field.to_vec(),
            HEADER_TRANSFORM_SEED => transform_seed = field.to_vec(),
            HEADER_TRANSFORM_ROUNDS => transform_rounds = codec::read_u64(int_field(field, 8)?),
            HEADER_ENCRYPTION_IV => encryption_iv = field.to_vec(),
            HEADER_PROTECTED_STREAM_KEY => protected_stream_key = field.to_vec(),
            HEADER_STREAM_START_BYTES => stream_start_bytes = field.to_vec(),
            HEADER_INNER_STREAM_ID => inner_stream_id = codec::read_u32(int_field(field, 4)?),
            HEADER_KDF_PARAMETERS => kdf_params = Some(KdfParameters::deserialize(field)?),
            HEADER_PUBLIC_CUSTOM_DATA => {
                public_custom_data = VariantDictionary::deserialize(field)?
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown header field id {other:#04x}"
                )))
            }
        }
    }

    let body_offset = data.len() - cursor.len();
    let kdf_params = match kdf_params {
        Some(params) => params,
        None => {
            if transform_seed.is_empty() {
                return Err(Error::malformed("header carries no KDF parameters"));
            }
            kdf::aes_params_from_header(&transform_seed, transform_rounds)
        }
    };
    let cipher_uuid =
        cipher_uuid.ok_or_else(|| Error::malformed("header carries no cipher id"))?;
    if master_seed.len() != 32 {
        return Err(Error::malformed("master seed must be 32 bytes"));
    }

    Ok((
        OuterHeader {
            version,
            raw: data[..body_offset].to_vec(),
            cipher: cipher::DataCipher::from_uuid(&cipher_uuid)?,
            compression,
            master_seed,
            encryption_iv,
            kdf: kdf_params,
            protected_stream_key,
            stream_start_bytes,
            inner_stream_id,
            public_custom_data,
        },
        body_offset,
    ))
}

fn int_field(field: &[u8], len: usize) -> Result<&[u8]> {
    if field.len() != len {
        return Err(Error::malformed(format!(
            "integer header field is {} bytes, expected {len}",
            field.len()
        )));
    }
    Ok(field)
}

pub(super) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::malformed(format!("gzip: {e}")))?;
    Ok(out)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder
        .finish()
        .map_err(|e| Error::malformed(format!("gzip: {e}")))
}

/// Decrypt and parse a KDBX file of any supported version.
pub fn open(data: &[u8], credential: &MasterCredential) -> Result<Database> {
    let (header, body_offset) = parse_outer(data)?;
    tracing::debug!(version = ?header.version, "KDBX header parsed");
    if header.version.is_kdbx4() {
        open_v4(data, body_offset, header, credential)
    } else {
        open_v3(data, body_offset, header, credential)
    }
}

fn open_v4(
    data: &[u8],
    body_offset: usize,
    header: OuterHeader,
    credential: &MasterCredential,
) -> Result<Database> {
    let mut cursor = &data[body_offset..];
    let stored_sha: [u8; 32] = codec::take(&mut cursor, 32)?.try_into().unwrap();
    let computed_sha: [u8; 32] = Sha256::digest(&header.raw).into();
    if stored_sha != computed_sha {
        // Corruption before any key material is involved.
        return Err(Error::malformed("header checksum mismatch"));
    }

    let composite = credential.composite_key_kdbx()?;
    let transformed = kdf::derive_key(&composite, &header.kdf)?;
    let hmac_base = cipher::hmac_base_key(&header.master_seed, &transformed);

    let stored_mac: [u8; 32] = codec::take(&mut cursor, 32)?.try_into().unwrap();
    if block_stream::header_mac(&hmac_base, &header.raw) != stored_mac {
        // Wrong credentials or a tampered header; indistinguishable.
        return Err(Error::IntegrityCheckFailed);
    }

    let ciphertext = block_stream::read_hmac_blocks(cursor, &hmac_base)?;
    let key = cipher::master_key(&header.master_seed, &transformed);
    let mut plaintext = cipher::decrypt(header.cipher, &key, &header.encryption_iv, &ciphertext)?;
    if header.compression {
        plaintext = gunzip(&plaintext)?;
    }

    let (inner_stream_id, inner_key, binaries, xml_start) = parse_inner_header(&plaintext)?;
    let mut stream = InnerStream::new(inner_stream_id, &inner_key)?;
    let text = String::from_utf8_lossy(&plaintext[xml_start..]);
    let mut ctx = xml::XmlContext {
        version: header.version,
        stream: &mut stream,
    };
    let parsed = xml::parse(&text, &mut ctx)?;

    let mut pool = BinaryPool::default();
    for binary in binaries {
        pool.add(binary);
    }
    assemble(header, inner_stream_id, parsed, pool, None)
}

fn open_v3(
    data: &[u8],
    body_offset: usize,
    header: OuterHeader,
    credential: &MasterCredential,
) -> Result<Database> {
    let composite = credential.composite_key_kdbx()?;
    let transformed = kdf::derive_key(&composite, &header.kdf)?;
    let key = cipher::master_key(&header.master_seed, &transformed);
    let plaintext = cipher::decrypt(
        header.cipher,
        &key,
        &header.encryption_iv,
        &data[body_offset..],
    )?;

    if header.stream_start_bytes.len() != 32 || plaintext.len() < 32 {
        return Err(Error::malformed("stream start bytes missing"));
    }
    if plaintext[..32] != header.stream_start_bytes[..] {
        return Err(Error::IntegrityCheckFailed);
    }

    let mut body = block_stream::read_hashed_blocks(&plaintext[32..])?;
    if header.compression {
        body = gunzip(&body)?;
    }

    let mut stream = InnerStream::new(header.inner_stream_id, &header.protected_stream_key)?;
    let text = String::from_utf8_lossy(&body);
    let mut ctx = xml::XmlContext {
        version: header.version,
        stream: &mut stream,
    };
    let parsed = xml::parse(&text, &mut ctx)?;

    if let Some(stored) = &parsed.header_hash {
        let computed = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(&header.raw));
        if *stored != computed {
            return Err(Error::IntegrityCheckFailed);
        }
    }

    // Meta binaries are keyed by ID attribute; rebuild the pool and remap
    // entry references onto pool indices.
    let mut pool = BinaryPool::default();
    let mut id_map = HashMap::new();
    for (id, binary) in &parsed.meta_binaries {
        id_map.insert(*id, pool.add(binary.clone()));
    }
    let inner_stream_id = header.inner_stream_id;
    assemble(header, inner_stream_id, parsed, pool, Some(id_map))
}

fn assemble(
    header: OuterHeader,
    inner_stream_id: u32,
    parsed: xml::ParsedXml,
    pool: BinaryPool,
    binary_id_map: Option<HashMap<usize, usize>>,
) -> Result<Database> {
    let root = parsed
        .root
        .ok_or_else(|| Error::malformed("document has no root group"))?;
    let mut entries = parsed.entries;
    if let Some(map) = binary_id_map {
        for entry in entries.values_mut() {
            for index in entry.binaries.values_mut() {
                *index = *map
                    .get(index)
                    .ok_or_else(|| Error::malformed("entry references an unknown binary id"))?;
            }
        }
    }

    let settings = HeaderSettings {
        version: header.version,
        cipher: header.cipher,
        compression: header.compression,
        kdf_parameters: header.kdf,
        inner_stream_id,
        public_custom_data: header.public_custom_data,
    };
    Database::from_parts(parsed.meta, settings, pool, parsed.groups, entries, root)
}

fn parse_inner_header(plaintext: &[u8]) -> Result<(u32, Vec<u8>, Vec<Binary>, usize)> {
    let mut cursor = plaintext;
    let mut stream_id = STREAM_ID_CHACHA20;
    let mut stream_key = Vec::new();
    let mut binaries = Vec::new();

    loop {
        let field_id = codec::take(&mut cursor, 1)?[0];
        let size = codec::read_u32(codec::take(&mut cursor, 4)?) as usize;
        let field = codec::take(&mut cursor, size)?;
        match field_id {
            INNER_END => break,
            INNER_STREAM_ID => stream_id = codec::read_u32(int_field(field, 4)?),
            INNER_STREAM_KEY => stream_key = field.to_vec(),
            INNER_BINARY => {
                if field.is_empty() {
                    return Err(Error::malformed("empty binary field"));
                }
                binaries.push(Binary {
                    data: field[1..].to_vec(),
                    protected: field[0] & BINARY_FLAG_PROTECTED != 0,
                });
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown inner header field id {other:#04x}"
                )))
            }
        }
    }

    if stream_key.is_empty() {
        return Err(Error::malformed("inner header carries no stream key"));
    }
    Ok((
        stream_id,
        stream_key,
        binaries,
        plaintext.len() - cursor.len(),
    ))
}

/// Serialize and encrypt a database as KDBX.
pub fn save(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    if database.settings.version.is_kdbx4() {
        save_v4(database, credential)
    } else {
        save_v3(database, credential)
    }
}

fn push_field(out: &mut Vec<u8>, kdbx4: bool, id: u8, data: &[u8]) {
    out.push(id);
    if kdbx4 {
        out.extend_from_slice(&codec::write_u32(data.len() as u32));
    } else {
        out.extend_from_slice(&codec::write_u16(data.len() as u16));
    }
    out.extend_from_slice(data);
}

fn save_v4(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    let settings = &database.settings;
    let mut kdf_params = settings.kdf_parameters.clone();
    kdf::engine_for(&kdf_params.uuid)?.randomize(&mut kdf_params);

    let mut master_seed = vec![0u8; 32];
    let mut encryption_iv = vec![0u8; settings.cipher.iv_len()];
    let mut inner_key = vec![0u8; 64];
    OsRng.fill_bytes(&mut master_seed);
    OsRng.fill_bytes(&mut encryption_iv);
    OsRng.fill_bytes(&mut inner_key);

    let version_word = match settings.version {
        FormatVersion::Kdbx41 => VERSION_4_1,
        _ => VERSION_4_0,
    };

    let mut header = Vec::new();
    header.extend_from_slice(&codec::write_u32(SIG1));
    header.extend_from_slice(&codec::write_u32(SIG2_KDBX));
    header.extend_from_slice(&codec::write_u32(version_word));
    push_field(
        &mut header,
        true,
        HEADER_CIPHER_ID,
        &codec::uuid_to_bytes(&settings.cipher.uuid()),
    );
    push_field(
        &mut header,
        true,
        HEADER_COMPRESSION,
        &codec::write_u32(u32::from(settings.compression)),
    );
    push_field(&mut header, true, HEADER_MASTER_SEED, &master_seed);
    push_field(&mut header, true, HEADER_ENCRYPTION_IV, &encryption_iv);
    push_field(
        &mut header,
        true,
        HEADER_KDF_PARAMETERS,
        &kdf_params.serialize(),
    );
    if !settings.public_custom_data.is_empty() {
        push_field(
            &mut header,
            true,
            HEADER_PUBLIC_CUSTOM_DATA,
            &settings.public_custom_data.serialize(),
        );
    }
    push_field(&mut header, true, HEADER_END, END_FIELD_DATA);

    // Inner header, then XML, as one plaintext.
    let mut plaintext = Vec::new();
    push_field(
        &mut plaintext,
        true,
        INNER_STREAM_ID,
        &codec::write_u32(settings.inner_stream_id),
    );
    push_field(&mut plaintext, true, INNER_STREAM_KEY, &inner_key);
    for binary in database.binaries.iter() {
        let mut field = Vec::with_capacity(binary.data.len() + 1);
        field.push(if binary.protected {
            BINARY_FLAG_PROTECTED
        } else {
            0
        });
        field.extend_from_slice(&binary.data);
        push_field(&mut plaintext, true, INNER_BINARY, &field);
    }
    push_field(&mut plaintext, true, INNER_END, &[]);

    let mut stream = InnerStream::new(settings.inner_stream_id, &inner_key)?;
    let mut ctx = xml::XmlContext {
        version: settings.version,
        stream: &mut stream,
    };
    plaintext.extend_from_slice(&xml::serialize(database, &mut ctx, None)?);

    let payload = if settings.compression {
        gzip(&plaintext)?
    } else {
        plaintext
    };

    let composite = credential.composite_key_kdbx()?;
    let transformed = kdf::derive_key(&composite, &kdf_params)?;
    let key = cipher::master_key(&master_seed, &transformed);
    let hmac_base = cipher::hmac_base_key(&master_seed, &transformed);
    let ciphertext = cipher::encrypt(settings.cipher, &key, &encryption_iv, &payload)?;

    let mut out = header.clone();
    let sha: [u8; 32] = Sha256::digest(&header).into();
    out.extend_from_slice(&sha);
    out.extend_from_slice(&block_stream::header_mac(&hmac_base, &header));
    out.extend_from_slice(&block_stream::write_hmac_blocks(&ciphertext, &hmac_base));
    Ok(out)
}

fn save_v3(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    let settings = &database.settings;
    if settings.kdf_parameters.uuid != KDF_AES {
        return Err(Error::InvalidKdfParameters(
            "KDBX 3.1 supports only AES-KDF".into(),
        ));
    }
    let mut kdf_params = settings.kdf_parameters.clone();
    kdf::engine_for(&kdf_params.uuid)?.randomize(&mut kdf_params);
    let (transform_seed, rounds) = kdf::aes_header_fields(&kdf_params)?;
    let transform_seed = transform_seed.to_vec();

    let mut master_seed = vec![0u8; 32];
    let mut encryption_iv = vec![0u8; settings.cipher.iv_len()];
    let mut stream_key = vec![0u8; 32];
    let mut stream_start = vec![0u8; 32];
    OsRng.fill_bytes(&mut master_seed);
    OsRng.fill_bytes(&mut encryption_iv);
    OsRng.fill_bytes(&mut stream_key);
    OsRng.fill_bytes(&mut stream_start);

    // ChaCha20 belongs to the 4.x inner header; 3.1 readers expect
    // Salsa20 here.
    let inner_stream_id = match settings.inner_stream_id {
        STREAM_ID_CHACHA20 => STREAM_ID_SALSA20,
        other => other,
    };

    let mut header = Vec::new();
    header.extend_from_slice(&codec::write_u32(SIG1));
    header.extend_from_slice(&codec::write_u32(SIG2_KDBX));
    header.extend_from_slice(&codec::write_u32(VERSION_3_1));
    push_field(
        &mut header,
        false,
        HEADER_CIPHER_ID,
        &codec::uuid_to_bytes(&settings.cipher.uuid()),
    );
    push_field(
        &mut header,
        false,
        HEADER_COMPRESSION,
        &codec::write_u32(u32::from(settings.compression)),
    );
    push_field(&mut header, false, HEADER_MASTER_SEED, &master_seed);
    push_field(&mut header, false, HEADER_TRANSFORM_SEED, &transform_seed);
    push_field(
        &mut header,
        false,
        HEADER_TRANSFORM_ROUNDS,
        &codec::write_u64(rounds),
    );
    push_field(&mut header, false, HEADER_ENCRYPTION_IV, &encryption_iv);
    push_field(&mut header, false, HEADER_PROTECTED_STREAM_KEY, &stream_key);
    push_field(&mut header, false, HEADER_STREAM_START_BYTES, &stream_start);
    push_field(
        &mut header,
        false,
        HEADER_INNER_STREAM_ID,
        &codec::write_u32(inner_stream_id),
    );
    push_field(&mut header, false, HEADER_END, END_FIELD_DATA);

    let header_hash =
        base64::engine::general_purpose::STANDARD.encode(Sha256::digest(&header));

    let mut stream = InnerStream::new(inner_stream_id, &stream_key)?;
    let mut ctx = xml::XmlContext {
        version: FormatVersion::Kdbx31,
        stream: &mut stream,
    };
    let body = xml::serialize(database, &mut ctx, Some(&header_hash))?;
    let body = if settings.compression {
        gzip(&body)?
    } else {
        body
    };

    let mut plaintext = stream_start.clone();
    plaintext.extend_from_slice(&block_stream::write_hashed_blocks(&body));

    let composite = credential.composite_key_kdbx()?;
    let transformed = kdf::derive_key(&composite, &kdf_params)?;
    let key = cipher::master_key(&master_seed, &transformed);
    let ciphertext = cipher::encrypt(settings.cipher, &key, &encryption_iv, &plaintext)?;

    let mut out = header;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::KDF_ARGON2D;
    use crate::db::{CustomField, EntryBuilder, Group};

    fn fast_v4_database() -> Database {
        let mut db = Database::new("Vault");
        db.settings.version = FormatVersion::Kdbx4;
        // Floor-cost Argon2 keeps the tests quick.
        db.settings.kdf_parameters = kdf::engine_for(&KDF_ARGON2D)
            .unwrap()
            .default_parameters();
        db.settings.kdf_parameters.dict.set_u64("M", 8192 * 1024);
        db.settings.kdf_parameters.dict.set_u64("I", 1);
        db.settings.kdf_parameters.dict.set_u32("P", 1);
        db
    }

    fn fast_v3_database() -> Database {
        let mut db = Database::new("Vault");
        db.settings.version = FormatVersion::Kdbx31;
        db.settings.kdf_parameters = kdf::aes_params_from_header(&[0u8; 32], 100);
        db
    }

    #[test]
    fn v4_round_trip_preserves_tree_and_secrets() {
        let mut db = fast_v4_database();
        let group = db.insert_group(Group::new("Work")).unwrap();
        db.insert_entry(
            EntryBuilder::new("VPN")
                .username("alice")
                .password("p@ss")
                .custom_field("Token", CustomField::protected("t0k3n"))
                .parent(group)
                .build(),
        )
        .unwrap();

        let credential = MasterCredential::with_password("master");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();

        assert!(db.tree_eq(&back));
        let entry_uuid = back.entries_preorder()[0];
        let entry = back.entry(&entry_uuid).unwrap();
        assert_eq!(entry.password(), "p@ss");
        assert_eq!(entry.custom_fields["Token"].value, "t0k3n");
    }

    #[test]
    fn v3_round_trip_preserves_tree_and_secrets() {
        let mut db = fast_v3_database();
        db.insert_entry(
            EntryBuilder::new("Mail")
                .username("bob")
                .password("hunter2")
                .build(),
        )
        .unwrap();

        let credential = MasterCredential::with_password("master");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();
        assert_eq!(back.settings.version, FormatVersion::Kdbx31);
        assert_eq!(back.settings.inner_stream_id, STREAM_ID_SALSA20);
        let entry_uuid = back.entries_preorder()[0];
        assert_eq!(back.entry(&entry_uuid).unwrap().password(), "hunter2");
    }

    #[test]
    fn v4_wrong_password_is_integrity_failure() {
        let db = fast_v4_database();
        let bytes = save(&db, &MasterCredential::with_password("right")).unwrap();
        let err = open(&bytes, &MasterCredential::with_password("wrong")).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed));
    }

    #[test]
    fn v3_wrong_password_is_integrity_failure() {
        let db = fast_v3_database();
        let bytes = save(&db, &MasterCredential::with_password("right")).unwrap();
        let err = open(&bytes, &MasterCredential::with_password("wrong")).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed));
    }

    #[test]
    fn v4_flipped_ciphertext_byte_is_detected() {
        let db = fast_v4_database();
        let credential = MasterCredential::with_password("pw");
        let mut bytes = save(&db, &credential).unwrap();
        let pos = bytes.len() - 40;
        bytes[pos] ^= 0x01;
        assert!(open(&bytes, &credential).is_err());
    }

    #[test]
    fn v4_flipped_header_byte_is_detected() {
        let db = fast_v4_database();
        let credential = MasterCredential::with_password("pw");
        let mut bytes = save(&db, &credential).unwrap();
        bytes[20] ^= 0x01;
        assert!(open(&bytes, &credential).is_err());
    }

    #[test]
    fn binaries_round_trip_v4() {
        let mut db = fast_v4_database();
        let index = db.binaries.add(Binary {
            data: b"attachment bytes".to_vec(),
            protected: true,
        });
        let mut entry = EntryBuilder::new("With file").build();
        entry.binaries.insert("notes.txt".into(), index);
        db.insert_entry(entry).unwrap();

        let credential = MasterCredential::with_password("pw");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();
        let entry_uuid = back.entries_preorder()[0];
        let index = back.entry(&entry_uuid).unwrap().binaries["notes.txt"];
        let binary = back.binaries.get(index).unwrap();
        assert_eq!(binary.data, b"attachment bytes");
        assert!(binary.protected);
    }

    #[test]
    fn public_custom_data_round_trips() {
        let mut db = fast_v4_database();
        db.settings
            .public_custom_data
            .set_u32("provider-slot", 7);
        let credential = MasterCredential::with_password("pw");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();
        assert_eq!(back.settings.public_custom_data.get_u32("provider-slot"), Some(7));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let db = fast_v4_database();
        let credential = MasterCredential::with_password("pw");
        let mut bytes = save(&db, &credential).unwrap();
        bytes[10] = 0x05; // bump the major version
        assert!(matches!(
            open(&bytes, &credential),
            Err(Error::UnsupportedVersion(_))
        ));
    }
}
