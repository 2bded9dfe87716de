//! Legacy KDB (KeePass 1.x) binary format.
//!
//! A fixed 124-byte header is followed by an AES-256-CBC encrypted body
//! of group and entry records. Records are flat (u16 field type, u32
//! size, data) lists; tree nesting is reconstructed from each group's
//! level field. The header's contents hash authenticates the plaintext,
//! so a wrong password and a corrupt file are indistinguishable.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{SIG1, SIG2_KDB};
use crate::codec;
use crate::crypto::inner_stream::STREAM_ID_NONE;
use crate::crypto::{cipher, kdf};
use crate::db::{
    Binary, BinaryPool, Database, Entry, FormatVersion, Group, HeaderSettings, Meta,
    SecureString,
};
use crate::error::{Error, Result};
use crate::keys::MasterCredential;

const HEADER_SIZE: usize = 124;
const VERSION: u32 = 0x0003_0004;
const VERSION_CRITICAL_MASK: u32 = 0xFFFF_FF00;

const FLAG_SHA2: u32 = 1;
const FLAG_RIJNDAEL: u32 = 2;

const FIELD_END: u16 = 0xFFFF;

// Group record field types.
const GROUP_ID: u16 = 0x0001;
const GROUP_NAME: u16 = 0x0002;
const GROUP_CREATION: u16 = 0x0003;
const GROUP_LAST_MOD: u16 = 0x0004;
const GROUP_LAST_ACCESS: u16 = 0x0005;
const GROUP_EXPIRE: u16 = 0x0006;
const GROUP_ICON: u16 = 0x0007;
const GROUP_LEVEL: u16 = 0x0008;
const GROUP_FLAGS: u16 = 0x0009;

// Entry record field types.
const ENTRY_UUID: u16 = 0x0001;
const ENTRY_GROUP_ID: u16 = 0x0002;
const ENTRY_ICON: u16 = 0x0003;
const ENTRY_TITLE: u16 = 0x0004;
const ENTRY_URL: u16 = 0x0005;
const ENTRY_USERNAME: u16 = 0x0006;
const ENTRY_PASSWORD: u16 = 0x0007;
const ENTRY_NOTES: u16 = 0x0008;
const ENTRY_CREATION: u16 = 0x0009;
const ENTRY_LAST_MOD: u16 = 0x000A;
const ENTRY_LAST_ACCESS: u16 = 0x000B;
const ENTRY_EXPIRE: u16 = 0x000C;
const ENTRY_BINARY_DESC: u16 = 0x000D;
const ENTRY_BINARY_DATA: u16 = 0x000E;

struct Header {
    master_seed: [u8; 16],
    encryption_iv: [u8; 16],
    num_groups: u32,
    num_entries: u32,
    contents_hash: [u8; 32],
    transform_seed: [u8; 32],
    transform_rounds: u32,
}

fn parse_header(data: &[u8]) -> Result<Header> {
    let mut cursor = data;
    let header_bytes = codec::take(&mut cursor, HEADER_SIZE)?;
    let mut h = header_bytes;

    let sig1 = codec::read_u32(codec::take(&mut h, 4)?);
    let sig2 = codec::read_u32(codec::take(&mut h, 4)?);
    if sig1 != SIG1 || sig2 != SIG2_KDB {
        return Err(Error::InvalidSignature);
    }
    let flags = codec::read_u32(codec::take(&mut h, 4)?);
    let version = codec::read_u32(codec::take(&mut h, 4)?);
    if version & VERSION_CRITICAL_MASK != VERSION & VERSION_CRITICAL_MASK {
        return Err(Error::UnsupportedVersion(version));
    }
    if flags & FLAG_RIJNDAEL == 0 {
        // Twofish and ARCFOUR bodies are not supported.
        return Err(Error::UnknownCipher(Uuid::from_u128(flags as u128)));
    }
    if flags & FLAG_SHA2 == 0 {
        return Err(Error::malformed("KDB header lacks the SHA-2 flag"));
    }

    let master_seed: [u8; 16] = codec::take(&mut h, 16)?.try_into().unwrap();
    let encryption_iv: [u8; 16] = codec::take(&mut h, 16)?.try_into().unwrap();
    let num_groups = codec::read_u32(codec::take(&mut h, 4)?);
    let num_entries = codec::read_u32(codec::take(&mut h, 4)?);
    let contents_hash: [u8; 32] = codec::take(&mut h, 32)?.try_into().unwrap();
    let transform_seed: [u8; 32] = codec::take(&mut h, 32)?.try_into().unwrap();
    let transform_rounds = codec::read_u32(codec::take(&mut h, 4)?);

    Ok(Header {
        master_seed,
        encryption_iv,
        num_groups,
        num_entries,
        contents_hash,
        transform_seed,
        transform_rounds,
    })
}

/// Decrypt and parse a KDB file.
pub fn open(data: &[u8], credential: &MasterCredential) -> Result<Database> {
    let header = parse_header(data)?;
    let body = &data[HEADER_SIZE..];

    let composite = credential.composite_key_kdb()?;
    let transformed = kdf::transform_aes(
        &composite,
        &header.transform_seed,
        u64::from(header.transform_rounds),
    );
    let key = cipher::master_key(&header.master_seed, &transformed);
    let plaintext = cipher::decrypt(
        cipher::DataCipher::Aes256,
        &key,
        &header.encryption_iv,
        body,
    )?;

    let digest: [u8; 32] = Sha256::digest(&plaintext).into();
    if digest != header.contents_hash {
        return Err(Error::IntegrityCheckFailed);
    }

    tracing::debug!(
        groups = header.num_groups,
        entries = header.num_entries,
        "KDB body decrypted"
    );
    parse_body(&plaintext, &header)
}

struct RawGroup {
    kdb_id: u32,
    level: u16,
    group: Group,
}

fn parse_body(plaintext: &[u8], header: &Header) -> Result<Database> {
    let mut cursor = plaintext;

    let mut raw_groups = Vec::with_capacity(header.num_groups as usize);
    for _ in 0..header.num_groups {
        raw_groups.push(parse_group_record(&mut cursor)?);
    }

    let root = Group::new("");
    let root_uuid = root.uuid;
    let mut groups: HashMap<Uuid, Group> = HashMap::new();
    groups.insert(root_uuid, root);

    // Levels to nesting: each group attaches to the nearest preceding
    // group one level up; level 0 attaches to the root.
    let mut id_map: HashMap<u32, Uuid> = HashMap::new();
    let mut stack: Vec<(u16, Uuid)> = Vec::new();
    for raw in raw_groups {
        while let Some((level, _)) = stack.last() {
            if *level >= raw.level {
                stack.pop();
            } else {
                break;
            }
        }
        let parent = match (raw.level, stack.last()) {
            (0, _) => root_uuid,
            (_, Some((level, uuid))) if *level == raw.level - 1 => *uuid,
            _ => return Err(Error::malformed("group level skips a nesting step")),
        };
        let mut group = raw.group;
        group.parent = Some(parent);
        let uuid = group.uuid;
        groups
            .get_mut(&parent)
            .expect("parent came off the stack")
            .groups
            .push(uuid);
        groups.insert(uuid, group);
        id_map.insert(raw.kdb_id, uuid);
        stack.push((raw.level, uuid));
    }

    let mut entries: HashMap<Uuid, Entry> = HashMap::new();
    let mut binaries = BinaryPool::default();
    for _ in 0..header.num_entries {
        let (entry, group_id, binary) = parse_entry_record(&mut cursor)?;
        let Some(mut entry) = entry else {
            continue; // meta stream, not a user entry
        };
        let parent = *id_map
            .get(&group_id)
            .ok_or_else(|| Error::malformed("entry references an unknown group id"))?;
        entry.parent = Some(parent);
        if let Some(data) = binary {
            let index = binaries.add(Binary {
                data,
                protected: false,
            });
            let name = if entry.binary_description.is_empty() {
                "attachment".to_string()
            } else {
                entry.binary_description.clone()
            };
            entry.binaries.insert(name, index);
        }
        groups
            .get_mut(&parent)
            .expect("checked against the id map")
            .entries
            .push(entry.uuid);
        entries.insert(entry.uuid, entry);
    }

    let settings = HeaderSettings {
        version: FormatVersion::Kdb,
        cipher: cipher::DataCipher::Aes256,
        compression: false,
        kdf_parameters: kdf::aes_params_from_header(
            &header.transform_seed,
            u64::from(header.transform_rounds),
        ),
        inner_stream_id: STREAM_ID_NONE,
        ..HeaderSettings::default()
    };
    let meta = Meta {
        recycle_bin_enabled: false,
        ..Meta::default()
    };
    Database::from_parts(meta, settings, binaries, groups, entries, root_uuid)
}

fn parse_group_record(cursor: &mut &[u8]) -> Result<RawGroup> {
    let mut group = Group::new("");
    let mut kdb_id = None;
    let mut level = 0u16;
    let never = codec::kdb_never_expire();

    loop {
        let field_type = codec::read_u16(codec::take(cursor, 2)?);
        let size = codec::read_u32(codec::take(cursor, 4)?) as usize;
        let data = codec::take(cursor, size)?;
        match field_type {
            FIELD_END => break,
            GROUP_ID => kdb_id = Some(codec::read_u32(field_exact(data, 4)?)),
            GROUP_NAME => group.name = codec::read_cstring(data),
            GROUP_CREATION => group.times.creation = read_date(data)?,
            GROUP_LAST_MOD => group.times.last_modification = read_date(data)?,
            GROUP_LAST_ACCESS => group.times.last_access = read_date(data)?,
            GROUP_EXPIRE => {
                group.times.expiry = read_date(data)?;
                group.times.expires = group.times.expiry != never;
            }
            GROUP_ICON => group.icon_id = codec::read_u32(field_exact(data, 4)?),
            GROUP_LEVEL => level = codec::read_u16(field_exact(data, 2)?),
            GROUP_FLAGS => group.flags = codec::read_u32(field_exact(data, 4)?),
            _ => {} // unknown field, skip
        }
    }

    Ok(RawGroup {
        kdb_id: kdb_id.ok_or_else(|| Error::malformed("group record without an id"))?,
        level,
        group,
    })
}

type EntryRecord = (Option<Entry>, u32, Option<Vec<u8>>);

fn parse_entry_record(cursor: &mut &[u8]) -> Result<EntryRecord> {
    let mut entry = Entry::new("");
    let mut group_id = None;
    let mut binary: Option<Vec<u8>> = None;
    let never = codec::kdb_never_expire();

    loop {
        let field_type = codec::read_u16(codec::take(cursor, 2)?);
        let size = codec::read_u32(codec::take(cursor, 4)?) as usize;
        let data = codec::take(cursor, size)?;
        match field_type {
            FIELD_END => break,
            ENTRY_UUID => entry.uuid = codec::uuid_from_bytes(data)?,
            ENTRY_GROUP_ID => group_id = Some(codec::read_u32(field_exact(data, 4)?)),
            ENTRY_ICON => entry.icon_id = codec::read_u32(field_exact(data, 4)?),
            ENTRY_TITLE => entry.title = codec::read_cstring(data),
            ENTRY_URL => entry.url = codec::read_cstring(data),
            ENTRY_USERNAME => entry.username = codec::read_cstring(data),
            ENTRY_PASSWORD => entry.password = SecureString::new(codec::read_cstring(data)),
            ENTRY_NOTES => entry.notes = codec::read_cstring(data),
            ENTRY_CREATION => entry.times.creation = read_date(data)?,
            ENTRY_LAST_MOD => entry.times.last_modification = read_date(data)?,
            ENTRY_LAST_ACCESS => entry.times.last_access = read_date(data)?,
            ENTRY_EXPIRE => {
                entry.times.expiry = read_date(data)?;
                entry.times.expires = entry.times.expiry != never;
            }
            ENTRY_BINARY_DESC => entry.binary_description = codec::read_cstring(data),
            ENTRY_BINARY_DATA if !data.is_empty() => binary = Some(data.to_vec()),
            _ => {}
        }
    }

    let group_id = group_id.ok_or_else(|| Error::malformed("entry record without a group id"))?;
    if is_meta_stream(&entry, binary.as_deref()) {
        return Ok((None, group_id, None));
    }
    Ok((Some(entry), group_id, binary))
}

/// KeePass 1.x stores UI state as pseudo-entries; they are not user data.
fn is_meta_stream(entry: &Entry, binary: Option<&[u8]>) -> bool {
    binary.is_some()
        && entry.binary_description == "bin-stream"
        && entry.title == "Meta-Info"
        && entry.username == "SYSTEM"
        && entry.url == "$"
}

fn field_exact(data: &[u8], len: usize) -> Result<&[u8]> {
    if data.len() != len {
        return Err(Error::malformed(format!(
            "field is {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(data)
}

fn read_date(data: &[u8]) -> Result<chrono::DateTime<chrono::Utc>> {
    let packed: &[u8; 5] = data
        .try_into()
        .map_err(|_| Error::malformed("date field is not 5 bytes"))?;
    Ok(codec::unpack_kdb_date(packed))
}

/// Serialize and encrypt a database as a KDB file.
pub fn save(database: &Database, credential: &MasterCredential) -> Result<Vec<u8>> {
    let mut kdf_params = database.settings.kdf_parameters.clone();
    kdf::engine_for(&kdf_params.uuid)?.randomize(&mut kdf_params);
    let (transform_seed, rounds) = kdf::aes_header_fields(&kdf_params)?;
    let rounds = u32::try_from(rounds)
        .map_err(|_| Error::InvalidKdfParameters("KDB rounds exceed u32".into()))?;

    let mut master_seed = [0u8; 16];
    let mut encryption_iv = [0u8; 16];
    OsRng.fill_bytes(&mut master_seed);
    OsRng.fill_bytes(&mut encryption_iv);

    let (plaintext, num_groups, num_entries) = serialize_body(database)?;
    let contents_hash: [u8; 32] = Sha256::digest(&plaintext).into();

    let composite = credential.composite_key_kdb()?;
    let transformed = kdf::derive_key(&composite, &kdf_params)?;
    let key = cipher::master_key(&master_seed, &transformed);
    let body = cipher::encrypt(
        cipher::DataCipher::Aes256,
        &key,
        &encryption_iv,
        &plaintext,
    )?;

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&codec::write_u32(SIG1));
    out.extend_from_slice(&codec::write_u32(SIG2_KDB));
    out.extend_from_slice(&codec::write_u32(FLAG_SHA2 | FLAG_RIJNDAEL));
    out.extend_from_slice(&codec::write_u32(VERSION));
    out.extend_from_slice(&master_seed);
    out.extend_from_slice(&encryption_iv);
    out.extend_from_slice(&codec::write_u32(num_groups));
    out.extend_from_slice(&codec::write_u32(num_entries));
    out.extend_from_slice(&contents_hash);
    out.extend_from_slice(transform_seed);
    out.extend_from_slice(&codec::write_u32(rounds));
    out.extend_from_slice(&body);
    Ok(out)
}

fn serialize_body(database: &Database) -> Result<(Vec<u8>, u32, u32)> {
    // KDB has no root record: top-level groups sit at level 0, and root
    // entries need a synthetic group to live in.
    let root = database.root_uuid();
    let order: Vec<Uuid> = database
        .groups_preorder()
        .into_iter()
        .filter(|uuid| *uuid != root)
        .collect();

    let mut ids: HashMap<Uuid, u32> = HashMap::new();
    for (pos, uuid) in order.iter().enumerate() {
        ids.insert(*uuid, pos as u32 + 1);
    }

    let root_entries = &database.root().entries;
    let synthetic_id = if root_entries.is_empty() {
        None
    } else {
        Some(order.len() as u32 + 1)
    };

    let mut out = Vec::new();
    let mut num_groups = 0u32;
    for uuid in &order {
        let group = database
            .group(uuid)
            .ok_or_else(|| Error::malformed("group vanished during export"))?;
        let level = group_level(database, uuid)?;
        write_group_record(&mut out, group, ids[uuid], level);
        num_groups += 1;
    }
    if let Some(id) = synthetic_id {
        let holder = Group::new(database.root().name.clone());
        write_group_record(&mut out, &holder, id, 0);
        num_groups += 1;
    }

    let mut num_entries = 0u32;
    for uuid in database.entries_preorder() {
        let entry = database
            .entry(&uuid)
            .ok_or_else(|| Error::malformed("entry vanished during export"))?;
        let parent = entry
            .parent
            .ok_or_else(|| Error::malformed("entry without a parent"))?;
        let group_id = if parent == root {
            synthetic_id.expect("root entries imply a synthetic group")
        } else {
            ids[&parent]
        };
        write_entry_record(&mut out, database, entry, group_id);
        num_entries += 1;
    }
    Ok((out, num_groups, num_entries))
}

fn group_level(database: &Database, uuid: &Uuid) -> Result<u16> {
    let mut level = 0u16;
    let mut current = database
        .group(uuid)
        .ok_or(Error::GroupNotFound(*uuid))?
        .parent;
    while let Some(parent) = current {
        if parent == database.root_uuid() {
            return Ok(level);
        }
        level += 1;
        current = database.group(&parent).and_then(|g| g.parent);
    }
    Err(Error::malformed("group detached from the root"))
}

fn write_field(out: &mut Vec<u8>, field_type: u16, data: &[u8]) {
    out.extend_from_slice(&codec::write_u16(field_type));
    out.extend_from_slice(&codec::write_u32(data.len() as u32));
    out.extend_from_slice(data);
}

fn write_date(out: &mut Vec<u8>, field_type: u16, time: &chrono::DateTime<chrono::Utc>) {
    write_field(out, field_type, &codec::pack_kdb_date(time));
}

fn write_group_record(out: &mut Vec<u8>, group: &Group, id: u32, level: u16) {
    let never = codec::kdb_never_expire();
    let expiry = if group.times.expires {
        group.times.expiry
    } else {
        never
    };
    write_field(out, GROUP_ID, &codec::write_u32(id));
    write_field(out, GROUP_NAME, &codec::write_cstring(&group.name));
    write_date(out, GROUP_CREATION, &group.times.creation);
    write_date(out, GROUP_LAST_MOD, &group.times.last_modification);
    write_date(out, GROUP_LAST_ACCESS, &group.times.last_access);
    write_date(out, GROUP_EXPIRE, &expiry);
    write_field(out, GROUP_ICON, &codec::write_u32(group.icon_id));
    write_field(out, GROUP_LEVEL, &codec::write_u16(level));
    write_field(out, GROUP_FLAGS, &codec::write_u32(group.flags));
    write_field(out, FIELD_END, &[]);
}

fn write_entry_record(out: &mut Vec<u8>, database: &Database, entry: &Entry, group_id: u32) {
    let never = codec::kdb_never_expire();
    let expiry = if entry.times.expires {
        entry.times.expiry
    } else {
        never
    };
    write_field(out, ENTRY_UUID, &codec::uuid_to_bytes(&entry.uuid));
    write_field(out, ENTRY_GROUP_ID, &codec::write_u32(group_id));
    write_field(out, ENTRY_ICON, &codec::write_u32(entry.icon_id));
    write_field(out, ENTRY_TITLE, &codec::write_cstring(&entry.title));
    write_field(out, ENTRY_URL, &codec::write_cstring(&entry.url));
    write_field(out, ENTRY_USERNAME, &codec::write_cstring(&entry.username));
    write_field(out, ENTRY_PASSWORD, &codec::write_cstring(entry.password()));
    write_field(out, ENTRY_NOTES, &codec::write_cstring(&entry.notes));
    write_date(out, ENTRY_CREATION, &entry.times.creation);
    write_date(out, ENTRY_LAST_MOD, &entry.times.last_modification);
    write_date(out, ENTRY_LAST_ACCESS, &entry.times.last_access);
    write_date(out, ENTRY_EXPIRE, &expiry);
    // A single attachment survives the legacy format.
    if let Some((name, index)) = entry.binaries.iter().next() {
        let description = if entry.binary_description.is_empty() {
            name.as_str()
        } else {
            entry.binary_description.as_str()
        };
        write_field(out, ENTRY_BINARY_DESC, &codec::write_cstring(description));
        let data = database
            .binaries
            .get(*index)
            .map(|b| b.data.as_slice())
            .unwrap_or(&[]);
        write_field(out, ENTRY_BINARY_DATA, data);
    } else {
        write_field(out, ENTRY_BINARY_DESC, &codec::write_cstring(""));
        write_field(out, ENTRY_BINARY_DATA, &[]);
    }
    write_field(out, FIELD_END, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EntryBuilder;

    fn fast_database() -> Database {
        let mut db = Database::new("Legacy");
        db.settings.version = FormatVersion::Kdb;
        db.settings.kdf_parameters = kdf::aes_params_from_header(&[0u8; 32], 17);
        db
    }

    #[test]
    fn round_trip_nested_tree() {
        let mut db = fast_database();
        let internet = db.insert_group(Group::new("Internet")).unwrap();
        let mut mail = Group::new("Mail");
        mail.parent = Some(internet);
        let mail = db.insert_group(mail).unwrap();
        db.insert_entry(
            EntryBuilder::new("IMAP")
                .username("me@example.org")
                .password("s3cret")
                .parent(mail)
                .build(),
        )
        .unwrap();

        let credential = MasterCredential::with_password("kdb-pass");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();

        assert_eq!(back.group_count(), 3); // root + Internet + Mail
        assert_eq!(back.entry_count(), 1);
        let entry_uuid = back.entries_preorder()[0];
        let entry = back.entry(&entry_uuid).unwrap();
        assert_eq!(entry.title, "IMAP");
        assert_eq!(entry.password(), "s3cret");
        let parent = back.group(&entry.parent.unwrap()).unwrap();
        assert_eq!(parent.name, "Mail");
    }

    #[test]
    fn wrong_password_fails_integrity() {
        let mut db = fast_database();
        db.insert_entry(Entry::new("x")).unwrap();
        let bytes = save(&db, &MasterCredential::with_password("right")).unwrap();
        let err = open(&bytes, &MasterCredential::with_password("wrong")).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed));
    }

    #[test]
    fn flipped_body_byte_fails_integrity() {
        let mut db = fast_database();
        db.insert_entry(Entry::new("x")).unwrap();
        let credential = MasterCredential::with_password("pw");
        let mut bytes = save(&db, &credential).unwrap();
        let pos = bytes.len() - 20;
        bytes[pos] ^= 0x01;
        assert!(open(&bytes, &credential).is_err());
    }

    #[test]
    fn root_entries_get_a_synthetic_group() {
        let mut db = fast_database();
        db.insert_entry(Entry::new("at root")).unwrap();
        let credential = MasterCredential::with_password("pw");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();
        assert_eq!(back.group_count(), 2); // root + synthetic holder
        assert_eq!(back.entry_count(), 1);
    }

    #[test]
    fn attachment_round_trips() {
        let mut db = fast_database();
        let index = db.binaries.add(Binary {
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            protected: false,
        });
        let group = db.insert_group(Group::new("Files")).unwrap();
        let mut entry = EntryBuilder::new("With file").parent(group).build();
        entry.binary_description = "payload.bin".into();
        entry.binaries.insert("payload.bin".into(), index);
        db.insert_entry(entry).unwrap();

        let credential = MasterCredential::with_password("pw");
        let bytes = save(&db, &credential).unwrap();
        let back = open(&bytes, &credential).unwrap();
        let entry_uuid = back.entries_preorder()[0];
        let entry = back.entry(&entry_uuid).unwrap();
        let index = entry.binaries["payload.bin"];
        assert_eq!(back.binaries.get(index).unwrap().data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(open(&[0u8; 60], &MasterCredential::with_password("pw")).is_err());
    }
}
