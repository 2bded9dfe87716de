//! VariantDictionary: the typed key/value wire format carrying KDF
//! parameters and public custom data in KDBX 4 headers.
//!
//! Wire layout: u16 version, then repeated records of
//! (type byte, u32 name length, name, u32 value length, value),
//! terminated by a 0x00 type byte.

use std::collections::BTreeMap;

use crate::codec;
use crate::error::{Error, Result};

const VD_VERSION: u16 = 0x0100;
const VDM_CRITICAL: u16 = 0xFF00;

const TYPE_NONE: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTE_ARRAY: u8 = 0x42;

/// A value in a [`VariantDictionary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    ByteArray(Vec<u8>),
}

/// Typed dictionary with a stable serialization order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    // BTreeMap keeps serialization deterministic across round trips.
    entries: BTreeMap<String, VariantValue>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: VariantValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&VariantValue> {
        self.entries.get(name)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.entries.get(name) {
            Some(VariantValue::UInt32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.entries.get(name) {
            Some(VariantValue::UInt64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.entries.get(name) {
            Some(VariantValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.entries.get(name) {
            Some(VariantValue::ByteArray(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.entries.get(name) {
            Some(VariantValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set_u32(&mut self, name: impl Into<String>, value: u32) {
        self.set(name, VariantValue::UInt32(value));
    }

    pub fn set_u64(&mut self, name: impl Into<String>, value: u64) {
        self.set(name, VariantValue::UInt64(value));
    }

    pub fn set_bytes(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.set(name, VariantValue::ByteArray(value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a dictionary from its wire form.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        let version = codec::read_u16(codec::take(&mut cursor, 2)?);
        if version & VDM_CRITICAL > VD_VERSION & VDM_CRITICAL {
            return Err(Error::malformed(format!(
                "variant dictionary version {version:#06x} too new"
            )));
        }

        let mut dict = VariantDictionary::new();
        loop {
            let type_byte = codec::take(&mut cursor, 1)?[0];
            if type_byte == TYPE_NONE {
                break;
            }
            let name_len = codec::read_u32(codec::take(&mut cursor, 4)?) as usize;
            let name_buf = codec::take(&mut cursor, name_len)?;
            let name = std::str::from_utf8(name_buf)
                .map_err(|_| Error::malformed("variant name is not UTF-8"))?
                .to_owned();
            let value_len = codec::read_u32(codec::take(&mut cursor, 4)?) as usize;
            let value_buf = codec::take(&mut cursor, value_len)?;

            let value = match type_byte {
                TYPE_UINT32 if value_len == 4 => VariantValue::UInt32(codec::read_u32(value_buf)),
                TYPE_UINT64 if value_len == 8 => VariantValue::UInt64(codec::read_u64(value_buf)),
                TYPE_BOOL if value_len == 1 => VariantValue::Bool(value_buf[0] != 0),
                TYPE_INT32 if value_len == 4 => {
                    VariantValue::Int32(codec::read_u32(value_buf) as i32)
                }
                TYPE_INT64 if value_len == 8 => {
                    VariantValue::Int64(codec::read_u64(value_buf) as i64)
                }
                TYPE_STRING => VariantValue::String(
                    std::str::from_utf8(value_buf)
                        .map_err(|_| Error::malformed("variant string is not UTF-8"))?
                        .to_owned(),
                ),
                TYPE_BYTE_ARRAY => VariantValue::ByteArray(value_buf.to_vec()),
                _ => {
                    return Err(Error::malformed(format!(
                        "variant entry {name:?}: bad type {type_byte:#04x} or length {value_len}"
                    )))
                }
            };
            dict.entries.insert(name, value);
        }
        Ok(dict)
    }

    /// Serialize to the wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&codec::write_u16(VD_VERSION));
        for (name, value) in &self.entries {
            let (type_byte, value_bytes): (u8, Vec<u8>) = match value {
                VariantValue::UInt32(v) => (TYPE_UINT32, v.to_le_bytes().to_vec()),
                VariantValue::UInt64(v) => (TYPE_UINT64, v.to_le_bytes().to_vec()),
                VariantValue::Bool(v) => (TYPE_BOOL, vec![u8::from(*v)]),
                VariantValue::Int32(v) => (TYPE_INT32, v.to_le_bytes().to_vec()),
                VariantValue::Int64(v) => (TYPE_INT64, v.to_le_bytes().to_vec()),
                VariantValue::String(v) => (TYPE_STRING, v.as_bytes().to_vec()),
                VariantValue::ByteArray(v) => (TYPE_BYTE_ARRAY, v.clone()),
            };
            out.push(type_byte);
            out.extend_from_slice(&codec::write_u32(name.len() as u32));
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&codec::write_u32(value_bytes.len() as u32));
            out.extend_from_slice(&value_bytes);
        }
        out.push(TYPE_NONE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        let mut dict = VariantDictionary::new();
        dict.set_u32("P", 2);
        dict.set_u64("M", 64 * 1024 * 1024);
        dict.set("B", VariantValue::Bool(true));
        dict.set("I32", VariantValue::Int32(-5));
        dict.set("I64", VariantValue::Int64(-5_000_000_000));
        dict.set("Name", VariantValue::String("argon2".into()));
        dict.set_bytes("S", vec![1, 2, 3, 4]);

        let wire = dict.serialize();
        let back = VariantDictionary::deserialize(&wire).unwrap();
        assert_eq!(dict, back);
    }

    #[test]
    fn rejects_newer_critical_version() {
        let mut wire = VariantDictionary::new().serialize();
        wire[1] = 0x02; // bump the critical version byte
        assert!(VariantDictionary::deserialize(&wire).is_err());
    }

    #[test]
    fn rejects_truncated_entry() {
        let mut dict = VariantDictionary::new();
        dict.set_u32("P", 2);
        let mut wire = dict.serialize();
        wire.truncate(wire.len() - 3);
        assert!(VariantDictionary::deserialize(&wire).is_err());
    }

    #[test]
    fn mismatched_length_is_rejected() {
        let mut wire: Vec<u8> = vec![0x00, 0x01]; // version
        wire.push(TYPE_UINT32);
        wire.extend_from_slice(&1u32.to_le_bytes());
        wire.push(b'P');
        wire.extend_from_slice(&2u32.to_le_bytes()); // UInt32 must be 4 bytes
        wire.extend_from_slice(&[0, 0]);
        wire.push(TYPE_NONE);
        assert!(VariantDictionary::deserialize(&wire).is_err());
    }
}
