//! Master credentials and composite key derivation.
//!
//! The credential holds raw key material only; secure storage of that
//! material (keystores, enclaves) is an external concern.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// A password kept in memory, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretString(***)")
    }
}

/// A 32-byte key wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub [u8; 32]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(***)")
    }
}

/// The user-supplied credentials for a database.
#[derive(Debug, Clone, Default)]
pub struct MasterCredential {
    password: Option<SecretString>,
    keyfile: Option<Vec<u8>>,
}

impl MasterCredential {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(SecretString::new(password)),
            keyfile: None,
        }
    }

    pub fn with_keyfile(mut self, keyfile_bytes: impl Into<Vec<u8>>) -> Self {
        self.keyfile = Some(keyfile_bytes.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.keyfile.is_none()
    }

    /// Composite key for KDBX files: SHA-256 over the concatenation of
    /// SHA-256(password) and the key-file key, each included only when
    /// present.
    pub fn composite_key_kdbx(&self) -> Result<SecretKey> {
        if self.is_empty() {
            return Err(Error::malformed("no credentials supplied"));
        }
        let mut hasher = Sha256::new();
        if let Some(password) = &self.password {
            hasher.update(Sha256::digest(password.as_str().as_bytes()));
        }
        if let Some(keyfile) = &self.keyfile {
            hasher.update(keyfile_key(keyfile)?.0);
        }
        Ok(SecretKey(hasher.finalize().into()))
    }

    /// Composite key for legacy KDB files. With a password alone the key
    /// is SHA-256(password) directly, without the outer hash round.
    pub fn composite_key_kdb(&self) -> Result<SecretKey> {
        match (&self.password, &self.keyfile) {
            (Some(password), None) => Ok(SecretKey(
                Sha256::digest(password.as_str().as_bytes()).into(),
            )),
            (None, Some(keyfile)) => keyfile_key(keyfile),
            (Some(password), Some(keyfile)) => {
                let mut hasher = Sha256::new();
                hasher.update(Sha256::digest(password.as_str().as_bytes()));
                hasher.update(keyfile_key(keyfile)?.0);
                Ok(SecretKey(hasher.finalize().into()))
            }
            (None, None) => Err(Error::malformed("no credentials supplied")),
        }
    }
}

/// Derive the 32-byte key contribution of a key file.
///
/// Recognized flavors, in order: exact 32 raw bytes, 64 hex characters,
/// KeePass XML key file, and otherwise SHA-256 of the whole content.
fn keyfile_key(content: &[u8]) -> Result<SecretKey> {
    if content.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(content);
        return Ok(SecretKey(key));
    }
    if content.len() == 64 {
        if let Ok(text) = std::str::from_utf8(content) {
            if let Ok(bytes) = hex::decode(text.trim()) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    return Ok(SecretKey(key));
                }
            }
        }
    }
    if let Some(key) = xml_keyfile_key(content)? {
        return Ok(key);
    }
    Ok(SecretKey(Sha256::digest(content).into()))
}

/// Parse a `<KeyFile><Key><Data>` XML key file.
///
/// Version 1.0 stores the key base64-encoded; version 2.0 stores it as
/// hex with an optional `Hash` attribute covering the first 4 bytes of
/// SHA-256(key). Returns `Ok(None)` when the content is not XML at all.
fn xml_keyfile_key(content: &[u8]) -> Result<Option<SecretKey>> {
    use quick_xml::events::Event;

    let text = match std::str::from_utf8(content) {
        Ok(text) if text.trim_start().starts_with('<') => text,
        _ => return Ok(None),
    };

    let mut reader = quick_xml::Reader::from_str(text);

    let mut in_data = false;
    let mut saw_keyfile = false;
    let mut data_text = String::new();
    let mut hash_attr: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"KeyFile" => saw_keyfile = true,
                b"Data" => {
                    in_data = true;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"Hash" {
                            hash_attr =
                                Some(String::from_utf8_lossy(&attr.value).into_owned());
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_data => {
                data_text.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"Data" => in_data = false,
            Ok(Event::Eof) => break,
            Err(_) => return Ok(None),
            _ => {}
        }
    }

    if !saw_keyfile || data_text.is_empty() {
        return Ok(None);
    }

    let compact: String = data_text.split_whitespace().collect();
    let bytes = if let Some(hash) = hash_attr {
        // Version 2.0: hex data, integrity-checked.
        let bytes =
            hex::decode(&compact).map_err(|_| Error::malformed("key file hex data"))?;
        let digest = Sha256::digest(&bytes);
        let expected =
            hex::decode(&hash).map_err(|_| Error::malformed("key file hash attribute"))?;
        if digest[..expected.len().min(32)] != expected[..] {
            return Err(Error::IntegrityCheckFailed);
        }
        bytes
    } else {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&compact)
            .map_err(|_| Error::malformed("key file base64 data"))?
    };

    if bytes.len() != 32 {
        return Err(Error::malformed("key file data is not 32 bytes"));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(Some(SecretKey(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_is_deterministic() {
        let cred = MasterCredential::with_password("hunter2");
        let a = cred.composite_key_kdbx().unwrap();
        let b = cred.composite_key_kdbx().unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn keyfile_changes_composite() {
        let plain = MasterCredential::with_password("hunter2");
        let with_file = MasterCredential::with_password("hunter2").with_keyfile([7u8; 32]);
        assert_ne!(
            plain.composite_key_kdbx().unwrap().0,
            with_file.composite_key_kdbx().unwrap().0
        );
    }

    #[test]
    fn raw_32_byte_keyfile_is_used_verbatim() {
        let key = keyfile_key(&[9u8; 32]).unwrap();
        assert_eq!(key.0, [9u8; 32]);
    }

    #[test]
    fn hex_keyfile_is_decoded() {
        let hex64 = "00".repeat(31) + "ff";
        let key = keyfile_key(hex64.as_bytes()).unwrap();
        assert_eq!(key.0[31], 0xFF);
        assert_eq!(key.0[0], 0);
    }

    #[test]
    fn xml_keyfile_v1_is_parsed() {
        use base64::Engine;
        let data = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
        let xml = format!(
            "<KeyFile><Meta><Version>1.0</Version></Meta><Key><Data>{data}</Data></Key></KeyFile>"
        );
        let key = keyfile_key(xml.as_bytes()).unwrap();
        assert_eq!(key.0, [3u8; 32]);
    }

    #[test]
    fn arbitrary_keyfile_is_hashed() {
        let key = keyfile_key(b"not a structured key file").unwrap();
        assert_eq!(
            key.0,
            <[u8; 32]>::from(Sha256::digest(b"not a structured key file"))
        );
    }

    #[test]
    fn empty_credential_is_rejected() {
        assert!(MasterCredential::default().composite_key_kdbx().is_err());
    }
}
