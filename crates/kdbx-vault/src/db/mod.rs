//! The in-memory tree model: a UUID-keyed arena of groups and entries.
//!
//! The database exclusively owns all nodes; parent/child relations are
//! UUID lookups, so ancestry checks are O(depth) index-chasing and no
//! ownership cycles can form.

pub mod entry;
pub mod group;
pub mod mutation;
pub mod times;

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

pub use entry::{CustomField, Entry, EntryBuilder, SecureString};
pub use group::Group;
pub use times::Times;

use crate::crypto::cipher::DataCipher;
use crate::crypto::inner_stream::STREAM_ID_CHACHA20;
use crate::crypto::kdf::{self, KdfParameters};
use crate::error::{Error, Result};
use crate::variant::VariantDictionary;

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

const RECYCLE_BIN_NAME: &str = "Recycle Bin";
const RECYCLE_BIN_ICON: u32 = 43;

/// Which file format (and sub-version) a database serializes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Legacy KDB binary (KeePass 1.x)
    Kdb,
    /// KDBX 3.1: hashed block stream, Salsa20 inner stream
    Kdbx31,
    /// KDBX 4.0: HMAC block stream, ChaCha20 inner stream
    Kdbx4,
    /// KDBX 4.1
    Kdbx41,
}

impl FormatVersion {
    pub fn is_kdbx4(&self) -> bool {
        matches!(self, FormatVersion::Kdbx4 | FormatVersion::Kdbx41)
    }
}

/// Database-wide metadata (the XML `Meta` block, or KDB equivalents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub name: String,
    pub description: String,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Option<Uuid>,
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub memory_protection: MemoryProtection,
    pub custom_data: BTreeMap<String, String>,
    pub custom_icons: BTreeMap<Uuid, Vec<u8>>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            generator: env!("CARGO_PKG_NAME").to_string(),
            name: String::new(),
            description: String::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: None,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            memory_protection: MemoryProtection::default(),
            custom_data: BTreeMap::new(),
            custom_icons: BTreeMap::new(),
        }
    }
}

/// Which standard fields are written with Protected=True.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

/// An attachment in the binary pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary {
    pub data: Vec<u8>,
    pub protected: bool,
}

/// Deduplicating pool of attachment payloads, owned by the database and
/// referenced by index from entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryPool {
    items: Vec<Binary>,
}

impl BinaryPool {
    pub fn add(&mut self, binary: Binary) -> usize {
        if let Some(pos) = self.items.iter().position(|b| *b == binary) {
            return pos;
        }
        self.items.push(binary);
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Binary> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binary> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Crypto and format settings persisted in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSettings {
    pub version: FormatVersion,
    pub cipher: DataCipher,
    pub compression: bool,
    pub kdf_parameters: KdfParameters,
    pub inner_stream_id: u32,
    /// KDBX 4 PublicCustomData header field, preserved verbatim
    pub public_custom_data: VariantDictionary,
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            version: FormatVersion::Kdbx4,
            cipher: DataCipher::Aes256,
            compression: true,
            kdf_parameters: kdf::engine_for(&kdf::KDF_ARGON2D)
                .expect("registered engine")
                .default_parameters(),
            inner_stream_id: STREAM_ID_CHACHA20,
            public_custom_data: VariantDictionary::new(),
        }
    }
}

/// The rooted tree of groups and entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub meta: Meta,
    pub settings: HeaderSettings,
    pub binaries: BinaryPool,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    root: Uuid,
}

impl Database {
    /// Create an empty database with a fresh root group.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Group::new(name.clone());
        let root_uuid = root.uuid;
        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);
        Self {
            meta: Meta {
                name,
                ..Meta::default()
            },
            settings: HeaderSettings::default(),
            binaries: BinaryPool::default(),
            groups,
            entries: HashMap::new(),
            root: root_uuid,
        }
    }

    /// Rebuild a database from parts produced by an importer. Validates
    /// that every parent back-reference points at a known group.
    pub(crate) fn from_parts(
        meta: Meta,
        settings: HeaderSettings,
        binaries: BinaryPool,
        groups: HashMap<Uuid, Group>,
        entries: HashMap<Uuid, Entry>,
        root: Uuid,
    ) -> Result<Self> {
        if !groups.contains_key(&root) {
            return Err(Error::malformed("root group missing from arena"));
        }
        for group in groups.values() {
            if let Some(parent) = group.parent {
                if !groups.contains_key(&parent) {
                    return Err(Error::malformed("group parent not in arena"));
                }
            }
        }
        for entry in entries.values() {
            match entry.parent {
                Some(parent) if groups.contains_key(&parent) => {}
                _ => return Err(Error::malformed("entry without a valid owning group")),
            }
        }
        Ok(Self {
            meta,
            settings,
            binaries,
            groups,
            entries,
            root,
        })
    }

    pub fn root_uuid(&self) -> Uuid {
        self.root
    }

    pub fn root(&self) -> &Group {
        self.groups.get(&self.root).expect("root group must exist")
    }

    pub fn group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    pub fn group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        self.groups.get_mut(uuid)
    }

    pub fn entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    pub fn entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(uuid)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Insert an entry into the arena and attach it to its parent
    /// (defaulting to the root group).
    pub fn insert_entry(&mut self, mut entry: Entry) -> Result<Uuid> {
        let parent = entry.parent.unwrap_or(self.root);
        entry.parent = Some(parent);
        let uuid = entry.uuid;
        let group = self
            .groups
            .get_mut(&parent)
            .ok_or(Error::GroupNotFound(parent))?;
        group.add_entry(uuid);
        self.entries.insert(uuid, entry);
        Ok(uuid)
    }

    /// Insert a group into the arena and attach it to its parent
    /// (defaulting to the root group).
    pub fn insert_group(&mut self, mut group: Group) -> Result<Uuid> {
        let parent = group.parent.unwrap_or(self.root);
        group.parent = Some(parent);
        let uuid = group.uuid;
        let parent_group = self
            .groups
            .get_mut(&parent)
            .ok_or(Error::GroupNotFound(parent))?;
        parent_group.add_group(uuid);
        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    pub(crate) fn detach_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;
        if let Some(parent) = entry.parent {
            if let Some(group) = self.groups.get_mut(&parent) {
                group.remove_entry(uuid);
            }
        }
        Ok(entry)
    }

    /// Remove a group and everything below it from the arena.
    pub(crate) fn remove_subtree(&mut self, uuid: &Uuid) -> Result<()> {
        let group = self
            .groups
            .remove(uuid)
            .ok_or(Error::GroupNotFound(*uuid))?;
        if let Some(parent) = group.parent {
            if let Some(parent_group) = self.groups.get_mut(&parent) {
                parent_group.remove_group(uuid);
            }
        }
        for entry_uuid in &group.entries {
            self.entries.remove(entry_uuid);
        }
        for child in &group.groups {
            // Children have already been detached from their parent map
            // entry; recurse on the arena directly.
            self.remove_subtree_inner(child);
        }
        Ok(())
    }

    fn remove_subtree_inner(&mut self, uuid: &Uuid) {
        if let Some(group) = self.groups.remove(uuid) {
            for entry_uuid in &group.entries {
                self.entries.remove(entry_uuid);
            }
            for child in &group.groups {
                self.remove_subtree_inner(child);
            }
        }
    }

    /// True if `ancestor` is on the parent chain of `node` (or equal).
    pub fn is_same_or_ancestor(&self, ancestor: &Uuid, node: &Uuid) -> bool {
        let mut current = Some(*node);
        while let Some(uuid) = current {
            if uuid == *ancestor {
                return true;
            }
            current = self.groups.get(&uuid).and_then(|g| g.parent);
        }
        false
    }

    /// True if the node is somewhere inside the recycle bin.
    pub fn is_in_recycle_bin(&self, group_uuid: &Uuid) -> bool {
        match self.meta.recycle_bin_uuid {
            Some(bin) => self.is_same_or_ancestor(&bin, group_uuid),
            None => false,
        }
    }

    /// The recycle bin group, creating it on first use when recycling is
    /// enabled.
    pub fn recycle_bin_or_create(&mut self) -> Result<Uuid> {
        if let Some(bin) = self.meta.recycle_bin_uuid {
            if self.groups.contains_key(&bin) {
                return Ok(bin);
            }
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME);
        bin.icon_id = RECYCLE_BIN_ICON;
        bin.enable_searching = Some(false);
        bin.enable_auto_type = Some(false);
        let uuid = self.insert_group(bin)?;
        self.meta.recycle_bin_uuid = Some(uuid);
        Ok(uuid)
    }

    /// Pre-order traversal of group UUIDs starting at the root.
    pub fn groups_preorder(&self) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(self.groups.len());
        self.collect_groups(&self.root, &mut out);
        out
    }

    fn collect_groups(&self, uuid: &Uuid, out: &mut Vec<Uuid>) {
        if let Some(group) = self.groups.get(uuid) {
            out.push(*uuid);
            for child in &group.groups {
                self.collect_groups(child, out);
            }
        }
    }

    /// Pre-order traversal of entries: for each group in pre-order, its
    /// entries in file order. This is the canonical traversal order used
    /// by search results and by the export path.
    pub fn entries_preorder(&self) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(self.entries.len());
        for group_uuid in self.groups_preorder() {
            if let Some(group) = self.groups.get(&group_uuid) {
                out.extend(group.entries.iter().copied());
            }
        }
        out
    }

    /// Structural equality ignoring header seeds/IVs: tree shape, node
    /// fields and metadata.
    pub fn tree_eq(&self, other: &Database) -> bool {
        if self.meta != other.meta || self.binaries != other.binaries {
            return false;
        }
        let mine = self.groups_preorder();
        let theirs = other.groups_preorder();
        if mine.len() != theirs.len() {
            return false;
        }
        for (a, b) in mine.iter().zip(theirs.iter()) {
            if self.groups.get(a) != other.groups.get(b) {
                return false;
            }
        }
        let mine = self.entries_preorder();
        let theirs = other.entries_preorder();
        if mine.len() != theirs.len() {
            return false;
        }
        mine.iter()
            .zip(theirs.iter())
            .all(|(a, b)| self.entries.get(a) == other.entries.get(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_database_has_root_only() {
        let db = Database::new("Passwords");
        assert_eq!(db.group_count(), 1);
        assert_eq!(db.entry_count(), 0);
        assert!(db.root().is_root());
    }

    #[test]
    fn insert_entry_attaches_to_root() {
        let mut db = Database::new("Passwords");
        let uuid = db.insert_entry(Entry::new("GitHub")).unwrap();
        assert_eq!(db.entry(&uuid).unwrap().parent, Some(db.root_uuid()));
        assert!(db.root().entries.contains(&uuid));
    }

    #[test]
    fn ancestry_follows_parent_chain() {
        let mut db = Database::new("Passwords");
        let a = db.insert_group(Group::new("A")).unwrap();
        let mut b = Group::new("B");
        b.parent = Some(a);
        let b = db.insert_group(b).unwrap();
        assert!(db.is_same_or_ancestor(&a, &b));
        assert!(!db.is_same_or_ancestor(&b, &a));
        assert!(db.is_same_or_ancestor(&db.root_uuid(), &b));
    }

    #[test]
    fn preorder_is_depth_first() {
        let mut db = Database::new("Passwords");
        let a = db.insert_group(Group::new("A")).unwrap();
        let mut inner = Group::new("A1");
        inner.parent = Some(a);
        let a1 = db.insert_group(inner).unwrap();
        let b = db.insert_group(Group::new("B")).unwrap();
        assert_eq!(db.groups_preorder(), vec![db.root_uuid(), a, a1, b]);
    }

    #[test]
    fn recycle_bin_created_once() {
        let mut db = Database::new("Passwords");
        let bin1 = db.recycle_bin_or_create().unwrap();
        let bin2 = db.recycle_bin_or_create().unwrap();
        assert_eq!(bin1, bin2);
        assert!(db.is_in_recycle_bin(&bin1));
    }

    #[test]
    fn binary_pool_dedupes() {
        let mut pool = BinaryPool::default();
        let a = pool.add(Binary {
            data: vec![1, 2, 3],
            protected: false,
        });
        let b = pool.add(Binary {
            data: vec![1, 2, 3],
            protected: false,
        });
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_subtree_drops_descendants() {
        let mut db = Database::new("Passwords");
        let a = db.insert_group(Group::new("A")).unwrap();
        let mut child = Group::new("A1");
        child.parent = Some(a);
        let a1 = db.insert_group(child).unwrap();
        let mut entry = Entry::new("deep");
        entry.parent = Some(a1);
        let e = db.insert_entry(entry).unwrap();

        db.remove_subtree(&a).unwrap();
        assert!(db.group(&a).is_none());
        assert!(db.group(&a1).is_none());
        assert!(db.entry(&e).is_none());
    }
}
