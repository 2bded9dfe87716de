//! Group types and operations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::times::Times;

/// A group (folder) containing entries and subgroups.
///
/// Children are held as UUIDs into the database arena; the `parent` field
/// is a back-reference for lookups only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub parent: Option<Uuid>,
    /// Child group UUIDs in file order
    #[serde(default)]
    pub groups: Vec<Uuid>,
    /// Entry UUIDs in file order
    #[serde(default)]
    pub entries: Vec<Uuid>,
    pub times: Times,
    pub is_expanded: bool,
    /// None inherits from the parent group
    pub enable_searching: Option<bool>,
    pub enable_auto_type: Option<bool>,
    pub default_auto_type_sequence: String,
    pub last_top_visible_entry: Option<Uuid>,
    /// KDB v3 group flags, preserved for round trips
    #[serde(default)]
    pub flags: u32,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            notes: String::new(),
            icon_id: 48,
            custom_icon: None,
            parent: None,
            groups: Vec::new(),
            entries: Vec::new(),
            times: Times::now(),
            is_expanded: true,
            enable_searching: None,
            enable_auto_type: None,
            default_auto_type_sequence: String::new(),
            last_top_visible_entry: None,
            flags: 0,
        }
    }

    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        let mut group = Self::new(name);
        group.uuid = uuid;
        group
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn add_group(&mut self, child: Uuid) {
        if !self.groups.contains(&child) {
            self.groups.push(child);
            self.times.touch_modified();
        }
    }

    pub fn remove_group(&mut self, child: &Uuid) -> bool {
        match self.groups.iter().position(|u| u == child) {
            Some(pos) => {
                self.groups.remove(pos);
                self.times.touch_modified();
                true
            }
            None => false,
        }
    }

    pub fn add_entry(&mut self, entry: Uuid) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
            self.times.touch_modified();
        }
    }

    pub fn remove_entry(&mut self, entry: &Uuid) -> bool {
        match self.entries.iter().position(|u| u == entry) {
            Some(pos) => {
                self.entries.remove(pos);
                self.times.touch_modified();
                true
            }
            None => false,
        }
    }

    /// Whether entries below this group participate in searches, absent
    /// any override further up the tree.
    pub fn searching_enabled(&self) -> bool {
        self.enable_searching.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_children() {
        let mut group = Group::new("Work");
        let child = Uuid::new_v4();
        group.add_group(child);
        group.add_group(child); // no duplicates
        assert_eq!(group.groups.len(), 1);
        assert!(group.remove_group(&child));
        assert!(!group.remove_group(&child));
    }

    #[test]
    fn entry_membership() {
        let mut group = Group::new("Work");
        let entry = Uuid::new_v4();
        group.add_entry(entry);
        assert!(group.entries.contains(&entry));
        assert!(group.remove_entry(&entry));
        assert!(group.entries.is_empty());
    }

    #[test]
    fn searching_defaults_to_enabled() {
        let mut group = Group::new("Any");
        assert!(group.searching_enabled());
        group.enable_searching = Some(false);
        assert!(!group.searching_enabled());
    }
}
