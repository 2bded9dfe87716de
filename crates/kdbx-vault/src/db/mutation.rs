//! Tree mutation operations with persist-or-rollback semantics.
//!
//! Every mutation runs the same state machine:
//! Prepare (snapshot a backup) → Apply (mutate the in-memory tree) →
//! Persist (caller-supplied serializer) → Commit, or Rollback to the
//! snapshot on any failure. The in-memory tree therefore never diverges
//! from the last durably saved state.
//!
//! All functions are synchronous; dispatching off the UI thread and
//! serializing concurrent persists is the caller's responsibility.

use uuid::Uuid;

use super::{Database, Entry, Group};
use crate::error::{Error, Result};

/// Reference to a node touched by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Group(Uuid),
    Entry(Uuid),
}

/// What a committed mutation did: the node before (if it existed) and
/// after (if it still exists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub old: Option<NodeRef>,
    pub new: Option<NodeRef>,
}

/// The Persist step: serialize the tree to durable storage.
pub type PersistFn<'a> = dyn FnMut(&Database) -> Result<()> + 'a;

impl Database {
    fn run_mutation<F>(&mut self, persist: &mut PersistFn, apply: F) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut Database) -> Result<MutationOutcome>,
    {
        let backup = self.clone();
        let result = apply(self).and_then(|outcome| {
            persist(self)?;
            Ok(outcome)
        });
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                *self = backup;
                Err(err)
            }
        }
    }

    pub fn add_entry(
        &mut self,
        entry: Entry,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, |db| {
            let uuid = db.insert_entry(entry)?;
            Ok(MutationOutcome {
                old: None,
                new: Some(NodeRef::Entry(uuid)),
            })
        })
    }

    /// Replace an entry's content, snapshotting the previous state into
    /// its history list first (subject to the configured caps).
    pub fn update_entry(
        &mut self,
        uuid: Uuid,
        mut updated: Entry,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        let max_items = self.meta.history_max_items;
        let max_size = self.meta.history_max_size;
        self.run_mutation(persist, move |db| {
            let current = db.entries.get_mut(&uuid).ok_or(Error::EntryNotFound(uuid))?;
            current.snapshot_into_history(max_items, max_size);
            updated.uuid = uuid;
            updated.parent = current.parent;
            updated.history = std::mem::take(&mut current.history);
            updated.times.touch_modified();
            *current = updated;
            Ok(MutationOutcome {
                old: Some(NodeRef::Entry(uuid)),
                new: Some(NodeRef::Entry(uuid)),
            })
        })
    }

    pub fn move_entry(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, |db| {
            if !db.groups.contains_key(&destination) {
                return Err(Error::GroupNotFound(destination));
            }
            let mut entry = db.detach_entry(&uuid)?;
            entry.parent = Some(destination);
            entry.times.touch_moved();
            db.insert_entry(entry)?;
            Ok(MutationOutcome {
                old: Some(NodeRef::Entry(uuid)),
                new: Some(NodeRef::Entry(uuid)),
            })
        })
    }

    /// Duplicate an entry under a destination group with a fresh UUID
    /// and empty history.
    pub fn copy_entry(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, |db| {
            let source = db.entries.get(&uuid).ok_or(Error::EntryNotFound(uuid))?;
            let mut copy = source.clone();
            copy.uuid = Uuid::new_v4();
            copy.parent = Some(destination);
            copy.history.clear();
            copy.times = super::Times::now();
            let new_uuid = db.insert_entry(copy)?;
            Ok(MutationOutcome {
                old: Some(NodeRef::Entry(uuid)),
                new: Some(NodeRef::Entry(new_uuid)),
            })
        })
    }

    /// Delete an entry: soft-delete into the recycle bin when recycling
    /// is enabled and the entry is not already inside the bin, otherwise
    /// remove it permanently.
    pub fn delete_entry(
        &mut self,
        uuid: Uuid,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, |db| {
            let parent = db
                .entries
                .get(&uuid)
                .ok_or(Error::EntryNotFound(uuid))?
                .parent
                .ok_or(Error::EntryNotFound(uuid))?;
            let recycle = db.meta.recycle_bin_enabled && !db.is_in_recycle_bin(&parent);
            if recycle {
                let bin = db.recycle_bin_or_create()?;
                let mut entry = db.detach_entry(&uuid)?;
                entry.parent = Some(bin);
                entry.times.touch_moved();
                db.insert_entry(entry)?;
                Ok(MutationOutcome {
                    old: Some(NodeRef::Entry(uuid)),
                    new: Some(NodeRef::Entry(uuid)),
                })
            } else {
                db.detach_entry(&uuid)?;
                Ok(MutationOutcome {
                    old: Some(NodeRef::Entry(uuid)),
                    new: None,
                })
            }
        })
    }

    pub fn add_group(
        &mut self,
        group: Group,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, |db| {
            let uuid = db.insert_group(group)?;
            Ok(MutationOutcome {
                old: None,
                new: Some(NodeRef::Group(uuid)),
            })
        })
    }

    pub fn update_group(
        &mut self,
        uuid: Uuid,
        mut updated: Group,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        self.run_mutation(persist, move |db| {
            let current = db.groups.get_mut(&uuid).ok_or(Error::GroupNotFound(uuid))?;
            updated.uuid = uuid;
            updated.parent = current.parent;
            updated.groups = std::mem::take(&mut current.groups);
            updated.entries = std::mem::take(&mut current.entries);
            updated.times.touch_modified();
            *current = updated;
            Ok(MutationOutcome {
                old: Some(NodeRef::Group(uuid)),
                new: Some(NodeRef::Group(uuid)),
            })
        })
    }

    /// Re-parent a group. Moving a group into itself or any of its
    /// descendants is rejected before the tree is touched.
    pub fn move_group(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        if self.is_same_or_ancestor(&uuid, &destination) {
            return Err(Error::InvalidMove(
                "cannot move a group into its own subtree".into(),
            ));
        }
        self.run_mutation(persist, |db| {
            db.reparent_group(uuid, destination)?;
            Ok(MutationOutcome {
                old: Some(NodeRef::Group(uuid)),
                new: Some(NodeRef::Group(uuid)),
            })
        })
    }

    fn reparent_group(&mut self, uuid: Uuid, destination: Uuid) -> Result<()> {
        if !self.groups.contains_key(&destination) {
            return Err(Error::GroupNotFound(destination));
        }
        let old_parent = self
            .groups
            .get(&uuid)
            .ok_or(Error::GroupNotFound(uuid))?
            .parent
            .ok_or_else(|| Error::InvalidMove("cannot move the root group".into()))?;
        if let Some(parent) = self.groups.get_mut(&old_parent) {
            parent.remove_group(&uuid);
        }
        if let Some(dest) = self.groups.get_mut(&destination) {
            dest.add_group(uuid);
        }
        let group = self.groups.get_mut(&uuid).expect("presence checked above");
        group.parent = Some(destination);
        group.times.touch_moved();
        Ok(())
    }

    /// Delete a group and its subtree, through the recycle bin when
    /// enabled (same policy as entries).
    pub fn delete_group(
        &mut self,
        uuid: Uuid,
        persist: &mut PersistFn,
    ) -> Result<MutationOutcome> {
        if uuid == self.root {
            return Err(Error::InvalidMove("cannot delete the root group".into()));
        }
        let in_bin = self.is_in_recycle_bin(&uuid);
        let is_bin = self.meta.recycle_bin_uuid == Some(uuid);
        let recycle = self.meta.recycle_bin_enabled && !in_bin && !is_bin;
        self.run_mutation(persist, |db| {
            if recycle {
                let bin = db.recycle_bin_or_create()?;
                db.reparent_group(uuid, bin)?;
                Ok(MutationOutcome {
                    old: Some(NodeRef::Group(uuid)),
                    new: Some(NodeRef::Group(uuid)),
                })
            } else {
                db.remove_subtree(&uuid)?;
                if db.meta.recycle_bin_uuid == Some(uuid) {
                    db.meta.recycle_bin_uuid = None;
                }
                Ok(MutationOutcome {
                    old: Some(NodeRef::Group(uuid)),
                    new: None,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EntryBuilder;

    fn ok_persist() -> Box<PersistFn<'static>> {
        Box::new(|_db: &Database| Ok(()))
    }

    fn failing_persist() -> Box<PersistFn<'static>> {
        Box::new(|_db: &Database| Err(Error::Io("disk full".into())))
    }

    #[test]
    fn add_entry_commits_on_persist_success() {
        let mut db = Database::new("T");
        let outcome = db
            .add_entry(Entry::new("GitHub"), &mut *ok_persist())
            .unwrap();
        assert!(matches!(outcome.new, Some(NodeRef::Entry(_))));
        assert_eq!(db.entry_count(), 1);
    }

    #[test]
    fn failed_persist_rolls_back() {
        let mut db = Database::new("T");
        let before = db.clone();
        let err = db
            .add_entry(Entry::new("GitHub"), &mut *failing_persist())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(db.tree_eq(&before));
        assert_eq!(db.entry_count(), 0);
    }

    #[test]
    fn update_snapshots_history() {
        let mut db = Database::new("T");
        let uuid = db
            .insert_entry(EntryBuilder::new("Old title").password("p1").build())
            .unwrap();
        let updated = EntryBuilder::new("New title").password("p2").build();
        db.update_entry(uuid, updated, &mut *ok_persist()).unwrap();

        let entry = db.entry(&uuid).unwrap();
        assert_eq!(entry.title, "New title");
        assert_eq!(entry.history.len(), 1);
        assert_eq!(entry.history[0].title, "Old title");
        assert_eq!(entry.history[0].password(), "p1");
    }

    #[test]
    fn move_group_into_descendant_rejected_tree_unchanged() {
        let mut db = Database::new("T");
        let g = db.insert_group(Group::new("G")).unwrap();
        let mut child = Group::new("D");
        child.parent = Some(g);
        let d = db.insert_group(child).unwrap();

        let before = db.clone();
        let err = db.move_group(g, d, &mut *ok_persist()).unwrap_err();
        assert!(matches!(err, Error::InvalidMove(_)));
        assert!(db.tree_eq(&before));
    }

    #[test]
    fn delete_with_recycling_moves_to_bin() {
        let mut db = Database::new("T");
        let uuid = db.insert_entry(Entry::new("Doomed")).unwrap();
        db.delete_entry(uuid, &mut *ok_persist()).unwrap();

        let entry = db.entry(&uuid).expect("soft-deleted, still present");
        let bin = db.meta.recycle_bin_uuid.expect("bin created");
        assert_eq!(entry.parent, Some(bin));
    }

    #[test]
    fn delete_inside_bin_is_permanent() {
        let mut db = Database::new("T");
        let uuid = db.insert_entry(Entry::new("Doomed")).unwrap();
        db.delete_entry(uuid, &mut *ok_persist()).unwrap();
        // Second delete: the entry now lives in the bin.
        db.delete_entry(uuid, &mut *ok_persist()).unwrap();
        assert!(db.entry(&uuid).is_none());
    }

    #[test]
    fn delete_with_recycling_disabled_is_permanent() {
        let mut db = Database::new("T");
        db.meta.recycle_bin_enabled = false;
        let uuid = db.insert_entry(Entry::new("Doomed")).unwrap();
        let outcome = db.delete_entry(uuid, &mut *ok_persist()).unwrap();
        assert_eq!(outcome.new, None);
        assert!(db.entry(&uuid).is_none());
    }

    #[test]
    fn copy_entry_gets_fresh_identity() {
        let mut db = Database::new("T");
        let uuid = db
            .insert_entry(EntryBuilder::new("Orig").password("pw").build())
            .unwrap();
        let outcome = db
            .copy_entry(uuid, db.root_uuid(), &mut *ok_persist())
            .unwrap();
        let Some(NodeRef::Entry(copy_uuid)) = outcome.new else {
            panic!("expected entry copy");
        };
        assert_ne!(copy_uuid, uuid);
        assert_eq!(db.entry(&copy_uuid).unwrap().password(), "pw");
    }

    #[test]
    fn move_group_persist_failure_rolls_back() {
        let mut db = Database::new("T");
        let g = db.insert_group(Group::new("G")).unwrap();
        let h = db.insert_group(Group::new("H")).unwrap();
        let before = db.clone();
        assert!(db.move_group(g, h, &mut *failing_persist()).is_err());
        assert!(db.tree_eq(&before));
    }
}
