//! An unlocked database bound to its credentials.
//!
//! The session owns both the tree and the master credential, so every
//! mutation can run the full prepare/apply/persist/commit cycle: the
//! database is re-encrypted and handed to the caller's sink before the
//! in-memory change is considered committed. A failing sink rolls the
//! tree back.

use uuid::Uuid;

use crate::db::mutation::MutationOutcome;
use crate::db::{Database, Entry, Group};
use crate::error::Result;
use crate::format;
use crate::keys::MasterCredential;

/// Where encrypted bytes go on persist: a file write, an upload, a test
/// buffer.
pub type SaveSink<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

pub struct Session {
    database: Database,
    credential: MasterCredential,
}

impl Session {
    /// Decrypt an existing database.
    pub fn open(data: &[u8], credential: MasterCredential) -> Result<Self> {
        let database = format::open(data, &credential)?;
        tracing::info!(
            groups = database.group_count(),
            entries = database.entry_count(),
            "database unlocked"
        );
        Ok(Self {
            database,
            credential,
        })
    }

    /// Start a fresh database.
    pub fn create(name: impl Into<String>, credential: MasterCredential) -> Self {
        Self {
            database: Database::new(name),
            credential,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    /// Encrypt the current tree without going through a mutation.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        format::save(&self.database, &self.credential)
    }

    /// Swap the master credential. Takes effect on the next persist.
    pub fn change_credential(&mut self, credential: MasterCredential) {
        self.credential = credential;
    }

    fn run<F>(&mut self, sink: &mut SaveSink, op: F) -> Result<MutationOutcome>
    where
        F: FnOnce(
            &mut Database,
            &mut crate::db::mutation::PersistFn,
        ) -> Result<MutationOutcome>,
    {
        let credential = self.credential.clone();
        let mut persist = |db: &Database| -> Result<()> {
            let bytes = format::save(db, &credential)?;
            sink(&bytes)
        };
        op(&mut self.database, &mut persist)
    }

    pub fn add_entry(&mut self, entry: Entry, sink: &mut SaveSink) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.add_entry(entry, persist))
    }

    pub fn update_entry(
        &mut self,
        uuid: Uuid,
        updated: Entry,
        sink: &mut SaveSink,
    ) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.update_entry(uuid, updated, persist))
    }

    pub fn move_entry(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        sink: &mut SaveSink,
    ) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.move_entry(uuid, destination, persist))
    }

    pub fn copy_entry(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        sink: &mut SaveSink,
    ) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.copy_entry(uuid, destination, persist))
    }

    pub fn delete_entry(&mut self, uuid: Uuid, sink: &mut SaveSink) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.delete_entry(uuid, persist))
    }

    pub fn add_group(&mut self, group: Group, sink: &mut SaveSink) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.add_group(group, persist))
    }

    pub fn update_group(
        &mut self,
        uuid: Uuid,
        updated: Group,
        sink: &mut SaveSink,
    ) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.update_group(uuid, updated, persist))
    }

    pub fn move_group(
        &mut self,
        uuid: Uuid,
        destination: Uuid,
        sink: &mut SaveSink,
    ) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.move_group(uuid, destination, persist))
    }

    pub fn delete_group(&mut self, uuid: Uuid, sink: &mut SaveSink) -> Result<MutationOutcome> {
        self.run(sink, |db, persist| db.delete_group(uuid, persist))
    }
}
