//! End-to-end scenarios across formats: save/open fidelity, tamper
//! detection, recycle-bin flows, search and reference resolution on
//! freshly reloaded databases.

use kdbx_vault::db::{CustomField, Times};
use kdbx_vault::error::Error;
use kdbx_vault::{
    open_database, save_database, search, Database, EntryBuilder, FormatVersion, Group,
    MasterCredential, SearchParameters, Session,
};

fn cheap_kdf(db: &mut Database) {
    // Low-cost AES-KDF keeps the suite fast; production defaults are
    // exercised in the crypto unit tests.
    db.settings.kdf_parameters =
        kdbx_vault::crypto::kdf::aes_params_from_header(&[0u8; 32], 64);
}

fn populated_database(version: FormatVersion) -> Database {
    let mut db = Database::new("Integration");
    db.settings.version = version;
    cheap_kdf(&mut db);

    let work = db.insert_group(Group::new("Work")).unwrap();
    let mut servers = Group::new("Servers");
    servers.parent = Some(work);
    let servers = db.insert_group(servers).unwrap();

    db.insert_entry(
        EntryBuilder::new("Mail")
            .username("alice@example.org")
            .password("correct horse")
            .url("https://mail.example.org")
            .tag("email")
            .parent(work)
            .build(),
    )
    .unwrap();
    db.insert_entry(
        EntryBuilder::new("Postgres")
            .username("svc_pg")
            .password("pg-secret")
            .custom_field("Port", CustomField::plain("5432"))
            .custom_field("Root PW", CustomField::protected("very secret"))
            .parent(servers)
            .build(),
    )
    .unwrap();
    db
}

#[test]
fn kdbx4_full_fidelity_round_trip() {
    let db = populated_database(FormatVersion::Kdbx4);
    let credential = MasterCredential::with_password("master");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();
    assert!(db.tree_eq(&back));
    assert_eq!(back.settings.version, FormatVersion::Kdbx4);
}

#[test]
fn kdbx41_round_trip_keeps_version() {
    let db = populated_database(FormatVersion::Kdbx41);
    let credential = MasterCredential::with_password("master");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();
    assert_eq!(back.settings.version, FormatVersion::Kdbx41);
    assert!(db.tree_eq(&back));
}

#[test]
fn kdbx31_round_trip_preserves_secrets() {
    let db = populated_database(FormatVersion::Kdbx31);
    let credential = MasterCredential::with_password("master");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();

    let titles: Vec<_> = back
        .entries_preorder()
        .iter()
        .map(|u| back.entry(u).unwrap().title.clone())
        .collect();
    assert_eq!(titles, vec!["Mail", "Postgres"]);
    let pg = back.entries_preorder()[1];
    let pg = back.entry(&pg).unwrap();
    assert_eq!(pg.password(), "pg-secret");
    assert_eq!(pg.custom_fields["Root PW"].value, "very secret");
}

#[test]
fn kdb_round_trip_preserves_tree() {
    let db = populated_database(FormatVersion::Kdb);
    let credential = MasterCredential::with_password("legacy");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();
    assert_eq!(back.settings.version, FormatVersion::Kdb);
    assert_eq!(back.group_count(), db.group_count());
    assert_eq!(back.entry_count(), db.entry_count());
}

#[test]
fn kdb_upgrades_to_kdbx4() {
    let legacy = populated_database(FormatVersion::Kdb);
    let credential = MasterCredential::with_password("migrate");
    let bytes = save_database(&legacy, &credential).unwrap();

    let mut upgraded = open_database(&bytes, &credential).unwrap();
    upgraded.settings.version = FormatVersion::Kdbx4;
    cheap_kdf(&mut upgraded);
    let bytes = save_database(&upgraded, &credential).unwrap();

    let back = open_database(&bytes, &credential).unwrap();
    assert_eq!(back.settings.version, FormatVersion::Kdbx4);
    assert_eq!(back.entry_count(), legacy.entry_count());
}

#[test]
fn tampering_is_detected_in_every_format() {
    for version in [
        FormatVersion::Kdb,
        FormatVersion::Kdbx31,
        FormatVersion::Kdbx4,
    ] {
        let db = populated_database(version);
        let credential = MasterCredential::with_password("pw");
        let clean = save_database(&db, &credential).unwrap();
        let mut tampered = clean.clone();
        let pos = tampered.len() - 17;
        tampered[pos] ^= 0x40;
        assert!(
            open_database(&tampered, &credential).is_err(),
            "tampered {version:?} file opened successfully"
        );
    }
}

#[test]
fn wrong_keyfile_is_rejected() {
    let db = populated_database(FormatVersion::Kdbx4);
    let credential = MasterCredential::with_password("pw").with_keyfile([1u8; 32]);
    let bytes = save_database(&db, &credential).unwrap();

    let wrong = MasterCredential::with_password("pw").with_keyfile([2u8; 32]);
    assert!(matches!(
        open_database(&bytes, &wrong),
        Err(Error::IntegrityCheckFailed)
    ));
    assert!(open_database(&bytes, &credential).is_ok());
}

#[test]
fn recycle_bin_flow_survives_reload() {
    let mut session = Session::create("Bin flow", MasterCredential::with_password("pw"));
    session.database_mut().settings.version = FormatVersion::Kdbx31;
    cheap_kdf(session.database_mut());

    let mut saved = Vec::new();
    let mut sink = |bytes: &[u8]| {
        saved = bytes.to_vec();
        Ok(())
    };
    let outcome = session
        .add_entry(EntryBuilder::new("Doomed").build(), &mut sink)
        .unwrap();
    let kdbx_vault::db::mutation::NodeRef::Entry(uuid) = outcome.new.unwrap() else {
        panic!("expected an entry");
    };
    session.delete_entry(uuid, &mut sink).unwrap();

    let reopened = Session::open(&saved, MasterCredential::with_password("pw")).unwrap();
    let db = reopened.database();
    // Soft-deleted: still present, but under the recycle bin and out of
    // search results.
    let entry = db.entry(&uuid).expect("entry still in the tree");
    let bin = db.meta.recycle_bin_uuid.expect("bin exists after reload");
    assert_eq!(entry.parent, Some(bin));
    assert!(search(db, "doomed", &SearchParameters::default())
        .unwrap()
        .is_empty());
}

#[test]
fn group_move_cycle_is_rejected_after_reload() {
    let mut db = populated_database(FormatVersion::Kdbx4);
    let credential = MasterCredential::with_password("pw");
    let bytes = save_database(&db, &credential).unwrap();
    db = open_database(&bytes, &credential).unwrap();

    let groups = db.groups_preorder();
    let (work, servers) = (groups[1], groups[2]);
    let before = db.clone();
    let err = db
        .move_group(work, servers, &mut |_: &Database| Ok(()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMove(_)));
    assert!(db.tree_eq(&before));
}

#[test]
fn references_resolve_after_reload() {
    let mut db = populated_database(FormatVersion::Kdbx4);
    db.insert_entry(
        EntryBuilder::new("App using Postgres")
            .username("{REF:U@T:Postgres}")
            .password("{REF:P@T:Postgres}")
            .build(),
    )
    .unwrap();

    let credential = MasterCredential::with_password("pw");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();

    let app = back
        .entries_preorder()
        .into_iter()
        .find(|u| back.entry(u).unwrap().title == "App using Postgres")
        .unwrap();
    let entry = back.entry(&app).unwrap();
    assert_eq!(kdbx_vault::spr::resolve(&back, &app, &entry.username), "svc_pg");
    assert_eq!(kdbx_vault::spr::resolve(&back, &app, entry.password()), "pg-secret");
}

#[test]
fn search_results_are_preorder_after_reload() {
    let db = populated_database(FormatVersion::Kdbx4);
    let credential = MasterCredential::with_password("pw");
    let bytes = save_database(&db, &credential).unwrap();
    let back = open_database(&bytes, &credential).unwrap();

    let found = search(&back, "s", &SearchParameters::default()).unwrap();
    let titles: Vec<_> = found
        .iter()
        .map(|u| back.entry(u).unwrap().title.clone())
        .collect();
    // "Mail" matches via its URL host, "Postgres" via title; pre-order
    // puts Work's own entry before the Servers subtree.
    assert_eq!(titles, vec!["Mail", "Postgres"]);
}

#[test]
fn expiry_survives_formats() {
    for version in [FormatVersion::Kdb, FormatVersion::Kdbx31, FormatVersion::Kdbx4] {
        let mut db = Database::new("Expiry");
        db.settings.version = version;
        cheap_kdf(&mut db);
        let mut entry = EntryBuilder::new("limited").build();
        entry.times = Times::now();
        entry.times.expires = true;
        entry.times.expiry = chrono::Utc::now() + chrono::Duration::days(30);
        db.insert_entry(entry).unwrap();

        let credential = MasterCredential::with_password("pw");
        let bytes = save_database(&db, &credential).unwrap();
        let back = open_database(&bytes, &credential).unwrap();
        let uuid = back.entries_preorder()[0];
        let entry = back.entry(&uuid).unwrap();
        assert!(entry.times.expires, "expires flag lost in {version:?}");
        assert!(!entry.is_expired());
    }
}
