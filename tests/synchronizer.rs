//! Synchronizer integration tests: diffing a fake maildir against the
//! stored state through a full resource instance.

use std::collections::BTreeMap;

use silt::domain::Mail;
use silt::{
    AccessMode, Config, EntityType, Operation, Query, RemoteId, Resource, Result,
    SynchronizationContext, Synchronizer, Uid,
};
use tempfile::tempdir;

/// A maildir reduced to its listing: file name → subject.
struct FakeMaildir {
    files: BTreeMap<String, String>,
}

impl FakeMaildir {
    fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, subject)| (name.to_string(), subject.to_string()))
                .collect(),
        }
    }

    fn payload(subject: &str) -> Vec<u8> {
        Mail {
            subject: subject.into(),
            ..Default::default()
        }
        .encode()
        .unwrap()
    }
}

impl Synchronizer for FakeMaildir {
    fn synchronize(&mut self, ctx: &mut SynchronizationContext<'_>) -> Result<()> {
        let files = &self.files;
        ctx.scan_for_removals(EntityType::Mail, |remote| {
            files.contains_key(&remote.to_string())
        })?;
        for (name, subject) in files {
            ctx.create_or_modify(
                EntityType::Mail,
                &RemoteId::from(name.as_str()),
                Self::payload(subject),
            )?;
        }
        Ok(())
    }
}

fn open_resource(dir: &tempfile::TempDir) -> Resource {
    Resource::new(Config::for_instance(dir.path(), "maildir.instance1")).unwrap()
}

fn query_all(resource: &mut Resource) -> Vec<Uid> {
    let query = Query {
        process_all: true,
        ..Query::for_type(EntityType::Mail)
    };
    resource
        .query(&query)
        .unwrap()
        .rows()
        .iter()
        .map(|row| row.uid.clone())
        .collect()
}

#[test]
fn removal_scan_enqueues_delete() {
    // Sync files a, b, c; remove b on disk; re-sync. The removal scan
    // enqueues one delete, and the store ends with latest non-tombstone
    // revisions only for a and c.
    let dir = tempdir().unwrap();
    let mut resource = open_resource(&dir);

    let mut source = FakeMaildir::new(&[("a", "first"), ("b", "second"), ("c", "third")]);
    resource.synchronize(&mut source).unwrap();
    assert_eq!(query_all(&mut resource).len(), 3);

    // "b" disappears from disk.
    source.files.remove("b");
    resource.synchronize(&mut source).unwrap();

    let remaining = query_all(&mut resource);
    assert_eq!(remaining.len(), 2);

    // The tombstoned entity is the one that was mapped to "b".
    let sync_txn = resource
        .synchronization_store()
        .begin(AccessMode::ReadOnly)
        .unwrap();
    let b_uid = {
        let db = sync_txn.database("rid.mapping.mail", false).unwrap();
        Uid::from_bytes(db.get(b"b").unwrap().expect("mapping for b must exist"))
    };
    assert!(!remaining.contains(&b_uid));

    let main_txn = resource.store().begin(AccessMode::ReadOnly).unwrap();
    let latest = silt::entity::read_latest(&main_txn, EntityType::Mail, &b_uid)
        .unwrap()
        .unwrap();
    assert!(latest.is_tombstone());
}

#[test]
fn resync_without_changes_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut resource = open_resource(&dir);

    let mut source = FakeMaildir::new(&[("a", "first"), ("b", "second")]);
    resource.synchronize(&mut source).unwrap();
    let after_first = resource.pipeline_mut().max_revision().unwrap();

    resource.synchronize(&mut source).unwrap();
    let after_second = resource.pipeline_mut().max_revision().unwrap();

    assert_eq!(after_first, after_second, "no change, no revision");
    assert_eq!(query_all(&mut resource).len(), 2);
}

#[test]
fn changed_file_becomes_modification() {
    let dir = tempdir().unwrap();
    let mut resource = open_resource(&dir);

    let mut source = FakeMaildir::new(&[("a", "first")]);
    resource.synchronize(&mut source).unwrap();

    source.files.insert("a".into(), "rewritten".into());
    resource.synchronize(&mut source).unwrap();

    let sync_txn = resource
        .synchronization_store()
        .begin(AccessMode::ReadOnly)
        .unwrap();
    let a_uid = {
        let db = sync_txn.database("rid.mapping.mail", false).unwrap();
        Uid::from_bytes(db.get(b"a").unwrap().unwrap())
    };

    let main_txn = resource.store().begin(AccessMode::ReadOnly).unwrap();
    let latest = silt::entity::read_latest(&main_txn, EntityType::Mail, &a_uid)
        .unwrap()
        .unwrap();
    assert_eq!(latest.metadata.operation, Operation::Modification);
    assert_eq!(
        Mail::decode(&latest.resource).unwrap().subject,
        "rewritten"
    );
}

#[test]
fn source_changes_do_not_replay_back() {
    // Everything a sync pass ingests carries replay_to_source == false;
    // a replay pass right after synchronization has nothing to push.
    let dir = tempdir().unwrap();
    let mut resource = open_resource(&dir);

    let mut source = FakeMaildir::new(&[("a", "first"), ("b", "second")]);
    resource.synchronize(&mut source).unwrap();

    let replayed = resource
        .replay_changes(|_, _, _| panic!("nothing must replay"))
        .unwrap();
    assert_eq!(replayed, 0);

    // A local change does replay.
    resource
        .pipeline_mut()
        .new_entity(
            EntityType::Mail,
            &Uid::from_bytes(b"local-draft"),
            &FakeMaildir::payload("draft"),
            true,
        )
        .unwrap();
    let mut seen = Vec::new();
    let replayed = resource
        .replay_changes(|entity_type, uid, _| {
            seen.push((entity_type, uid.clone()));
            Ok(())
        })
        .unwrap();
    assert_eq!(replayed, 1);
    assert_eq!(seen, vec![(EntityType::Mail, Uid::from_bytes(b"local-draft"))]);
}

#[test]
fn failed_pass_leaves_no_mappings() {
    struct Failing;
    impl Synchronizer for Failing {
        fn synchronize(&mut self, ctx: &mut SynchronizationContext<'_>) -> Result<()> {
            ctx.create_or_modify(
                EntityType::Mail,
                &RemoteId::from("doomed"),
                FakeMaildir::payload("doomed"),
            )?;
            Err(silt::StorageError::engine("source went away").into())
        }
    }

    let dir = tempdir().unwrap();
    let mut resource = open_resource(&dir);
    assert!(resource.synchronize(&mut Failing).is_err());

    // The mapping transaction was aborted; no command was ingested.
    assert_eq!(resource.pipeline_mut().max_revision().unwrap(), 0);
    let sync_txn = resource
        .synchronization_store()
        .begin(AccessMode::ReadOnly)
        .unwrap();
    let result = sync_txn.database("rid.mapping.mail", false);
    match result {
        Ok(db) => assert_eq!(db.get(b"doomed").unwrap(), None),
        Err(e) => assert!(e.is_not_found()),
    }
}
