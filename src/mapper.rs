//! Remote-ID ↔ local-UID mapping.
//!
//! Synchronizers know entities by the identifiers of their source (file
//! names, iCal UIDs); the engine knows them by local UIDs. The mapping is
//! bijective per entity type and lives in a separate store suffixed
//! `.synchronization`, so it can be written while the main store's writer
//! is busy with ingestion.
//!
//! Both directions are always written in the same transaction: if
//! `rid.mapping[r] = u` then `localid.mapping[u] = r`.

use tracing::{trace, warn};

use crate::domain::EntityType;
use crate::error::Result;
use crate::storage::Transaction;
use crate::types::{RemoteId, Uid};

fn rid_db(entity_type: EntityType) -> String {
    format!("rid.mapping.{}", entity_type.as_str())
}

fn localid_db(entity_type: EntityType) -> String {
    format!("localid.mapping.{}", entity_type.as_str())
}

/// Returns the local UID for a remote ID, minting one on first sight.
///
/// A minted UID is recorded in both directions before it is returned, so
/// the bijection invariant holds within the transaction.
pub fn resolve_remote_id(
    entity_type: EntityType,
    remote_id: &RemoteId,
    txn: &Transaction,
) -> Result<Uid> {
    {
        let rid = txn.database(&rid_db(entity_type), false)?;
        if let Some(uid) = rid.get(remote_id.as_bytes())? {
            return Ok(Uid::from_bytes(uid));
        }
    }
    let uid = Uid::new();
    record_remote_id(entity_type, &uid, remote_id, txn)?;
    trace!(%entity_type, %remote_id, %uid, "minted local UID");
    Ok(uid)
}

/// Returns the remote ID recorded for a local UID.
///
/// An absent mapping is not an error; it is logged and `None` is
/// returned.
pub fn resolve_local_id(
    entity_type: EntityType,
    uid: &Uid,
    txn: &Transaction,
) -> Result<Option<RemoteId>> {
    let local = match txn.database(&localid_db(entity_type), false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let remote_id = local.get(uid.as_bytes())?.map(RemoteId::from_bytes);
    if remote_id.is_none() {
        warn!(%entity_type, %uid, "no remote id recorded for local UID");
    }
    Ok(remote_id)
}

/// Records both directions of a mapping.
pub fn record_remote_id(
    entity_type: EntityType,
    uid: &Uid,
    remote_id: &RemoteId,
    txn: &Transaction,
) -> Result<()> {
    {
        let mut rid = txn.database(&rid_db(entity_type), false)?;
        rid.put(remote_id.as_bytes(), uid.as_bytes())?;
    }
    let mut local = txn.database(&localid_db(entity_type), false)?;
    local.put(uid.as_bytes(), remote_id.as_bytes())?;
    Ok(())
}

/// Erases both directions of a mapping.
pub fn remove_remote_id(
    entity_type: EntityType,
    uid: &Uid,
    remote_id: &RemoteId,
    txn: &Transaction,
) -> Result<()> {
    {
        let mut rid = txn.database(&rid_db(entity_type), false)?;
        rid.remove(remote_id.as_bytes(), None)?;
    }
    let mut local = txn.database(&localid_db(entity_type), false)?;
    local.remove(uid.as_bytes(), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccessMode, Store};
    use tempfile::tempdir;

    fn sync_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("instance1.synchronization"),
            AccessMode::ReadWrite,
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_resolve_mints_once() {
        let (_dir, store) = sync_store();
        let remote = RemoteId::from("cur/1422");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let first = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        let second = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        assert_eq!(first, second);
        txn.commit().unwrap();

        // Still resolves after commit.
        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let third = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_bijection() {
        let (_dir, store) = sync_store();
        let remote = RemoteId::from("cur/1422");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let uid = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        let back = resolve_local_id(EntityType::Mail, &uid, &txn).unwrap();
        assert_eq!(back, Some(remote));
        txn.commit().unwrap();
    }

    #[test]
    fn test_types_are_isolated() {
        let (_dir, store) = sync_store();
        let remote = RemoteId::from("shared-remote-id");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let mail_uid = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        let folder_uid = resolve_remote_id(EntityType::Folder, &remote, &txn).unwrap();
        assert_ne!(mail_uid, folder_uid);
        txn.commit().unwrap();
    }

    #[test]
    fn test_unmapped_local_id_is_none() {
        let (_dir, store) = sync_store();

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let missing = resolve_local_id(EntityType::Mail, &Uid::from_bytes(b"nope"), &txn).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_remove_erases_both_directions() {
        let (_dir, store) = sync_store();
        let remote = RemoteId::from("cur/1422");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        let uid = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        remove_remote_id(EntityType::Mail, &uid, &remote, &txn).unwrap();

        assert_eq!(resolve_local_id(EntityType::Mail, &uid, &txn).unwrap(), None);
        // The remote id resolves to a fresh UID afterwards.
        let reminted = resolve_remote_id(EntityType::Mail, &remote, &txn).unwrap();
        assert_ne!(uid, reminted);
        txn.commit().unwrap();
    }
}
