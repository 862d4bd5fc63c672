//! Revision log: the monotonic revision counter and the revision index.
//!
//! The counter lives at `__internal_maxRevision` inside the reserved
//! `__internal` database. The revision index `__internal.revisions` maps
//! each assigned revision (8 big-endian bytes) to the entity type and UID
//! it touched, so change replay can walk `(last_replayed, maxRevision]` in
//! order without gaps.
//!
//! Both the entity record and the revision-index entry are written in the
//! same transaction as the counter update; the counter therefore never
//! runs ahead of the records it accounts for.

use crate::domain::EntityType;
use crate::error::{Result, StorageError};
use crate::storage::keys::{INTERNAL_DB, MAX_REVISION_KEY, REVISION_INDEX_DB};
use crate::storage::Transaction;
use crate::types::{Revision, Uid};

/// Reads the highest assigned revision, 0 when none has been assigned.
pub fn max_revision(txn: &Transaction) -> Result<Revision> {
    let internal = match txn.database(INTERNAL_DB, false) {
        Ok(db) => db,
        // A store without the internal database has never assigned a
        // revision.
        Err(e) if e.is_not_found() => return Ok(0),
        Err(e) => return Err(e),
    };
    match internal.get(MAX_REVISION_KEY)? {
        Some(bytes) => decode_revision(&bytes),
        None => Ok(0),
    }
}

/// Writes the revision counter.
pub fn set_max_revision(txn: &Transaction, revision: Revision) -> Result<()> {
    let mut internal = txn.database(INTERNAL_DB, false)?;
    internal.put(MAX_REVISION_KEY, &revision.to_be_bytes())?;
    Ok(())
}

/// Records which entity a revision touched.
pub fn record_revision(
    txn: &Transaction,
    revision: Revision,
    entity_type: EntityType,
    uid: &Uid,
) -> Result<()> {
    let mut index = txn.database(REVISION_INDEX_DB, false)?;
    let mut value = Vec::with_capacity(1 + uid.as_bytes().len());
    value.push(entity_type.as_tag());
    value.extend_from_slice(uid.as_bytes());
    index.put(&revision.to_be_bytes(), &value)?;
    Ok(())
}

/// Looks up the entity a revision touched.
pub fn entity_for_revision(
    txn: &Transaction,
    revision: Revision,
) -> Result<Option<(EntityType, Uid)>> {
    let index = match txn.database(REVISION_INDEX_DB, false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    match index.get(&revision.to_be_bytes())? {
        Some(bytes) => decode_entry(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Walks revisions in `(after, upto]` in ascending order.
///
/// The callback receives each revision with the entity it touched and
/// returns whether to continue. Returns the number of revisions visited.
pub fn scan_revisions(
    txn: &Transaction,
    after: Revision,
    upto: Revision,
    mut on_revision: impl FnMut(Revision, EntityType, &Uid) -> bool,
) -> Result<usize> {
    if upto <= after {
        return Ok(0);
    }
    let index = match txn.database(REVISION_INDEX_DB, false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut count = 0usize;
    let mut decode_failure = None;
    for revision in (after + 1)..=upto {
        match index.get(&revision.to_be_bytes())? {
            Some(bytes) => match decode_entry(&bytes) {
                Ok((entity_type, uid)) => {
                    count += 1;
                    if !on_revision(revision, entity_type, &uid) {
                        break;
                    }
                }
                Err(e) => {
                    decode_failure = Some(e);
                    break;
                }
            },
            // A gap inside the assigned range violates the write
            // invariant.
            None => {
                decode_failure = Some(
                    StorageError::corrupted(format!(
                        "revision {} missing from the revision index",
                        revision
                    ))
                    .into(),
                );
                break;
            }
        }
    }
    match decode_failure {
        Some(e) => Err(e),
        None => Ok(count),
    }
}

fn decode_revision(bytes: &[u8]) -> Result<Revision> {
    if bytes.len() != 8 {
        return Err(StorageError::corrupted("malformed revision counter").into());
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(Revision::from_be_bytes(raw))
}

fn decode_entry(bytes: &[u8]) -> Result<(EntityType, Uid)> {
    if bytes.len() < 2 {
        return Err(StorageError::corrupted("malformed revision index entry").into());
    }
    let entity_type = EntityType::from_tag(bytes[0])
        .ok_or_else(|| StorageError::corrupted("unknown entity type in revision index"))?;
    Ok((entity_type, Uid::from_bytes(&bytes[1..])))
}
