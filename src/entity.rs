//! Stored entity records.
//!
//! Every revision of an entity is a distinct record in `<type>.main`. The
//! stored value is an [`EntityBuffer`] with three subregions: per-revision
//! [`Metadata`], the `resource` payload (schema owned by the resource
//! plug-in), and an optional `local` overlay for locally edited properties.
//!
//! Readers must tolerate records written before a field existed, so every
//! metadata field has a defined default: `operation = Creation`,
//! `replay_to_source = true`, `processed = false`, `revision = -1`
//! (unknown).

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::EntityType;
use crate::error::{Result, StorageError};
use crate::storage::keys::{entity_key, revision_from_key, REVISION_SUFFIX_LEN};
use crate::storage::Transaction;
use crate::types::{Revision, Uid, UNKNOWN_REVISION};

/// What a revision did to its entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// The entity came into existence with this revision.
    #[default]
    Creation,
    /// The revision replaced the payload of an existing entity.
    Modification,
    /// The revision tombstoned the entity; the payload is empty.
    Removal,
}

/// Per-revision metadata stored alongside the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Revision stamp, or [`UNKNOWN_REVISION`] when not assigned yet.
    pub revision: i64,

    /// Operation this revision performed.
    pub operation: Operation,

    /// Whether a change-replay pass should push this revision back to the
    /// external source. Changes that came *from* the source carry `false`.
    pub replay_to_source: bool,

    /// Set once the preprocessor chain for this revision has completed.
    pub processed: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            revision: UNKNOWN_REVISION,
            operation: Operation::Creation,
            replay_to_source: true,
            processed: false,
        }
    }
}

impl Metadata {
    /// Creates metadata for a freshly assigned revision.
    pub fn for_revision(revision: Revision, operation: Operation, replay_to_source: bool) -> Self {
        Self {
            revision: revision as i64,
            operation,
            replay_to_source,
            processed: false,
        }
    }

    /// Returns the revision if it has been assigned.
    pub fn revision(&self) -> Option<Revision> {
        if self.revision < 0 {
            None
        } else {
            Some(self.revision as Revision)
        }
    }

    /// Returns true if this revision tombstones the entity.
    #[inline]
    pub fn is_removal(&self) -> bool {
        self.operation == Operation::Removal
    }
}

/// A stored entity value: metadata, resource payload, local overlay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityBuffer {
    /// Per-revision metadata.
    pub metadata: Metadata,

    /// Payload bytes owned by the resource plug-in's codec.
    pub resource: Vec<u8>,

    /// Overlay with locally edited properties, when present.
    pub local: Option<Vec<u8>>,
}

impl EntityBuffer {
    /// Assembles a buffer for a new revision.
    pub fn assemble(metadata: Metadata, resource: Vec<u8>) -> Self {
        Self {
            metadata,
            resource,
            local: None,
        }
    }

    /// Assembles a tombstone buffer for the given revision.
    pub fn tombstone(revision: Revision, replay_to_source: bool) -> Self {
        Self {
            metadata: Metadata::for_revision(revision, Operation::Removal, replay_to_source),
            resource: Vec::new(),
            local: None,
        }
    }

    /// Encodes the buffer for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(StorageError::from)?)
    }

    /// Decodes a buffer read from storage.
    ///
    /// A record that fails to decode is treated as corruption: the bytes
    /// were produced by [`EntityBuffer::encode`] in the same store.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)
            .map_err(|e| StorageError::corrupted(format!("invalid entity record: {}", e)))?)
    }

    /// Returns true if this record tombstones the entity.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.metadata.is_removal()
    }
}

/// Reads the latest stored revision of an entity.
///
/// Returns `Ok(None)` when the entity (or the whole type database) does
/// not exist. A record that fails to decode is logged and skipped rather
/// than failing the read.
pub fn read_latest(
    txn: &Transaction,
    entity_type: EntityType,
    uid: &Uid,
) -> Result<Option<EntityBuffer>> {
    read_below(txn, entity_type, uid, Revision::MAX)
}

/// Reads the latest stored revision strictly below `before`.
///
/// Used by preprocessors to see the state a modification replaced.
pub fn read_previous(
    txn: &Transaction,
    entity_type: EntityType,
    uid: &Uid,
    before: Revision,
) -> Result<Option<EntityBuffer>> {
    if before == 0 {
        return Ok(None);
    }
    read_below(txn, entity_type, uid, before - 1)
}

/// Reads the record stored for an exact `(uid, revision)` pair.
pub fn read_exact(
    txn: &Transaction,
    entity_type: EntityType,
    uid: &Uid,
    revision: Revision,
) -> Result<Option<EntityBuffer>> {
    let main = match txn.database(&entity_type.main_db(), false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    match main.get(&entity_key(uid, revision))? {
        Some(bytes) => EntityBuffer::decode(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Latest record with revision `<= upto`, matching the UID exactly.
///
/// The UID-prefix scan can overshoot onto UIDs that extend the requested
/// one (`m1` vs `m10`), so candidates are filtered by exact key length.
fn read_below(
    txn: &Transaction,
    entity_type: EntityType,
    uid: &Uid,
    upto: Revision,
) -> Result<Option<EntityBuffer>> {
    let main = match txn.database(&entity_type.main_db(), false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let exact_len = uid.as_bytes().len() + REVISION_SUFFIX_LEN;
    let mut last: Option<Vec<u8>> = None;
    main.scan(
        uid.as_bytes(),
        |key, value| {
            if key.len() == exact_len {
                match revision_from_key(key) {
                    Some(revision) if revision <= upto => last = Some(value.to_vec()),
                    // Revisions ascend within the prefix; past `upto` we
                    // are done.
                    Some(_) => return false,
                    None => {}
                }
            }
            true
        },
        |e| {
            warn!(entity_type = %entity_type, uid = %uid, error = %e, "entity read error");
        },
    );
    match last {
        Some(bytes) => match EntityBuffer::decode(&bytes) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(e) => {
                warn!(entity_type = %entity_type, uid = %uid, error = %e, "read invalid entity record");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}
