//! Synchronizer support: diffing against a source and change replay.
//!
//! The concrete synchronizers (maildir scraping, calendar fetching) live
//! outside the engine; what they all share is here. A synchronization
//! pass runs inside a [`SynchronizationContext`]: a read snapshot of the
//! main store plus the mapping store's writer. It diffs the source
//! listing against the stored state and produces commands, which the
//! resource ingests after the mapping transaction commits.
//!
//! A synchronizer holding the mapping writer must not call back into the
//! pipeline synchronously; change replay is disabled for the duration of
//! a pass (see [`ChangeReplay`]).

use tracing::{debug, info, instrument, trace};

use crate::commands::Command;
use crate::domain::EntityType;
use crate::entity::{read_exact, read_latest, EntityBuffer, Operation};
use crate::error::Result;
use crate::mapper;
use crate::revision;
use crate::storage::keys::{is_internal_key, uid_from_key};
use crate::storage::{AccessMode, Store, Transaction};
use crate::types::{RemoteId, Revision, Uid};

/// A synchronization pass against an external source.
pub trait Synchronizer {
    /// Diffs the source against the stored state, producing commands
    /// through the context.
    fn synchronize(&mut self, ctx: &mut SynchronizationContext<'_>) -> Result<()>;
}

/// Everything a synchronization pass works with.
///
/// `main_txn` is a read snapshot of the entity store; `sync_txn` is the
/// mapping store's write transaction, committed when the pass succeeds.
pub struct SynchronizationContext<'a> {
    pub(crate) main_txn: &'a Transaction,
    pub(crate) sync_txn: &'a Transaction,
    pub(crate) commands: &'a mut Vec<Command>,
}

impl SynchronizationContext<'_> {
    /// Returns the local UID for a remote ID, minting one on first sight.
    pub fn resolve_remote_id(&self, entity_type: EntityType, remote_id: &RemoteId) -> Result<Uid> {
        mapper::resolve_remote_id(entity_type, remote_id, self.sync_txn)
    }

    /// Returns the remote ID recorded for a local UID.
    pub fn resolve_local_id(&self, entity_type: EntityType, uid: &Uid) -> Result<Option<RemoteId>> {
        mapper::resolve_local_id(entity_type, uid, self.sync_txn)
    }

    /// Enqueues a command for ingestion after the pass.
    pub fn enqueue(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Enqueues a delete for every stored entity whose remote ID the
    /// source no longer has. Returns the number of deletes enqueued.
    pub fn scan_for_removals(
        &mut self,
        entity_type: EntityType,
        exists: impl FnMut(&RemoteId) -> bool,
    ) -> Result<usize> {
        let commands = scan_for_removals(self.main_txn, self.sync_txn, entity_type, exists)?;
        let count = commands.len();
        self.commands.extend(commands);
        Ok(count)
    }

    /// Resolves a remote entity and enqueues a create or modify when the
    /// stored state differs. Returns the entity's local UID.
    pub fn create_or_modify(
        &mut self,
        entity_type: EntityType,
        remote_id: &RemoteId,
        payload: Vec<u8>,
    ) -> Result<Uid> {
        let (uid, command) =
            create_or_modify(self.main_txn, self.sync_txn, entity_type, remote_id, payload)?;
        if let Some(command) = command {
            self.commands.push(command);
        }
        Ok(uid)
    }
}

/// Walks `<type>.main` and produces a [`Command::Delete`] for every
/// entity whose remote ID fails the `exists` check.
///
/// Entities without a recorded remote ID (purely local ones) are left
/// alone.
pub fn scan_for_removals(
    txn: &Transaction,
    sync_txn: &Transaction,
    entity_type: EntityType,
    mut exists: impl FnMut(&RemoteId) -> bool,
) -> Result<Vec<Command>> {
    let max_revision = revision::max_revision(txn)?;
    let mut commands = Vec::new();
    for uid in stored_uids(txn, entity_type)? {
        trace!(%uid, "checking for removal");
        let Some(latest) = read_latest(txn, entity_type, &uid)? else {
            continue;
        };
        if latest.is_tombstone() {
            continue;
        }
        let Some(remote_id) = mapper::resolve_local_id(entity_type, &uid, sync_txn)? else {
            continue;
        };
        if !exists(&remote_id) {
            debug!(%uid, %remote_id, "found a removed entity");
            commands.push(Command::delete(uid, entity_type, max_revision, false));
        }
    }
    Ok(commands)
}

/// Resolves a remote entity against the stored state.
///
/// An unknown remote ID yields a create; a known one whose stored payload
/// differs yields a modify; an identical payload yields nothing. Changes
/// coming from the source never replay back to it.
pub fn create_or_modify(
    txn: &Transaction,
    sync_txn: &Transaction,
    entity_type: EntityType,
    remote_id: &RemoteId,
    payload: Vec<u8>,
) -> Result<(Uid, Option<Command>)> {
    let uid = mapper::resolve_remote_id(entity_type, remote_id, sync_txn)?;
    let latest = read_latest(txn, entity_type, &uid)?;
    let command = match latest {
        Some(ref record) if !record.is_tombstone() => {
            if record.resource == payload {
                trace!(%remote_id, "entity unchanged");
                None
            } else {
                debug!(%remote_id, "found a modified entity");
                let revision = record.metadata.revision().unwrap_or(0);
                Some(Command::modify(
                    uid.clone(),
                    entity_type,
                    revision,
                    payload,
                    false,
                ))
            }
        }
        _ => {
            debug!(%remote_id, "found a new entity");
            Some(Command::create(uid.clone(), entity_type, payload, false))
        }
    };
    Ok((uid, command))
}

fn stored_uids(txn: &Transaction, entity_type: EntityType) -> Result<Vec<Uid>> {
    let main = match txn.database(&entity_type.main_db(), false) {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut uids = Vec::new();
    main.scan(
        b"",
        |key, _| {
            if !is_internal_key(key) {
                if let Some(uid) = uid_from_key(key) {
                    if uids.last() != Some(&uid) {
                        uids.push(uid);
                    }
                }
            }
            true
        },
        |e| {
            trace!(error = %e, "scan error while listing stored entities");
        },
    );
    uids.dedup();
    Ok(uids)
}

/// Replays committed revisions to the external source.
///
/// Walks the revision log over `(last_replayed, maxRevision]` and hands
/// each creation or removal to the replayer. Revisions whose metadata
/// carries `replay_to_source == false` came from the source and are
/// skipped; modifications are skipped as well (source-side modification
/// replay is not implemented).
#[derive(Debug)]
pub struct ChangeReplay {
    last_replayed: Revision,
    enabled: bool,
}

impl Default for ChangeReplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeReplay {
    /// Starts replay from the beginning of the revision log.
    pub fn new() -> Self {
        Self {
            last_replayed: 0,
            enabled: true,
        }
    }

    /// Starts replay after the given revision.
    pub fn starting_after(last_replayed: Revision) -> Self {
        Self {
            last_replayed,
            enabled: true,
        }
    }

    /// Highest revision handed to a replayer so far.
    #[inline]
    pub fn last_replayed(&self) -> Revision {
        self.last_replayed
    }

    /// Enables or disables replay.
    ///
    /// Replay stays disabled while a synchronizer holds the mapping
    /// store's writer; replaying would deadlock on it.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns true if replay is currently enabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replays every pending revision. Returns the number of revisions
    /// handed to the replayer; 0 while disabled.
    #[instrument(skip_all)]
    pub fn replay(
        &mut self,
        store: &Store,
        mut replayer: impl FnMut(EntityType, &Uid, &EntityBuffer) -> Result<()>,
    ) -> Result<usize> {
        if !self.enabled {
            trace!("change replay is disabled");
            return Ok(0);
        }
        let txn = store.begin(AccessMode::ReadOnly)?;
        let max = revision::max_revision(&txn)?;
        if max <= self.last_replayed {
            return Ok(0);
        }

        let mut pending = Vec::new();
        revision::scan_revisions(&txn, self.last_replayed, max, |rev, entity_type, uid| {
            pending.push((rev, entity_type, uid.clone()));
            true
        })?;

        let mut replayed = 0usize;
        for (rev, entity_type, uid) in pending {
            let Some(record) = read_exact(&txn, entity_type, &uid, rev)? else {
                self.last_replayed = rev;
                continue;
            };
            if !record.metadata.replay_to_source {
                trace!(%uid, rev, "change came from the source");
                self.last_replayed = rev;
                continue;
            }
            match record.metadata.operation {
                Operation::Creation | Operation::Removal => {
                    replayer(entity_type, &uid, &record)?;
                    replayed += 1;
                }
                Operation::Modification => {
                    debug!(%uid, rev, "modification replay is not implemented, skipping");
                }
            }
            self.last_replayed = rev;
        }
        info!(replayed, upto = max, "change replay caught up");
        Ok(replayed)
    }
}
