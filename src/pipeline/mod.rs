//! The ingestion pipeline.
//!
//! The pipeline owns the main store's writer. Every ingested command
//! assigns the next revision, writes the entity record and the
//! revision-index entry, bumps `maxRevision`, and drives the command
//! through the preprocessor chain registered for its entity type and
//! kind, all within one write transaction. Preprocessor side-effects
//! (index updates) are therefore atomic with the entity write.
//!
//! # Scheduling
//!
//! Each in-flight command is a pipeline state: a cursor through its
//! preprocessor chain. Synchronous preprocessors run to completion inside
//! the ingesting call. A preprocessor that defers
//! ([`Processing::Pending`]) parks its state; the remainder of the chain
//! runs in a fresh write transaction once the completion arrives and the
//! cooperative stepper ([`Pipeline::step_pipelines`]) is driven again.
//!
//! ```text
//!   created ─→ running ─→ idle ─→ running ─→ … ─→ completed
//!                 │  processing_completed  ▲
//!                 └────────────────────────┘
//! ```
//!
//! # Notifications
//!
//! After the transaction of the last preprocessor commits, the state's
//! revision is queued for `RevisionUpdated`. Emission is held back until
//! every lower revision has been emitted, so subscribers always observe
//! revisions in increasing order. `PipelinesDrained` fires exactly when
//! the active set becomes empty. Delivery is at-most-once: a full
//! subscriber channel drops the event, and subscribers pull the current
//! `maxRevision` on receipt.

mod preprocessor;

pub use preprocessor::{
    CompletionToken, DefaultIndexUpdater, PipelineContext, Preprocessor, Processing,
};

use std::collections::{BTreeSet, HashMap};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, instrument, trace, warn};

use crate::commands::Command;
use crate::config::Config;
use crate::domain::EntityType;
use crate::entity::{read_exact, read_latest, read_previous, EntityBuffer, Metadata, Operation};
use crate::error::{Result, SiltError};
use crate::revision;
use crate::storage::keys::entity_key;
use crate::storage::{AccessMode, Store, Transaction};
use crate::types::{Revision, Uid};

/// Which preprocessor chain a command runs through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Chain for created entities.
    New,
    /// Chain for modified entities.
    Modified,
    /// Chain for removed entities.
    Deleted,
}

/// Signal emitted across the resource boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A revision finished processing; pull `maxRevision` for the current
    /// state.
    RevisionUpdated(Revision),
    /// The active set became empty.
    PipelinesDrained,
}

/// Identifies one pipeline state in the active set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateStatus {
    /// Dispatched to a preprocessor, or parked on a deferred completion.
    Running,
    /// Ready for the next step.
    Idle,
}

/// Per-command cursor through a preprocessor chain.
#[derive(Debug)]
struct PipelineState {
    id: StateId,
    entity_type: EntityType,
    kind: PipelineKind,
    uid: Uid,
    revision: Revision,
    cursor: usize,
    status: StateStatus,
}

enum ChainOutcome {
    Finished,
    Pending,
}

/// The ingestion pipeline of one resource instance.
pub struct Pipeline {
    store: Store,
    chains: HashMap<(EntityType, PipelineKind), Vec<Box<dyn Preprocessor>>>,
    active: Vec<PipelineState>,
    next_state_id: u64,
    step_scheduled: bool,
    subscribers: Vec<Sender<Notification>>,
    notification_capacity: usize,
    write_retry_limit: u32,
    /// Highest revision whose `RevisionUpdated` has been emitted.
    last_notified: Revision,
    /// Completed revisions waiting for every lower one to be emitted.
    completed_out_of_order: BTreeSet<Revision>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("active", &self.active.len())
            .field("last_notified", &self.last_notified)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline owning the given store's writer.
    pub fn new(store: Store, config: &Config) -> Result<Self> {
        let last_notified = {
            let txn = store.begin(AccessMode::ReadOnly)?;
            revision::max_revision(&txn)?
        };
        Ok(Self {
            store,
            chains: HashMap::new(),
            active: Vec::new(),
            next_state_id: 0,
            step_scheduled: false,
            subscribers: Vec::new(),
            notification_capacity: config.notification_capacity,
            write_retry_limit: config.write_retry_limit,
            last_notified,
            completed_out_of_order: BTreeSet::new(),
        })
    }

    /// The store this pipeline writes to.
    #[inline]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Registers the preprocessor chain for one entity type and kind.
    pub fn set_preprocessors(
        &mut self,
        entity_type: EntityType,
        kind: PipelineKind,
        preprocessors: Vec<Box<dyn Preprocessor>>,
    ) {
        self.chains.insert((entity_type, kind), preprocessors);
    }

    /// Subscribes to pipeline notifications.
    ///
    /// Dropping the receiver cancels the subscription; the sender is
    /// unregistered on the next emission.
    pub fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = bounded(self.notification_capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Highest assigned revision.
    pub fn max_revision(&self) -> Result<Revision> {
        let txn = self.store.begin(AccessMode::ReadOnly)?;
        revision::max_revision(&txn)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Ingests a serialized command buffer.
    ///
    /// Undecodable or schema-invalid commands are dropped with a warning;
    /// ingestion of later commands is unaffected.
    pub fn ingest(&mut self, buffer: &[u8]) -> Result<Option<Revision>> {
        let command = match Command::decode(buffer) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "dropping undecodable command");
                return Ok(None);
            }
        };
        self.ingest_command(command)
    }

    /// Ingests a decoded command.
    pub fn ingest_command(&mut self, command: Command) -> Result<Option<Revision>> {
        let outcome = match command {
            Command::Create(c) => {
                self.new_entity(c.entity_type, &c.entity_id, &c.delta, c.replay_to_source)
            }
            Command::Modify(c) => {
                self.modified_entity(c.entity_type, &c.entity_id, &c.delta, c.replay_to_source)
            }
            Command::Delete(c) => {
                self.deleted_entity(c.entity_type, &c.entity_id, c.replay_to_source)
            }
        };
        match outcome {
            Err(e) if e.is_invalid_buffer() => {
                warn!(error = %e, "dropping invalid command");
                Ok(None)
            }
            other => other,
        }
    }

    /// Creates an entity.
    ///
    /// Replaying a create for an existing UID is safe: with an identical
    /// payload it is a no-op, with a differing payload it degrades to a
    /// modification. Returns the assigned revision, or `None` for no-ops.
    #[instrument(skip(self, payload), fields(%entity_type, %uid))]
    pub fn new_entity(
        &mut self,
        entity_type: EntityType,
        uid: &Uid,
        payload: &[u8],
        replay_to_source: bool,
    ) -> Result<Option<Revision>> {
        entity_type.validate(payload)?;
        self.ingest_operation(entity_type, uid, Operation::Creation, payload, replay_to_source)
    }

    /// Modifies an entity.
    ///
    /// A modification of an absent or tombstoned UID degrades to a
    /// creation; an identical payload is a no-op.
    #[instrument(skip(self, payload), fields(%entity_type, %uid))]
    pub fn modified_entity(
        &mut self,
        entity_type: EntityType,
        uid: &Uid,
        payload: &[u8],
        replay_to_source: bool,
    ) -> Result<Option<Revision>> {
        entity_type.validate(payload)?;
        self.ingest_operation(
            entity_type,
            uid,
            Operation::Modification,
            payload,
            replay_to_source,
        )
    }

    /// Tombstones an entity. Removal of an absent UID is a no-op.
    #[instrument(skip(self), fields(%entity_type, %uid))]
    pub fn deleted_entity(
        &mut self,
        entity_type: EntityType,
        uid: &Uid,
        replay_to_source: bool,
    ) -> Result<Option<Revision>> {
        self.ingest_operation(entity_type, uid, Operation::Removal, &[], replay_to_source)
    }

    fn ingest_operation(
        &mut self,
        entity_type: EntityType,
        uid: &Uid,
        operation: Operation,
        payload: &[u8],
        replay_to_source: bool,
    ) -> Result<Option<Revision>> {
        let mut attempt = 0u32;
        loop {
            match self.ingest_once(entity_type, uid, operation, payload, replay_to_source) {
                Err(e) if is_retriable(&e) && attempt < self.write_retry_limit => {
                    attempt += 1;
                    warn!(error = %e, attempt, "retrying ingestion after transient storage error");
                }
                other => return other,
            }
        }
    }

    fn ingest_once(
        &mut self,
        entity_type: EntityType,
        uid: &Uid,
        operation: Operation,
        payload: &[u8],
        replay_to_source: bool,
    ) -> Result<Option<Revision>> {
        let txn = self.store.begin(AccessMode::ReadWrite)?;
        let previous = read_latest(&txn, entity_type, uid)?;
        let exists = previous.as_ref().is_some_and(|p| !p.is_tombstone());

        let effective = match operation {
            Operation::Creation if exists => {
                if previous.as_ref().map(|p| p.resource.as_slice()) == Some(payload) {
                    trace!(%uid, "replayed create matches the stored payload");
                    return Ok(None);
                }
                Operation::Modification
            }
            Operation::Creation => Operation::Creation,
            Operation::Modification if exists => {
                if previous.as_ref().map(|p| p.resource.as_slice()) == Some(payload) {
                    trace!(%uid, "modification carries no change");
                    return Ok(None);
                }
                Operation::Modification
            }
            Operation::Modification => Operation::Creation,
            Operation::Removal if exists => Operation::Removal,
            Operation::Removal => {
                trace!(%uid, "removal of an absent entity");
                return Ok(None);
            }
        };

        let revision = revision::max_revision(&txn)? + 1;
        let buffer = match effective {
            Operation::Removal => EntityBuffer::tombstone(revision, replay_to_source),
            _ => EntityBuffer::assemble(
                Metadata::for_revision(revision, effective, replay_to_source),
                payload.to_vec(),
            ),
        };
        {
            let mut main = txn.database(&entity_type.main_db(), false)?;
            main.put(&entity_key(uid, revision), &buffer.encode()?)?;
        }
        revision::record_revision(&txn, revision, entity_type, uid)?;
        revision::set_max_revision(&txn, revision)?;

        let kind = match effective {
            Operation::Creation => PipelineKind::New,
            Operation::Modification => PipelineKind::Modified,
            Operation::Removal => PipelineKind::Deleted,
        };
        let id = StateId(self.next_state_id);
        self.next_state_id += 1;
        let mut state = PipelineState {
            id,
            entity_type,
            kind,
            uid: uid.clone(),
            revision,
            cursor: 0,
            status: StateStatus::Running,
        };

        let outcome = {
            let chain = self.chains.entry((entity_type, kind)).or_default();
            run_preprocessors(chain, &txn, &mut state, &buffer, previous.as_ref())
        };
        match outcome {
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
            Ok(ChainOutcome::Pending) => {
                txn.commit()?;
                debug!(%uid, revision, "revision committed, state parked on deferred completion");
                self.active.push(state);
                Ok(Some(revision))
            }
            Ok(ChainOutcome::Finished) => {
                txn.commit()?;
                debug!(%uid, revision, "revision committed");
                self.active.push(state);
                self.finish_state(id);
                Ok(Some(revision))
            }
        }
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    /// Reports a deferred completion.
    ///
    /// The token must identify the currently dispatched preprocessor of a
    /// parked state; stale or duplicate completions are ignored. The state
    /// becomes idle and a step is scheduled (single-shot).
    pub fn processing_completed(&mut self, token: CompletionToken) {
        let Some(state) = self.active.iter_mut().find(|s| s.id == token.state) else {
            trace!(?token, "completion for an unknown state ignored");
            return;
        };
        if state.status != StateStatus::Running || state.cursor != token.cursor {
            trace!(?token, cursor = state.cursor, "stale completion ignored");
            return;
        }
        state.cursor += 1;
        state.status = StateStatus::Idle;
        self.step_scheduled = true;
    }

    /// Returns true if a completion has scheduled a step that has not run
    /// yet.
    #[inline]
    pub fn step_scheduled(&self) -> bool {
        self.step_scheduled
    }

    /// Advances every idle state until it finishes or parks again.
    ///
    /// This is the cooperative stepper: the event loop calls it once per
    /// scheduled turn.
    pub fn step_pipelines(&mut self) -> Result<()> {
        self.step_scheduled = false;
        while let Some(id) = self
            .active
            .iter()
            .find(|s| s.status == StateStatus::Idle)
            .map(|s| s.id)
        {
            self.resume_state(id)?;
        }
        Ok(())
    }

    /// Steps until only parked states (or none) remain.
    pub fn drain(&mut self) -> Result<()> {
        while self.active.iter().any(|s| s.status == StateStatus::Idle) {
            self.step_pipelines()?;
        }
        Ok(())
    }

    /// Returns true if no pipeline states remain active.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of active pipeline states.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn resume_state(&mut self, id: StateId) -> Result<()> {
        let Some(pos) = self.active.iter().position(|s| s.id == id) else {
            return Ok(());
        };
        let (entity_type, kind, uid, revision) = {
            let state = &self.active[pos];
            (state.entity_type, state.kind, state.uid.clone(), state.revision)
        };
        self.active[pos].status = StateStatus::Running;

        let txn = self.store.begin(AccessMode::ReadWrite)?;
        let Some(entity) = read_exact(&txn, entity_type, &uid, revision)? else {
            warn!(%uid, revision, "record of a parked state vanished");
            txn.abort()?;
            self.finish_state(id);
            return Ok(());
        };
        let previous = read_previous(&txn, entity_type, &uid, revision)?;

        let outcome = {
            let state = &mut self.active[pos];
            let chain = self.chains.entry((entity_type, kind)).or_default();
            run_preprocessors(chain, &txn, state, &entity, previous.as_ref())
        };
        match outcome {
            Err(e) => {
                // The revision is already durable; the state is dropped so
                // the notification order does not stall behind it.
                txn.abort()?;
                self.finish_state(id);
                Err(e)
            }
            Ok(ChainOutcome::Pending) => {
                txn.commit()?;
                Ok(())
            }
            Ok(ChainOutcome::Finished) => {
                txn.commit()?;
                self.finish_state(id);
                Ok(())
            }
        }
    }

    fn finish_state(&mut self, id: StateId) {
        let Some(pos) = self.active.iter().position(|s| s.id == id) else {
            return;
        };
        let state = self.active.remove(pos);
        trace!(uid = %state.uid, revision = state.revision, "pipeline state completed");
        self.queue_revision(state.revision);
        if self.active.is_empty() {
            self.emit(Notification::PipelinesDrained);
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn queue_revision(&mut self, revision: Revision) {
        self.completed_out_of_order.insert(revision);
        while self
            .completed_out_of_order
            .first()
            .is_some_and(|r| *r == self.last_notified + 1)
        {
            let revision = self.last_notified + 1;
            self.completed_out_of_order.pop_first();
            self.last_notified = revision;
            self.emit(Notification::RevisionUpdated(revision));
        }
    }

    fn emit(&mut self, notification: Notification) {
        self.subscribers.retain(|tx| match tx.try_send(notification) {
            Ok(()) => true,
            // At-most-once: a slow subscriber loses the event and pulls
            // maxRevision on its next receipt.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

fn run_preprocessors(
    chain: &mut [Box<dyn Preprocessor>],
    txn: &Transaction,
    state: &mut PipelineState,
    entity: &EntityBuffer,
    previous: Option<&EntityBuffer>,
) -> Result<ChainOutcome> {
    while state.cursor < chain.len() {
        let ctx = PipelineContext {
            txn,
            entity_type: state.entity_type,
            uid: &state.uid,
            operation: entity.metadata.operation,
            entity,
            previous,
            token: CompletionToken {
                state: state.id,
                cursor: state.cursor,
            },
        };
        let step = &mut chain[state.cursor];
        match step.process(&ctx) {
            Ok(Processing::Completed) => state.cursor += 1,
            Ok(Processing::Pending) => return Ok(ChainOutcome::Pending),
            Err(e) => {
                return Err(SiltError::preprocessor_failed(
                    step.name(),
                    state.uid.clone(),
                    e.to_string(),
                ))
            }
        }
    }
    Ok(ChainOutcome::Finished)
}

fn is_retriable(error: &SiltError) -> bool {
    matches!(error, SiltError::Storage(e) if e.is_retriable())
}
