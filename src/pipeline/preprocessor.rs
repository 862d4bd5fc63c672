//! Preprocessors: the per-command steps of a pipeline.
//!
//! A preprocessor observes one `(operation, uid, entity)` triple inside
//! the write transaction that stores the revision. It may inspect the
//! previous entity state, mutate secondary indexes, or defer its
//! completion across asynchronous work by returning
//! [`Processing::Pending`] and later handing its [`CompletionToken`] to
//! [`Pipeline::processing_completed`](super::Pipeline::processing_completed).
//!
//! Preprocessors must not mutate the entity payload.

use crate::domain::EntityType;
use crate::entity::{EntityBuffer, Operation};
use crate::error::Result;
use crate::index::Index;
use crate::storage::Transaction;
use crate::types::Uid;

use super::StateId;

/// What a preprocessor did with the dispatched entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Processing {
    /// The step is done; the cursor advances.
    Completed,
    /// Completion is deferred; the pipeline state stays busy until the
    /// preprocessor reports back with its completion token.
    Pending,
}

/// Identifies one dispatched preprocessor invocation.
///
/// Completions carrying a token that no longer matches the currently
/// dispatched preprocessor are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionToken {
    pub(crate) state: StateId,
    pub(crate) cursor: usize,
}

/// Everything a preprocessor may look at during one invocation.
///
/// The context borrows the write transaction of the ingestion; index
/// handles opened through it are transactionally coupled to the entity
/// write.
pub struct PipelineContext<'a> {
    pub(crate) txn: &'a Transaction,
    pub(crate) entity_type: EntityType,
    pub(crate) uid: &'a Uid,
    pub(crate) operation: Operation,
    pub(crate) entity: &'a EntityBuffer,
    pub(crate) previous: Option<&'a EntityBuffer>,
    pub(crate) token: CompletionToken,
}

impl<'a> PipelineContext<'a> {
    /// Type of the dispatched entity.
    #[inline]
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// UID of the dispatched entity.
    #[inline]
    pub fn uid(&self) -> &Uid {
        self.uid
    }

    /// Operation the revision performed.
    #[inline]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The stored record of the revision being processed.
    #[inline]
    pub fn entity(&self) -> &EntityBuffer {
        self.entity
    }

    /// The latest record before this revision, if the entity existed.
    #[inline]
    pub fn previous(&self) -> Option<&EntityBuffer> {
        self.previous
    }

    /// The write transaction the revision is stored in.
    #[inline]
    pub fn transaction(&self) -> &'a Transaction {
        self.txn
    }

    /// Opens the secondary index for a property of this entity type.
    pub fn index(&self, property: &str) -> Result<Index<'a>> {
        let name = format!("{}.index.{}", self.entity_type.as_str(), property);
        Index::new(name, self.txn)
    }

    /// Token identifying this invocation for deferred completion.
    #[inline]
    pub fn completion_token(&self) -> CompletionToken {
        self.token
    }
}

/// A step in a pipeline.
pub trait Preprocessor {
    /// Name used in error reports and logs.
    fn name(&self) -> &str {
        "preprocessor"
    }

    /// Processes one entity revision.
    ///
    /// An error aborts the surrounding write transaction when raised
    /// before the revision committed.
    fn process(&mut self, ctx: &PipelineContext<'_>) -> Result<Processing>;
}

/// Maintains every declared secondary index of an entity type.
///
/// On creation the new payload's terms are added; on modification the
/// previous payload's terms are replaced; on removal the previous terms
/// are erased. Registered as the default preprocessor for every type.
#[derive(Debug, Default)]
pub struct DefaultIndexUpdater;

impl DefaultIndexUpdater {
    fn add_terms(&self, ctx: &PipelineContext<'_>, payload: &[u8]) -> Result<()> {
        for definition in ctx.entity_type().index_definitions() {
            if let Some(term) = ctx.entity_type().read_property(payload, definition.property) {
                let mut index = ctx.index(definition.property)?;
                index.add(&term, ctx.uid())?;
            }
        }
        Ok(())
    }

    fn remove_terms(&self, ctx: &PipelineContext<'_>, payload: &[u8]) -> Result<()> {
        for definition in ctx.entity_type().index_definitions() {
            if let Some(term) = ctx.entity_type().read_property(payload, definition.property) {
                let mut index = ctx.index(definition.property)?;
                index.remove(&term, ctx.uid())?;
            }
        }
        Ok(())
    }
}

impl Preprocessor for DefaultIndexUpdater {
    fn name(&self) -> &str {
        "default-index-updater"
    }

    fn process(&mut self, ctx: &PipelineContext<'_>) -> Result<Processing> {
        match ctx.operation() {
            Operation::Creation => {
                self.add_terms(ctx, &ctx.entity().resource)?;
            }
            Operation::Modification => {
                if let Some(previous) = ctx.previous() {
                    self.remove_terms(ctx, &previous.resource)?;
                }
                self.add_terms(ctx, &ctx.entity().resource)?;
            }
            Operation::Removal => {
                if let Some(previous) = ctx.previous() {
                    self.remove_terms(ctx, &previous.resource)?;
                }
            }
        }
        Ok(Processing::Completed)
    }
}
