//! Command frames delivered to the pipeline.
//!
//! Synchronizers and the client transport hand the pipeline serialized
//! command buffers. Three frames exist, one per ingestion operation; the
//! [`Command`] envelope carries the discriminant on the wire.
//!
//! `delta` is the full resource payload for the target revision. The
//! `deletions` list on [`ModifyEntity`] names properties cleared by the
//! modification; it travels with the frame for replayers that need it.

use serde::{Deserialize, Serialize};

use crate::domain::EntityType;
use crate::error::{Result, SiltError};
use crate::types::{Revision, Uid};

/// Create a new entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntity {
    /// UID of the entity to create.
    pub entity_id: Uid,
    /// Entity type the payload belongs to.
    pub entity_type: EntityType,
    /// Resource payload bytes.
    pub delta: Vec<u8>,
    /// Whether change replay should push this change to the source.
    pub replay_to_source: bool,
}

/// Modify an existing entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyEntity {
    /// Revision the sender based the modification on, or
    /// [`UNKNOWN_REVISION`].
    pub target_revision: i64,
    /// UID of the entity to modify.
    pub entity_id: Uid,
    /// Properties cleared by this modification.
    pub deletions: Vec<String>,
    /// Entity type the payload belongs to.
    pub entity_type: EntityType,
    /// Resource payload bytes for the new revision.
    pub delta: Vec<u8>,
    /// Whether change replay should push this change to the source.
    pub replay_to_source: bool,
}

/// Tombstone an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntity {
    /// Revision the sender based the deletion on, or [`UNKNOWN_REVISION`].
    pub target_revision: i64,
    /// UID of the entity to delete.
    pub entity_id: Uid,
    /// Entity type of the target.
    pub entity_type: EntityType,
    /// Whether change replay should push this change to the source.
    pub replay_to_source: bool,
}

/// Envelope for the three command frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Create a new entity.
    Create(CreateEntity),
    /// Modify an existing entity.
    Modify(ModifyEntity),
    /// Tombstone an entity.
    Delete(DeleteEntity),
}

impl Command {
    /// Builds a create command.
    pub fn create(
        entity_id: Uid,
        entity_type: EntityType,
        delta: Vec<u8>,
        replay_to_source: bool,
    ) -> Self {
        Self::Create(CreateEntity {
            entity_id,
            entity_type,
            delta,
            replay_to_source,
        })
    }

    /// Builds a modify command based on the given revision.
    pub fn modify(
        entity_id: Uid,
        entity_type: EntityType,
        target_revision: Revision,
        delta: Vec<u8>,
        replay_to_source: bool,
    ) -> Self {
        Self::Modify(ModifyEntity {
            target_revision: target_revision as i64,
            entity_id,
            deletions: Vec::new(),
            entity_type,
            delta,
            replay_to_source,
        })
    }

    /// Builds a delete command based on the given revision.
    pub fn delete(
        entity_id: Uid,
        entity_type: EntityType,
        target_revision: Revision,
        replay_to_source: bool,
    ) -> Self {
        Self::Delete(DeleteEntity {
            target_revision: target_revision as i64,
            entity_id,
            entity_type,
            replay_to_source,
        })
    }

    /// UID the command targets.
    pub fn entity_id(&self) -> &Uid {
        match self {
            Self::Create(c) => &c.entity_id,
            Self::Modify(c) => &c.entity_id,
            Self::Delete(c) => &c.entity_id,
        }
    }

    /// Entity type the command targets.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Create(c) => c.entity_type,
            Self::Modify(c) => c.entity_type,
            Self::Delete(c) => c.entity_type,
        }
    }

    /// Encodes the command for transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SiltError::invalid_buffer(format!("cannot encode command: {}", e)))
    }

    /// Decodes a command buffer.
    ///
    /// A buffer that fails to decode is an [`SiltError::InvalidBuffer`];
    /// the pipeline drops such commands and logs a warning.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let command: Command = bincode::deserialize(bytes)
            .map_err(|e| SiltError::invalid_buffer(format!("cannot decode command: {}", e)))?;
        if command.entity_id().is_empty() {
            return Err(SiltError::invalid_buffer("command carries an empty UID"));
        }
        Ok(command)
    }
}
