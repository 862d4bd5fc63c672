//! Domain types and the per-type registration tables.
//!
//! The engine dispatches on the [`EntityType`] tag instead of an open
//! class hierarchy: each type contributes its index definitions, a
//! property reader used for index terms and residual query filters, and a
//! payload validator backing the `InvalidBuffer` error.
//!
//! Payloads are bincode-encoded structs owned by the resource plug-in
//! ([`Mail`], [`Folder`], [`Event`]); the engine itself only ever looks at
//! them through [`EntityType::read_property`].

pub mod event;
pub mod folder;
pub mod mail;

pub use event::Event;
pub use folder::Folder;
pub use mail::Mail;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SiltError};
use crate::index::IndexDefinition;

/// Tag identifying the entity type of a record or command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// A mail message.
    Mail,
    /// A mail folder.
    Folder,
    /// A calendar event.
    Event,
}

impl EntityType {
    /// Every known entity type.
    pub const ALL: [EntityType; 3] = [EntityType::Mail, EntityType::Folder, EntityType::Event];

    /// Type name used in database names (`mail.main`,
    /// `mail.index.folder`, `rid.mapping.mail`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Mail => "mail",
            EntityType::Folder => "folder",
            EntityType::Event => "event",
        }
    }

    /// Parses a type name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mail" => Some(EntityType::Mail),
            "folder" => Some(EntityType::Folder),
            "event" => Some(EntityType::Event),
            _ => None,
        }
    }

    /// Single-byte tag used in the revision index.
    pub fn as_tag(&self) -> u8 {
        match self {
            EntityType::Mail => 1,
            EntityType::Folder => 2,
            EntityType::Event => 3,
        }
    }

    /// Inverse of [`EntityType::as_tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntityType::Mail),
            2 => Some(EntityType::Folder),
            3 => Some(EntityType::Event),
            _ => None,
        }
    }

    /// Name of this type's main database.
    pub fn main_db(&self) -> String {
        format!("{}.main", self.as_str())
    }

    /// Secondary indexes defined for this type.
    pub fn index_definitions(&self) -> &'static [IndexDefinition] {
        match self {
            EntityType::Mail => mail::INDEXES,
            EntityType::Folder => folder::INDEXES,
            EntityType::Event => event::INDEXES,
        }
    }

    /// Reads a property from a payload as normalized term bytes.
    ///
    /// Text properties yield their UTF-8 bytes, booleans a single `0`/`1`
    /// byte, integers 8 big-endian bytes. Returns `None` for unknown
    /// properties, absent optional values, and undecodable payloads.
    pub fn read_property(&self, payload: &[u8], property: &str) -> Option<Vec<u8>> {
        match self {
            EntityType::Mail => mail::read_property(payload, property),
            EntityType::Folder => folder::read_property(payload, property),
            EntityType::Event => event::read_property(payload, property),
        }
    }

    /// Validates that a payload decodes against this type's schema.
    pub fn validate(&self, payload: &[u8]) -> Result<()> {
        let outcome = match self {
            EntityType::Mail => bincode::deserialize::<Mail>(payload).map(|_| ()),
            EntityType::Folder => bincode::deserialize::<Folder>(payload).map(|_| ()),
            EntityType::Event => bincode::deserialize::<Event>(payload).map(|_| ()),
        };
        outcome.map_err(|e| {
            SiltError::invalid_buffer(format!("{} payload rejected: {}", self.as_str(), e))
        })
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalizes a text property into term bytes.
pub(crate) fn text_term(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value.as_bytes().to_vec())
    }
}

/// Normalizes a boolean property into a single-byte term.
pub(crate) fn bool_term(value: bool) -> Option<Vec<u8>> {
    Some(vec![u8::from(value)])
}

/// Normalizes an integer property into big-endian term bytes, so index
/// order matches numeric order.
pub(crate) fn i64_term(value: i64) -> Option<Vec<u8>> {
    Some(value.to_be_bytes().to_vec())
}
