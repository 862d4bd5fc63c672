//! Folder payloads.

use serde::{Deserialize, Serialize};

use super::text_term;
use crate::error::Result;
use crate::index::IndexDefinition;

/// Indexed folder properties: the parent folder's local UID.
pub static INDEXES: &[IndexDefinition] = &[IndexDefinition::new("parent")];

/// A mail folder payload.
///
/// Top-level folders carry no `parent`; a folder tree query groups
/// children under the UID named by it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Display name.
    pub name: String,
    /// Icon identifier for clients.
    pub icon: String,
    /// Local UID of the parent folder; empty at the top level.
    pub parent: String,
}

impl Folder {
    /// Encodes the payload for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(crate::error::StorageError::from)?)
    }

    /// Decodes a stored payload.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        bincode::deserialize(payload).ok()
    }
}

/// Reads a folder property as normalized term bytes.
pub fn read_property(payload: &[u8], property: &str) -> Option<Vec<u8>> {
    let folder = Folder::decode(payload)?;
    match property {
        "name" => text_term(&folder.name),
        "icon" => text_term(&folder.icon),
        "parent" => text_term(&folder.parent),
        _ => None,
    }
}
