//! Calendar event payloads.

use serde::{Deserialize, Serialize};

use super::text_term;
use crate::error::Result;
use crate::index::IndexDefinition;

/// Indexed event properties: the iCal UID.
pub static INDEXES: &[IndexDefinition] = &[IndexDefinition::new("uid")];

/// A calendar event payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Summary line.
    pub summary: String,
    /// Free-form description.
    pub description: String,
    /// The iCal UID assigned by the calendar source.
    pub uid: String,
}

impl Event {
    /// Encodes the payload for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(crate::error::StorageError::from)?)
    }

    /// Decodes a stored payload.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        bincode::deserialize(payload).ok()
    }
}

/// Reads an event property as normalized term bytes.
pub fn read_property(payload: &[u8], property: &str) -> Option<Vec<u8>> {
    let event = Event::decode(payload)?;
    match property {
        "summary" => text_term(&event.summary),
        "description" => text_term(&event.description),
        "uid" => text_term(&event.uid),
        _ => None,
    }
}
