//! Mail payloads.
//!
//! The property set matches what a maildir synchronizer extracts from a
//! message on disk: envelope headers, the owning folder's local UID, and
//! the path of the MIME file.

use serde::{Deserialize, Serialize};

use super::{bool_term, i64_term, text_term};
use crate::error::Result;
use crate::index::IndexDefinition;

/// Indexed mail properties: the owning folder and the date line.
pub static INDEXES: &[IndexDefinition] = &[
    IndexDefinition::new("folder"),
    IndexDefinition::new("date"),
];

/// A mail message payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    /// Subject header.
    pub subject: String,
    /// From header.
    pub sender: String,
    /// Display name of the sender.
    pub sender_name: String,
    /// Date header as Unix milliseconds.
    pub date: i64,
    /// Local UID of the folder holding this mail.
    pub folder: String,
    /// Path of the MIME message file.
    pub mime_message: String,
    /// Whether the mail has not been read yet.
    pub unread: bool,
    /// Whether the mail is flagged important.
    pub important: bool,
}

impl Mail {
    /// Encodes the payload for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(crate::error::StorageError::from)?)
    }

    /// Decodes a stored payload.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        bincode::deserialize(payload).ok()
    }
}

/// Reads a mail property as normalized term bytes.
pub fn read_property(payload: &[u8], property: &str) -> Option<Vec<u8>> {
    let mail = Mail::decode(payload)?;
    match property {
        "subject" => text_term(&mail.subject),
        "sender" => text_term(&mail.sender),
        "senderName" => text_term(&mail.sender_name),
        "date" => i64_term(mail.date),
        "folder" => text_term(&mail.folder),
        "mimeMessage" => text_term(&mail.mime_message),
        "unread" => bool_term(mail.unread),
        "important" => bool_term(mail.important),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mail = Mail {
            subject: "hello".into(),
            sender: "a@example.org".into(),
            date: 1000,
            folder: "folder-uid".into(),
            unread: true,
            ..Default::default()
        };
        let bytes = mail.encode().unwrap();
        assert_eq!(Mail::decode(&bytes), Some(mail));
    }

    #[test]
    fn test_read_property() {
        let mail = Mail {
            subject: "hello".into(),
            folder: "folder-uid".into(),
            unread: true,
            ..Default::default()
        };
        let bytes = mail.encode().unwrap();

        assert_eq!(read_property(&bytes, "subject"), Some(b"hello".to_vec()));
        assert_eq!(read_property(&bytes, "folder"), Some(b"folder-uid".to_vec()));
        assert_eq!(read_property(&bytes, "unread"), Some(vec![1]));
        // Empty text properties read as absent.
        assert_eq!(read_property(&bytes, "sender"), None);
        assert_eq!(read_property(&bytes, "nonsense"), None);
    }
}
