//! Core identifier types shared across the engine.
//!
//! Entity UIDs are opaque byte strings: synchronizers usually mint them as
//! UUID v7 text, but clients may supply their own identifiers. Remote IDs
//! are whatever the external source uses (a maildir file name, an iCal UID).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A revision stamp assigned by the pipeline.
///
/// Revisions are per-resource, start at 1, and advance by exactly one per
/// successful ingestion.
pub type Revision = u64;

/// Sentinel used in wire metadata when the revision is not known yet.
pub const UNKNOWN_REVISION: i64 = -1;

/// Opaque entity identifier.
///
/// A `Uid` is an arbitrary non-empty byte string. The remote-ID mapper mints
/// them as UUID v7 text (time-ordered), but nothing in the engine assumes
/// that shape.
///
/// # Example
/// ```
/// use silt::Uid;
///
/// let minted = Uid::new();
/// let explicit = Uid::from_bytes(b"m1");
/// assert_ne!(minted, explicit);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(Vec<u8>);

impl Uid {
    /// Mints a new UID as UUID v7 text (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7().hyphenated().to_string().into_bytes())
    }

    /// Creates a UID from raw bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(bytes.as_ref().to_vec())
    }

    /// Returns the raw bytes for storage keys.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if the UID carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Uid {
    /// Mints a fresh UID. Use [`Uid::from_bytes`] for a fixed identifier.
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8]> for Uid {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

/// Identifier assigned by an external source.
///
/// For a maildir resource this is a file or directory path; the engine
/// treats it as opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteId(Vec<u8>);

impl RemoteId {
    /// Creates a remote ID from raw bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(bytes.as_ref().to_vec())
    }

    /// Returns the raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if the remote ID carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}
