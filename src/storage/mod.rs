//! Storage layer: the transactional entity store.
//!
//! One [`Store`] per resource instance holds every named database of that
//! resource: `<type>.main` entity records, `<type>.index.<property>`
//! secondary indexes, and the reserved `__internal` namespace. A sibling
//! store suffixed `.synchronization` holds the remote-ID mappings so
//! synchronizers can write them independently of the main store's writer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Store (one redb file per resource instance)              │
//! │   │                                                      │
//! │   ├─ Transaction (ReadOnly*, ReadWrite at most one)      │
//! │   │    │                                                 │
//! │   │    ├─ Database "mail.main"          (plain)          │
//! │   │    ├─ Database "mail.index.folder"  (duplicates)     │
//! │   │    └─ Database "__internal"         (reserved)       │
//! │   └─ default error handler for scan paths                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys of entity records are `uid + revision` (big-endian suffix), so a
//! prefix scan over a UID yields revisions in ascending order; see
//! [`keys`].

pub mod keys;
mod store;

pub use store::{
    basic_error_handler, AccessMode, Database, ErrorHandler, Store, Transaction, SCHEMA_VERSION,
};
