//! # silt
//!
//! Embedded synchronization and query engine for personal information
//! management. Each account **resource** (a maildir, a calendar) owns a
//! transactional store of revisioned entities; synchronizers feed inbound
//! changes through a preprocessor **pipeline** that stamps revisions and
//! maintains secondary indexes, and clients run **queries** that can stay
//! live on the resulting revision stream.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use silt::{Config, EntityType, Query, Resource};
//!
//! // Open a resource instance
//! let mut resource = Resource::new(Config::for_instance("./storage", "maildir.instance1"))?;
//!
//! // Ingest a change coming from the source
//! let mail = silt::domain::Mail { subject: "hello".into(), ..Default::default() };
//! resource.pipeline_mut().new_entity(
//!     EntityType::Mail,
//!     &silt::Uid::from_bytes(b"m1"),
//!     &mail.encode()?,
//!     false,
//! )?;
//!
//! // Query it back
//! let results = resource.query(&Query::for_type(EntityType::Mail))?;
//! assert_eq!(results.row_count(), 1);
//! ```
//!
//! ## Key Concepts
//!
//! ### Entity
//!
//! The unit of storage: an opaque UID plus a sequence of **revisions**,
//! each a distinct record carrying metadata (revision stamp, operation,
//! replay flag) and a typed payload. An entity's current state is its
//! highest non-tombstone revision.
//!
//! ### Pipeline
//!
//! The single writer of a resource. Every create/modify/delete command
//! assigns the next revision and runs the type's preprocessor chain in
//! the same write transaction; subscribers learn about committed
//! revisions through `RevisionUpdated` notifications.
//!
//! ### Live query
//!
//! A query that first delivers a snapshot and then keeps folding every
//! new revision into its result model, in revision order.
//!
//! ## Thread Safety
//!
//! The engine follows a single-threaded cooperative model: one owner
//! drives the pipeline and its notifications. Read transactions may be
//! taken from other threads; the store serializes its single writer
//! internally.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod error;
mod types;

pub mod commands;
pub mod domain;
pub mod entity;
pub mod index;
pub mod mapper;
pub mod pipeline;
pub mod query;
pub mod resource;
pub mod revision;
pub mod storage;
pub mod sync;

// ============================================================================
// Public API re-exports
// ============================================================================

// Resource shell
pub use resource::{load, register_factory, Resource, ResourceFactory};

// Configuration
pub use config::Config;

// Error handling
pub use error::{Result, SiltError, StorageError};

// Core types
pub use types::{RemoteId, Revision, Uid, UNKNOWN_REVISION};

// Domain registration
pub use domain::EntityType;

// Entity records and commands
pub use commands::Command;
pub use entity::{EntityBuffer, Metadata, Operation};

// Pipeline
pub use pipeline::{
    DefaultIndexUpdater, Notification, Pipeline, PipelineContext, PipelineKind, Preprocessor,
    Processing,
};

// Queries
pub use query::{LiveQuery, Query, QueryEvent, QueryExecutor, ResultRow, ResultSet};

// Storage (for advanced users and synchronizers)
pub use storage::{AccessMode, Store, Transaction};

// Synchronization
pub use sync::{ChangeReplay, SynchronizationContext, Synchronizer};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common silt usage.
///
/// ```rust
/// use silt::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::EntityType;
    pub use crate::error::{Result, SiltError};
    pub use crate::pipeline::{Notification, Pipeline, PipelineKind};
    pub use crate::query::{LiveQuery, Query, QueryEvent};
    pub use crate::resource::Resource;
    pub use crate::types::{RemoteId, Revision, Uid};
}
