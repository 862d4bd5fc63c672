//! Query execution: index selection, residual filtering, live delivery.
//!
//! A non-live query runs against a single transactional snapshot:
//!
//! 1. **Index selection**: every filter property with a declared index
//!    is resolved through `<type>.index.<property>`; the applied filters
//!    are recorded on the result.
//! 2. **Residual filter**: candidates are read via their latest record,
//!    tombstones dropped, and the remaining filter properties evaluated
//!    against the payload in-process.
//! 3. **Parent grouping**: with a parent property set, the top level
//!    holds entities without a parent; [`QueryExecutor::fetch_children`]
//!    runs the child query for one row.
//!
//! A [`LiveQuery`] additionally subscribes to the pipeline: on every
//! notification it walks the revision log over `(last_seen, maxRevision]`
//! and folds each revision into its result model, delivering one
//! [`QueryEvent`] per revision that changed the model.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crossbeam_channel::Receiver;
use tracing::{debug, trace};

use crate::domain::EntityType;
use crate::entity::{read_exact, read_latest};
use crate::error::Result;
use crate::index::Index;
use crate::pipeline::Notification;
use crate::revision;
use crate::storage::keys::{is_internal_key, uid_from_key};
use crate::storage::{AccessMode, Store, Transaction};
use crate::types::{Revision, Uid};

/// What a client asks a resource for.
///
/// `sync_on_demand` and `process_all` are honored by
/// [`Resource::query`](crate::Resource::query); the executor itself only
/// evaluates the filter.
#[derive(Clone, Debug)]
pub struct Query {
    /// Resource instances the client addressed. Filtered upstream; the
    /// core only ever sees its own.
    pub resources: BTreeSet<String>,
    /// Entity type to query.
    pub entity_type: EntityType,
    /// Property → term filters, all of which must match.
    pub property_filter: BTreeMap<String, Vec<u8>>,
    /// Property grouping results into a tree, e.g. `"parent"` for
    /// folders. Top-level rows are entities without that property.
    pub parent_property: Option<String>,
    /// Synchronize with the source before querying.
    pub sync_on_demand: bool,
    /// Drain the pipeline before the first result.
    pub process_all: bool,
    /// Keep delivering matching changes after the snapshot.
    pub live_query: bool,
}

impl Query {
    /// A query for every entity of a type, with all flags off.
    pub fn for_type(entity_type: EntityType) -> Self {
        Self {
            resources: BTreeSet::new(),
            entity_type,
            property_filter: BTreeMap::new(),
            parent_property: None,
            sync_on_demand: false,
            process_all: false,
            live_query: false,
        }
    }

    /// Adds a property filter.
    pub fn with_filter(mut self, property: impl Into<String>, term: impl Into<Vec<u8>>) -> Self {
        self.property_filter.insert(property.into(), term.into());
        self
    }

    /// Groups results as a tree under the given parent property.
    pub fn with_parent_property(mut self, property: impl Into<String>) -> Self {
        self.parent_property = Some(property.into());
        self
    }
}

/// One entity in a result set, copied out of the read transaction.
#[derive(Clone, Debug)]
pub struct ResultRow {
    /// Entity UID.
    pub uid: Uid,
    /// Revision of the delivered record.
    pub revision: Revision,
    /// Resource payload of the delivered record.
    pub payload: Vec<u8>,
}

/// The outcome of a non-live query against one snapshot.
#[derive(Debug, Default)]
pub struct ResultSet {
    rows: Vec<ResultRow>,
    applied_filters: BTreeSet<String>,
    at_revision: Revision,
}

impl ResultSet {
    /// Rows in candidate order.
    #[inline]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Number of rows.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Filter properties that were answered by an index.
    #[inline]
    pub fn applied_filters(&self) -> &BTreeSet<String> {
        &self.applied_filters
    }

    /// The `maxRevision` observed by the snapshot.
    #[inline]
    pub fn at_revision(&self) -> Revision {
        self.at_revision
    }
}

/// Resolves queries against the indexes and the entity store.
pub struct QueryExecutor<'s> {
    store: &'s Store,
}

impl<'s> QueryExecutor<'s> {
    /// Creates an executor over the given store.
    pub fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Runs a non-live query against a fresh snapshot.
    pub fn execute(&self, query: &Query) -> Result<ResultSet> {
        let txn = self.store.begin(AccessMode::ReadOnly)?;
        self.execute_in(&txn, query, true)
    }

    /// Runs the child query for one parent row of a tree query.
    pub fn fetch_children(&self, query: &Query, parent: &Uid) -> Result<ResultSet> {
        let Some(parent_property) = query.parent_property.clone() else {
            return self.execute(query);
        };
        let mut child_query = query.clone();
        child_query
            .property_filter
            .insert(parent_property, parent.as_bytes().to_vec());
        let txn = self.store.begin(AccessMode::ReadOnly)?;
        // The parent filter replaces the top-level absence rule.
        self.execute_in(&txn, &child_query, false)
    }

    fn execute_in(&self, txn: &Transaction, query: &Query, top_level: bool) -> Result<ResultSet> {
        let at_revision = revision::max_revision(txn)?;

        // Phase 1: index selection.
        let mut applied_filters = BTreeSet::new();
        let mut candidates: Option<Vec<Uid>> = None;
        for definition in query.entity_type.index_definitions() {
            let Some(term) = query.property_filter.get(definition.property) else {
                continue;
            };
            let matches = match Index::new(
                definition.database_name(query.entity_type.as_str()),
                txn,
            ) {
                Ok(index) => index.lookup_all(term),
                // An index that was never written to holds no matches.
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            };
            applied_filters.insert(definition.property.to_string());
            candidates = Some(match candidates {
                None => matches,
                Some(previous) => {
                    let keep: HashSet<Uid> = matches.into_iter().collect();
                    previous.into_iter().filter(|uid| keep.contains(uid)).collect()
                }
            });
        }
        let candidates = match candidates {
            Some(uids) => uids,
            None => self.all_uids(txn, query.entity_type)?,
        };
        trace!(
            candidates = candidates.len(),
            applied = applied_filters.len(),
            "index selection done"
        );

        // Phase 2: residual filter over the latest records.
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for uid in candidates {
            if !seen.insert(uid.clone()) {
                continue;
            }
            let Some(record) = read_latest(txn, query.entity_type, &uid)? else {
                continue;
            };
            if record.is_tombstone() {
                continue;
            }
            if !residual_match(query, &applied_filters, &record.resource) {
                continue;
            }
            if top_level {
                if let Some(parent_property) = &query.parent_property {
                    // Top-level rows of a tree query carry no parent.
                    let has_parent = query
                        .entity_type
                        .read_property(&record.resource, parent_property)
                        .is_some();
                    if has_parent && !query.property_filter.contains_key(parent_property) {
                        continue;
                    }
                }
            }
            rows.push(ResultRow {
                uid,
                revision: record.metadata.revision().unwrap_or(0),
                payload: record.resource,
            });
        }

        debug!(rows = rows.len(), at_revision, "query executed");
        Ok(ResultSet {
            rows,
            applied_filters,
            at_revision,
        })
    }

    /// Every UID present in `<type>.main`, in key order.
    fn all_uids(&self, txn: &Transaction, entity_type: EntityType) -> Result<Vec<Uid>> {
        let main = match txn.database(&entity_type.main_db(), false) {
            Ok(db) => db,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let on_error = self.store.default_error_handler();
        let mut uids = Vec::new();
        let mut seen = HashSet::new();
        main.scan(
            b"",
            |key, _| {
                if !is_internal_key(key) {
                    if let Some(uid) = uid_from_key(key) {
                        if seen.insert(uid.clone()) {
                            uids.push(uid);
                        }
                    }
                }
                true
            },
            |e| on_error(e),
        );
        Ok(uids)
    }
}

/// Evaluates the filter properties that no index answered.
fn residual_match(query: &Query, applied: &BTreeSet<String>, payload: &[u8]) -> bool {
    for (property, term) in &query.property_filter {
        if applied.contains(property) {
            continue;
        }
        match query.entity_type.read_property(payload, property) {
            Some(value) if &value == term => {}
            _ => return false,
        }
    }
    true
}

/// Matches a record against the full filter, ignoring indexes.
///
/// Used by live queries, which evaluate single records in-process.
fn full_match(query: &Query, payload: &[u8]) -> bool {
    let empty = BTreeSet::new();
    residual_match(query, &empty, payload)
}

/// One change delivered by a live query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryEvent {
    /// An entity entered the result set.
    Added(Uid),
    /// An entity in the result set changed.
    Modified(Uid),
    /// An entity left the result set.
    Removed(Uid),
}

/// A query that keeps delivering matched changes after its snapshot.
///
/// The caller drives it: whenever the subscription receives a
/// notification (or on its own schedule), call
/// [`LiveQuery::process_notifications`] to fold new revisions into the
/// result model.
pub struct LiveQuery {
    query: Query,
    notifications: Receiver<Notification>,
    last_seen: Revision,
    rows: Vec<Uid>,
}

impl LiveQuery {
    /// Starts a live query: runs the snapshot and attaches the
    /// subscription receiver.
    pub(crate) fn start(
        store: &Store,
        notifications: Receiver<Notification>,
        query: Query,
    ) -> Result<Self> {
        let snapshot = QueryExecutor::new(store).execute(&query)?;
        let rows = snapshot.rows().iter().map(|row| row.uid.clone()).collect();
        Ok(Self {
            query,
            last_seen: snapshot.at_revision(),
            notifications,
            rows,
        })
    }

    /// Current number of rows in the result model.
    #[inline]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// UIDs currently in the result model, in insertion order.
    #[inline]
    pub fn rows(&self) -> &[Uid] {
        &self.rows
    }

    /// Highest revision folded into the model.
    #[inline]
    pub fn last_seen(&self) -> Revision {
        self.last_seen
    }

    /// Drains pending notifications and folds every new revision into the
    /// result model, in revision order.
    ///
    /// Each revision in `(last_seen, maxRevision]` yields at most one
    /// event: `Added` when a matching entity enters the model, `Modified`
    /// when it changes in place, `Removed` when a tombstone or a
    /// non-matching revision evicts it. Notification delivery is
    /// at-most-once, so the current `maxRevision` is pulled regardless of
    /// how many notifications were actually received.
    pub fn process_notifications(&mut self, store: &Store) -> Result<Vec<QueryEvent>> {
        while self.notifications.try_recv().is_ok() {}

        let txn = store.begin(AccessMode::ReadOnly)?;
        let max = revision::max_revision(&txn)?;
        if max <= self.last_seen {
            return Ok(Vec::new());
        }

        let mut touched = Vec::new();
        revision::scan_revisions(&txn, self.last_seen, max, |rev, entity_type, uid| {
            if entity_type == self.query.entity_type {
                touched.push((rev, uid.clone()));
            }
            true
        })?;

        let mut events = Vec::new();
        for (rev, uid) in touched {
            let record = read_exact(&txn, self.query.entity_type, &uid, rev)?;
            let matches = record.as_ref().is_some_and(|r| {
                !r.is_tombstone()
                    && full_match(&self.query, &r.resource)
                    && self.parent_rule_allows(&r.resource)
            });
            let present = self.rows.contains(&uid);
            match (matches, present) {
                (true, false) => {
                    self.rows.push(uid.clone());
                    events.push(QueryEvent::Added(uid));
                }
                (true, true) => events.push(QueryEvent::Modified(uid)),
                (false, true) => {
                    self.rows.retain(|u| u != &uid);
                    events.push(QueryEvent::Removed(uid));
                }
                (false, false) => {}
            }
        }
        self.last_seen = max;
        Ok(events)
    }

    fn parent_rule_allows(&self, payload: &[u8]) -> bool {
        match &self.query.parent_property {
            Some(property) if !self.query.property_filter.contains_key(property) => self
                .query
                .entity_type
                .read_property(payload, property)
                .is_none(),
            _ => true,
        }
    }
}
