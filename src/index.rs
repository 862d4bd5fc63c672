//! Secondary indexes: named term → UID multimaps.
//!
//! An [`Index`] wraps a duplicate-allowing database opened within a
//! transaction. Index databases are named `<type>.index.<property>`; the
//! remote-ID mapping databases reuse the same machinery under
//! `rid.mapping.<type>` / `localid.mapping.<type>`.
//!
//! Index writes happen inside the same transaction as the entity write
//! that triggers them, so an index is never observable out of step with
//! `main`.

use tracing::warn;

use crate::error::{Result, StorageError};
use crate::storage::{Database, Transaction};
use crate::types::Uid;

/// Declares one indexed property of an entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Property whose normalized value becomes the index term.
    pub property: &'static str,
}

impl IndexDefinition {
    /// Creates a definition for the given property.
    pub const fn new(property: &'static str) -> Self {
        Self { property }
    }

    /// Index database name for the given entity type name.
    pub fn database_name(&self, type_name: &str) -> String {
        format!("{}.index.{}", type_name, self.property)
    }
}

/// A named secondary index opened within a transaction.
pub struct Index<'txn> {
    name: String,
    db: Database<'txn>,
}

impl<'txn> Index<'txn> {
    /// Opens the index inside the given transaction.
    ///
    /// Write transactions create the underlying database on demand; in a
    /// read transaction an index that was never written to reports
    /// `NotFound`.
    pub fn new(name: impl Into<String>, txn: &'txn Transaction) -> Result<Self> {
        let name = name.into();
        let db = txn.database(&name, true)?;
        Ok(Self { name, db })
    }

    /// Name of the underlying database.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Associates a UID with a term. Adding an identical `(term, uid)`
    /// pair again is a no-op.
    pub fn add(&mut self, term: &[u8], uid: &Uid) -> Result<()> {
        self.db.put(term, uid.as_bytes())
    }

    /// Removes one `(term, uid)` pair. An absent pair is not an error;
    /// it is logged and ignored.
    pub fn remove(&mut self, term: &[u8], uid: &Uid) -> Result<()> {
        let removed = self.db.remove(term, Some(uid.as_bytes()))?;
        if !removed {
            warn!(
                index = %self.name,
                uid = %uid,
                "removal of an absent index entry"
            );
        }
        Ok(())
    }

    /// Yields every UID associated with the term.
    ///
    /// `on_uid` returns whether to continue. Returns the number of UIDs
    /// delivered.
    pub fn lookup(
        &self,
        term: &[u8],
        mut on_uid: impl FnMut(&Uid) -> bool,
        mut on_error: impl FnMut(&StorageError),
    ) -> usize {
        let mut count = 0usize;
        self.db.scan(
            term,
            |key, value| {
                // The prefix scan may overshoot onto longer terms.
                if key != term {
                    return false;
                }
                count += 1;
                on_uid(&Uid::from_bytes(value))
            },
            |e| on_error(e),
        );
        count
    }

    /// Collects every UID associated with the term.
    pub fn lookup_all(&self, term: &[u8]) -> Vec<Uid> {
        let mut uids = Vec::new();
        self.lookup(
            term,
            |uid| {
                uids.push(uid.clone());
                true
            },
            |e| {
                warn!(index = %self.name, error = %e, "index lookup error");
            },
        );
        uids
    }

    /// First UID associated with the term, if any.
    pub fn lookup_one(&self, term: &[u8]) -> Option<Uid> {
        let mut found = None;
        self.lookup(
            term,
            |uid| {
                found = Some(uid.clone());
                false
            },
            |e| {
                warn!(index = %self.name, error = %e, "index lookup error");
            },
        );
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccessMode, Store};
    use tempfile::tempdir;

    fn writable_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("s"), AccessMode::ReadWrite).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_and_lookup() {
        let (_dir, store) = writable_store();
        let m1 = Uid::from_bytes(b"m1");
        let m2 = Uid::from_bytes(b"m2");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        {
            let mut index = Index::new("mail.index.folder", &txn).unwrap();
            index.add(b"inbox", &m1).unwrap();
            index.add(b"inbox", &m2).unwrap();
            index.add(b"sent", &m1).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(AccessMode::ReadOnly).unwrap();
        let index = Index::new("mail.index.folder", &txn).unwrap();
        assert_eq!(index.lookup_all(b"inbox"), vec![m1.clone(), m2]);
        assert_eq!(index.lookup_all(b"sent"), vec![m1]);
        assert!(index.lookup_all(b"drafts").is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_dir, store) = writable_store();
        let m1 = Uid::from_bytes(b"m1");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        {
            let mut index = Index::new("event.index.uid", &txn).unwrap();
            index.add(b"u7", &m1).unwrap();
            index.add(b"u7", &m1).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(AccessMode::ReadOnly).unwrap();
        let index = Index::new("event.index.uid", &txn).unwrap();
        assert_eq!(index.lookup_all(b"u7").len(), 1);
    }

    #[test]
    fn test_lookup_does_not_bleed_across_terms() {
        let (_dir, store) = writable_store();
        let m1 = Uid::from_bytes(b"m1");
        let m2 = Uid::from_bytes(b"m2");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        {
            let mut index = Index::new("mail.index.folder", &txn).unwrap();
            index.add(b"in", &m1).unwrap();
            // A term that extends the lookup term must not match it.
            index.add(b"inbox", &m2).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(AccessMode::ReadOnly).unwrap();
        let index = Index::new("mail.index.folder", &txn).unwrap();
        assert_eq!(index.lookup_all(b"in"), vec![m1]);
    }

    #[test]
    fn test_remove_single_pair() {
        let (_dir, store) = writable_store();
        let m1 = Uid::from_bytes(b"m1");
        let m2 = Uid::from_bytes(b"m2");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        {
            let mut index = Index::new("mail.index.folder", &txn).unwrap();
            index.add(b"inbox", &m1).unwrap();
            index.add(b"inbox", &m2).unwrap();
            index.remove(b"inbox", &m1).unwrap();
            // Removing the pair again is non-fatal.
            index.remove(b"inbox", &m1).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(AccessMode::ReadOnly).unwrap();
        let index = Index::new("mail.index.folder", &txn).unwrap();
        assert_eq!(index.lookup_all(b"inbox"), vec![m2]);
    }

    #[test]
    fn test_lookup_one() {
        let (_dir, store) = writable_store();
        let m1 = Uid::from_bytes(b"m1");

        let txn = store.begin(AccessMode::ReadWrite).unwrap();
        {
            let mut index = Index::new("rid.mapping.mail", &txn).unwrap();
            index.add(b"cur/1422", &m1).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(AccessMode::ReadOnly).unwrap();
        let index = Index::new("rid.mapping.mail", &txn).unwrap();
        assert_eq!(index.lookup_one(b"cur/1422"), Some(m1));
        assert_eq!(index.lookup_one(b"cur/9999"), None);
    }

    #[test]
    fn test_index_definition_database_name() {
        let def = IndexDefinition::new("folder");
        assert_eq!(def.database_name("mail"), "mail.index.folder");
    }
}
