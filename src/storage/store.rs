//! redb-backed entity store.
//!
//! A [`Store`] wraps one memory-mapped redb database file inside the
//! resource instance's directory. Named databases map to redb tables:
//! plain tables for unique keys, multimap tables when duplicates are
//! allowed (secondary indexes).
//!
//! # Concurrency
//!
//! redb provides MVCC: any number of read transactions may coexist with at
//! most one write transaction, each observing a consistent snapshot.
//! Cross-process writer exclusion is enforced with an advisory lock on
//! `write.lock` inside the store directory.
//!
//! # File Layout
//!
//! A store at `<root>/<instance>/` contains:
//! - `data.redb` - the database file
//! - `write.lock` - advisory lock taken by the ReadWrite opener

use std::fs::{self, File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use redb::{MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument, warn};

use super::keys::{INTERNAL_DB, SCHEMA_VERSION_KEY};
use crate::error::{Result, StorageError};

/// Current store schema version.
///
/// The store refuses to open when the recorded version doesn't match.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the database inside the store directory.
const DATA_FILE: &str = "data.redb";

/// File name of the advisory writer lock inside the store directory.
const LOCK_FILE: &str = "write.lock";

/// Whether a store or transaction is opened for reading or writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Reads only; never creates databases.
    ReadOnly,
    /// Reads and writes; creates databases on demand.
    ReadWrite,
}

/// Handler invoked for non-fatal read errors on scan paths.
pub type ErrorHandler = Arc<dyn Fn(&StorageError) + Send + Sync>;

/// Returns the built-in error handler, which logs at warn level.
pub fn basic_error_handler() -> ErrorHandler {
    Arc::new(|error: &StorageError| {
        warn!(error = %error, "storage read error");
    })
}

/// One resource-instance store.
///
/// Values handed to scan callbacks borrow transaction-owned memory and are
/// only valid for the duration of the callback; copy them out for longer
/// lifetimes.
pub struct Store {
    db: redb::Database,
    path: PathBuf,
    mode: AccessMode,
    // Held for the lifetime of a ReadWrite store; the advisory lock is
    // released when the file closes.
    _write_lock: Option<File>,
    error_handler: ErrorHandler,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens or creates the store in the given directory.
    ///
    /// ReadWrite mode creates the directory on demand, takes the writer
    /// lock, and initializes the schema record. ReadOnly mode fails with
    /// `NotFound` when the store does not exist.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Locked`] if another writer holds the store
    /// - [`StorageError::SchemaVersionMismatch`] on version skew
    /// - [`StorageError::NotFound`] for ReadOnly opens of absent stores
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data_file = path.join(DATA_FILE);

        match mode {
            AccessMode::ReadWrite => {
                fs::create_dir_all(&path)?;
                let write_lock = Self::acquire_write_lock(&path)?;
                let db = redb::Database::create(&data_file).map_err(StorageError::from)?;
                let store = Self {
                    db,
                    path,
                    mode,
                    _write_lock: Some(write_lock),
                    error_handler: basic_error_handler(),
                };
                store.initialize_schema()?;
                debug!("store opened for writing");
                Ok(store)
            }
            AccessMode::ReadOnly => {
                if !data_file.exists() {
                    return Err(StorageError::not_found(data_file.display().to_string()).into());
                }
                let db = redb::Database::open(&data_file).map_err(StorageError::from)?;
                let store = Self {
                    db,
                    path,
                    mode,
                    _write_lock: None,
                    error_handler: basic_error_handler(),
                };
                store.check_schema()?;
                debug!("store opened read-only");
                Ok(store)
            }
        }
    }

    fn acquire_write_lock(path: &Path) -> Result<File> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;
        Ok(lock)
    }

    /// Writes the schema version on first open, validates it afterwards.
    fn initialize_schema(&self) -> Result<()> {
        let txn = self.begin(AccessMode::ReadWrite)?;
        {
            let mut internal = txn.database(INTERNAL_DB, false)?;
            match internal.get(SCHEMA_VERSION_KEY)? {
                Some(bytes) => {
                    let found: u32 = bincode::deserialize(&bytes).map_err(StorageError::from)?;
                    if found != SCHEMA_VERSION {
                        return Err(StorageError::SchemaVersionMismatch {
                            expected: SCHEMA_VERSION,
                            found,
                        }
                        .into());
                    }
                }
                None => {
                    let bytes = bincode::serialize(&SCHEMA_VERSION).map_err(StorageError::from)?;
                    internal.put(SCHEMA_VERSION_KEY, &bytes)?;
                    info!(schema_version = SCHEMA_VERSION, "store initialized");
                }
            }
        }
        txn.commit()
    }

    fn check_schema(&self) -> Result<()> {
        let txn = self.begin(AccessMode::ReadOnly)?;
        let internal = txn.database(INTERNAL_DB, false)?;
        let bytes = internal
            .get(SCHEMA_VERSION_KEY)?
            .ok_or_else(|| StorageError::corrupted("missing schema version record"))?;
        let found: u32 = bincode::deserialize(&bytes).map_err(StorageError::from)?;
        if found != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found,
            }
            .into());
        }
        Ok(())
    }

    /// Begins a transaction.
    ///
    /// Multiple ReadOnly transactions may coexist with at most one
    /// ReadWrite transaction. Dropping an uncommitted write transaction
    /// aborts it, so a transaction is always released on every exit path.
    pub fn begin(&self, mode: AccessMode) -> Result<Transaction> {
        match mode {
            AccessMode::ReadOnly => {
                let txn = self.db.begin_read().map_err(StorageError::from)?;
                Ok(Transaction::Read(txn))
            }
            AccessMode::ReadWrite => {
                if self.mode != AccessMode::ReadWrite {
                    return Err(
                        StorageError::engine("write transaction on a read-only store").into(),
                    );
                }
                let txn = self.db.begin_write().map_err(StorageError::from)?;
                Ok(Transaction::Write(txn))
            }
        }
    }

    /// Directory this store lives in.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode this store was opened with.
    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Replaces the handler used for non-fatal read errors.
    pub fn set_default_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Handler used for non-fatal read errors.
    pub fn default_error_handler(&self) -> ErrorHandler {
        Arc::clone(&self.error_handler)
    }

    /// Deletes a store directory and everything in it.
    ///
    /// The store must not be open.
    pub fn remove_from_disk(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// A transaction over a [`Store`].
///
/// Obtained from [`Store::begin`]. Each transaction observes a consistent
/// snapshot. Dropping a write transaction without committing aborts it.
pub enum Transaction {
    /// Snapshot reader.
    Read(redb::ReadTransaction),
    /// The single writer.
    Write(redb::WriteTransaction),
}

impl Transaction {
    /// Returns true for write transactions.
    pub fn is_writable(&self) -> bool {
        matches!(self, Transaction::Write(_))
    }

    /// Opens a named database inside this transaction.
    ///
    /// Write transactions create the database on demand; read transactions
    /// fail with `NotFound` when it is absent. `allow_duplicates` selects a
    /// multimap database where one key maps to a set of values.
    pub fn database(&self, name: &str, allow_duplicates: bool) -> Result<Database<'_>> {
        match (self, allow_duplicates) {
            (Transaction::Read(txn), false) => {
                let def = TableDefinition::<&[u8], &[u8]>::new(name);
                let table = txn.open_table(def).map_err(StorageError::from)?;
                Ok(Database::ReadPlain(table))
            }
            (Transaction::Read(txn), true) => {
                let def = MultimapTableDefinition::<&[u8], &[u8]>::new(name);
                let table = txn.open_multimap_table(def).map_err(StorageError::from)?;
                Ok(Database::ReadDup(table))
            }
            (Transaction::Write(txn), false) => {
                let def = TableDefinition::<&[u8], &[u8]>::new(name);
                let table = txn.open_table(def).map_err(StorageError::from)?;
                Ok(Database::WritePlain(table))
            }
            (Transaction::Write(txn), true) => {
                let def = MultimapTableDefinition::<&[u8], &[u8]>::new(name);
                let table = txn.open_multimap_table(def).map_err(StorageError::from)?;
                Ok(Database::WriteDup(table))
            }
        }
    }

    /// Commits the transaction.
    ///
    /// Read transactions release their snapshot; write transactions make
    /// every change visible atomically to later read transactions.
    pub fn commit(self) -> Result<()> {
        match self {
            Transaction::Read(_) => Ok(()),
            Transaction::Write(txn) => {
                txn.commit().map_err(StorageError::from)?;
                Ok(())
            }
        }
    }

    /// Abandons the transaction, discarding any writes.
    pub fn abort(self) -> Result<()> {
        match self {
            Transaction::Read(_) => Ok(()),
            Transaction::Write(txn) => {
                txn.abort().map_err(StorageError::from)?;
                Ok(())
            }
        }
    }
}

/// A named database opened within a transaction.
///
/// Values surfaced by [`Database::scan`] and [`Database::find_latest`]
/// borrow memory owned by the transaction and must not outlive the
/// callback invocation.
pub enum Database<'txn> {
    /// Unique-key database in a read transaction.
    ReadPlain(redb::ReadOnlyTable<&'static [u8], &'static [u8]>),
    /// Unique-key database in a write transaction.
    WritePlain(redb::Table<'txn, &'static [u8], &'static [u8]>),
    /// Duplicate-allowing database in a read transaction.
    ReadDup(redb::ReadOnlyMultimapTable<&'static [u8], &'static [u8]>),
    /// Duplicate-allowing database in a write transaction.
    WriteDup(redb::MultimapTable<'txn, &'static [u8], &'static [u8]>),
}

impl std::fmt::Debug for Database<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Database::ReadPlain(_) => "ReadPlain",
            Database::WritePlain(_) => "WritePlain",
            Database::ReadDup(_) => "ReadDup",
            Database::WriteDup(_) => "WriteDup",
        };
        f.debug_tuple(variant).finish()
    }
}

fn read_only_write() -> StorageError {
    StorageError::engine("write operation in a read-only transaction")
}

/// What a scan callback decided.
enum Step {
    Continue,
    Stop,
}

impl Database<'_> {
    /// Writes a key/value pair.
    ///
    /// On a duplicate-allowing database, identical `(key, value)` pairs are
    /// coalesced.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self {
            Database::WritePlain(table) => {
                table.insert(key, value).map_err(StorageError::from)?;
                Ok(())
            }
            Database::WriteDup(table) => {
                table.insert(key, value).map_err(StorageError::from)?;
                Ok(())
            }
            _ => Err(read_only_write().into()),
        }
    }

    /// Reads the value for a key, or the first value on a
    /// duplicate-allowing database.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Database::ReadPlain(table) => Ok(table
                .get(key)
                .map_err(StorageError::from)?
                .map(|guard| guard.value().to_vec())),
            Database::WritePlain(table) => Ok(table
                .get(key)
                .map_err(StorageError::from)?
                .map(|guard| guard.value().to_vec())),
            Database::ReadDup(table) => {
                let mut values = table.get(key).map_err(StorageError::from)?;
                match values.next() {
                    Some(value) => Ok(Some(value.map_err(StorageError::from)?.value().to_vec())),
                    None => Ok(None),
                }
            }
            Database::WriteDup(table) => {
                let mut values = table.get(key).map_err(StorageError::from)?;
                match values.next() {
                    Some(value) => Ok(Some(value.map_err(StorageError::from)?.value().to_vec())),
                    None => Ok(None),
                }
            }
        }
    }

    /// Removes a key, or one `(key, value)` pair on a duplicate-allowing
    /// database. Returns whether anything was removed; removing an absent
    /// entry is not an error.
    pub fn remove(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        match self {
            Database::WritePlain(table) => {
                let removed = table.remove(key).map_err(StorageError::from)?;
                Ok(removed.is_some())
            }
            Database::WriteDup(table) => match value {
                Some(value) => Ok(table.remove(key, value).map_err(StorageError::from)?),
                None => {
                    let removed = table.remove_all(key).map_err(StorageError::from)?;
                    let mut any = false;
                    for entry in removed {
                        entry.map_err(StorageError::from)?;
                        any = true;
                    }
                    Ok(any)
                }
            },
            _ => Err(read_only_write().into()),
        }
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns true if any key with the given prefix is present.
    pub fn contains_prefix(&self, prefix: &[u8]) -> Result<bool> {
        let mut found = false;
        let mut error: Option<String> = None;
        self.scan(
            prefix,
            |_, _| {
                found = true;
                false
            },
            |e| error = Some(e.to_string()),
        );
        match error {
            Some(e) => Err(StorageError::engine(e).into()),
            None => Ok(found),
        }
    }

    /// Iterates every `(key, value)` pair with the given prefix in
    /// lexicographic order; an empty prefix scans the whole database.
    ///
    /// `on_kv` returns whether to continue. Read errors go to `on_error`
    /// and end the scan; they are not fatal to the caller. Returns the
    /// number of `on_kv` invocations.
    pub fn scan(
        &self,
        prefix: &[u8],
        mut on_kv: impl FnMut(&[u8], &[u8]) -> bool,
        mut on_error: impl FnMut(&StorageError),
    ) -> usize {
        let mut count = 0usize;
        let mut visit = |key: &[u8], value: &[u8]| {
            count += 1;
            if on_kv(key, value) {
                Step::Continue
            } else {
                Step::Stop
            }
        };
        match self {
            Database::ReadPlain(table) => {
                walk_plain(table.range::<&[u8]>(bounds(prefix)), prefix, &mut visit, &mut on_error)
            }
            Database::WritePlain(table) => {
                walk_plain(table.range::<&[u8]>(bounds(prefix)), prefix, &mut visit, &mut on_error)
            }
            Database::ReadDup(table) => {
                walk_dup(table.range::<&[u8]>(bounds(prefix)), prefix, &mut visit, &mut on_error)
            }
            Database::WriteDup(table) => {
                walk_dup(table.range::<&[u8]>(bounds(prefix)), prefix, &mut visit, &mut on_error)
            }
        }
        count
    }

    /// Delivers exactly the record with the largest key for the given UID
    /// prefix, if any. With entity keys (`uid + BE(revision)`) this is the
    /// latest revision. Returns the number of `on_kv` invocations (0 or 1).
    pub fn find_latest(
        &self,
        uid_prefix: &[u8],
        mut on_kv: impl FnMut(&[u8], &[u8]) -> bool,
        mut on_error: impl FnMut(&StorageError),
    ) -> usize {
        let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
        let mut remember = |key: &[u8], value: &[u8]| {
            last = Some((key.to_vec(), value.to_vec()));
            Step::Continue
        };
        match self {
            Database::ReadPlain(table) => walk_plain(
                table.range::<&[u8]>(bounds(uid_prefix)),
                uid_prefix,
                &mut remember,
                &mut on_error,
            ),
            Database::WritePlain(table) => walk_plain(
                table.range::<&[u8]>(bounds(uid_prefix)),
                uid_prefix,
                &mut remember,
                &mut on_error,
            ),
            Database::ReadDup(table) => walk_dup(
                table.range::<&[u8]>(bounds(uid_prefix)),
                uid_prefix,
                &mut remember,
                &mut on_error,
            ),
            Database::WriteDup(table) => walk_dup(
                table.range::<&[u8]>(bounds(uid_prefix)),
                uid_prefix,
                &mut remember,
                &mut on_error,
            ),
        }
        match last {
            Some((key, value)) => {
                on_kv(&key, &value);
                1
            }
            None => 0,
        }
    }
}

type ByteBounds<'a> = (Bound<&'a [u8]>, Bound<&'a [u8]>);

/// Keys at or after the prefix; iteration re-checks the prefix per key, so
/// no successor key has to be materialized for the upper bound.
fn bounds(prefix: &[u8]) -> ByteBounds<'_> {
    if prefix.is_empty() {
        (Bound::Unbounded, Bound::Unbounded)
    } else {
        (Bound::Included(prefix), Bound::Unbounded)
    }
}

fn walk_plain<'a>(
    range: std::result::Result<redb::Range<'a, &'static [u8], &'static [u8]>, redb::StorageError>,
    prefix: &[u8],
    visit: &mut impl FnMut(&[u8], &[u8]) -> Step,
    on_error: &mut impl FnMut(&StorageError),
) {
    let iter = match range {
        Ok(iter) => iter,
        Err(e) => {
            on_error(&e.into());
            return;
        }
    };
    for entry in iter {
        match entry {
            Ok((key, value)) => {
                if !key.value().starts_with(prefix) {
                    break;
                }
                if let Step::Stop = visit(key.value(), value.value()) {
                    break;
                }
            }
            Err(e) => {
                on_error(&e.into());
                break;
            }
        }
    }
}

fn walk_dup<'a>(
    range: std::result::Result<
        redb::MultimapRange<'a, &'static [u8], &'static [u8]>,
        redb::StorageError,
    >,
    prefix: &[u8],
    visit: &mut impl FnMut(&[u8], &[u8]) -> Step,
    on_error: &mut impl FnMut(&StorageError),
) {
    let iter = match range {
        Ok(iter) => iter,
        Err(e) => {
            on_error(&e.into());
            return;
        }
    };
    'keys: for entry in iter {
        match entry {
            Ok((key, values)) => {
                if !key.value().starts_with(prefix) {
                    break;
                }
                for value in values {
                    match value {
                        Ok(value) => {
                            if let Step::Stop = visit(key.value(), value.value()) {
                                break 'keys;
                            }
                        }
                        Err(e) => {
                            on_error(&e.into());
                            break 'keys;
                        }
                    }
                }
            }
            Err(e) => {
                on_error(&e.into());
                break;
            }
        }
    }
}
