//! Transactional key/value storage for the sequencer.
//!
//! Every persistent subsystem (ballot queues, census metadata, election
//! state, process records) shares a single [`Db`] handle. Namespacing is done
//! with short ASCII key prefixes (see [`keys`]); [`Db::prefixed`] returns a
//! cheap view that transparently prepends a prefix to every operation, which
//! is how per-process sub-databases are carved out of the shared store.
//!
//! Two backends implement the same surface: RocksDB for real deployments and
//! an ordered in-memory map for unit tests. Writes go through [`WriteTx`],
//! which applies all of its puts and deletes atomically or not at all.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rocksdb::{IteratorMode, Options, WriteBatch};

mod error;
pub mod keys;

pub use error::DbError;

/// A handle to the underlying store, plus the key prefix this view operates
/// under. Cloning is cheap; all clones share the same backend.
#[derive(Clone)]
pub struct Db {
    backend: Arc<Backend>,
    prefix: Vec<u8>,
}

enum Backend {
    Rocks(rocksdb::DB),
    Mem(RwLock<BTreeMap<Vec<u8>, Vec<u8>>>),
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match *self.backend {
            Backend::Rocks(_) => "rocks",
            Backend::Mem(_) => "mem",
        };
        f.debug_struct("Db")
            .field("backend", &kind)
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}

/// RocksDB tuning shared by every store the sequencer opens.
pub fn gen_db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    // Census trees open one store per tree, so keep the per-instance
    // footprint small.
    opts.set_max_open_files(256);
    opts.set_keep_log_file_num(2);
    opts
}

impl Db {
    /// Opens (or creates) a RocksDB-backed store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let db = rocksdb::DB::open(&gen_db_options(), path.as_ref())?;
        Ok(Self {
            backend: Arc::new(Backend::Rocks(db)),
            prefix: Vec::new(),
        })
    }

    /// An in-memory store with the same semantics. Test-oriented, but not
    /// test-gated: mocks build on it too.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Mem(RwLock::new(BTreeMap::new()))),
            prefix: Vec::new(),
        }
    }

    /// Returns a view of the same store under `prefix`. Prefixes nest.
    pub fn prefixed(&self, prefix: &[u8]) -> Self {
        let mut combined = self.prefix.clone();
        combined.extend_from_slice(prefix);
        Self {
            backend: self.backend.clone(),
            prefix: combined,
        }
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }

    /// Reads a single value. `Ok(None)` means the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let full = self.full_key(key);
        match &*self.backend {
            Backend::Rocks(db) => Ok(db.get(&full)?),
            Backend::Mem(map) => {
                let map = map.read().expect("db lock poisoned");
                Ok(map.get(&full).cloned())
            }
        }
    }

    /// Like [`Db::get`], but a missing key is an error.
    pub fn require(&self, key: &[u8]) -> Result<Vec<u8>, DbError> {
        self.get(key)?.ok_or(DbError::NotFound)
    }

    /// Writes a single key. Shorthand for a one-put transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let mut tx = self.write_tx();
        tx.put(key, value);
        tx.commit()
    }

    /// Deletes a single key. Deleting an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        let mut tx = self.write_tx();
        tx.delete(key);
        tx.commit()
    }

    /// Starts a write transaction. Dropping it without
    /// [`WriteTx::commit`] discards every queued operation.
    pub fn write_tx(&self) -> WriteTx {
        WriteTx {
            db: self.clone(),
            ops: Vec::new(),
        }
    }

    /// Stages a put into `tx` under this view's prefix. Several views of
    /// the same backend can stage into one transaction; this is how
    /// multi-namespace updates (tree nodes plus records plus metadata)
    /// commit atomically.
    pub fn stage_put(&self, tx: &mut WriteTx, key: &[u8], value: &[u8]) {
        debug_assert!(
            Arc::ptr_eq(&self.backend, &tx.db.backend),
            "staging across different backends"
        );
        tx.ops.push(Op::Put(self.full_key(key), value.to_vec()));
    }

    /// Stages a delete into `tx` under this view's prefix.
    pub fn stage_delete(&self, tx: &mut WriteTx, key: &[u8]) {
        debug_assert!(
            Arc::ptr_eq(&self.backend, &tx.db.backend),
            "staging across different backends"
        );
        tx.ops.push(Op::Delete(self.full_key(key)));
    }

    /// Visits every `(key, value)` pair under `prefix` (relative to this
    /// view) in ascending key order, against a consistent snapshot. The
    /// visitor returns `false` to stop early. Keys are reported with the
    /// view prefix stripped.
    pub fn iter_prefix(
        &self,
        prefix: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), DbError> {
        let full_prefix = self.full_key(prefix);
        match &*self.backend {
            Backend::Rocks(db) => {
                let snapshot = db.snapshot();
                let iter = snapshot.iterator(IteratorMode::From(
                    &full_prefix,
                    rocksdb::Direction::Forward,
                ));
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(&full_prefix) {
                        break;
                    }
                    if !visit(&key[self.prefix.len()..], &value) {
                        break;
                    }
                }
            }
            Backend::Mem(map) => {
                // Cloning the matching range gives the same snapshot
                // isolation the RocksDB path has.
                let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
                    let map = map.read().expect("db lock poisoned");
                    map.range(full_prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&full_prefix))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                };
                for (key, value) in pairs {
                    if !visit(&key[self.prefix.len()..], &value) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Counts keys under `prefix`.
    pub fn count_prefix(&self, prefix: &[u8]) -> Result<usize, DbError> {
        let mut n = 0;
        self.iter_prefix(prefix, |_, _| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    fn apply(&self, ops: Vec<Op>) -> Result<(), DbError> {
        match &*self.backend {
            Backend::Rocks(db) => {
                let mut batch = WriteBatch::default();
                for op in ops {
                    match op {
                        Op::Put(k, v) => batch.put(k, v),
                        Op::Delete(k) => batch.delete(k),
                    }
                }
                db.write(batch)?;
            }
            Backend::Mem(map) => {
                let mut map = map.write().expect("db lock poisoned");
                for op in ops {
                    match op {
                        Op::Put(k, v) => {
                            map.insert(k, v);
                        }
                        Op::Delete(k) => {
                            map.remove(&k);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes memtables to disk. A no-op for the in-memory backend.
    pub fn flush(&self) -> Result<(), DbError> {
        if let Backend::Rocks(db) = &*self.backend {
            db.flush()?;
        }
        Ok(())
    }
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of puts and deletes applied atomically on [`WriteTx::commit`].
pub struct WriteTx {
    db: Db,
    ops: Vec<Op>,
}

impl WriteTx {
    /// Queues a put. Nothing is written until commit.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put(self.db.full_key(key), value.to_vec()));
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(Op::Delete(self.db.full_key(key)));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every queued operation in one atomic write.
    pub fn commit(self) -> Result<(), DbError> {
        self.db.apply(self.ops)
    }
}
