//! A persistent incremental Merkle tree over Poseidon.
//!
//! Leaves are appended at the next free index; a key → index map rides in
//! the same store so lookups and proofs address leaves by their 20-byte
//! key. Nodes are persisted level by level, and all mutations of one call
//! commit in a single atomic write.
//!
//! The tree is generic over what the leaf value means: censuses store the
//! packed `(address << 88) | weight` value, the election state stores a
//! Poseidon commitment to the voter's last ballot.

use std::collections::HashMap;

use ark_bn254::Fr;
use once_cell::sync::Lazy;
use scrutiny_crypto::poseidon;
use scrutiny_db::Db;
use thiserror::Error;

use scrutiny_interface::{Address, Root};

/// Tree depth; capacity is `2^DEPTH` leaves.
pub const DEPTH: usize = 32;

const KEY_META: &[u8] = b"m";
const KEY_NODE: &[u8] = b"n";
const KEY_LEAF_INDEX: &[u8] = b"k";

/// Hashes of fully-empty subtrees, one per level. `ZEROS[0]` is the empty
/// leaf; `ZEROS[DEPTH]` is the root of an empty tree.
static ZEROS: Lazy<Vec<Fr>> = Lazy::new(|| {
    let mut zeros = Vec::with_capacity(DEPTH + 1);
    let mut current = Fr::from(0u64);
    zeros.push(current);
    for _ in 0..DEPTH {
        current = poseidon::hash(&[current, current]).expect("two inputs always hash");
        zeros.push(current);
    }
    zeros
});

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("key already present")]
    AlreadyExists,
    #[error("key not found")]
    NotFound,
    #[error("tree is full")]
    Full,
    #[error(transparent)]
    Db(#[from] scrutiny_db::DbError),
    #[error("hash: {0}")]
    Hash(String),
    #[error("corrupt tree metadata: {0}")]
    Corrupt(String),
}

impl From<scrutiny_crypto::CryptoError> for TreeError {
    fn from(e: scrutiny_crypto::CryptoError) -> Self {
        TreeError::Hash(e.to_string())
    }
}

/// How a prepared mutation treats keys that already exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Every entry must be new.
    InsertOnly,
    /// Every entry must already exist.
    UpdateOnly,
    /// Insert new keys, update existing ones.
    Upsert,
}

/// A computed tree mutation that has not been committed yet. Produced by
/// [`Tree::prepare`], staged with [`Tree::stage`], finalized with
/// [`Tree::absorb`].
pub struct Prepared {
    /// Key/value pairs relative to the tree's namespace.
    ops: Vec<(Vec<u8>, Vec<u8>)>,
    next_index: u64,
    root: Fr,
}

impl Prepared {
    /// The root the tree will have once this mutation commits.
    pub fn root(&self) -> Root {
        poseidon::fr_to_be_bytes(&self.root)
    }
}

/// A Merkle inclusion proof for one leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeProof {
    pub root: Root,
    pub index: u64,
    /// The 32-byte big-endian leaf value.
    pub value: [u8; 32],
    /// One sibling per level, leaf level first.
    pub siblings: Vec<[u8; 32]>,
}

impl TreeProof {
    /// Flattens the siblings into the wire encoding: concatenated 32-byte
    /// big-endian limbs.
    pub fn packed_siblings(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.siblings.len() * 32);
        for limb in &self.siblings {
            out.extend_from_slice(limb);
        }
        out
    }

    /// Splits a packed sibling string back into limbs.
    pub fn unpack_siblings(packed: &[u8]) -> Option<Vec<[u8; 32]>> {
        if packed.len() != DEPTH * 32 {
            return None;
        }
        Some(
            packed
                .chunks_exact(32)
                .map(|chunk| {
                    let mut limb = [0u8; 32];
                    limb.copy_from_slice(chunk);
                    limb
                })
                .collect(),
        )
    }
}

/// The persistent tree. One instance owns its backing store view; callers
/// serialize access externally (census refs hold a mutex, the state engine
/// a per-process lock).
pub struct Tree {
    db: Db,
    next_index: u64,
    root: Fr,
}

impl Tree {
    /// Opens the tree stored in `db`, initializing an empty one if the
    /// store is fresh.
    pub fn open(db: Db) -> Result<Self, TreeError> {
        match db.get(KEY_META)? {
            Some(meta) => {
                if meta.len() != 40 {
                    return Err(TreeError::Corrupt(format!(
                        "meta record has {} bytes",
                        meta.len()
                    )));
                }
                let mut next_index = [0u8; 8];
                next_index.copy_from_slice(&meta[..8]);
                let root = poseidon::fr_from_be_bytes(&meta[8..40]);
                Ok(Self {
                    db,
                    next_index: u64::from_be_bytes(next_index),
                    root,
                })
            }
            None => Ok(Self {
                db,
                next_index: 0,
                root: ZEROS[DEPTH],
            }),
        }
    }

    pub fn root(&self) -> Root {
        poseidon::fr_to_be_bytes(&self.root)
    }

    /// Flushes the backing store to disk.
    pub fn flush(&self) -> Result<(), TreeError> {
        Ok(self.db.flush()?)
    }

    /// Number of leaves inserted so far.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Looks up a key's leaf index and value.
    pub fn get(&self, key: &Address) -> Result<Option<(u64, [u8; 32])>, TreeError> {
        let Some(index) = self.stored_index(key)? else {
            return Ok(None);
        };
        let value = self
            .node(0, index, &HashMap::new())?
            .ok_or_else(|| TreeError::Corrupt("indexed leaf has no node".to_string()))?;
        Ok(Some((index, value)))
    }

    /// Appends a new leaf. Fails with [`TreeError::AlreadyExists`] if the
    /// key is present.
    pub fn insert(&mut self, key: &Address, value: [u8; 32]) -> Result<(), TreeError> {
        let prepared = self.prepare(WriteMode::InsertOnly, &[(*key, value)])?;
        self.apply_now(prepared)
    }

    /// Appends many leaves in one atomic write. The whole batch fails if
    /// any key is already present.
    pub fn insert_batch(&mut self, entries: &[(Address, [u8; 32])]) -> Result<(), TreeError> {
        let prepared = self.prepare(WriteMode::InsertOnly, entries)?;
        self.apply_now(prepared)
    }

    /// Replaces the value of an existing key.
    pub fn update(&mut self, key: &Address, value: [u8; 32]) -> Result<(), TreeError> {
        let prepared = self.prepare(WriteMode::UpdateOnly, &[(*key, value)])?;
        self.apply_now(prepared)
    }

    /// Inserts the key or updates it if present.
    pub fn upsert(&mut self, key: &Address, value: [u8; 32]) -> Result<(), TreeError> {
        let prepared = self.prepare(WriteMode::Upsert, &[(*key, value)])?;
        self.apply_now(prepared)
    }

    /// Computes a mutation without committing it. The caller stages the
    /// result into a write transaction (possibly alongside operations from
    /// other views of the same backend), commits, and then absorbs it so
    /// the in-memory root and size advance. Later entries see the effect
    /// of earlier ones within the same batch.
    pub fn prepare(
        &self,
        mode: WriteMode,
        entries: &[(Address, [u8; 32])],
    ) -> Result<Prepared, TreeError> {
        let mut overlay: HashMap<(u8, u64), [u8; 32]> = HashMap::new();
        let mut new_indices: Vec<(Address, u64)> = Vec::new();
        let mut batch_indices: HashMap<Address, u64> = HashMap::new();
        let mut next_index = self.next_index;
        let mut root = self.root;

        for (key, value) in entries {
            let existing = match batch_indices.get(key) {
                Some(index) => Some(*index),
                None => self.stored_index(key)?,
            };
            let index = match existing {
                Some(index) => {
                    if mode == WriteMode::InsertOnly {
                        return Err(TreeError::AlreadyExists);
                    }
                    index
                }
                None => {
                    if mode == WriteMode::UpdateOnly {
                        return Err(TreeError::NotFound);
                    }
                    if next_index >= 1u64 << DEPTH {
                        return Err(TreeError::Full);
                    }
                    let index = next_index;
                    next_index += 1;
                    new_indices.push((*key, index));
                    index
                }
            };
            batch_indices.insert(*key, index);
            root = self.write_path(index, *value, &mut overlay)?;
        }

        let mut ops: Vec<(Vec<u8>, Vec<u8>)> =
            Vec::with_capacity(overlay.len() + new_indices.len() + 1);
        for ((level, index), value) in overlay {
            ops.push((node_key(level, index), value.to_vec()));
        }
        for (address, index) in new_indices {
            ops.push((leaf_index_key(&address), index.to_be_bytes().to_vec()));
        }
        let mut meta = Vec::with_capacity(40);
        meta.extend_from_slice(&next_index.to_be_bytes());
        meta.extend_from_slice(&poseidon::fr_to_be_bytes(&root));
        ops.push((KEY_META.to_vec(), meta));

        Ok(Prepared {
            ops,
            next_index,
            root,
        })
    }

    /// Stages a prepared mutation into `tx` under this tree's namespace.
    pub fn stage(&self, prepared: &Prepared, tx: &mut scrutiny_db::WriteTx) {
        for (key, value) in &prepared.ops {
            self.db.stage_put(tx, key, value);
        }
    }

    /// Advances the in-memory state to a committed mutation. Must only be
    /// called after the transaction that staged `prepared` has committed.
    pub fn absorb(&mut self, prepared: Prepared) {
        self.next_index = prepared.next_index;
        self.root = prepared.root;
    }

    fn apply_now(&mut self, prepared: Prepared) -> Result<(), TreeError> {
        let mut tx = self.db.write_tx();
        self.stage(&prepared, &mut tx);
        tx.commit()?;
        self.absorb(prepared);
        Ok(())
    }

    fn stored_index(&self, key: &Address) -> Result<Option<u64>, TreeError> {
        let Some(record) = self.db.get(&leaf_index_key(key))? else {
            return Ok(None);
        };
        if record.len() != 8 {
            return Err(TreeError::Corrupt("leaf index record".to_string()));
        }
        let mut index = [0u8; 8];
        index.copy_from_slice(&record);
        Ok(Some(u64::from_be_bytes(index)))
    }

    /// Builds an inclusion proof for `key`.
    pub fn proof(&self, key: &Address) -> Result<TreeProof, TreeError> {
        let (index, value) = self.get(key)?.ok_or(TreeError::NotFound)?;
        let empty = HashMap::new();
        let mut siblings = Vec::with_capacity(DEPTH);
        let mut idx = index;
        for level in 0..DEPTH {
            let sibling = self
                .node(level as u8, idx ^ 1, &empty)?
                .unwrap_or_else(|| poseidon::fr_to_be_bytes(&ZEROS[level]));
            siblings.push(sibling);
            idx >>= 1;
        }
        Ok(TreeProof {
            root: self.root(),
            index,
            value,
            siblings,
        })
    }

    /// Recomputes the root from a proof. Static: no store access.
    pub fn verify(proof: &TreeProof) -> bool {
        if proof.siblings.len() != DEPTH {
            return false;
        }
        let mut current = poseidon::fr_from_be_bytes(&proof.value);
        let mut idx = proof.index;
        for sibling in &proof.siblings {
            let sibling = poseidon::fr_from_be_bytes(sibling);
            let pair = if idx & 1 == 0 {
                [current, sibling]
            } else {
                [sibling, current]
            };
            current = match poseidon::hash(&pair) {
                Ok(h) => h,
                Err(_) => return false,
            };
            idx >>= 1;
        }
        poseidon::fr_to_be_bytes(&current) == proof.root
    }

    /// Every `(key, value)` leaf pair, in insertion order.
    pub fn leaves(&self) -> Result<Vec<(Address, [u8; 32])>, TreeError> {
        let mut by_index: Vec<(u64, Address)> = Vec::new();
        self.db.iter_prefix(KEY_LEAF_INDEX, |key, value| {
            if key.len() == KEY_LEAF_INDEX.len() + 20 && value.len() == 8 {
                let mut address = [0u8; 20];
                address.copy_from_slice(&key[KEY_LEAF_INDEX.len()..]);
                let mut index = [0u8; 8];
                index.copy_from_slice(value);
                by_index.push((u64::from_be_bytes(index), address));
            }
            true
        })?;
        by_index.sort_unstable();

        let empty = HashMap::new();
        let mut out = Vec::with_capacity(by_index.len());
        for (index, address) in by_index {
            let value = self
                .node(0, index, &empty)?
                .ok_or_else(|| TreeError::Corrupt("indexed leaf has no node".to_string()))?;
            out.push((address, value));
        }
        Ok(out)
    }

    /// Recomputes the hash path from a leaf up, recording every touched
    /// node in `overlay`, and returns the resulting root. Siblings are
    /// read overlay-first, so sequential calls compose.
    fn write_path(
        &self,
        index: u64,
        value: [u8; 32],
        overlay: &mut HashMap<(u8, u64), [u8; 32]>,
    ) -> Result<Fr, TreeError> {
        let mut current = poseidon::fr_from_be_bytes(&value);
        let mut idx = index;
        for level in 0..DEPTH {
            overlay.insert((level as u8, idx), poseidon::fr_to_be_bytes(&current));
            let sibling = match self.node(level as u8, idx ^ 1, overlay)? {
                Some(bytes) => poseidon::fr_from_be_bytes(&bytes),
                None => ZEROS[level],
            };
            let pair = if idx & 1 == 0 {
                [current, sibling]
            } else {
                [sibling, current]
            };
            current = poseidon::hash(&pair)?;
            idx >>= 1;
        }
        Ok(current)
    }

    fn node(
        &self,
        level: u8,
        index: u64,
        overlay: &HashMap<(u8, u64), [u8; 32]>,
    ) -> Result<Option<[u8; 32]>, TreeError> {
        if let Some(value) = overlay.get(&(level, index)) {
            return Ok(Some(*value));
        }
        match self.db.get(&node_key(level, index))? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(TreeError::Corrupt(format!(
                        "node ({level}, {index}) has {} bytes",
                        bytes.len()
                    )));
                }
                let mut value = [0u8; 32];
                value.copy_from_slice(&bytes);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn node_key(level: u8, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_NODE.len() + 9);
    key.extend_from_slice(KEY_NODE);
    key.push(level);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn leaf_index_key(address: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEAF_INDEX.len() + 20);
    key.extend_from_slice(KEY_LEAF_INDEX);
    key.extend_from_slice(address);
    key
}
