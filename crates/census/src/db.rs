//! The census store: many persistent Merkle trees, three overlapping
//! indices, and an atomic publish protocol.
//!
//! Trees start life under a random working UUID and are mutated through
//! batched inserts. Publication moves the backing directory over the
//! destination's (derived from the canonical root or the sponsoring
//! address) in a single rename, which is the atomic point of the protocol:
//! everything before it can be retried, everything after it treats the
//! destination as authoritative.
//!
//! Lock ordering is strict: the index lock first, then a ref's tree lock,
//! never the reverse. Root-index refreshes after mutations are coalesced
//! through a bounded channel into a single background writer that only ever
//! takes the index lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_db::{keys, Db};
use scrutiny_interface::census::{normalize_census_key, pack_census_value, unpack_census_value};
use scrutiny_interface::process::CensusOrigin;
use scrutiny_interface::{Address, CensusProof, Root, SequencerError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::tree::{Tree, TreeError, TreeProof};

/// Namespace UUID the deterministic census identifiers are derived under
/// (UUIDv5, SHA-1). Changing it orphans every published census.
const CENSUS_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1b, 0x25, 0xc0, 0x5e, 0x2a, 0x4b, 0x9d, 0x91, 0x3c, 0x6f, 0x84, 0xa7, 0xd2, 0x10,
    0x4e,
]);

/// Identifier flavor used when deriving deterministic census UUIDs.
const ROOT_TAG: &[u8] = b"root:";
const ADDRESS_TAG: &[u8] = b"addr:";

/// How many coalesced root updates can queue before producers skip.
const ROOT_UPDATE_QUEUE: usize = 64;

/// Poseidon is the only hasher deployed today; the byte is persisted so a
/// future hasher can coexist.
const HASH_TYPE_POSEIDON: u8 = 1;

/// Persisted census metadata, stored under the working (`cw_`), root
/// (`cr_`) and address (`ca_`) indices.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
struct CensusMeta {
    id: [u8; 16],
    hash_type: u8,
    /// Unix seconds of the last load or mutation.
    last_used: u64,
    root: Root,
}

/// How a census ref is addressed once published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefKey {
    /// A working census, addressed only by its UUID.
    Working,
    /// Published under a canonical root (left-trimmed bytes).
    Root(Vec<u8>),
    /// Published under a sponsoring organization address.
    Address(Address),
}

/// A handle to one census tree. The store owns these; callers borrow them
/// through the load methods and must not retain them across a delete.
pub struct CensusRef {
    id: Uuid,
    dir: PathBuf,
    key: RefKey,
    published: AtomicBool,
    last_used: AtomicU64,
    /// `None` only transiently, while the tree is closed during publish.
    slot: Mutex<Option<Tree>>,
}

impl CensusRef {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The tree's current root.
    pub fn root(&self) -> Result<Root, SequencerError> {
        let slot = self.slot.lock().expect("census ref lock poisoned");
        let tree = slot
            .as_ref()
            .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
        Ok(tree.root())
    }

    /// Number of leaves.
    pub fn len(&self) -> Result<u64, SequencerError> {
        let slot = self.slot.lock().expect("census ref lock poisoned");
        let tree = slot
            .as_ref()
            .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
        Ok(tree.len())
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_used.store(unix_now(), Ordering::Release);
    }
}

struct RootUpdate {
    id: Uuid,
    root: Root,
}

struct Shared {
    meta: Db,
    base_dir: PathBuf,
    refs: RwLock<HashMap<Uuid, Arc<CensusRef>>>,
    root_tx: mpsc::Sender<RootUpdate>,
    root_rx: Mutex<mpsc::Receiver<RootUpdate>>,
}

/// The census store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CensusDb {
    shared: Arc<Shared>,
}

impl CensusDb {
    /// Opens the store. `meta` is the node's main KV handle; census tree
    /// directories are created under `base_dir`.
    pub fn new(meta: Db, base_dir: impl AsRef<Path>) -> Result<Self, SequencerError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(|e| SequencerError::Io(e.to_string()))?;
        let (root_tx, root_rx) = mpsc::channel(ROOT_UPDATE_QUEUE);
        Ok(Self {
            shared: Arc::new(Shared {
                meta,
                base_dir,
                refs: RwLock::new(HashMap::new()),
                root_tx,
                root_rx: Mutex::new(root_rx),
            }),
        })
    }

    /// The deterministic UUID a census published under `root` gets.
    pub fn uuid_for_root(root: &[u8]) -> Uuid {
        let trimmed = trim_root(root);
        let mut name = Vec::with_capacity(ROOT_TAG.len() + trimmed.len());
        name.extend_from_slice(ROOT_TAG);
        name.extend_from_slice(trimmed);
        Uuid::new_v5(&CENSUS_NAMESPACE, &name)
    }

    /// The deterministic UUID a census published under `address` gets.
    pub fn uuid_for_address(address: &Address) -> Uuid {
        let mut name = Vec::with_capacity(ADDRESS_TAG.len() + address.len());
        name.extend_from_slice(ADDRESS_TAG);
        name.extend_from_slice(address);
        Uuid::new_v5(&CENSUS_NAMESPACE, &name)
    }

    /// Creates a fresh, empty census under `id`. Fails with `AlreadyExists`
    /// if the id is known in memory or on disk.
    pub fn new_census(&self, id: Uuid) -> Result<Arc<CensusRef>, SequencerError> {
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        self.create_locked(&mut refs, id, RefKey::Working)
    }

    /// Creates the destination census for a future publish under `root`.
    pub fn new_by_root(&self, root: &[u8]) -> Result<Arc<CensusRef>, SequencerError> {
        let id = Self::uuid_for_root(root);
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        self.create_locked(&mut refs, id, RefKey::Root(trim_root(root).to_vec()))
    }

    /// Creates the destination census for a future publish under `address`.
    pub fn new_by_address(&self, address: &Address) -> Result<Arc<CensusRef>, SequencerError> {
        let id = Self::uuid_for_address(address);
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        self.create_locked(&mut refs, id, RefKey::Address(*address))
    }

    fn create_locked(
        &self,
        refs: &mut HashMap<Uuid, Arc<CensusRef>>,
        id: Uuid,
        key: RefKey,
    ) -> Result<Arc<CensusRef>, SequencerError> {
        if refs.contains_key(&id) {
            return Err(SequencerError::AlreadyExists(format!("census {id}")));
        }
        if self.working_meta(&id)?.is_some() {
            return Err(SequencerError::AlreadyExists(format!("census {id}")));
        }
        let dir = self.tree_dir(&id);
        if dir.exists() {
            return Err(SequencerError::AlreadyExists(format!(
                "census directory {}",
                dir.display()
            )));
        }

        let tree = Tree::open(Db::open(&dir)?).map_err(tree_err)?;
        let census = Arc::new(CensusRef {
            id,
            dir,
            key,
            published: AtomicBool::new(false),
            last_used: AtomicU64::new(unix_now()),
            slot: Mutex::new(Some(tree)),
        });
        self.persist_working_meta(&census)?;
        refs.insert(id, census.clone());
        Ok(census)
    }

    /// Loads a working census by UUID: memory first under the read lock,
    /// then the metadata blob under the write lock.
    pub fn load(&self, id: &Uuid) -> Result<Arc<CensusRef>, SequencerError> {
        {
            let refs = self.shared.refs.read().expect("census index lock poisoned");
            if let Some(census) = refs.get(id) {
                census.touch();
                return Ok(census.clone());
            }
        }

        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        // Double-checked: someone may have loaded it while we waited.
        if let Some(census) = refs.get(id) {
            census.touch();
            return Ok(census.clone());
        }
        let meta = self
            .working_meta(id)?
            .ok_or_else(|| SequencerError::NotFound(format!("census {id}")))?;
        let census = self.reopen_locked(&mut refs, meta, RefKey::Working, false)?;
        self.persist_working_meta(&census)?;
        Ok(census)
    }

    /// Loads a published census by its canonical root.
    pub fn load_by_root(&self, root: &[u8]) -> Result<Arc<CensusRef>, SequencerError> {
        let trimmed = trim_root(root).to_vec();
        let id = Self::uuid_for_root(root);
        {
            let refs = self.shared.refs.read().expect("census index lock poisoned");
            if let Some(census) = refs.get(&id) {
                census.touch();
                return Ok(census.clone());
            }
        }
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        if let Some(census) = refs.get(&id) {
            census.touch();
            return Ok(census.clone());
        }
        let meta = self
            .read_meta(keys::CENSUS_ROOT, &trimmed)?
            .ok_or_else(|| SequencerError::NotFound(format!("census root {}", hex::encode(root))))?;
        self.reopen_locked(&mut refs, meta, RefKey::Root(trimmed), true)
    }

    /// Loads a published census by its sponsoring address.
    pub fn load_by_address(&self, address: &Address) -> Result<Arc<CensusRef>, SequencerError> {
        let id = Self::uuid_for_address(address);
        {
            let refs = self.shared.refs.read().expect("census index lock poisoned");
            if let Some(census) = refs.get(&id) {
                census.touch();
                return Ok(census.clone());
            }
        }
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        if let Some(census) = refs.get(&id) {
            census.touch();
            return Ok(census.clone());
        }
        let meta = self
            .read_meta(keys::CENSUS_ADDRESS, address)?
            .ok_or_else(|| {
                SequencerError::NotFound(format!("census address {}", hex::encode(address)))
            })?;
        self.reopen_locked(&mut refs, meta, RefKey::Address(*address), true)
    }

    fn reopen_locked(
        &self,
        refs: &mut HashMap<Uuid, Arc<CensusRef>>,
        meta: CensusMeta,
        key: RefKey,
        published: bool,
    ) -> Result<Arc<CensusRef>, SequencerError> {
        let id = Uuid::from_bytes(meta.id);
        let dir = self.tree_dir(&id);
        let tree = Tree::open(Db::open(&dir)?).map_err(tree_err)?;
        let census = Arc::new(CensusRef {
            id,
            dir,
            key,
            published: AtomicBool::new(published),
            last_used: AtomicU64::new(unix_now()),
            slot: Mutex::new(Some(tree)),
        });
        refs.insert(id, census.clone());
        Ok(census)
    }

    /// Inserts one census entry. See [`CensusDb::insert_batch`].
    pub fn insert(
        &self,
        census: &CensusRef,
        key: &[u8],
        weight: u64,
    ) -> Result<(), SequencerError> {
        self.insert_batch(census, &[(key.to_vec(), weight)])
    }

    /// Inserts a batch of `(key, weight)` entries. Keys are normalized to
    /// 20 bytes; values are the packed `(address << 88) | weight` leaves.
    pub fn insert_batch(
        &self,
        census: &CensusRef,
        entries: &[(Vec<u8>, u64)],
    ) -> Result<(), SequencerError> {
        if census.is_published() {
            return Err(SequencerError::Locked(format!(
                "census {} is published",
                census.id
            )));
        }
        let leaves: Vec<(Address, [u8; 32])> = entries
            .iter()
            .map(|(key, weight)| {
                let address = normalize_census_key(key);
                (address, pack_census_value(&address, *weight))
            })
            .collect();

        let root = {
            let mut slot = census.slot.lock().expect("census ref lock poisoned");
            let tree = slot
                .as_mut()
                .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
            tree.insert_batch(&leaves).map_err(tree_err)?;
            tree.root()
        };
        census.touch();
        self.post_root_update(census.id, root);
        Ok(())
    }

    /// Generates an inclusion proof against a published census.
    pub fn proof_by_root(&self, root: &[u8], key: &[u8]) -> Result<CensusProof, SequencerError> {
        let census = self.load_by_root(root)?;
        let address = normalize_census_key(key);
        let proof = {
            let slot = census.slot.lock().expect("census ref lock poisoned");
            let tree = slot
                .as_ref()
                .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
            tree.proof(&address).map_err(tree_err)?
        };
        let (_, weight) = unpack_census_value(&proof.value)
            .ok_or_else(|| SequencerError::Internal("unpackable census leaf".to_string()))?;
        Ok(CensusProof {
            root: proof.root.to_vec(),
            address,
            value: proof.value.to_vec(),
            siblings: proof.packed_siblings(),
            weight,
            index: proof.index,
            census_origin: CensusOrigin::MerkleTreeOffchainStatic,
            public_key: None,
            signature: None,
        })
    }

    /// Verifies a Merkle census proof: recomputes the packed value from
    /// the address and weight, unpacks the siblings and re-runs the tree
    /// verification.
    pub fn verify_proof(proof: &CensusProof) -> bool {
        let expected_value = pack_census_value(&proof.address, proof.weight);
        if proof.value != expected_value {
            return false;
        }
        let Some(siblings) = TreeProof::unpack_siblings(&proof.siblings) else {
            return false;
        };
        let Ok(root) = proof.root.as_slice().try_into() else {
            return false;
        };
        Tree::verify(&TreeProof {
            root,
            index: proof.index,
            value: expected_value,
            siblings,
        })
    }

    /// Publishes the working census over `dest`: flushes and closes both
    /// trees, renames the working directory over the destination's, reopens
    /// the destination, verifies its root, updates the indices and deletes
    /// the working entry.
    pub fn publish(&self, working: &Uuid, dest: &Arc<CensusRef>) -> Result<(), SequencerError> {
        let mut refs = self.shared.refs.write().expect("census index lock poisoned");
        let working_ref = match refs.get(working) {
            Some(r) => r.clone(),
            None => {
                let meta = self
                    .working_meta(working)?
                    .ok_or_else(|| SequencerError::NotFound(format!("census {working}")))?;
                self.reopen_locked(&mut refs, meta, RefKey::Working, false)?
            }
        };
        if working_ref.id == dest.id {
            return Err(SequencerError::Internal(
                "cannot publish a census onto itself".to_string(),
            ));
        }

        let mut working_slot = working_ref.slot.lock().expect("census ref lock poisoned");
        let mut dest_slot = dest.slot.lock().expect("census ref lock poisoned");

        let expected_root = {
            let tree = working_slot
                .as_ref()
                .ok_or_else(|| SequencerError::Locked("working tree is closed".to_string()))?;
            tree.flush().map_err(tree_err)?;
            tree.root()
        };

        // Close both trees so the directories can be moved.
        let working_tree = working_slot.take();
        let dest_tree = dest_slot.take();
        drop(working_tree);
        drop(dest_tree);

        // Move the destination aside so it can be restored if the rename
        // fails; the rename itself is the atomic point of the protocol.
        let backup = dest.dir.with_extension("bak");
        if dest.dir.exists() {
            if let Err(e) = std::fs::rename(&dest.dir, &backup) {
                *working_slot = Tree::open(Db::open(&working_ref.dir)?).map_err(tree_err).ok();
                *dest_slot = Tree::open(Db::open(&dest.dir)?).map_err(tree_err).ok();
                return Err(SequencerError::Io(format!(
                    "moving publish destination aside: {e}"
                )));
            }
        }
        if let Err(e) = std::fs::rename(&working_ref.dir, &dest.dir) {
            if backup.exists() {
                let _ = std::fs::rename(&backup, &dest.dir);
            }
            *working_slot = Tree::open(Db::open(&working_ref.dir)?).map_err(tree_err).ok();
            *dest_slot = Tree::open(Db::open(&dest.dir)?).map_err(tree_err).ok();
            return Err(SequencerError::Io(format!("publish rename: {e}")));
        }
        if backup.exists() {
            let _ = std::fs::remove_dir_all(&backup);
        }

        // The rename is the atomic point: from here on the destination is
        // authoritative at the working root, even if a later step fails.
        let meta = CensusMeta {
            id: dest.id.into_bytes(),
            hash_type: HASH_TYPE_POSEIDON,
            last_used: unix_now(),
            root: expected_root,
        };
        let mut tx = self.shared.meta.write_tx();
        tx.put(
            &keys::key(keys::CENSUS_ROOT, trim_root(&expected_root)),
            &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
        );
        if let RefKey::Address(address) = &dest.key {
            tx.put(
                &keys::key(keys::CENSUS_ADDRESS, address),
                &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
            );
        }
        tx.delete(&keys::key(keys::CENSUS_WORKING, working.as_bytes()));
        // The destination's placeholder entry is transient; a published
        // census is only addressable through the root and address indices.
        tx.delete(&keys::key(keys::CENSUS_WORKING, dest.id.as_bytes()));
        tx.commit()?;

        refs.remove(working);
        dest.published.store(true, Ordering::Release);
        dest.touch();

        let reopened = Tree::open(Db::open(&dest.dir)?).map_err(tree_err)?;
        let actual_root = reopened.root();
        *dest_slot = Some(reopened);
        if actual_root != expected_root {
            return Err(SequencerError::root_mismatch(&expected_root, &actual_root));
        }

        tracing::info!(
            census = %dest.id,
            root = %hex::encode(expected_root),
            "census published"
        );
        Ok(())
    }

    /// Deletes a census: metadata and in-memory entry go now, the backing
    /// directory is removed by a background task.
    pub fn del(&self, id: &Uuid) -> Result<(), SequencerError> {
        let removed = {
            let mut refs = self.shared.refs.write().expect("census index lock poisoned");
            let removed = refs.remove(id);
            self.shared
                .meta
                .delete(&keys::key(keys::CENSUS_WORKING, id.as_bytes()))?;
            removed
        };

        let dir = match &removed {
            Some(census) => {
                let mut slot = census.slot.lock().expect("census ref lock poisoned");
                slot.take(); // close the tree
                census.dir.clone()
            }
            None => self.tree_dir(id),
        };

        std::thread::spawn(move || {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "census cleanup failed");
                }
            }
        });
        Ok(())
    }

    /// Deletes working censuses whose `last_used` is older than `max_age`.
    /// Returns the number purged.
    pub fn purge_working(&self, max_age: Duration) -> Result<usize, SequencerError> {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let mut expired = Vec::new();
        self.shared.meta.iter_prefix(keys::CENSUS_WORKING, |_, value| {
            if let Ok(meta) = CensusMeta::try_from_slice(value) {
                if meta.last_used < cutoff {
                    expired.push(Uuid::from_bytes(meta.id));
                }
            }
            true
        })?;

        for id in &expired {
            self.del(id)?;
        }
        Ok(expired.len())
    }

    /// Serializes a census into its portable dump form.
    pub fn dump(&self, census: &CensusRef) -> Result<CensusDump, SequencerError> {
        let slot = census.slot.lock().expect("census ref lock poisoned");
        let tree = slot
            .as_ref()
            .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
        let mut entries = Vec::new();
        for (address, value) in tree.leaves().map_err(tree_err)? {
            let (_, weight) = unpack_census_value(&value)
                .ok_or_else(|| SequencerError::Internal("unpackable census leaf".to_string()))?;
            entries.push(CensusDumpEntry {
                key: address.to_vec(),
                weight,
            });
        }
        Ok(CensusDump {
            root: tree.root().to_vec(),
            entries,
        })
    }

    /// Materializes a census from a dump, publishing it under
    /// `declared_root`. Fails with `RootMismatch` if the rebuilt tree does
    /// not reproduce the declared root.
    pub fn import(
        &self,
        declared_root: &[u8],
        dump: &CensusDump,
    ) -> Result<Arc<CensusRef>, SequencerError> {
        let census = self.new_by_root(declared_root)?;
        let entries: Vec<(Vec<u8>, u64)> = dump
            .entries
            .iter()
            .map(|e| (e.key.clone(), e.weight))
            .collect();
        self.insert_batch(&census, &entries)?;
        self.seal_import(census, declared_root)
    }

    /// Parses and imports a JSON-encoded dump.
    pub fn import_json(
        &self,
        declared_root: &[u8],
        dump_json: &[u8],
    ) -> Result<Arc<CensusRef>, SequencerError> {
        let dump: CensusDump = serde_json::from_slice(dump_json)
            .map_err(|e| SequencerError::Io(format!("census dump: {e}")))?;
        self.import(declared_root, &dump)
    }

    /// Rebuilds a census from an ordered add/update event log, publishing
    /// it under `declared_root`.
    pub fn import_events(
        &self,
        declared_root: &[u8],
        events: &[CensusEvent],
    ) -> Result<Arc<CensusRef>, SequencerError> {
        let census = self.new_by_root(declared_root)?;
        {
            let mut slot = census.slot.lock().expect("census ref lock poisoned");
            let tree = slot
                .as_mut()
                .ok_or_else(|| SequencerError::Locked("census tree is closed".to_string()))?;
            for event in events {
                let address = normalize_census_key(&event.key);
                let value = pack_census_value(&address, event.weight);
                tree.upsert(&address, value).map_err(tree_err)?;
            }
        }
        self.seal_import(census, declared_root)
    }

    /// Promotes an imported tree to published in place: same verification
    /// and index updates as [`CensusDb::publish`], minus the rename (the
    /// tree was built in its destination directory).
    fn seal_import(
        &self,
        census: Arc<CensusRef>,
        declared_root: &[u8],
    ) -> Result<Arc<CensusRef>, SequencerError> {
        let actual = census.root()?;
        let trimmed = trim_root(declared_root);
        if trimmed.len() > 32 {
            self.del(&census.id)?;
            return Err(SequencerError::Internal(format!(
                "declared root is {} bytes",
                trimmed.len()
            )));
        }
        let mut declared = [0u8; 32];
        declared[32 - trimmed.len()..].copy_from_slice(trimmed);
        if actual != declared {
            // The partial tree is useless; drop it entirely.
            self.del(&census.id)?;
            return Err(SequencerError::root_mismatch(&declared, &actual));
        }

        let meta = CensusMeta {
            id: census.id.into_bytes(),
            hash_type: HASH_TYPE_POSEIDON,
            last_used: unix_now(),
            root: actual,
        };
        let mut tx = self.shared.meta.write_tx();
        tx.put(
            &keys::key(keys::CENSUS_ROOT, trim_root(&actual)),
            &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
        );
        tx.delete(&keys::key(keys::CENSUS_WORKING, census.id.as_bytes()));
        tx.commit()?;
        census.published.store(true, Ordering::Release);
        Ok(census)
    }

    /// Applies queued root-index updates until the queue is empty. The
    /// node runs this from the background updater task; tests call it
    /// directly.
    pub fn apply_root_updates(&self) -> Result<usize, SequencerError> {
        let mut applied = 0;
        loop {
            let update = {
                let mut rx = self.shared.root_rx.lock().expect("root queue lock poisoned");
                match rx.try_recv() {
                    Ok(update) => update,
                    Err(_) => break,
                }
            };
            let _refs = self.shared.refs.write().expect("census index lock poisoned");
            if let Some(mut meta) = self.working_meta(&update.id)? {
                meta.root = update.root;
                meta.last_used = unix_now();
                self.shared.meta.put(
                    &keys::key(keys::CENSUS_WORKING, update.id.as_bytes()),
                    &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
                )?;
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// The background root-index writer. Drains the coalescing queue on a
    /// short interval until shutdown flips.
    pub async fn run_root_updater(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.apply_root_updates() {
                        tracing::warn!(error = %e, "root index update failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Final drain so no acknowledged mutation is lost.
                        let _ = self.apply_root_updates();
                        return;
                    }
                }
            }
        }
    }

    /// Best-effort: a full queue drops the update, the next successful
    /// mutation re-posts the latest root.
    fn post_root_update(&self, id: Uuid, root: Root) {
        if self.shared.root_tx.try_send(RootUpdate { id, root }).is_err() {
            tracing::debug!(census = %id, "root update queue full, skipping");
        }
    }

    fn tree_dir(&self, id: &Uuid) -> PathBuf {
        self.shared
            .base_dir
            .join(format!("{}{}", keys::CENSUS_DIR, hex::encode(id.as_bytes())))
    }

    fn working_meta(&self, id: &Uuid) -> Result<Option<CensusMeta>, SequencerError> {
        self.read_meta(keys::CENSUS_WORKING, id.as_bytes())
    }

    fn read_meta(&self, prefix: &[u8], suffix: &[u8]) -> Result<Option<CensusMeta>, SequencerError> {
        match self.shared.meta.get(&keys::key(prefix, suffix))? {
            Some(bytes) => CensusMeta::try_from_slice(&bytes)
                .map(Some)
                .map_err(|e| SequencerError::Io(format!("corrupt census metadata: {e}"))),
            None => Ok(None),
        }
    }

    fn persist_working_meta(&self, census: &CensusRef) -> Result<(), SequencerError> {
        let meta = CensusMeta {
            id: census.id.into_bytes(),
            hash_type: HASH_TYPE_POSEIDON,
            last_used: census.last_used.load(Ordering::Acquire),
            root: census.root()?,
        };
        self.shared.meta.put(
            &keys::key(keys::CENSUS_WORKING, census.id.as_bytes()),
            &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
        )?;
        Ok(())
    }
}

/// A portable census snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusDump {
    #[serde(with = "scrutiny_interface::hex_string::hex_string_serde")]
    pub root: Vec<u8>,
    pub entries: Vec<CensusDumpEntry>,
}

/// One dump entry: a census key and its weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusDumpEntry {
    #[serde(with = "scrutiny_interface::hex_string::hex_string_serde")]
    pub key: Vec<u8>,
    pub weight: u64,
}

/// One entry of an ordered census event log: an add or weight update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusEvent {
    #[serde(with = "scrutiny_interface::hex_string::hex_string_serde")]
    pub key: Vec<u8>,
    pub weight: u64,
}

/// Strips leading zero bytes, the canonical form roots are indexed under.
fn trim_root(root: &[u8]) -> &[u8] {
    let start = root.iter().position(|b| *b != 0).unwrap_or(root.len());
    &root[start..]
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

fn tree_err(e: TreeError) -> SequencerError {
    match e {
        TreeError::AlreadyExists => SequencerError::AlreadyExists("census key".to_string()),
        TreeError::NotFound => SequencerError::NotFound("census key".to_string()),
        TreeError::Full => SequencerError::Internal("census tree is full".to_string()),
        TreeError::Db(db) => db.into(),
        TreeError::Hash(m) => SequencerError::Internal(m),
        TreeError::Corrupt(m) => SequencerError::Io(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (CensusDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = CensusDb::new(Db::in_memory(), dir.path().join("censuses")).unwrap();
        (db, dir)
    }

    fn key(byte: u8) -> Vec<u8> {
        vec![byte; 20]
    }

    #[test]
    fn create_load_and_duplicate_rejection() {
        let (db, _dir) = setup();
        let id = Uuid::new_v4();
        let census = db.new_census(id).unwrap();
        assert_eq!(census.id(), id);
        assert!(matches!(
            db.new_census(id),
            Err(SequencerError::AlreadyExists(_))
        ));

        // Loads resolve from memory, and from disk after eviction.
        assert_eq!(db.load(&id).unwrap().id(), id);
        db.shared.refs.write().unwrap().clear();
        assert_eq!(db.load(&id).unwrap().id(), id);

        assert!(matches!(
            db.load(&Uuid::new_v4()),
            Err(SequencerError::NotFound(_))
        ));
    }

    #[test]
    fn deterministic_uuids() {
        let root = vec![0, 0, 0xab, 0xcd];
        // Leading zeros are trimmed before hashing.
        assert_eq!(
            CensusDb::uuid_for_root(&root),
            CensusDb::uuid_for_root(&[0xab, 0xcd])
        );
        assert_ne!(
            CensusDb::uuid_for_root(&[0xab, 0xcd]),
            CensusDb::uuid_for_root(&[0xab, 0xce])
        );
        // Root- and address-derived ids never collide on the same bytes.
        let twenty = [7u8; 20];
        assert_ne!(
            CensusDb::uuid_for_root(&twenty),
            CensusDb::uuid_for_address(&twenty)
        );
    }

    #[test]
    fn insert_proof_verify_cycle() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();
        db.insert_batch(
            &census,
            &[(key(1), 10), (key(2), 20)],
        )
        .unwrap();
        let root = census.root().unwrap();

        // Publish in place through import-style sealing is exercised in
        // other tests; here we publish via the rename path.
        let dest = db.new_by_root(&root).unwrap();
        db.publish(&census.id(), &dest).unwrap();

        let proof = db.proof_by_root(&root, &key(1)).unwrap();
        assert!(CensusDb::verify_proof(&proof));
        assert_eq!(proof.weight, 10);

        // Unknown keys cannot be proven.
        assert!(db.proof_by_root(&root, &key(9)).is_err());

        // A tampered weight fails verification.
        let mut bad = proof;
        bad.weight = 11;
        assert!(!CensusDb::verify_proof(&bad));
    }

    #[test]
    fn publish_end_to_end() {
        let (db, _dir) = setup();
        let working = db.new_census(Uuid::new_v4()).unwrap();
        let working_id = working.id();
        let working_dir = working.dir.clone();
        let mut a = vec![0x0a; 19];
        a.push(0x01);
        let mut b = vec![0x0a; 19];
        b.push(0x02);
        db.insert_batch(&working, &[(a.clone(), 10), (b, 20)]).unwrap();
        let root = working.root().unwrap();

        let dest = db.new_by_root(&root).unwrap();
        db.publish(&working_id, &dest).unwrap();

        // The published tree serves proofs under the canonical root.
        let proof = db.proof_by_root(&root, &a).unwrap();
        assert!(CensusDb::verify_proof(&proof));

        // The working identity is gone: memory, metadata and directory.
        assert!(matches!(
            db.load(&working_id),
            Err(SequencerError::NotFound(_))
        ));
        assert!(!working_dir.exists());

        // The destination root matches the working root read before the
        // rename, and the census is now immutable.
        assert_eq!(dest.root().unwrap(), root);
        assert!(matches!(
            db.insert(&dest, &key(3), 1),
            Err(SequencerError::Locked(_))
        ));

        // Reload from a cold index works via the root.
        db.shared.refs.write().unwrap().clear();
        let reloaded = db.load_by_root(&root).unwrap();
        assert_eq!(reloaded.root().unwrap(), root);
    }

    #[test]
    fn publish_by_address_indexes_the_address() {
        let (db, _dir) = setup();
        let working = db.new_census(Uuid::new_v4()).unwrap();
        db.insert(&working, &key(1), 5).unwrap();
        let root = working.root().unwrap();

        let org = [0x77u8; 20];
        let dest = db.new_by_address(&org).unwrap();
        db.publish(&working.id(), &dest).unwrap();

        db.shared.refs.write().unwrap().clear();
        let by_address = db.load_by_address(&org).unwrap();
        assert_eq!(by_address.root().unwrap(), root);
        // The root index is written too.
        assert!(db.load_by_root(&root).is_ok());
    }

    #[test]
    fn short_and_long_keys_normalize_through_proofs() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();

        // A 19-byte key is right-padded, a 21-byte key truncated; the
        // 21-byte key collides with its 20-byte prefix.
        let short = vec![0xaa; 19];
        let long: Vec<u8> = vec![0xbb; 21];
        db.insert_batch(&census, &[(short.clone(), 7), (long.clone(), 9)])
            .unwrap();
        let root = census.root().unwrap();
        let dest = db.new_by_root(&root).unwrap();
        db.publish(&census.id(), &dest).unwrap();

        // Both original spellings round-trip through proof generation.
        let proof = db.proof_by_root(&root, &short).unwrap();
        assert!(CensusDb::verify_proof(&proof));
        assert_eq!(&proof.address[..19], &short[..]);
        assert_eq!(proof.address[19], 0);
        assert_eq!(proof.weight, 7);

        let proof = db.proof_by_root(&root, &long).unwrap();
        assert!(CensusDb::verify_proof(&proof));
        assert_eq!(proof.address, [0xbb; 20]);

        // The truncated spelling addresses the same leaf.
        let truncated = db.proof_by_root(&root, &[0xbb; 20]).unwrap();
        assert_eq!(truncated.index, proof.index);
    }

    #[test]
    fn del_removes_everything() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();
        let id = census.id();
        let dir = census.dir.clone();
        db.insert(&census, &key(1), 1).unwrap();

        db.del(&id).unwrap();
        assert!(matches!(db.load(&id), Err(SequencerError::NotFound(_))));

        // Directory removal is asynchronous; give it a moment.
        for _ in 0..50 {
            if !dir.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!dir.exists());
    }

    #[test]
    fn purge_working_by_age() {
        let (db, _dir) = setup();
        let stale = db.new_census(Uuid::new_v4()).unwrap();
        let fresh = db.new_census(Uuid::new_v4()).unwrap();

        // Backdate the stale census's metadata.
        let mut meta = db.working_meta(&stale.id()).unwrap().unwrap();
        meta.last_used = unix_now() - 1000;
        db.shared
            .meta
            .put(
                &keys::key(keys::CENSUS_WORKING, stale.id().as_bytes()),
                &borsh::to_vec(&meta).unwrap(),
            )
            .unwrap();

        let purged = db.purge_working(Duration::from_secs(100)).unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(db.load(&stale.id()), Err(SequencerError::NotFound(_))));
        assert!(db.load(&fresh.id()).is_ok());
    }

    #[test]
    fn dump_import_roundtrip() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();
        db.insert_batch(&census, &[(key(1), 1), (key(2), 2), (key(3), 3)])
            .unwrap();
        let dump = db.dump(&census).unwrap();
        let root = census.root().unwrap();
        assert_eq!(dump.root, root.to_vec());

        // Import into a separate store reproduces the root.
        let (other, _dir2) = setup();
        let imported = other.import(&root, &dump).unwrap();
        assert_eq!(imported.root().unwrap(), root);
        assert!(other.proof_by_root(&root, &key(2)).is_ok());

        // JSON form round-trips too.
        let (third, _dir3) = setup();
        let json = serde_json::to_vec(&dump).unwrap();
        let imported = third.import_json(&root, &json).unwrap();
        assert_eq!(imported.root().unwrap(), root);
    }

    #[test]
    fn import_rejects_wrong_root() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();
        db.insert(&census, &key(1), 1).unwrap();
        let dump = db.dump(&census).unwrap();

        let (other, _dir2) = setup();
        let wrong_root = [0xee; 32];
        assert!(matches!(
            other.import(&wrong_root, &dump),
            Err(SequencerError::RootMismatch { .. })
        ));
        // The failed import leaves nothing behind.
        assert!(other.load_by_root(&wrong_root).is_err());
    }

    #[test]
    fn import_events_applies_updates_in_order() {
        let (db, _dir) = setup();
        // Build the expected tree: key1 ends at weight 7 after an update.
        let census = db.new_census(Uuid::new_v4()).unwrap();
        db.insert_batch(&census, &[(key(1), 7), (key(2), 2)]).unwrap();
        let root = census.root().unwrap();

        let events = vec![
            CensusEvent { key: key(1), weight: 1 },
            CensusEvent { key: key(2), weight: 2 },
            CensusEvent { key: key(1), weight: 7 },
        ];
        let (other, _dir2) = setup();
        let imported = other.import_events(&root, &events).unwrap();
        assert_eq!(imported.root().unwrap(), root);
    }

    #[test]
    fn coalesced_root_updates_land_in_metadata() {
        let (db, _dir) = setup();
        let census = db.new_census(Uuid::new_v4()).unwrap();
        db.insert(&census, &key(1), 1).unwrap();
        let root = census.root().unwrap();

        assert!(db.apply_root_updates().unwrap() >= 1);
        let meta = db.working_meta(&census.id()).unwrap().unwrap();
        assert_eq!(meta.root, root);
    }
}
