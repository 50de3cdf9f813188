//! Persistent ballot queues and exclusion locks.
//!
//! A ballot moves pending → verified → in-batch → settled. The two lock
//! sets guard the whole journey: a vote id is locked from ingress until
//! its batch settles or fails, and an address can have at most one ballot
//! in flight per process. Locks and queues are persisted in the same
//! transactions that move the ballots, so a restart recovers exactly the
//! in-flight set.
//!
//! Ingress decisions happen under one critical section (a plain mutex; no
//! suspension points inside), which is what makes the lock checks and the
//! queue-depth backpressure atomic.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_db::{keys, Db};
use scrutiny_interface::{
    Address, AggregatedBatch, Ballot, ProcessId, PushResult, SequencerError, StateTransition,
    VerifiedBallot, VoteId,
};

/// A verified ballot with its queue timestamp, used for the max-wait rule.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QueuedVerified {
    pub ballot: VerifiedBallot,
    pub enqueued_ms: u64,
}

/// Queue depths, as reported by [`BallotQueue::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub verified: usize,
    pub open_batches: usize,
    pub locked_vote_ids: usize,
    pub locked_addresses: usize,
}

struct LockState {
    vote_ids: HashSet<VoteId>,
    addresses: HashSet<(ProcessId, Address)>,
    pending_per_process: HashMap<ProcessId, usize>,
    next_pending_seq: u64,
}

/// The persistent ballot pipeline storage. Thread-safe.
pub struct BallotQueue {
    db: Db,
    locks: Mutex<LockState>,
    max_pending_per_process: usize,
}

impl BallotQueue {
    /// Opens the queue over the main store, reloading lock sets and queue
    /// depths from disk.
    pub fn open(db: Db, max_pending_per_process: usize) -> Result<Self, SequencerError> {
        let mut vote_ids = HashSet::new();
        db.iter_prefix(keys::LOCK_VOTE_ID, |key, _| {
            if let Ok(vote_id) = <VoteId>::try_from(key[keys::LOCK_VOTE_ID.len()..].to_vec()) {
                vote_ids.insert(vote_id);
            }
            true
        })?;

        let mut addresses = HashSet::new();
        db.iter_prefix(keys::LOCK_ADDRESS, |key, _| {
            let suffix = &key[keys::LOCK_ADDRESS.len()..];
            if suffix.len() == 52 {
                if let Ok(process_id) = ProcessId::from_bytes(&suffix[..32]) {
                    let mut address = [0u8; 20];
                    address.copy_from_slice(&suffix[32..]);
                    addresses.insert((process_id, address));
                }
            }
            true
        })?;

        let mut pending_per_process: HashMap<ProcessId, usize> = HashMap::new();
        db.iter_prefix(keys::BALLOT_PENDING, |key, _| {
            let suffix = &key[keys::BALLOT_PENDING.len()..];
            if suffix.len() == 40 {
                if let Ok(process_id) = ProcessId::from_bytes(&suffix[..32]) {
                    *pending_per_process.entry(process_id).or_default() += 1;
                }
            }
            true
        })?;

        let next_pending_seq = match db.get(&keys::key(keys::QUEUE_META, b"pseq"))? {
            Some(bytes) if bytes.len() == 8 => {
                u64::from_be_bytes(bytes.try_into().expect("checked length"))
            }
            _ => 0,
        };

        Ok(Self {
            db,
            locks: Mutex::new(LockState {
                vote_ids,
                addresses,
                pending_per_process,
                next_pending_seq,
            }),
            max_pending_per_process,
        })
    }

    /// The ingress critical section. `accepting` tells whether the process
    /// exists and currently takes ballots; the caller resolves that before
    /// entering so no storage read happens under the lock.
    pub fn push(&self, ballot: Ballot, accepting: bool) -> Result<(), SequencerError> {
        if !accepting {
            return Err(SequencerError::NotFound(format!(
                "process {} is not accepting ballots",
                ballot.process_id
            )));
        }

        let mut locks = self.locks.lock().expect("ballot lock state poisoned");
        if locks.vote_ids.contains(&ballot.vote_id) {
            return Err(SequencerError::NullifierProcessing);
        }
        let address_key = (ballot.process_id, ballot.address);
        if locks.addresses.contains(&address_key) {
            return Err(SequencerError::AddressProcessing);
        }
        let depth = locks
            .pending_per_process
            .get(&ballot.process_id)
            .copied()
            .unwrap_or(0);
        if depth >= self.max_pending_per_process {
            return Err(SequencerError::Busy);
        }

        let seq = locks.next_pending_seq;
        let ballot_bytes =
            borsh::to_vec(&ballot).map_err(|e| SequencerError::Internal(e.to_string()))?;

        // Persist first; memory only changes once the write is durable.
        let mut tx = self.db.write_tx();
        tx.put(&pending_key(&ballot.process_id, seq), &ballot_bytes);
        tx.put(&vote_id_lock_key(&ballot.vote_id), &[]);
        tx.put(&address_lock_key(&ballot.process_id, &ballot.address), &[]);
        tx.put(&keys::key(keys::QUEUE_META, b"pseq"), &(seq + 1).to_be_bytes());
        tx.commit()?;

        locks.vote_ids.insert(ballot.vote_id);
        locks.addresses.insert(address_key);
        *locks.pending_per_process.entry(ballot.process_id).or_default() += 1;
        locks.next_pending_seq = seq + 1;
        Ok(())
    }

    /// Maps ingress errors onto the stable three-valued API response.
    pub fn to_push_result(result: Result<(), SequencerError>) -> PushResult {
        match result {
            Ok(()) => PushResult::Accepted,
            Err(SequencerError::Busy) => PushResult::Busy,
            Err(e) => PushResult::Rejected {
                reason: e.to_string(),
            },
        }
    }

    /// Up to `max` pending ballots in FIFO order, with their storage keys.
    /// Entries stay pending until marked verified or rejected.
    pub fn peek_pending(&self, max: usize) -> Result<Vec<(Vec<u8>, Ballot)>, SequencerError> {
        let mut out = Vec::new();
        let mut corrupt = None;
        self.db.iter_prefix(keys::BALLOT_PENDING, |key, value| {
            match Ballot::try_from_slice(value) {
                Ok(ballot) => out.push((key.to_vec(), ballot)),
                Err(e) => {
                    corrupt = Some(e.to_string());
                    return false;
                }
            }
            out.len() < max
        })?;
        if let Some(e) = corrupt {
            return Err(SequencerError::Io(format!("corrupt pending ballot: {e}")));
        }
        Ok(out)
    }

    /// Moves a pending ballot into the verified queue. Locks stay held.
    pub fn mark_verified(
        &self,
        pending_key: &[u8],
        verified: VerifiedBallot,
    ) -> Result<(), SequencerError> {
        let process_id = verified.process_id;
        let entry = QueuedVerified {
            ballot: verified,
            enqueued_ms: unix_millis(),
        };
        let bytes = borsh::to_vec(&entry).map_err(|e| SequencerError::Internal(e.to_string()))?;

        let mut locks = self.locks.lock().expect("ballot lock state poisoned");
        let mut tx = self.db.write_tx();
        tx.delete(pending_key);
        // The verified key reuses the pending sequence, preserving FIFO.
        tx.put(
            &keys::key(keys::BALLOT_VERIFIED, &pending_key[keys::BALLOT_PENDING.len()..]),
            &bytes,
        );
        tx.commit()?;
        decrement(&mut locks.pending_per_process, &process_id);
        Ok(())
    }

    /// Drops a pending ballot and releases its locks (a rejection).
    pub fn reject_pending(&self, pending_key: &[u8], ballot: &Ballot) -> Result<(), SequencerError> {
        let mut locks = self.locks.lock().expect("ballot lock state poisoned");
        let mut tx = self.db.write_tx();
        tx.delete(pending_key);
        tx.delete(&vote_id_lock_key(&ballot.vote_id));
        tx.delete(&address_lock_key(&ballot.process_id, &ballot.address));
        tx.commit()?;

        locks.vote_ids.remove(&ballot.vote_id);
        locks.addresses.remove(&(ballot.process_id, ballot.address));
        decrement(&mut locks.pending_per_process, &ballot.process_id);
        Ok(())
    }

    /// Number of verified ballots waiting for a process.
    pub fn verified_len(&self, process_id: &ProcessId) -> Result<usize, SequencerError> {
        Ok(self.db.count_prefix(&verified_prefix(process_id))?)
    }

    /// Age of the oldest verified ballot for a process, in milliseconds.
    pub fn oldest_verified_age_ms(
        &self,
        process_id: &ProcessId,
    ) -> Result<Option<u64>, SequencerError> {
        let mut oldest = None;
        self.db.iter_prefix(&verified_prefix(process_id), |_, value| {
            if let Ok(entry) = QueuedVerified::try_from_slice(value) {
                oldest = Some(entry.enqueued_ms);
            }
            false
        })?;
        Ok(oldest.map(|ms| unix_millis().saturating_sub(ms)))
    }

    /// Closes a batch: takes up to `max` verified ballots in FIFO order,
    /// assigns the next batch sequence for the process, persists the open
    /// batch and removes the ballots from the verified queue, atomically.
    /// Returns `None` when the verified queue is empty.
    pub fn close_batch(
        &self,
        process_id: &ProcessId,
        max: usize,
    ) -> Result<Option<AggregatedBatch>, SequencerError> {
        let mut taken: Vec<(Vec<u8>, QueuedVerified)> = Vec::new();
        let mut corrupt = None;
        self.db.iter_prefix(&verified_prefix(process_id), |key, value| {
            match QueuedVerified::try_from_slice(value) {
                Ok(entry) => taken.push((key.to_vec(), entry)),
                Err(e) => {
                    corrupt = Some(e.to_string());
                    return false;
                }
            }
            taken.len() < max
        })?;
        if let Some(e) = corrupt {
            return Err(SequencerError::Io(format!("corrupt verified ballot: {e}")));
        }
        if taken.is_empty() {
            return Ok(None);
        }

        let seq_key = keys::key(keys::QUEUE_META, &batch_seq_suffix(process_id));
        let seq = match self.db.get(&seq_key)? {
            Some(bytes) if bytes.len() == 8 => {
                u64::from_be_bytes(bytes.try_into().expect("checked length"))
            }
            _ => 0,
        };

        let batch = AggregatedBatch {
            seq,
            process_id: *process_id,
            ballots: taken.iter().map(|(_, e)| e.ballot.clone()).collect(),
            proof: Vec::new(),
        };
        let batch_bytes =
            borsh::to_vec(&batch).map_err(|e| SequencerError::Internal(e.to_string()))?;

        let mut tx = self.db.write_tx();
        for (key, _) in &taken {
            tx.delete(key);
        }
        tx.put(
            &keys::key(keys::BATCH_AGGREGATED, &AggregatedBatch::storage_key(process_id, seq)),
            &batch_bytes,
        );
        tx.put(&seq_key, &(seq + 1).to_be_bytes());
        tx.commit()?;
        Ok(Some(batch))
    }

    /// Persists a batch's aggregation proof once the prover returns it.
    pub fn store_batch(&self, batch: &AggregatedBatch) -> Result<(), SequencerError> {
        let bytes = borsh::to_vec(batch).map_err(|e| SequencerError::Internal(e.to_string()))?;
        self.db.put(
            &keys::key(
                keys::BATCH_AGGREGATED,
                &AggregatedBatch::storage_key(&batch.process_id, batch.seq),
            ),
            &bytes,
        )?;
        Ok(())
    }

    /// Persists a state transition while it awaits settlement.
    pub fn store_transition(&self, transition: &StateTransition) -> Result<(), SequencerError> {
        let bytes =
            borsh::to_vec(transition).map_err(|e| SequencerError::Internal(e.to_string()))?;
        self.db.put(
            &keys::key(
                keys::STATE_TRANSITION,
                &AggregatedBatch::storage_key(&transition.process_id, transition.batch_seq),
            ),
            &bytes,
        )?;
        Ok(())
    }

    /// Reads back a stored, not-yet-settled state transition.
    pub fn get_transition(
        &self,
        process_id: &ProcessId,
        seq: u64,
    ) -> Result<Option<StateTransition>, SequencerError> {
        match self.db.get(&keys::key(
            keys::STATE_TRANSITION,
            &AggregatedBatch::storage_key(process_id, seq),
        ))? {
            Some(bytes) => StateTransition::try_from_slice(&bytes)
                .map(Some)
                .map_err(|e| SequencerError::Io(format!("corrupt transition record: {e}"))),
            None => Ok(None),
        }
    }

    /// Settles a batch: deletes its records and releases every lock its
    /// ballots held. This is the moment a voter may cast again.
    pub fn mark_batch_done(&self, batch: &AggregatedBatch) -> Result<(), SequencerError> {
        self.finish_batch(batch, true)
    }

    /// Fails a batch: same bookkeeping as settling, different log. Ballots
    /// are dropped; users may re-submit with a fresh vote id.
    pub fn mark_batch_failed(&self, batch: &AggregatedBatch) -> Result<(), SequencerError> {
        self.finish_batch(batch, false)
    }

    fn finish_batch(&self, batch: &AggregatedBatch, done: bool) -> Result<(), SequencerError> {
        let mut locks = self.locks.lock().expect("ballot lock state poisoned");
        let mut tx = self.db.write_tx();
        tx.delete(&keys::key(
            keys::BATCH_AGGREGATED,
            &AggregatedBatch::storage_key(&batch.process_id, batch.seq),
        ));
        tx.delete(&keys::key(
            keys::STATE_TRANSITION,
            &AggregatedBatch::storage_key(&batch.process_id, batch.seq),
        ));
        for ballot in &batch.ballots {
            tx.delete(&vote_id_lock_key(&ballot.vote_id));
            tx.delete(&address_lock_key(&batch.process_id, &ballot.address));
        }
        tx.commit()?;

        for ballot in &batch.ballots {
            locks.vote_ids.remove(&ballot.vote_id);
            locks.addresses.remove(&(batch.process_id, ballot.address));
        }
        if done {
            tracing::info!(
                process = %batch.process_id,
                batch = batch.seq,
                ballots = batch.ballots.len(),
                "batch settled"
            );
        } else {
            tracing::warn!(
                process = %batch.process_id,
                batch = batch.seq,
                ballots = batch.ballots.len(),
                "batch failed, locks released"
            );
        }
        Ok(())
    }

    /// Open (unsettled) batches, for restart recovery and cancellation.
    pub fn open_batches(
        &self,
        process_id: Option<&ProcessId>,
    ) -> Result<Vec<AggregatedBatch>, SequencerError> {
        let prefix = match process_id {
            Some(pid) => keys::key(keys::BATCH_AGGREGATED, &pid.to_bytes()),
            None => keys::BATCH_AGGREGATED.to_vec(),
        };
        let mut batches = Vec::new();
        let mut corrupt = None;
        self.db.iter_prefix(&prefix, |_, value| {
            match AggregatedBatch::try_from_slice(value) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    corrupt = Some(e.to_string());
                    return false;
                }
            }
            true
        })?;
        if let Some(e) = corrupt {
            return Err(SequencerError::Io(format!("corrupt batch record: {e}")));
        }
        Ok(batches)
    }

    /// Current queue depths.
    pub fn stats(&self) -> Result<QueueStats, SequencerError> {
        let locks = self.locks.lock().expect("ballot lock state poisoned");
        Ok(QueueStats {
            pending: locks.pending_per_process.values().sum(),
            verified: self.db.count_prefix(keys::BALLOT_VERIFIED)?,
            open_batches: self.db.count_prefix(keys::BATCH_AGGREGATED)?,
            locked_vote_ids: locks.vote_ids.len(),
            locked_addresses: locks.addresses.len(),
        })
    }

    /// Whether a vote id is currently locked. Exposed for tests and the
    /// status API.
    pub fn vote_id_locked(&self, vote_id: &VoteId) -> bool {
        self.locks
            .lock()
            .expect("ballot lock state poisoned")
            .vote_ids
            .contains(vote_id)
    }
}

fn pending_key(process_id: &ProcessId, seq: u64) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(40);
    suffix.extend_from_slice(&process_id.to_bytes());
    suffix.extend_from_slice(&seq.to_be_bytes());
    keys::key(keys::BALLOT_PENDING, &suffix)
}

fn verified_prefix(process_id: &ProcessId) -> Vec<u8> {
    keys::key(keys::BALLOT_VERIFIED, &process_id.to_bytes())
}

fn vote_id_lock_key(vote_id: &VoteId) -> Vec<u8> {
    keys::key(keys::LOCK_VOTE_ID, vote_id)
}

fn address_lock_key(process_id: &ProcessId, address: &Address) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(52);
    suffix.extend_from_slice(&process_id.to_bytes());
    suffix.extend_from_slice(address);
    keys::key(keys::LOCK_ADDRESS, &suffix)
}

fn batch_seq_suffix(process_id: &ProcessId) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(37);
    suffix.extend_from_slice(b"bseq_");
    suffix.extend_from_slice(&process_id.to_bytes());
    suffix
}

fn decrement(map: &mut HashMap<ProcessId, usize>, process_id: &ProcessId) {
    if let Some(depth) = map.get_mut(process_id) {
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            map.remove(process_id);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
