//! The per-election state engine.
//!
//! Every process owns one [`ElectionState`]: a Merkle tree of voters (the
//! leaf commits to the voter's last vote id and ciphertexts), two
//! homomorphic ElGamal accumulators per ballot field, and the voter and
//! overwrite counters. Applying a batch walks its ballots in insertion
//! order, charges overwrites by moving the previous ciphertexts into the
//! `sub` accumulator, and commits the whole delta in one atomic write.
//!
//! Callers serialize batch application per process: the engine itself does
//! no locking, matching the pipeline rule that at most one state
//! transition per process is in flight at a time.

use ark_bn254::Fr;
use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_census::tree::{Tree, WriteMode};
use scrutiny_crypto::elgamal::Ciphertext;
use scrutiny_crypto::poseidon;
use scrutiny_db::{keys, Db};
use scrutiny_interface::{
    Address, AggregatedBatch, EncryptedField, ProcessId, Root, SequencerError, StateTransition,
    VerifiedBallot,
};

const VOTER_RECORD: &[u8] = b"v_";
const STATE_META: &[u8] = b"m_";
const TREE_NS: &[u8] = b"t_";

/// What the state remembers about a voter, used to detect and charge
/// overwrites.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
struct VoterRecord {
    vote_id: [u8; 32],
    ciphertexts: Vec<EncryptedField>,
}

/// Persisted accumulators and counters, updated atomically with the tree.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
struct StateMeta {
    add: Vec<EncryptedField>,
    sub: Vec<EncryptedField>,
    voter_count: u64,
    overwrite_count: u64,
}

/// One election's state. See the crate docs for the concurrency contract.
pub struct ElectionState {
    process_id: ProcessId,
    db: Db,
    tree: Tree,
    add: Vec<Ciphertext>,
    sub: Vec<Ciphertext>,
    voter_count: u64,
    overwrite_count: u64,
    num_fields: usize,
}

impl ElectionState {
    /// Opens (or initializes) the state of `process_id` inside the node's
    /// main store. `num_fields` comes from the process ballot mode and is
    /// fixed for the election's lifetime.
    pub fn open(
        main: &Db,
        process_id: ProcessId,
        num_fields: usize,
    ) -> Result<Self, SequencerError> {
        let db = main
            .prefixed(keys::STATE)
            .prefixed(&process_id.to_bytes());
        let tree = Tree::open(db.prefixed(TREE_NS))
            .map_err(|e| SequencerError::Io(e.to_string()))?;

        let (add, sub, voter_count, overwrite_count) = match db.get(STATE_META)? {
            Some(bytes) => {
                let meta = StateMeta::try_from_slice(&bytes)
                    .map_err(|e| SequencerError::Io(format!("corrupt state metadata: {e}")))?;
                if meta.add.len() != num_fields || meta.sub.len() != num_fields {
                    return Err(SequencerError::Io(format!(
                        "state has {} fields, process declares {num_fields}",
                        meta.add.len()
                    )));
                }
                (
                    decode_fields(&meta.add)?,
                    decode_fields(&meta.sub)?,
                    meta.voter_count,
                    meta.overwrite_count,
                )
            }
            None => (
                vec![Ciphertext::zero(); num_fields],
                vec![Ciphertext::zero(); num_fields],
                0,
                0,
            ),
        };

        Ok(Self {
            process_id,
            db,
            tree,
            add,
            sub,
            voter_count,
            overwrite_count,
            num_fields,
        })
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// The current state root.
    pub fn root(&self) -> Root {
        self.tree.root()
    }

    pub fn voter_count(&self) -> u64 {
        self.voter_count
    }

    pub fn overwrite_count(&self) -> u64 {
        self.overwrite_count
    }

    /// The `add` accumulator, one ciphertext per field.
    pub fn accumulator_add(&self) -> &[Ciphertext] {
        &self.add
    }

    /// The `sub` accumulator, one ciphertext per field.
    pub fn accumulator_sub(&self) -> &[Ciphertext] {
        &self.sub
    }

    /// Applies a batch in its recorded order and returns the resulting
    /// state transition (without a proof; the prover fills that in).
    ///
    /// The voter tree update, the voter records, and the accumulator
    /// metadata all commit in one write: a crash leaves the previous state
    /// intact.
    pub fn apply(&mut self, batch: &AggregatedBatch) -> Result<StateTransition, SequencerError> {
        if batch.process_id != self.process_id {
            return Err(SequencerError::Internal(format!(
                "batch for {} applied to state of {}",
                batch.process_id, self.process_id
            )));
        }
        let old_root = self.root();

        let mut add_delta = vec![Ciphertext::zero(); self.num_fields];
        let mut sub_delta = vec![Ciphertext::zero(); self.num_fields];
        let mut voters_added = 0u64;
        let mut overwrites = 0u64;
        let mut leaf_updates: Vec<(Address, [u8; 32])> = Vec::with_capacity(batch.ballots.len());
        let mut record_puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(batch.ballots.len());

        for ballot in &batch.ballots {
            if ballot.ciphertexts.len() != self.num_fields {
                return Err(SequencerError::Internal(format!(
                    "ballot {} carries {} fields, state has {}",
                    hex::encode(ballot.vote_id),
                    ballot.ciphertexts.len(),
                    self.num_fields
                )));
            }
            let new_fields = decode_fields(&ballot.ciphertexts)?;

            // The address lock guarantees each address appears at most once
            // per batch, so reading the pre-state record here is sound.
            match self.voter_record(&ballot.address)? {
                Some(previous) => {
                    let old_fields = decode_fields(&previous.ciphertexts)?;
                    for (acc, ct) in sub_delta.iter_mut().zip(old_fields.iter()) {
                        *acc = acc.add(ct);
                    }
                    overwrites += 1;
                }
                None => {
                    voters_added += 1;
                }
            }

            for (acc, ct) in add_delta.iter_mut().zip(new_fields.iter()) {
                *acc = acc.add(ct);
            }

            leaf_updates.push((ballot.address, voter_leaf(ballot)?));
            let record = VoterRecord {
                vote_id: ballot.vote_id,
                ciphertexts: ballot.ciphertexts.clone(),
            };
            record_puts.push((
                record_key(&ballot.address),
                borsh::to_vec(&record).map_err(|e| SequencerError::Internal(e.to_string()))?,
            ));
        }

        let prepared = self
            .tree
            .prepare(WriteMode::Upsert, &leaf_updates)
            .map_err(|e| SequencerError::Io(e.to_string()))?;

        let new_add: Vec<Ciphertext> = self
            .add
            .iter()
            .zip(add_delta.iter())
            .map(|(acc, delta)| acc.add(delta))
            .collect();
        let new_sub: Vec<Ciphertext> = self
            .sub
            .iter()
            .zip(sub_delta.iter())
            .map(|(acc, delta)| acc.add(delta))
            .collect();
        let meta = StateMeta {
            add: encode_fields(&new_add),
            sub: encode_fields(&new_sub),
            voter_count: self.voter_count + voters_added,
            overwrite_count: self.overwrite_count + overwrites,
        };

        let mut tx = self.db.write_tx();
        self.tree.stage(&prepared, &mut tx);
        for (key, value) in &record_puts {
            tx.put(key, value);
        }
        tx.put(
            STATE_META,
            &borsh::to_vec(&meta).map_err(|e| SequencerError::Internal(e.to_string()))?,
        );
        tx.commit()?;

        self.tree.absorb(prepared);
        self.add = new_add;
        self.sub = new_sub;
        self.voter_count = meta.voter_count;
        self.overwrite_count = meta.overwrite_count;

        let new_root = self.root();
        tracing::debug!(
            process = %self.process_id,
            batch = batch.seq,
            old_root = %hex::encode(old_root),
            new_root = %hex::encode(new_root),
            voters_added,
            overwrites,
            "state transition applied"
        );

        Ok(StateTransition {
            process_id: self.process_id,
            batch_seq: batch.seq,
            old_root,
            new_root,
            add_delta: encode_fields(&add_delta),
            sub_delta: encode_fields(&sub_delta),
            voters_added,
            overwrites,
            proof: Vec::new(),
        })
    }

    fn voter_record(&self, address: &Address) -> Result<Option<VoterRecord>, SequencerError> {
        match self.db.get(&record_key(address))? {
            Some(bytes) => VoterRecord::try_from_slice(&bytes)
                .map(Some)
                .map_err(|e| SequencerError::Io(format!("corrupt voter record: {e}"))),
            None => Ok(None),
        }
    }
}

fn record_key(address: &Address) -> Vec<u8> {
    keys::key(VOTER_RECORD, address)
}

/// The voter leaf commits to the last vote id and the ciphertexts: any
/// change to either changes the state root.
fn voter_leaf(ballot: &VerifiedBallot) -> Result<[u8; 32], SequencerError> {
    let mut inputs = Vec::with_capacity(1 + ballot.ciphertexts.len() * 4);
    inputs.push(poseidon::fr_from_be_bytes(&ballot.vote_id));
    for field in &ballot.ciphertexts {
        let ct = Ciphertext::from_bytes(field.as_ref())?;
        inputs.extend_from_slice(&ct.coords());
    }
    let leaf: Fr = poseidon::hash_chain(&inputs)?;
    Ok(poseidon::fr_to_be_bytes(&leaf))
}

fn decode_fields(fields: &[EncryptedField]) -> Result<Vec<Ciphertext>, SequencerError> {
    fields
        .iter()
        .map(|f| Ciphertext::from_bytes(f.as_ref()).map_err(Into::into))
        .collect()
}

fn encode_fields(fields: &[Ciphertext]) -> Vec<EncryptedField> {
    fields.iter().map(|ct| EncryptedField(ct.to_bytes())).collect()
}
