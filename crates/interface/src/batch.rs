//! Aggregated batches, prover witnesses and state transitions.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::ballot::{EncryptedField, VerifiedBallot};
use crate::process::ProcessId;
use crate::Root;

/// An ordered batch of verified ballots, closed by the aggregator. The
/// real ballots keep their FIFO order; the circuit sees the batch padded
/// with dummy slots to the configured batch size.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct AggregatedBatch {
    /// Batch identifier, unique per process: the sequence number assigned
    /// at aggregation time.
    pub seq: u64,
    pub process_id: ProcessId,
    pub ballots: Vec<VerifiedBallot>,
    /// Aggregation proof attesting every inner proof is valid.
    pub proof: Vec<u8>,
}

impl AggregatedBatch {
    /// Storage key for this batch: process id then big-endian sequence, so
    /// batches iterate in creation order.
    pub fn storage_key(process_id: &ProcessId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(&process_id.to_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

/// One slot of the aggregation circuit witness.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct SlotWitness {
    /// Zero for padding slots; the circuit skips them.
    pub is_valid: bool,
    /// Poseidon inputs hash of the slot's ballot (zero for padding).
    pub inputs_hash: [u8; 32],
    /// The slot's inner proof handle (empty for padding).
    pub inner_proof: Vec<u8>,
}

impl SlotWitness {
    /// The deterministic padding slot. Every dummy entry is identical so
    /// the batch shape carries no information about its fill level.
    pub fn padding() -> Self {
        Self {
            is_valid: false,
            inputs_hash: [0u8; 32],
            inner_proof: Vec::new(),
        }
    }
}

/// The aggregation circuit witness: a fixed number of slots. Its borsh
/// encoding is the stable public-input serialization; changing it breaks
/// verification of previously produced proofs.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BatchWitness {
    pub process_id: ProcessId,
    pub slots: Vec<SlotWitness>,
}

impl BatchWitness {
    /// Builds the witness for `ballots`, padding to `batch_size`.
    pub fn build(process_id: ProcessId, ballots: &[VerifiedBallot], batch_size: usize) -> Self {
        let mut slots: Vec<SlotWitness> = ballots
            .iter()
            .map(|b| SlotWitness {
                is_valid: true,
                inputs_hash: b.inputs_hash,
                inner_proof: b.inner_proof.clone(),
            })
            .collect();
        slots.resize(batch_size, SlotWitness::padding());
        Self { process_id, slots }
    }

    /// Number of real (non-padding) slots.
    pub fn real_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_valid).count()
    }
}

/// The result of applying one batch to an election state, with everything
/// the chain needs to verify and record it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct StateTransition {
    pub process_id: ProcessId,
    /// Batch sequence number this transition was produced from.
    pub batch_seq: u64,
    pub old_root: Root,
    pub new_root: Root,
    /// Per-field ciphertexts added to the `add` accumulator by this batch.
    pub add_delta: Vec<EncryptedField>,
    /// Per-field ciphertexts moved into the `sub` accumulator by
    /// overwrites in this batch.
    pub sub_delta: Vec<EncryptedField>,
    /// Net new voters introduced by this batch.
    pub voters_added: u64,
    /// Overwrites charged by this batch.
    pub overwrites: u64,
    /// Succinct state-transition proof.
    pub proof: Vec<u8>,
}

/// Witness of the state-transition circuit: the state delta the prover
/// attests to, referencing the already-proven batch.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct TransitionWitness {
    pub process_id: ProcessId,
    pub old_root: Root,
    pub new_root: Root,
    /// The aggregation proof of the underlying batch.
    pub batch_proof: Vec<u8>,
    pub add_delta: Vec<EncryptedField>,
    pub sub_delta: Vec<EncryptedField>,
    pub voters_added: u64,
    pub overwrites: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ProcessId {
        ProcessId {
            chain_id: 1,
            organization: [1u8; 20],
            nonce: 9,
        }
    }

    fn verified(vote_id_byte: u8) -> VerifiedBallot {
        VerifiedBallot {
            process_id: pid(),
            address: [vote_id_byte; 20],
            vote_id: [vote_id_byte; 32],
            inputs_hash: [vote_id_byte; 32],
            inner_proof: vec![vote_id_byte],
            ciphertexts: vec![EncryptedField([vote_id_byte; 64])],
            weight: 1,
        }
    }

    #[test]
    fn witness_pads_to_batch_size() {
        let ballots = vec![verified(1)];
        let witness = BatchWitness::build(pid(), &ballots, 4);
        assert_eq!(witness.slots.len(), 4);
        assert_eq!(witness.real_count(), 1);
        assert!(witness.slots[0].is_valid);
        for slot in &witness.slots[1..] {
            assert_eq!(slot, &SlotWitness::padding());
        }
    }

    #[test]
    fn witness_preserves_ballot_order() {
        let ballots = vec![verified(1), verified(2), verified(3)];
        let witness = BatchWitness::build(pid(), &ballots, 4);
        for (i, ballot) in ballots.iter().enumerate() {
            assert_eq!(witness.slots[i].inputs_hash, ballot.inputs_hash);
        }
    }

    #[test]
    fn witness_serialization_is_stable() {
        // The borsh encoding is the public-input serialization the circuit
        // commits to; two identical witnesses must encode identically.
        let a = BatchWitness::build(pid(), &[verified(5)], 2);
        let b = BatchWitness::build(pid(), &[verified(5)], 2);
        assert_eq!(borsh::to_vec(&a).unwrap(), borsh::to_vec(&b).unwrap());
    }

    #[test]
    fn batch_storage_keys_sort_by_seq() {
        let k1 = AggregatedBatch::storage_key(&pid(), 1);
        let k2 = AggregatedBatch::storage_key(&pid(), 2);
        let k10 = AggregatedBatch::storage_key(&pid(), 10);
        assert!(k1 < k2 && k2 < k10);
    }
}
