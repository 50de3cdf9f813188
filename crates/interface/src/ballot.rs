//! Ballots through their pipeline states.

use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_crypto::eth::keccak256;
use serde::{Deserialize, Serialize};

use crate::census::CensusProof;
use crate::process::ProcessId;
use crate::{Address, VoteId};

/// One encrypted ballot field: the 64-byte encoding of an ElGamal
/// ciphertext. Serialized as hex on the wire; serde has no built-in support
/// for arrays this long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct EncryptedField(pub [u8; 64]);

impl EncryptedField {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl From<[u8; 64]> for EncryptedField {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EncryptedField {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for EncryptedField {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::hex_string::HexString(self.0.as_slice()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EncryptedField {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = crate::hex_string::hex_string_serde::deserialize(deserializer)?;
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("encrypted field must be 64 bytes"))?;
        Ok(Self(array))
    }
}

/// An opaque zero-knowledge proof together with its typed public inputs.
/// The core never looks inside the blob; the backend does.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct BallotProof {
    pub proof: Vec<u8>,
    /// 32-byte big-endian field elements, in circuit order.
    pub public_inputs: Vec<[u8; 32]>,
}

/// A raw ballot submission, exactly as it enters the pending queue.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Ballot {
    pub process_id: ProcessId,
    pub address: Address,
    pub vote_id: VoteId,
    /// One ElGamal ciphertext per ballot field.
    pub ciphertexts: Vec<EncryptedField>,
    pub ballot_proof: BallotProof,
    pub census_proof: CensusProof,
    /// 65-byte recoverable ECDSA signature over [`Ballot::signed_digest`].
    pub signature: Vec<u8>,
}

impl Ballot {
    /// Derives the vote id: the keccak-256 of the ballot fields, the
    /// address and the process id. Anything that changes the ballot changes
    /// its exclusion token.
    pub fn compute_vote_id(
        process_id: &ProcessId,
        address: &Address,
        ciphertexts: &[EncryptedField],
    ) -> VoteId {
        let mut data = Vec::with_capacity(32 + 20 + ciphertexts.len() * 64);
        data.extend_from_slice(&process_id.to_bytes());
        data.extend_from_slice(address);
        for ct in ciphertexts {
            data.extend_from_slice(ct.as_ref());
        }
        keccak256(&data)
    }

    /// The digest the voter signs: keccak-256 of the vote id.
    pub fn signed_digest(&self) -> [u8; 32] {
        keccak256(self.vote_id)
    }

    /// Structural sanity checks applied before any cryptography: field
    /// count, id validity, signature length.
    pub fn check_shape(&self, expected_fields: usize) -> Result<(), String> {
        if !self.process_id.is_valid() {
            return Err("invalid process id".to_string());
        }
        if self.ciphertexts.len() != expected_fields {
            return Err(format!(
                "expected {expected_fields} ballot fields, got {}",
                self.ciphertexts.len()
            ));
        }
        if self.signature.len() != 65 {
            return Err(format!(
                "signature must be 65 bytes, got {}",
                self.signature.len()
            ));
        }
        if self.census_proof.address != self.address {
            return Err("census proof address differs from ballot address".to_string());
        }
        Ok(())
    }
}

/// A ballot whose proofs and signature have been checked, carrying the
/// artifacts the aggregation circuit needs.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct VerifiedBallot {
    pub process_id: ProcessId,
    pub address: Address,
    pub vote_id: VoteId,
    /// Poseidon digest binding the ballot to its process parameters.
    pub inputs_hash: [u8; 32],
    /// Handle to the recursively-verifiable inner proof.
    pub inner_proof: Vec<u8>,
    /// Ciphertexts in the reduced twisted-Edwards form the aggregation
    /// circuit consumes.
    pub ciphertexts: Vec<EncryptedField>,
    /// Census weight the ballot was admitted with.
    pub weight: u64,
}
