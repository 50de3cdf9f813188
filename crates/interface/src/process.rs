//! Election process descriptors and identifiers.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::error::SequencerError;
use crate::{Address, Root};

/// A 32-byte election identifier: chain id, organization address and a
/// per-organization nonce, with 4 reserved bytes of padding. Immutable, and
/// the primary key of all per-election state.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct ProcessId {
    /// The chain this election settles on. Must be non-zero.
    pub chain_id: u32,
    /// The organization that sponsors the election. Must be non-zero.
    pub organization: Address,
    /// Distinguishes elections of the same organization.
    pub nonce: u64,
}

impl ProcessId {
    pub const BYTE_LEN: usize = 32;

    /// Canonical 32-byte encoding: big-endian chain id, address, big-endian
    /// nonce, 4 zero bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..4].copy_from_slice(&self.chain_id.to_be_bytes());
        out[4..24].copy_from_slice(&self.organization);
        out[24..32].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SequencerError> {
        if bytes.len() != Self::BYTE_LEN {
            return Err(SequencerError::Internal(format!(
                "process id must be {} bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            )));
        }
        let mut chain_id = [0u8; 4];
        chain_id.copy_from_slice(&bytes[..4]);
        let mut organization = [0u8; 20];
        organization.copy_from_slice(&bytes[4..24]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[24..32]);
        Ok(Self {
            chain_id: u32::from_be_bytes(chain_id),
            organization,
            nonce: u64::from_be_bytes(nonce),
        })
    }

    /// A process id is valid when its chain id and organization address are
    /// both non-zero.
    pub fn is_valid(&self) -> bool {
        self.chain_id != 0 && self.organization != [0u8; 20]
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

/// Lifecycle of an election process.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum ProcessStatus {
    /// Accepting ballots.
    Ready,
    /// Temporarily not accepting ballots.
    Paused,
    /// Voting period over; finalization pending.
    Ended,
    /// Aborted; never finalizes.
    Canceled,
    /// Finalized with a published result.
    Results,
}

impl ProcessStatus {
    /// Whether ballots for this process are admitted at ingress.
    pub fn accepts_ballots(&self) -> bool {
        matches!(self, ProcessStatus::Ready)
    }
}

/// The shape and bounds of a ballot for one election.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct BallotMode {
    /// Number of fields each ballot carries.
    pub num_fields: u32,
    /// Maximum value of a single field.
    pub max_value: u64,
    /// Minimum value of a single field.
    pub min_value: u64,
    /// Maximum sum across all fields.
    pub max_value_sum: u64,
    /// Minimum sum across all fields.
    pub min_value_sum: u64,
    /// Whether field values must be pairwise distinct.
    pub unique_values: bool,
    /// Cost exponent for quadratic-style voting.
    pub cost_exponent: u32,
    /// Whether the cost budget derives from the census weight.
    pub cost_from_weight: bool,
}

/// Which kind of census proof a process accepts, and how proofs against it
/// are verified. The tag is persisted, so variants must keep their
/// discriminants.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CensusOrigin {
    /// Merkle inclusion proof against a static off-chain census tree.
    MerkleTreeOffchainStatic,
    /// Credential service provider signing with EdDSA over BabyJubJub.
    CspEddsaBabyJubJub,
    /// Credential service provider signing with EdDSA over BabyJubJub,
    /// BN254-native deployment flavor.
    CspEddsaBn254,
    /// Credential service provider signing with EdDSA over the
    /// BLS12-377-embedded Edwards curve.
    CspEddsaBls12377,
}

impl CensusOrigin {
    /// The persisted wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            CensusOrigin::MerkleTreeOffchainStatic => 1,
            CensusOrigin::CspEddsaBabyJubJub => 2,
            CensusOrigin::CspEddsaBn254 => 3,
            CensusOrigin::CspEddsaBls12377 => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, SequencerError> {
        match tag {
            1 => Ok(CensusOrigin::MerkleTreeOffchainStatic),
            2 => Ok(CensusOrigin::CspEddsaBabyJubJub),
            3 => Ok(CensusOrigin::CspEddsaBn254),
            4 => Ok(CensusOrigin::CspEddsaBls12377),
            other => Err(SequencerError::Internal(format!(
                "unknown census origin tag {other}"
            ))),
        }
    }
}

/// The census a process validates eligibility against.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CensusInfo {
    pub origin: CensusOrigin,
    /// Census root: a Merkle root or a CSP public key hash, depending on
    /// the origin.
    pub root: Vec<u8>,
    /// Where the full census can be fetched from.
    pub uri: String,
    /// Upper bound on participating voters; feeds the decryption bound.
    pub max_voters: u64,
}

/// A full election descriptor, as read from the chain and tracked locally.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub status: ProcessStatus,
    pub ballot_mode: BallotMode,
    pub census: CensusInfo,
    /// Compressed ElGamal public key the ballots encrypt to.
    pub encryption_key: [u8; 32],
    /// Unix seconds.
    pub start_time: u64,
    /// Seconds from `start_time` to the end of the voting period.
    pub duration: u64,
    /// The most recently accepted state root.
    pub state_root: Root,
    /// Monotone non-decreasing.
    pub voter_count: u64,
    /// Monotone non-decreasing.
    pub overwrite_count: u64,
    /// Per-field sums; set only when `status == Results`.
    pub result: Option<Vec<u64>>,
    pub organization_id: Address,
    pub metadata_uri: String,
}

impl Process {
    /// The discrete-log search bound used at finalization.
    pub fn decryption_bound(&self) -> u64 {
        match self.ballot_mode.max_value.checked_mul(self.census.max_voters) {
            Some(0) | None => scrutiny_crypto::elgamal::DEFAULT_DECRYPT_BOUND,
            Some(bound) => bound,
        }
    }

    /// Unix second after which the voting period is over.
    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }

    /// Decodes the election's ElGamal public key.
    pub fn encryption_key(&self) -> Result<scrutiny_crypto::elgamal::PublicKey, SequencerError> {
        Ok(scrutiny_crypto::elgamal::PublicKey::from_bytes(
            &self.encryption_key,
        )?)
    }
}
