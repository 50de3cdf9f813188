//! Proof jobs as they travel between the master and its workers.

use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_interface::{BatchWitness, TransitionWitness};

/// Monotonic job identifier, unique for the life of the master.
pub type JobId = u64;

/// Which circuit a job belongs to. Workers advertise the kinds they can
/// prove and lease only those.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum JobKind {
    /// Aggregation of a padded ballot batch.
    Aggregation,
    /// State transition over an already-aggregated batch.
    StateTransition,
}

/// The witness a job proves.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum JobPayload {
    Aggregation(BatchWitness),
    Transition(TransitionWitness),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Aggregation(_) => JobKind::Aggregation,
            JobPayload::Transition(_) => JobKind::StateTransition,
        }
    }
}

/// A leasable unit of proving work.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProofJob {
    pub id: JobId,
    pub payload: JobPayload,
}

impl ProofJob {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}
