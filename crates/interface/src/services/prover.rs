//! The opaque proof-system seam.

use crate::ballot::Ballot;
use crate::batch::{BatchWitness, TransitionWitness};
use crate::error::SequencerError;

/// Proof generation and verification, treated as an opaque collaborator.
///
/// Methods are synchronous and CPU-bound; callers run them on a dedicated
/// pool (the local prover uses rayon) or ship them to remote workers.
/// Proofs are byte blobs paired with typed public inputs; the core never
/// inspects them.
pub trait ProofBackend: Send + Sync {
    /// Checks a ballot's well-formedness proof against its public inputs.
    fn verify_ballot_proof(&self, ballot: &Ballot) -> Result<(), SequencerError>;

    /// Produces the aggregation proof for a padded batch witness.
    fn prove_aggregation(&self, witness: &BatchWitness) -> Result<Vec<u8>, SequencerError>;

    /// Checks an aggregation proof against its witness.
    fn verify_aggregation(
        &self,
        witness: &BatchWitness,
        proof: &[u8],
    ) -> Result<(), SequencerError>;

    /// Produces the state-transition proof for a state delta.
    fn prove_transition(&self, witness: &TransitionWitness) -> Result<Vec<u8>, SequencerError>;

    /// Checks a state-transition proof against its witness.
    fn verify_transition(
        &self,
        witness: &TransitionWitness,
        proof: &[u8],
    ) -> Result<(), SequencerError>;
}
