//! A deterministic stand-in for the real proof system.
//!
//! The concrete circuits and their trusted setup live outside the core;
//! everything here treats proofs as opaque blobs behind the
//! [`ProofBackend`] trait. This mock derives "proofs" by hashing the typed
//! witness, which preserves the one property the pipeline relies on: a
//! proof verifies if and only if it was produced for exactly that witness.

use std::sync::atomic::{AtomicBool, Ordering};

use scrutiny_interface::services::prover::ProofBackend;
use scrutiny_interface::{Ballot, BatchWitness, SequencerError, TransitionWitness};
use sha2::{Digest, Sha256};

const BALLOT_TAG: &[u8] = b"ballot-proof";
const AGGREGATION_TAG: &[u8] = b"aggregation-proof";
const TRANSITION_TAG: &[u8] = b"transition-proof";

/// Deterministic hash-based proof backend. Also used by tests to inject
/// proving failures.
#[derive(Default)]
pub struct MockProofBackend {
    fail_proving: AtomicBool,
    reject_ballots: AtomicBool,
}

impl MockProofBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent proving call fail, until reset.
    pub fn set_fail_proving(&self, fail: bool) {
        self.fail_proving.store(fail, Ordering::Release);
    }

    /// Makes every subsequent ballot verification fail, until reset.
    pub fn set_reject_ballots(&self, reject: bool) {
        self.reject_ballots.store(reject, Ordering::Release);
    }

    fn digest(tag: &[u8], bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        hasher.update(bytes);
        hasher.finalize().to_vec()
    }
}

/// The ballot proof a submitter would attach, for fixtures and tests.
pub fn mock_ballot_proof(ballot_without_proof: &Ballot) -> Vec<u8> {
    let mut stripped = ballot_without_proof.clone();
    stripped.ballot_proof = Default::default();
    let bytes = borsh::to_vec(&stripped).expect("ballot serialization is infallible");
    MockProofBackend::digest(BALLOT_TAG, &bytes)
}

impl ProofBackend for MockProofBackend {
    fn verify_ballot_proof(&self, ballot: &Ballot) -> Result<(), SequencerError> {
        if self.reject_ballots.load(Ordering::Acquire) {
            return Err(SequencerError::InvalidProof("ballot proof rejected".to_string()));
        }
        let expected = mock_ballot_proof(ballot);
        if ballot.ballot_proof.proof == expected {
            Ok(())
        } else {
            Err(SequencerError::InvalidProof(
                "ballot proof does not match its inputs".to_string(),
            ))
        }
    }

    fn prove_aggregation(&self, witness: &BatchWitness) -> Result<Vec<u8>, SequencerError> {
        if self.fail_proving.load(Ordering::Acquire) {
            return Err(SequencerError::Internal("prover offline".to_string()));
        }
        let bytes = borsh::to_vec(witness).map_err(|e| SequencerError::Internal(e.to_string()))?;
        Ok(Self::digest(AGGREGATION_TAG, &bytes))
    }

    fn verify_aggregation(
        &self,
        witness: &BatchWitness,
        proof: &[u8],
    ) -> Result<(), SequencerError> {
        let bytes = borsh::to_vec(witness).map_err(|e| SequencerError::Internal(e.to_string()))?;
        if Self::digest(AGGREGATION_TAG, &bytes) == proof {
            Ok(())
        } else {
            Err(SequencerError::InvalidProof("aggregation proof".to_string()))
        }
    }

    fn prove_transition(&self, witness: &TransitionWitness) -> Result<Vec<u8>, SequencerError> {
        if self.fail_proving.load(Ordering::Acquire) {
            return Err(SequencerError::Internal("prover offline".to_string()));
        }
        let bytes = borsh::to_vec(witness).map_err(|e| SequencerError::Internal(e.to_string()))?;
        Ok(Self::digest(TRANSITION_TAG, &bytes))
    }

    fn verify_transition(
        &self,
        witness: &TransitionWitness,
        proof: &[u8],
    ) -> Result<(), SequencerError> {
        let bytes = borsh::to_vec(witness).map_err(|e| SequencerError::Internal(e.to_string()))?;
        if Self::digest(TRANSITION_TAG, &bytes) == proof {
            Ok(())
        } else {
            Err(SequencerError::InvalidProof("transition proof".to_string()))
        }
    }
}
