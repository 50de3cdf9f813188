//! Census management for the sequencer.
//!
//! A census is the authorized voter set of one election: either a
//! persistent incremental Merkle tree of `(address, weight)` leaves
//! ([`tree`], managed by [`CensusDb`]), or a credential service provider
//! key whose signatures certify eligibility ([`verifier`]). Both produce
//! the same [`CensusProof`] wire shape, so the ballot pipeline verifies
//! them through one registry.
//!
//! [`CensusProof`]: scrutiny_interface::CensusProof

pub mod db;
pub mod tree;
pub mod verifier;

pub use db::{CensusDb, CensusDump, CensusDumpEntry, CensusEvent, CensusRef, RefKey};
pub use tree::{Prepared, Tree, TreeError, TreeProof, WriteMode, DEPTH};
pub use verifier::{
    csp_message, CensusProofVerifier, CspSigner, MerkleVerifier, VerifierRegistry, VerifyError,
};
