//! Cryptographic building blocks for the sequencer.
//!
//! Everything here is named by role, not by circuit: Poseidon hashing over
//! the BN254 scalar field ([`poseidon`]), exponential ElGamal on BabyJubJub
//! with homomorphic accumulation ([`elgamal`]), EdDSA over arkworks
//! twisted-Edwards curves for credential service providers ([`eddsa`]), and
//! Ethereum-style ECDSA recovery for ballot signatures ([`eth`]).

pub mod eddsa;
pub mod elgamal;
pub mod eth;
pub mod poseidon;

use thiserror::Error;

/// Failures from the cryptographic layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A byte string did not decode into a curve point or field element.
    #[error("malformed encoding: {0}")]
    Malformed(String),
    /// A signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,
    /// A discrete-log search exhausted its bound.
    #[error("plaintext not found within bound {0}")]
    Decryption(u64),
    /// Hash input shape not supported by the permutation.
    #[error("hash: {0}")]
    Hash(String),
}
