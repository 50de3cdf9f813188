//! Traits at the system's external seams.
//!
//! The sequencer core treats the chain and the proof system as
//! collaborators behind narrow interfaces: everything else in the
//! workspace is written against these traits, with real and mock
//! implementations provided elsewhere.

pub mod chain;
pub mod prover;

pub use chain::{ChainClient, ProcessEvent, TxHash};
pub use prover::ProofBackend;
