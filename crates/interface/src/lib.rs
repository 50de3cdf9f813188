//! Core domain model of the scrutiny sequencer.
//!
//! This crate defines the types every other crate speaks: election
//! processes, ballots in their successive states, census proofs, state
//! transitions, the error taxonomy and the service traits at the system's
//! external seams (chain access, proof generation). It carries no business
//! logic beyond validation and encoding.

pub mod ballot;
pub mod batch;
pub mod census;
pub mod config;
pub mod error;
pub mod hex_string;
pub mod process;
pub mod services;

pub use ballot::{Ballot, BallotProof, EncryptedField, VerifiedBallot};
pub use batch::{AggregatedBatch, BatchWitness, SlotWitness, StateTransition, TransitionWitness};
pub use census::{CensusProof, normalize_census_key, pack_census_value, unpack_census_value};
pub use config::SequencerConfig;
pub use error::{PushResult, SequencerError};
pub use process::{BallotMode, CensusInfo, CensusOrigin, Process, ProcessId, ProcessStatus};

/// A 20-byte account address.
pub type Address = [u8; 20];
/// A 32-byte ballot exclusion token, derived from the ballot contents.
pub type VoteId = [u8; 32];
/// A 32-byte Merkle root.
pub type Root = [u8; 32];
