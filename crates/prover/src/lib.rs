//! Proof generation orchestration.
//!
//! The sequencer (the single master) queues proving work on a [`JobBoard`];
//! workers lease jobs, prove them and submit results. Remote workers speak
//! to the board through the node's transport layer; the [`LocalProver`]
//! drains the same board in-process when no workers are configured. The
//! actual proof system sits behind
//! [`ProofBackend`](scrutiny_interface::services::prover::ProofBackend);
//! [`MockProofBackend`] is the deterministic stand-in used by tests.

pub mod backend;
pub mod board;
pub mod job;
pub mod local;

pub use backend::{mock_ballot_proof, MockProofBackend};
pub use board::{JobBoard, JobCompletion, WorkerStats};
pub use job::{JobId, JobKind, JobPayload, ProofJob};
pub use local::{LocalProver, LOCAL_WORKER_ADDRESS};
