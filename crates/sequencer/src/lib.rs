//! The ballot pipeline.
//!
//! Ballots enter through [`Ingress::push`], wait in the pending queue
//! until the [`verifier`] stage checks their signature, census proof and
//! ballot proof, then queue as verified until the [`aggregator`] closes a
//! batch, proves it, applies it to the election state and settles the new
//! root on chain. When a process's voting period ends, the [`finalizer`]
//! decrypts the accumulators and publishes the result.
//!
//! Exclusion locks (vote id and per-process address) are held from ingress
//! to settlement or failure; see [`queue`] for the exact lifecycle.

pub mod aggregator;
pub mod finalizer;
pub mod queue;
pub mod verifier;

use std::sync::Arc;

use scrutiny_chain::ProcessStore;
use scrutiny_interface::{Ballot, PushResult};

pub use aggregator::Aggregator;
pub use finalizer::{ElectionKeyStore, Finalizer};
pub use queue::{BallotQueue, QueueStats, QueuedVerified};
pub use verifier::{compute_inputs_hash, BallotVerifier};

/// The ballot submission API. Maps every internal condition onto the
/// stable `Accepted | Rejected(reason) | Busy` surface.
#[derive(Clone)]
pub struct Ingress {
    queue: Arc<BallotQueue>,
    processes: ProcessStore,
}

impl Ingress {
    pub fn new(queue: Arc<BallotQueue>, processes: ProcessStore) -> Self {
        Self { queue, processes }
    }

    /// Submits a ballot. Never blocks: the heavy checks happen later in
    /// the verification stage; ingress only enforces the lock and
    /// backpressure rules.
    pub fn push(&self, ballot: Ballot) -> PushResult {
        let accepting = self
            .processes
            .get(&ballot.process_id)
            .map(|process| process.status.accepts_ballots())
            .unwrap_or(false);
        let result = self.queue.push(ballot, accepting);
        BallotQueue::to_push_result(result)
    }
}
