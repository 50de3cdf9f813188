//! The narrow chain interface the core depends on.

use async_trait::async_trait;

use crate::batch::StateTransition;
use crate::error::SequencerError;
use crate::process::{Process, ProcessId, ProcessStatus};

/// Hash of a submitted chain transaction.
pub type TxHash = [u8; 32];

/// A process-registry event observed on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEvent {
    /// The process as declared on chain at creation time.
    pub process: Process,
    /// Block the event was emitted in.
    pub block: u64,
}

/// Read and write access to the on-chain process registry.
///
/// Every write returns a transaction hash; success means confirmation with
/// the configured number of blocks, which callers await through
/// [`ChainClient::wait_confirmation`]. Submission failures are classified:
/// [`SequencerError::PermanentTx`] must not be retried,
/// [`SequencerError::TransientTx`] should be retried (the pool rotates the
/// endpoint underneath).
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Reads a process descriptor.
    async fn process(&self, id: &ProcessId) -> Result<Process, SequencerError>;

    /// Returns process-creation events after `from_block`, along with the
    /// last block scanned.
    async fn new_process_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<ProcessEvent>, u64), SequencerError>;

    /// Submits a state transition for confirmation.
    async fn submit_state_transition(
        &self,
        transition: &StateTransition,
    ) -> Result<TxHash, SequencerError>;

    /// Submits final per-field results with their proof.
    async fn submit_results(
        &self,
        id: &ProcessId,
        results: &[u64],
        proof: &[u8],
    ) -> Result<TxHash, SequencerError>;

    /// Updates a process status on chain.
    async fn set_process_status(
        &self,
        id: &ProcessId,
        status: ProcessStatus,
    ) -> Result<TxHash, SequencerError>;

    /// Resolves once `tx` has the configured number of confirmations.
    async fn wait_confirmation(&self, tx: TxHash) -> Result<(), SequencerError>;
}
