//! The single-endpoint RPC surface the pool rotates over.

use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use scrutiny_interface::services::chain::{ProcessEvent, TxHash};
use scrutiny_interface::{Process, ProcessId, ProcessStatus, SequencerError, StateTransition};

/// A typed write payload, built once and signed/broadcast by an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TxPayload {
    StateTransition(StateTransition),
    Results {
        process_id: ProcessId,
        results: Vec<u64>,
        proof: Vec<u8>,
    },
    SetStatus {
        process_id: ProcessId,
        status: ProcessStatus,
    },
}

impl TxPayload {
    /// The process a payload settles against, for logging.
    pub fn process_id(&self) -> &ProcessId {
        match self {
            TxPayload::StateTransition(t) => &t.process_id,
            TxPayload::Results { process_id, .. } => process_id,
            TxPayload::SetStatus { process_id, .. } => process_id,
        }
    }
}

/// One RPC endpoint. Implementations classify their failures: a revert is
/// [`SequencerError::PermanentTx`], connectivity trouble is
/// [`SequencerError::TransientTx`]. The pool reacts differently to each.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Reads a process descriptor from the registry contract.
    async fn process(&self, id: &ProcessId) -> Result<Process, SequencerError>;

    /// Fetches process-creation events after `from_block`; returns the
    /// events and the last scanned block.
    async fn new_process_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<ProcessEvent>, u64), SequencerError>;

    /// The signer's next account nonce according to this endpoint.
    async fn next_nonce(&self) -> Result<u64, SequencerError>;

    /// Gas estimate for a payload.
    async fn estimate_gas(&self, payload: &TxPayload) -> Result<u64, SequencerError>;

    /// Signs and broadcasts, returning the transaction hash.
    async fn send(
        &self,
        payload: &TxPayload,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<TxHash, SequencerError>;

    /// Confirmations a transaction has accumulated; zero if unseen.
    async fn confirmations(&self, tx: TxHash) -> Result<u64, SequencerError>;
}
