//! An in-memory chain for tests and local development.
//!
//! [`MockChain`] is the shared "chain state": a process registry, a log of
//! submitted transactions and a per-endpoint error script. [`MockRpc`]
//! implements [`ChainRpc`] over it, so the whole adapter stack (pool,
//! transaction manager, monitor) runs unchanged in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scrutiny_interface::services::chain::{ProcessEvent, TxHash};
use scrutiny_interface::{Process, ProcessId, ProcessStatus, SequencerError};
use sha2::{Digest, Sha256};

use crate::rpc::{ChainRpc, TxPayload};

#[derive(Default)]
struct ChainState {
    processes: HashMap<ProcessId, Process>,
    events: Vec<ProcessEvent>,
    head_block: u64,
    submitted: Vec<TxPayload>,
    confirmations: HashMap<TxHash, u64>,
    next_nonce: u64,
    /// Errors the next send calls pop, in order.
    send_errors: VecDeque<SequencerError>,
}

/// Shared in-memory chain state. Clone-cheap.
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process and emits its creation event.
    pub fn create_process(&self, process: Process) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        state.head_block += 1;
        let block = state.head_block;
        state.processes.insert(process.id, process.clone());
        state.events.push(ProcessEvent { process, block });
    }

    /// Updates a process status directly (as the registry owner would).
    pub fn set_status(&self, id: &ProcessId, status: ProcessStatus) {
        let mut state = self.state.lock().expect("mock chain lock poisoned");
        if let Some(process) = state.processes.get_mut(id) {
            process.status = status;
        }
    }

    /// Every payload submitted so far.
    pub fn submitted(&self) -> Vec<TxPayload> {
        self.state
            .lock()
            .expect("mock chain lock poisoned")
            .submitted
            .clone()
    }

    /// Scripts an error for an upcoming send.
    pub fn push_send_error(&self, error: SequencerError) {
        self.state
            .lock()
            .expect("mock chain lock poisoned")
            .send_errors
            .push_back(error);
    }

    /// The process as the chain currently sees it.
    pub fn process(&self, id: &ProcessId) -> Option<Process> {
        self.state
            .lock()
            .expect("mock chain lock poisoned")
            .processes
            .get(id)
            .cloned()
    }

    fn apply_payload(state: &mut ChainState, payload: &TxPayload) {
        match payload {
            TxPayload::StateTransition(t) => {
                if let Some(process) = state.processes.get_mut(&t.process_id) {
                    process.state_root = t.new_root;
                    process.voter_count += t.voters_added;
                    process.overwrite_count += t.overwrites;
                }
            }
            TxPayload::Results {
                process_id,
                results,
                ..
            } => {
                if let Some(process) = state.processes.get_mut(process_id) {
                    process.result = Some(results.clone());
                    process.status = ProcessStatus::Results;
                }
            }
            TxPayload::SetStatus { process_id, status } => {
                if let Some(process) = state.processes.get_mut(process_id) {
                    process.status = *status;
                }
            }
        }
    }
}

/// One endpoint view of a [`MockChain`].
#[derive(Clone)]
pub struct MockRpc {
    chain: MockChain,
}

impl MockRpc {
    pub fn new(chain: MockChain) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn process(&self, id: &ProcessId) -> Result<Process, SequencerError> {
        self.chain
            .process(id)
            .ok_or_else(|| SequencerError::NotFound(format!("process {id}")))
    }

    async fn new_process_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<ProcessEvent>, u64), SequencerError> {
        let state = self.chain.state.lock().expect("mock chain lock poisoned");
        let events: Vec<ProcessEvent> = state
            .events
            .iter()
            .filter(|e| e.block > from_block)
            .cloned()
            .collect();
        Ok((events, state.head_block))
    }

    async fn next_nonce(&self) -> Result<u64, SequencerError> {
        let state = self.chain.state.lock().expect("mock chain lock poisoned");
        Ok(state.next_nonce)
    }

    async fn estimate_gas(&self, _payload: &TxPayload) -> Result<u64, SequencerError> {
        Ok(21_000)
    }

    async fn send(
        &self,
        payload: &TxPayload,
        nonce: u64,
        _gas_limit: u64,
    ) -> Result<TxHash, SequencerError> {
        let mut state = self.chain.state.lock().expect("mock chain lock poisoned");
        if let Some(error) = state.send_errors.pop_front() {
            return Err(error);
        }
        if nonce != state.next_nonce {
            return Err(SequencerError::PermanentTx(format!(
                "nonce too {}: expected {}, got {nonce}",
                if nonce < state.next_nonce { "low" } else { "high" },
                state.next_nonce
            )));
        }
        state.next_nonce += 1;
        state.head_block += 1;

        let mut hasher = Sha256::new();
        hasher.update(
            borsh::to_vec(payload).map_err(|e| SequencerError::Internal(e.to_string()))?,
        );
        hasher.update(nonce.to_be_bytes());
        let hash: TxHash = hasher.finalize().into();

        MockChain::apply_payload(&mut state, payload);
        state.submitted.push(payload.clone());
        // The mock confirms instantly and deeply.
        state.confirmations.insert(hash, u64::MAX);
        Ok(hash)
    }

    async fn confirmations(&self, tx: TxHash) -> Result<u64, SequencerError> {
        let state = self.chain.state.lock().expect("mock chain lock poisoned");
        Ok(state.confirmations.get(&tx).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use scrutiny_interface::services::chain::ChainClient;
    use scrutiny_interface::{BallotMode, CensusInfo, CensusOrigin};

    use crate::pool::RpcPool;
    use crate::txmgr::ChainAdapter;

    use super::*;

    pub(crate) fn test_process(nonce: u64) -> Process {
        Process {
            id: ProcessId {
                chain_id: 1,
                organization: [4u8; 20],
                nonce,
            },
            status: ProcessStatus::Ready,
            ballot_mode: BallotMode {
                num_fields: 1,
                max_value: 100,
                min_value: 0,
                max_value_sum: 100,
                min_value_sum: 0,
                unique_values: false,
                cost_exponent: 1,
                cost_from_weight: false,
            },
            census: CensusInfo {
                origin: CensusOrigin::MerkleTreeOffchainStatic,
                root: vec![9u8; 32],
                uri: "census://registry/1".to_string(),
                max_voters: 1000,
            },
            encryption_key: [0u8; 32],
            start_time: 0,
            duration: 3600,
            state_root: [0u8; 32],
            voter_count: 0,
            overwrite_count: 0,
            result: None,
            organization_id: [4u8; 20],
            metadata_uri: String::new(),
        }
    }

    fn adapter(chain: &MockChain, endpoints: usize) -> ChainAdapter<MockRpc> {
        let rpcs: Vec<MockRpc> = (0..endpoints).map(|_| MockRpc::new(chain.clone())).collect();
        let pool = Arc::new(RpcPool::new(rpcs, 3, Duration::from_secs(60)));
        ChainAdapter::new(pool, 120, Duration::from_millis(1), 1)
    }

    #[tokio::test]
    async fn submit_and_confirm_state_transition() {
        let chain = MockChain::new();
        let process = test_process(1);
        chain.create_process(process.clone());
        let adapter = adapter(&chain, 2);

        let transition = scrutiny_interface::StateTransition {
            process_id: process.id,
            batch_seq: 0,
            old_root: [0u8; 32],
            new_root: [1u8; 32],
            add_delta: vec![],
            sub_delta: vec![],
            voters_added: 2,
            overwrites: 0,
            proof: vec![1],
        };
        let tx = adapter.submit_state_transition(&transition).await.unwrap();
        adapter.wait_confirmation(tx).await.unwrap();

        let on_chain = adapter.process(&process.id).await.unwrap();
        assert_eq!(on_chain.state_root, [1u8; 32]);
        assert_eq!(on_chain.voter_count, 2);
    }

    #[tokio::test]
    async fn nonces_advance_across_submissions() {
        let chain = MockChain::new();
        let process = test_process(1);
        chain.create_process(process.clone());
        let adapter = adapter(&chain, 1);

        for i in 0..3u64 {
            adapter
                .set_process_status(&process.id, ProcessStatus::Paused)
                .await
                .unwrap_or_else(|e| panic!("submission {i} failed: {e}"));
        }
        assert_eq!(chain.submitted().len(), 3);
    }

    #[tokio::test]
    async fn transient_send_errors_rotate_and_succeed() {
        let chain = MockChain::new();
        let process = test_process(1);
        chain.create_process(process.clone());
        let adapter = adapter(&chain, 3);

        chain.push_send_error(SequencerError::TransientTx("socket hangup".to_string()));
        let tx = adapter
            .set_process_status(&process.id, ProcessStatus::Ended)
            .await
            .unwrap();
        adapter.wait_confirmation(tx).await.unwrap();
        assert_eq!(chain.process(&process.id).unwrap().status, ProcessStatus::Ended);
    }

    #[tokio::test]
    async fn revert_is_returned_as_permanent() {
        let chain = MockChain::new();
        let process = test_process(1);
        chain.create_process(process.clone());
        let adapter = adapter(&chain, 3);

        chain.push_send_error(SequencerError::PermanentTx(
            "execution reverted".to_string(),
        ));
        let result = adapter
            .set_process_status(&process.id, ProcessStatus::Ended)
            .await;
        assert!(matches!(result, Err(SequencerError::PermanentTx(_))));
        assert!(chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn events_are_delivered_once_per_cursor() {
        let chain = MockChain::new();
        chain.create_process(test_process(1));
        chain.create_process(test_process(2));
        let adapter = adapter(&chain, 1);

        let (events, last) = adapter.new_process_events(0).await.unwrap();
        assert_eq!(events.len(), 2);
        let (more, _) = adapter.new_process_events(last).await.unwrap();
        assert!(more.is_empty());
    }
}
