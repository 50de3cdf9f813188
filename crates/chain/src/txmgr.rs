//! Transaction submission with replay-safe nonces.
//!
//! The manager owns the signer's next nonce under a lock, multiplies gas
//! estimates by the configured margin, and remembers what it sent so a
//! transaction that fails to confirm can be replaced (same nonce, bumped
//! gas). Errors keep their permanent/transient classification all the way
//! up: a revert is final, anything else may be retried against a rotated
//! endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scrutiny_interface::services::chain::{ChainClient, ProcessEvent, TxHash};
use scrutiny_interface::{Process, ProcessId, ProcessStatus, SequencerError, StateTransition};
use tokio::sync::Mutex;

use crate::pool::RpcPool;
use crate::rpc::{ChainRpc, TxPayload};

/// Gas bump applied when replacing a stuck transaction, in percent.
const REPLACEMENT_GAS_BUMP_PERCENT: u64 = 110;

/// How many confirmation polls happen before a replacement is attempted.
const POLLS_BEFORE_REPLACEMENT: u32 = 10;

/// Total confirmation polls before giving up.
const MAX_CONFIRMATION_POLLS: u32 = 30;

struct PendingTx {
    payload: TxPayload,
    nonce: u64,
    gas_limit: u64,
    replaced: bool,
}

/// Nonce management and submission over an endpoint pool.
pub struct TxManager<R: ChainRpc> {
    pool: Arc<RpcPool<R>>,
    next_nonce: Mutex<Option<u64>>,
    pending: Mutex<HashMap<TxHash, PendingTx>>,
    gas_multiplier_percent: u64,
    retry_sleep: Duration,
    confirmations: u64,
}

impl<R: ChainRpc> TxManager<R> {
    pub fn new(
        pool: Arc<RpcPool<R>>,
        gas_multiplier_percent: u64,
        retry_sleep: Duration,
        confirmations: u64,
    ) -> Self {
        Self {
            pool,
            next_nonce: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            gas_multiplier_percent,
            retry_sleep,
            confirmations,
        }
    }

    /// Builds, signs and broadcasts a payload. The nonce lock is held for
    /// the whole submission so concurrent writes never race a nonce.
    pub async fn submit(&self, payload: TxPayload) -> Result<TxHash, SequencerError> {
        let mut nonce_guard = self.next_nonce.lock().await;
        let nonce = match *nonce_guard {
            Some(nonce) => nonce,
            None => {
                self.pool
                    .execute(|endpoint| async move { endpoint.next_nonce().await })
                    .await?
            }
        };

        let estimate = {
            let payload = payload.clone();
            self.pool
                .execute(move |endpoint| {
                    let payload = payload.clone();
                    async move { endpoint.estimate_gas(&payload).await }
                })
                .await?
        };
        let gas_limit = estimate.saturating_mul(self.gas_multiplier_percent) / 100;

        let send_result = {
            let payload = payload.clone();
            self.pool
                .execute(move |endpoint| {
                    let payload = payload.clone();
                    async move { endpoint.send(&payload, nonce, gas_limit).await }
                })
                .await
        };

        match send_result {
            Ok(hash) => {
                *nonce_guard = Some(nonce + 1);
                tracing::info!(
                    process = %payload.process_id(),
                    tx = %hex::encode(hash),
                    nonce,
                    "transaction broadcast"
                );
                self.pending.lock().await.insert(
                    hash,
                    PendingTx {
                        payload,
                        nonce,
                        gas_limit,
                        replaced: false,
                    },
                );
                Ok(hash)
            }
            Err(e) => {
                // Whatever happened, the chain's view of our nonce is now
                // uncertain; refetch it on the next submission.
                *nonce_guard = None;
                Err(e)
            }
        }
    }

    /// Waits until `tx` has the configured confirmations. After a while
    /// without any, the transaction is replaced once (same nonce, higher
    /// gas); if that also stalls the caller gets a transient error.
    pub async fn wait_confirmation(&self, tx: TxHash) -> Result<(), SequencerError> {
        let mut current = tx;
        let mut polls = 0u32;
        loop {
            let confirmations = self
                .pool
                .execute(|endpoint| async move { endpoint.confirmations(current).await })
                .await?;
            if confirmations >= self.confirmations {
                self.pending.lock().await.remove(&current);
                return Ok(());
            }

            polls += 1;
            if polls >= MAX_CONFIRMATION_POLLS {
                return Err(SequencerError::TransientTx(format!(
                    "transaction 0x{} unconfirmed after {polls} polls",
                    hex::encode(current)
                )));
            }
            if polls == POLLS_BEFORE_REPLACEMENT && confirmations == 0 {
                if let Some(replacement) = self.replace(current).await? {
                    tracing::warn!(
                        old = %hex::encode(current),
                        new = %hex::encode(replacement),
                        "replaced stuck transaction"
                    );
                    current = replacement;
                }
            }
            tokio::time::sleep(self.retry_sleep).await;
        }
    }

    /// Re-broadcasts a pending transaction with bumped gas and the same
    /// nonce. Returns `None` if the transaction is unknown or was already
    /// replaced.
    async fn replace(&self, tx: TxHash) -> Result<Option<TxHash>, SequencerError> {
        let (payload, nonce, gas_limit) = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(&tx) else {
                return Ok(None);
            };
            if entry.replaced {
                return Ok(None);
            }
            entry.replaced = true;
            (
                entry.payload.clone(),
                entry.nonce,
                entry.gas_limit.saturating_mul(REPLACEMENT_GAS_BUMP_PERCENT) / 100,
            )
        };

        let send_result = {
            let payload = payload.clone();
            self.pool
                .execute(move |endpoint| {
                    let payload = payload.clone();
                    async move { endpoint.send(&payload, nonce, gas_limit).await }
                })
                .await
        };
        match send_result {
            Ok(hash) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&tx);
                pending.insert(
                    hash,
                    PendingTx {
                        payload,
                        nonce,
                        gas_limit,
                        replaced: true,
                    },
                );
                Ok(Some(hash))
            }
            Err(SequencerError::PermanentTx(e)) => Err(SequencerError::PermanentTx(e)),
            Err(e) => {
                tracing::warn!(error = %e, "replacement broadcast failed");
                Ok(None)
            }
        }
    }
}

/// The [`ChainClient`] the rest of the node talks to: reads go through the
/// pool directly, writes through the transaction manager.
pub struct ChainAdapter<R: ChainRpc> {
    pool: Arc<RpcPool<R>>,
    txmgr: TxManager<R>,
}

impl<R: ChainRpc> ChainAdapter<R> {
    pub fn new(
        pool: Arc<RpcPool<R>>,
        gas_multiplier_percent: u64,
        retry_sleep: Duration,
        confirmations: u64,
    ) -> Self {
        let txmgr = TxManager::new(
            pool.clone(),
            gas_multiplier_percent,
            retry_sleep,
            confirmations,
        );
        Self { pool, txmgr }
    }
}

#[async_trait]
impl<R: ChainRpc + 'static> ChainClient for ChainAdapter<R> {
    async fn process(&self, id: &ProcessId) -> Result<Process, SequencerError> {
        let id = *id;
        self.pool
            .execute(move |endpoint| async move { endpoint.process(&id).await })
            .await
    }

    async fn new_process_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<ProcessEvent>, u64), SequencerError> {
        self.pool
            .execute(move |endpoint| async move { endpoint.new_process_events(from_block).await })
            .await
    }

    async fn submit_state_transition(
        &self,
        transition: &StateTransition,
    ) -> Result<TxHash, SequencerError> {
        self.txmgr
            .submit(TxPayload::StateTransition(transition.clone()))
            .await
    }

    async fn submit_results(
        &self,
        id: &ProcessId,
        results: &[u64],
        proof: &[u8],
    ) -> Result<TxHash, SequencerError> {
        self.txmgr
            .submit(TxPayload::Results {
                process_id: *id,
                results: results.to_vec(),
                proof: proof.to_vec(),
            })
            .await
    }

    async fn set_process_status(
        &self,
        id: &ProcessId,
        status: ProcessStatus,
    ) -> Result<TxHash, SequencerError> {
        self.txmgr
            .submit(TxPayload::SetStatus {
                process_id: *id,
                status,
            })
            .await
    }

    async fn wait_confirmation(&self, tx: TxHash) -> Result<(), SequencerError> {
        self.txmgr.wait_confirmation(tx).await
    }
}
