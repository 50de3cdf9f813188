//! Batch building and settlement.
//!
//! The aggregator ticks over every known process: it closes a batch when
//! enough verified ballots have queued (or the oldest has waited past the
//! max), dispatches the aggregation proof, applies the batch to the
//! election state, dispatches the transition proof, and submits the new
//! root on chain. Each step persists its output, so a restart resumes an
//! open batch wherever it stopped instead of redoing (or worse, re-applying)
//! work.
//!
//! State transitions are strictly serialized per process: one aggregator
//! task drives all batches, and a batch is settled or abandoned before the
//! next one for that process is opened.

use std::collections::HashMap;
use std::sync::Arc;

use scrutiny_chain::ProcessStore;
use scrutiny_db::Db;
use scrutiny_interface::config::{BatchConfig, ChainConfig};
use scrutiny_interface::services::chain::ChainClient;
use scrutiny_interface::{
    AggregatedBatch, BatchWitness, Process, ProcessId, ProcessStatus, SequencerError,
    StateTransition, TransitionWitness,
};
use scrutiny_prover::{JobBoard, JobPayload};
use scrutiny_state::ElectionState;

use crate::queue::BallotQueue;

/// The batch-driving worker. One instance per node.
pub struct Aggregator<C> {
    queue: Arc<BallotQueue>,
    processes: ProcessStore,
    board: Arc<JobBoard>,
    chain: Arc<C>,
    db: Db,
    batch_config: BatchConfig,
    chain_config: ChainConfig,
    states: tokio::sync::Mutex<HashMap<ProcessId, ElectionState>>,
}

impl<C: ChainClient> Aggregator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<BallotQueue>,
        processes: ProcessStore,
        board: Arc<JobBoard>,
        chain: Arc<C>,
        db: Db,
        batch_config: BatchConfig,
        chain_config: ChainConfig,
    ) -> Self {
        Self {
            queue,
            processes,
            board,
            chain,
            db,
            batch_config,
            chain_config,
            states: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One aggregator tick across all processes.
    pub async fn tick(&self) -> Result<(), SequencerError> {
        for process in self.processes.list()? {
            if let Err(e) = self.tick_process(&process).await {
                tracing::error!(process = %process.id, error = %e, "aggregation failed");
                self.pause_process(&process.id)?;
            }
        }
        Ok(())
    }

    async fn tick_process(&self, process: &Process) -> Result<(), SequencerError> {
        match process.status {
            ProcessStatus::Ready => {}
            ProcessStatus::Canceled | ProcessStatus::Ended | ProcessStatus::Results => {
                // The election is over: abandon whatever was in flight and
                // release its locks so the queues drain.
                for batch in self.queue.open_batches(Some(&process.id))? {
                    self.queue.mark_batch_failed(&batch)?;
                }
                return Ok(());
            }
            // A paused process keeps its open batches; recovery re-drives
            // them once it resumes.
            ProcessStatus::Paused => return Ok(()),
        }

        // Resume batches recovered from a previous run first: transitions
        // are serialized per process, so nothing new is closed until the
        // old ones settle.
        for batch in self.queue.open_batches(Some(&process.id))? {
            self.drive_batch(process, batch).await?;
        }

        let depth = self.queue.verified_len(&process.id)?;
        if depth == 0 {
            return Ok(());
        }
        let oldest_ms = self
            .queue
            .oldest_verified_age_ms(&process.id)?
            .unwrap_or(0);
        let wait_exceeded = oldest_ms as u128 >= self.batch_config.batch_max_wait().as_millis();
        if depth < self.batch_config.batch_size && !wait_exceeded {
            return Ok(());
        }

        if let Some(batch) = self
            .queue
            .close_batch(&process.id, self.batch_config.batch_size)?
        {
            tracing::info!(
                process = %process.id,
                batch = batch.seq,
                ballots = batch.ballots.len(),
                early = wait_exceeded && batch.ballots.len() < self.batch_config.batch_size,
                "batch closed"
            );
            self.drive_batch(process, batch).await?;
        }
        Ok(())
    }

    /// Drives one batch as far as it can go: aggregation proof, state
    /// application, transition proof, chain settlement.
    async fn drive_batch(
        &self,
        process: &Process,
        mut batch: AggregatedBatch,
    ) -> Result<(), SequencerError> {
        // A batch with zero real ballots is never submitted; nothing ever
        // creates one, but recovery is defensive about records.
        if batch.ballots.is_empty() {
            self.queue.mark_batch_failed(&batch)?;
            return Ok(());
        }

        if batch.proof.is_empty() {
            let witness = BatchWitness::build(
                batch.process_id,
                &batch.ballots,
                self.batch_config.batch_size,
            );
            match self.prove(JobPayload::Aggregation(witness)).await {
                Ok(proof) => {
                    batch.proof = proof;
                    self.queue.store_batch(&batch)?;
                }
                Err(e) => {
                    // Nothing has touched the state yet: fail the batch,
                    // release the locks, let voters retry.
                    tracing::warn!(
                        process = %batch.process_id,
                        batch = batch.seq,
                        error = %e,
                        "aggregation proof failed"
                    );
                    self.queue.mark_batch_failed(&batch)?;
                    return Ok(());
                }
            }
        }

        let mut transition = match self.queue.get_transition(&batch.process_id, batch.seq)? {
            Some(stored) => stored,
            None => {
                let mut states = self.states.lock().await;
                let state = match states.entry(batch.process_id) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(entry) => entry.insert(
                        ElectionState::open(
                            &self.db,
                            batch.process_id,
                            process.ballot_mode.num_fields as usize,
                        )?,
                    ),
                };
                let transition = state.apply(&batch)?;
                self.queue.store_transition(&transition)?;
                transition
            }
        };

        if transition.proof.is_empty() {
            let witness = TransitionWitness {
                process_id: transition.process_id,
                old_root: transition.old_root,
                new_root: transition.new_root,
                batch_proof: batch.proof.clone(),
                add_delta: transition.add_delta.clone(),
                sub_delta: transition.sub_delta.clone(),
                voters_added: transition.voters_added,
                overwrites: transition.overwrites,
            };
            // The state is already advanced; a proving failure here is a
            // malfunction, not a bad batch. Keep everything on disk and
            // surface the error so the process pauses.
            transition.proof = self.prove(JobPayload::Transition(witness)).await?;
            self.queue.store_transition(&transition)?;
        }

        self.settle(process, &batch, &transition).await
    }

    /// Submits a proven transition, retrying transient failures, and
    /// releases the batch on confirmation.
    async fn settle(
        &self,
        process: &Process,
        batch: &AggregatedBatch,
        transition: &StateTransition,
    ) -> Result<(), SequencerError> {
        let mut attempt = 0;
        let tx = loop {
            match self.chain.submit_state_transition(transition).await {
                Ok(tx) => break tx,
                Err(SequencerError::PermanentTx(reason)) => {
                    return Err(SequencerError::PermanentTx(reason));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.chain_config.retry_count {
                        return Err(e);
                    }
                    tracing::warn!(
                        process = %transition.process_id,
                        attempt,
                        error = %e,
                        "transition submission failed, retrying"
                    );
                    tokio::time::sleep(self.chain_config.retry_sleep()).await;
                }
            }
        };
        self.chain.wait_confirmation(tx).await?;

        // Mirror the accepted transition into the local process record.
        let mut local = self.processes.get(&process.id)?;
        local.state_root = transition.new_root;
        local.voter_count += transition.voters_added;
        local.overwrite_count += transition.overwrites;
        self.processes.put(&local)?;

        self.queue.mark_batch_done(batch)?;
        Ok(())
    }

    /// Queues a proving job and waits for its completion.
    async fn prove(&self, payload: JobPayload) -> Result<Vec<u8>, SequencerError> {
        let (_, completion) = self.board.enqueue(payload);
        completion
            .await
            .map_err(|_| SequencerError::Internal("job board dropped a completion".to_string()))?
    }

    /// Marks a process paused locally after a malfunction. Queues are
    /// preserved; recovery re-drives them on restart or operator action.
    fn pause_process(&self, id: &ProcessId) -> Result<(), SequencerError> {
        let mut process = self.processes.get(id)?;
        if process.status == ProcessStatus::Ready {
            process.status = ProcessStatus::Paused;
            self.processes.put(&process)?;
            tracing::error!(process = %id, "process paused after malfunction");
        }
        Ok(())
    }

    /// The aggregator loop.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.batch_config.ticker_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "aggregator tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
