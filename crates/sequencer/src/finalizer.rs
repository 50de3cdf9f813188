//! Tally finalization.
//!
//! When a process's voting period elapses (or it is ended explicitly), the
//! finalizer decrypts the add and sub accumulators field by field with the
//! election's secret key, publishes `add − sub` as the result and flips
//! the process to `Results`. The discrete-log search is bounded by
//! `max_value × max_voters`, falling back to a fixed cap when a process
//! declares neither.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scrutiny_chain::ProcessStore;
use scrutiny_crypto::elgamal::{decrypt, KeyPair, SecretKey};
use scrutiny_db::{keys, Db};
use scrutiny_interface::services::chain::ChainClient;
use scrutiny_interface::{Process, ProcessId, ProcessStatus, SequencerError};
use scrutiny_state::ElectionState;

/// Election key material under the `ek_` prefix of the main store. The
/// sequencer generates the pair when it first sees a process it will
/// sequence for, and is the only holder of the decryption half.
#[derive(Clone)]
pub struct ElectionKeyStore {
    db: Db,
}

impl ElectionKeyStore {
    pub fn new(main: &Db) -> Self {
        Self {
            db: main.prefixed(keys::ELECTION_KEYS),
        }
    }

    pub fn put(&self, id: &ProcessId, keys: &KeyPair) -> Result<(), SequencerError> {
        self.db.put(&id.to_bytes(), &keys.secret.to_bytes())?;
        Ok(())
    }

    pub fn secret(&self, id: &ProcessId) -> Result<SecretKey, SequencerError> {
        match self.db.get(&id.to_bytes())? {
            Some(bytes) => Ok(SecretKey::from_bytes(&bytes)?),
            None => Err(SequencerError::NotFound(format!(
                "election key for {id}"
            ))),
        }
    }
}

/// The finalization worker.
pub struct Finalizer<C> {
    processes: ProcessStore,
    election_keys: ElectionKeyStore,
    chain: Arc<C>,
    db: Db,
    scan_interval: Duration,
}

impl<C: ChainClient> Finalizer<C> {
    pub fn new(
        processes: ProcessStore,
        election_keys: ElectionKeyStore,
        chain: Arc<C>,
        db: Db,
        scan_interval: Duration,
    ) -> Self {
        Self {
            processes,
            election_keys,
            chain,
            db,
            scan_interval,
        }
    }

    /// Whether a process is due for finalization.
    fn is_due(process: &Process, now: u64) -> bool {
        if process.result.is_some() {
            return false;
        }
        match process.status {
            ProcessStatus::Ended => true,
            ProcessStatus::Ready | ProcessStatus::Paused => now >= process.end_time(),
            ProcessStatus::Canceled | ProcessStatus::Results => false,
        }
    }

    /// One periodic scan. Returns the processes finalized this pass.
    pub async fn scan(&self) -> Result<usize, SequencerError> {
        let now = unix_now();
        let mut finalized = 0;
        for process in self.processes.list()? {
            if !Self::is_due(&process, now) {
                continue;
            }
            match self.finalize(&process.id).await {
                Ok(result) => {
                    tracing::info!(process = %process.id, ?result, "process finalized");
                    finalized += 1;
                }
                Err(e) => {
                    tracing::error!(process = %process.id, error = %e, "finalization failed");
                }
            }
        }
        Ok(finalized)
    }

    /// Finalizes one process: decrypt, persist, submit. Also usable on
    /// demand when a process is ended explicitly.
    pub async fn finalize(&self, id: &ProcessId) -> Result<Vec<u64>, SequencerError> {
        let mut process = self.processes.get(id)?;
        if process.result.is_some() {
            return Err(SequencerError::AlreadyExists(format!(
                "results for {id}"
            )));
        }
        let secret = self.election_keys.secret(id)?;
        let num_fields = process.ballot_mode.num_fields as usize;
        let state = ElectionState::open(&self.db, *id, num_fields)?;
        let bound = process.decryption_bound();

        let mut result = Vec::with_capacity(num_fields);
        for i in 0..num_fields {
            let added = decrypt(&state.accumulator_add()[i], &secret, bound)?;
            let subtracted = decrypt(&state.accumulator_sub()[i], &secret, bound)?;
            let net = added.checked_sub(subtracted).ok_or_else(|| {
                SequencerError::Internal(format!(
                    "field {i} decrypts negative: add {added}, sub {subtracted}"
                ))
            })?;
            result.push(net);
        }

        // Persist locally before touching the chain, so a crash between
        // the two leaves a recoverable record rather than a re-decryption.
        process.result = Some(result.clone());
        process.status = ProcessStatus::Results;
        self.processes.put(&process)?;

        let tx = self
            .chain
            .submit_results(id, &result, &[])
            .await?;
        self.chain.wait_confirmation(tx).await?;
        Ok(result)
    }

    /// The periodic scan loop.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        tracing::error!(error = %e, "finalizer scan failed");
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

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
