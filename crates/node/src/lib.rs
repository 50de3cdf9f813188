//! Node assembly.
//!
//! [`Node::build`] wires every subsystem (census store, ballot queues,
//! verification stage, aggregator, job board, local prover, process
//! monitor, finalizer) around one KV store and one configuration value.
//! [`Node::start`] spawns each long-running piece as an independent tokio
//! task; all of them observe the same shutdown signal and exit at their
//! next suspension point, leaving in-flight work on disk for recovery.

pub mod fixtures;

use std::sync::Arc;

use scrutiny_census::CensusDb;
use scrutiny_chain::{CensusFetcher, ProcessMonitor, ProcessStore};
use scrutiny_db::Db;
use scrutiny_interface::services::chain::ChainClient;
use scrutiny_interface::services::prover::ProofBackend;
use scrutiny_interface::{SequencerConfig, SequencerError};
use scrutiny_prover::{JobBoard, LocalProver};
use scrutiny_sequencer::{
    Aggregator, BallotQueue, BallotVerifier, ElectionKeyStore, Finalizer, Ingress,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Threads the local prover devotes to proof generation.
const LOCAL_PROVER_THREADS: usize = 2;

/// An assembled (but not yet started) node.
pub struct Node<C> {
    pub config: SequencerConfig,
    pub db: Db,
    pub census: CensusDb,
    pub processes: ProcessStore,
    pub queue: Arc<BallotQueue>,
    pub ingress: Ingress,
    pub board: Arc<JobBoard>,
    pub election_keys: ElectionKeyStore,
    verifier: Arc<BallotVerifier>,
    aggregator: Arc<Aggregator<C>>,
    finalizer: Arc<Finalizer<C>>,
    local_prover: Arc<LocalProver>,
    monitor: ProcessMonitor<C>,
}

impl<C: ChainClient + 'static> Node<C> {
    /// Builds the full component graph. Nothing runs yet.
    pub fn build(
        config: SequencerConfig,
        chain: Arc<C>,
        fetcher: Arc<dyn CensusFetcher>,
        backend: Arc<dyn ProofBackend>,
    ) -> Result<Self, SequencerError> {
        let db = Db::open(config.storage.path.join("db"))?;
        let census = CensusDb::new(db.clone(), config.storage.path.join("censuses"))?;
        let processes = ProcessStore::new(&db);
        let election_keys = ElectionKeyStore::new(&db);
        let queue = Arc::new(BallotQueue::open(db.clone(), config.batch.ingest_queue_depth)?);
        let ingress = Ingress::new(queue.clone(), processes.clone());

        let master_seed = hex::decode(&config.workers.master_seed)
            .map_err(|e| SequencerError::Internal(format!("master seed: {e}")))?;
        let board = Arc::new(JobBoard::new(
            master_seed,
            config.workers.worker_timeout(),
            config.workers.ban_timeout(),
            config.workers.failures_to_get_banned,
            backend.clone(),
        ));
        let local_prover = Arc::new(LocalProver::new(
            board.clone(),
            backend.clone(),
            LOCAL_PROVER_THREADS,
        ));

        let verifier = Arc::new(BallotVerifier::new(
            queue.clone(),
            processes.clone(),
            backend,
        ));
        let aggregator = Arc::new(Aggregator::new(
            queue.clone(),
            processes.clone(),
            board.clone(),
            chain.clone(),
            db.clone(),
            config.batch.clone(),
            config.chain.clone(),
        ));
        let finalizer = Arc::new(Finalizer::new(
            processes.clone(),
            election_keys.clone(),
            chain.clone(),
            db.clone(),
            config.chain.monitor_interval(),
        ));
        let monitor = ProcessMonitor::new(
            chain,
            processes.clone(),
            census.clone(),
            fetcher,
            config.chain.monitor_interval(),
        );

        Ok(Self {
            config,
            db,
            census,
            processes,
            queue,
            ingress,
            board,
            election_keys,
            verifier,
            aggregator,
            finalizer,
            local_prover,
            monitor,
        })
    }

    /// Spawns every subsystem and returns the handle bundle used to stop
    /// them.
    pub fn start(self) -> (RunningNode, NodeParts) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let monitor = self.monitor;
        tasks.push((
            "monitor",
            tokio::spawn(monitor.run(shutdown_rx.clone())),
        ));

        let verifier = self.verifier.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "verifier",
            tokio::spawn(async move { verifier.run(rx).await }),
        ));

        let aggregator = self.aggregator.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "aggregator",
            tokio::spawn(async move { aggregator.run(rx).await }),
        ));

        let finalizer = self.finalizer.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "finalizer",
            tokio::spawn(async move { finalizer.run(rx).await }),
        ));

        let board = self.board.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "job-board-sweeper",
            tokio::spawn(async move { board.run_sweeper(rx).await }),
        ));

        let prover = self.local_prover.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "local-prover",
            tokio::spawn(async move { prover.run(rx).await }),
        ));

        let census = self.census.clone();
        let rx = shutdown_rx.clone();
        tasks.push((
            "census-root-updater",
            tokio::spawn(async move { census.run_root_updater(rx).await }),
        ));

        let census = self.census.clone();
        let max_age = self.config.census.purge_max_age();
        let mut rx = shutdown_rx;
        tasks.push((
            "census-purge",
            tokio::spawn(async move {
                // Sweep a few times per age window; precision is not
                // important here.
                let period = (max_age / 4).max(std::time::Duration::from_secs(1));
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match census.purge_working(max_age) {
                                Ok(0) => {}
                                Ok(purged) => {
                                    tracing::info!(purged, "stale working censuses purged");
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "census purge failed");
                                }
                            }
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }),
        ));

        tracing::info!(tasks = tasks.len(), "node started");

        let parts = NodeParts {
            config: self.config,
            db: self.db,
            census: self.census,
            processes: self.processes,
            queue: self.queue,
            ingress: self.ingress,
            board: self.board,
            election_keys: self.election_keys,
        };
        (
            RunningNode {
                shutdown: shutdown_tx,
                tasks,
            },
            parts,
        )
    }
}

/// The externally usable surfaces of a started node.
pub struct NodeParts {
    pub config: SequencerConfig,
    pub db: Db,
    pub census: CensusDb,
    pub processes: ProcessStore,
    pub queue: Arc<BallotQueue>,
    pub ingress: Ingress,
    pub board: Arc<JobBoard>,
    pub election_keys: ElectionKeyStore,
}

/// Handles to the spawned subsystem tasks.
pub struct RunningNode {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningNode {
    /// Signals shutdown and waits (bounded) for every task to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            match tokio::time::timeout(std::time::Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task panicked"),
                Err(_) => tracing::warn!(task = name, "task did not drain in time"),
            }
        }
        tracing::info!("node stopped");
    }
}
