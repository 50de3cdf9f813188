//! The process monitor.
//!
//! Polls the registry for new elections, persists them locally, downloads
//! their declared censuses and materializes the trees so proofs can be
//! served before the first ballot arrives. Status changes of known
//! processes are refreshed on the same tick so the pipeline and finalizer
//! see pauses and endings promptly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scrutiny_census::CensusDb;
use scrutiny_interface::services::chain::ChainClient;
use scrutiny_interface::{CensusOrigin, SequencerError};

use crate::store::ProcessStore;

/// Fetches the full census content addressed by a process's census URI.
/// The transport (HTTP, IPFS gateway, file) lives outside the core.
#[async_trait]
pub trait CensusFetcher: Send + Sync {
    /// Returns the JSON-encoded census dump at `uri`.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, SequencerError>;
}

/// Watches the registry and keeps the local view current.
pub struct ProcessMonitor<C> {
    client: Arc<C>,
    store: ProcessStore,
    census: CensusDb,
    fetcher: Arc<dyn CensusFetcher>,
    interval: Duration,
    last_block: u64,
}

impl<C: ChainClient> ProcessMonitor<C> {
    pub fn new(
        client: Arc<C>,
        store: ProcessStore,
        census: CensusDb,
        fetcher: Arc<dyn CensusFetcher>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            census,
            fetcher,
            interval,
            last_block: 0,
        }
    }

    /// One monitor tick: ingest creation events, refresh known statuses.
    pub async fn tick(&mut self) -> Result<usize, SequencerError> {
        let (events, last_block) = self.client.new_process_events(self.last_block).await?;
        self.last_block = last_block;

        let mut materialized = 0;
        for event in events {
            let process = event.process;
            if self.store.contains(&process.id)? {
                continue;
            }
            tracing::info!(
                process = %process.id,
                census_origin = ?process.census.origin,
                "new process observed"
            );
            self.store.put(&process)?;
            if let Err(e) = self.materialize_census(&process).await {
                // The process stays known; proofs against its census will
                // fail until a later tick re-downloads it.
                tracing::error!(process = %process.id, error = %e, "census download failed");
            }
            materialized += 1;
        }

        self.refresh_statuses().await?;
        Ok(materialized)
    }

    /// Downloads and imports a Merkle census. CSP censuses have nothing to
    /// materialize: their root is a provider key hash.
    async fn materialize_census(
        &self,
        process: &scrutiny_interface::Process,
    ) -> Result<(), SequencerError> {
        if process.census.origin != CensusOrigin::MerkleTreeOffchainStatic {
            return Ok(());
        }
        if self.census.load_by_root(&process.census.root).is_ok() {
            return Ok(());
        }
        let dump = self.fetcher.fetch(&process.census.uri).await?;
        match self.census.import_json(&process.census.root, &dump) {
            Ok(census) => {
                tracing::info!(
                    process = %process.id,
                    root = %hex::encode(&process.census.root),
                    leaves = census.len()?,
                    "census materialized"
                );
                Ok(())
            }
            Err(SequencerError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Re-reads the status of every locally known process.
    async fn refresh_statuses(&self) -> Result<(), SequencerError> {
        for mut local in self.store.list()? {
            match self.client.process(&local.id).await {
                Ok(on_chain) => {
                    if on_chain.status != local.status {
                        tracing::info!(
                            process = %local.id,
                            from = ?local.status,
                            to = ?on_chain.status,
                            "process status changed"
                        );
                        local.status = on_chain.status;
                        local.result = on_chain.result;
                        self.store.put(&local)?;
                    }
                }
                Err(SequencerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The monitor loop.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "monitor tick failed");
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use scrutiny_census::CensusDump;
    use scrutiny_db::Db;
    use scrutiny_interface::{
        BallotMode, CensusInfo, Process, ProcessId, ProcessStatus,
    };

    use crate::mock::{MockChain, MockRpc};
    use crate::pool::RpcPool;
    use crate::txmgr::ChainAdapter;

    use super::*;

    struct MapFetcher {
        dumps: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl CensusFetcher for MapFetcher {
        async fn fetch(&self, uri: &str) -> Result<Vec<u8>, SequencerError> {
            self.dumps
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .ok_or_else(|| SequencerError::NotFound(format!("census at {uri}")))
        }
    }

    fn process_with_census(root: Vec<u8>, uri: &str) -> Process {
        Process {
            id: ProcessId {
                chain_id: 1,
                organization: [8u8; 20],
                nonce: 1,
            },
            status: ProcessStatus::Ready,
            ballot_mode: BallotMode {
                num_fields: 1,
                max_value: 10,
                min_value: 0,
                max_value_sum: 10,
                min_value_sum: 0,
                unique_values: false,
                cost_exponent: 1,
                cost_from_weight: false,
            },
            census: CensusInfo {
                origin: CensusOrigin::MerkleTreeOffchainStatic,
                root,
                uri: uri.to_string(),
                max_voters: 100,
            },
            encryption_key: [0u8; 32],
            start_time: 0,
            duration: 3600,
            state_root: [0u8; 32],
            voter_count: 0,
            overwrite_count: 0,
            result: None,
            organization_id: [8u8; 20],
            metadata_uri: String::new(),
        }
    }

    #[tokio::test]
    async fn monitor_materializes_new_processes_and_their_censuses() {
        // Build the census dump the "organizer" would have published.
        let dir = tempfile::tempdir().unwrap();
        let builder = CensusDb::new(Db::in_memory(), dir.path().join("builder")).unwrap();
        let working = builder.new_census(uuid::Uuid::new_v4()).unwrap();
        builder
            .insert_batch(&working, &[(vec![1u8; 20], 1), (vec![2u8; 20], 2)])
            .unwrap();
        let root = working.root().unwrap();
        let dump: CensusDump = builder.dump(&working).unwrap();

        // Chain with one process declaring that census.
        let chain = MockChain::new();
        let process = process_with_census(root.to_vec(), "census://p1");
        chain.create_process(process.clone());

        let pool = Arc::new(RpcPool::new(
            vec![MockRpc::new(chain.clone())],
            3,
            Duration::from_secs(60),
        ));
        let client = Arc::new(ChainAdapter::new(pool, 120, Duration::from_millis(1), 1));

        let main = Db::in_memory();
        let store = ProcessStore::new(&main);
        let census = CensusDb::new(main.clone(), dir.path().join("node")).unwrap();
        let fetcher = Arc::new(MapFetcher {
            dumps: Mutex::new(HashMap::from([(
                "census://p1".to_string(),
                serde_json::to_vec(&dump).unwrap(),
            )])),
        });

        let mut monitor = ProcessMonitor::new(
            client,
            store.clone(),
            census.clone(),
            fetcher,
            Duration::from_millis(10),
        );

        assert_eq!(monitor.tick().await.unwrap(), 1);
        assert!(store.contains(&process.id).unwrap());
        // The census serves proofs immediately.
        let proof = census.proof_by_root(&root, &[1u8; 20]).unwrap();
        assert!(CensusDb::verify_proof(&proof));

        // A second tick is a no-op.
        assert_eq!(monitor.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn monitor_tracks_status_changes() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new();
        let process = process_with_census(vec![7u8; 32], "census://p1");
        chain.create_process(process.clone());

        let pool = Arc::new(RpcPool::new(
            vec![MockRpc::new(chain.clone())],
            3,
            Duration::from_secs(60),
        ));
        let client = Arc::new(ChainAdapter::new(pool, 120, Duration::from_millis(1), 1));
        let main = Db::in_memory();
        let store = ProcessStore::new(&main);
        let census = CensusDb::new(main.clone(), dir.path().join("node")).unwrap();
        let fetcher = Arc::new(MapFetcher {
            dumps: Mutex::new(HashMap::new()),
        });

        let mut monitor = ProcessMonitor::new(
            client,
            store.clone(),
            census,
            fetcher,
            Duration::from_millis(10),
        );
        monitor.tick().await.unwrap();
        assert_eq!(store.get(&process.id).unwrap().status, ProcessStatus::Ready);

        chain.set_status(&process.id, ProcessStatus::Ended);
        monitor.tick().await.unwrap();
        assert_eq!(store.get(&process.id).unwrap().status, ProcessStatus::Ended);
    }
}
