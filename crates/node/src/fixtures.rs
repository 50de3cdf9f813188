//! Test and local-development fixtures: an in-memory chain, a map-backed
//! census fetcher, and helpers to register elections and build correctly
//! signed ballots. Integration tests drive a full node through these.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use scrutiny_census::CensusDb;
use scrutiny_chain::{CensusFetcher, MockChain, MockRpc, RpcPool};
use scrutiny_crypto::elgamal::{encrypt, KeyPair};
use scrutiny_crypto::eth;
use scrutiny_db::Db;
use scrutiny_interface::{
    Address, Ballot, BallotMode, BallotProof, CensusInfo, CensusOrigin, EncryptedField, Process,
    ProcessId, ProcessStatus, SequencerConfig, SequencerError,
};
use scrutiny_prover::{mock_ballot_proof, MockProofBackend};

use crate::{Node, NodeParts, RunningNode};

/// Serves census dumps from an in-memory map, keyed by URI.
#[derive(Default)]
pub struct MapFetcher {
    dumps: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapFetcher {
    pub fn insert(&self, uri: &str, dump: Vec<u8>) {
        self.dumps
            .lock()
            .expect("fetcher lock poisoned")
            .insert(uri.to_string(), dump);
    }
}

#[async_trait]
impl CensusFetcher for MapFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, SequencerError> {
        self.dumps
            .lock()
            .expect("fetcher lock poisoned")
            .get(uri)
            .cloned()
            .ok_or_else(|| SequencerError::NotFound(format!("census at {uri}")))
    }
}

/// A deterministic voter: secret key and the Ethereum address it controls.
#[derive(Clone, Copy)]
pub struct Voter {
    pub secret: [u8; 32],
    pub address: Address,
}

impl Voter {
    pub fn new(seed: u8) -> Self {
        let secret = [seed; 32];
        let address = eth::address_of(&secret).expect("fixture key is valid").0;
        Self { secret, address }
    }
}

/// A fully started node over an in-memory chain, plus everything a test
/// needs to poke it.
pub struct TestNode {
    pub parts: NodeParts,
    pub chain: MockChain,
    pub backend: Arc<MockProofBackend>,
    pub fetcher: Arc<MapFetcher>,
    pub running: RunningNode,
    pub rng: StdRng,
    _storage: tempfile::TempDir,
}

impl TestNode {
    /// Builds and starts a node with test-friendly intervals.
    pub fn start() -> Self {
        let storage = tempfile::tempdir().expect("tempdir");
        let config = SequencerConfig::for_testing(storage.path());

        let chain = MockChain::new();
        let endpoints: Vec<MockRpc> = (0..2).map(|_| MockRpc::new(chain.clone())).collect();
        let pool = Arc::new(RpcPool::new(
            endpoints,
            config.chain.retry_count,
            config.chain.endpoint_cooldown(),
        ));
        let adapter = Arc::new(scrutiny_chain::ChainAdapter::new(
            pool,
            config.chain.gas_multiplier_percent,
            config.chain.retry_sleep(),
            config.chain.confirmations,
        ));

        let backend = Arc::new(MockProofBackend::new());
        let fetcher = Arc::new(MapFetcher::default());

        let node = Node::build(config, adapter, fetcher.clone(), backend.clone())
            .expect("node builds");
        let (running, parts) = node.start();

        Self {
            parts,
            chain,
            backend,
            fetcher,
            running,
            rng: StdRng::seed_from_u64(101),
            _storage: storage,
        }
    }

    /// Registers an election: builds and publishes its census dump,
    /// generates the election key pair, creates the process on the mock
    /// chain. Returns the process as declared.
    pub fn register_election(
        &mut self,
        nonce: u64,
        voters: &[Voter],
        max_value: u64,
        duration_secs: u64,
    ) -> (Process, KeyPair) {
        // Build the census the organizer would have published.
        let builder_dir = tempfile::tempdir().expect("tempdir");
        let builder =
            CensusDb::new(Db::in_memory(), builder_dir.path()).expect("census builder");
        let working = builder
            .new_census(uuid::Uuid::new_v4())
            .expect("working census");
        let entries: Vec<(Vec<u8>, u64)> = voters
            .iter()
            .map(|v| (v.address.to_vec(), 1u64))
            .collect();
        builder.insert_batch(&working, &entries).expect("census insert");
        let root = working.root().expect("census root");
        let dump = builder.dump(&working).expect("census dump");

        let uri = format!("census://election/{nonce}");
        self.fetcher
            .insert(&uri, serde_json::to_vec(&dump).expect("dump encodes"));

        let election_keys = KeyPair::generate(&mut self.rng);
        let process = Process {
            id: ProcessId {
                chain_id: 1,
                organization: [0x0e; 20],
                nonce,
            },
            status: ProcessStatus::Ready,
            ballot_mode: BallotMode {
                num_fields: 1,
                max_value,
                min_value: 0,
                max_value_sum: max_value,
                min_value_sum: 0,
                unique_values: false,
                cost_exponent: 1,
                cost_from_weight: false,
            },
            census: CensusInfo {
                origin: CensusOrigin::MerkleTreeOffchainStatic,
                root: root.to_vec(),
                uri,
                max_voters: voters.len() as u64,
            },
            encryption_key: election_keys.public.to_bytes(),
            start_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock before unix epoch")
                .as_secs(),
            duration: duration_secs,
            state_root: [0u8; 32],
            voter_count: 0,
            overwrite_count: 0,
            result: None,
            organization_id: [0x0e; 20],
            metadata_uri: String::new(),
        };

        self.parts
            .election_keys
            .put(&process.id, &election_keys)
            .expect("election key stored");
        self.chain.create_process(process.clone());
        (process, election_keys)
    }

    /// Builds a correctly signed, proven ballot for a census voter.
    pub fn make_ballot(
        &mut self,
        process: &Process,
        election_keys: &KeyPair,
        voter: &Voter,
        values: &[u64],
    ) -> Ballot {
        let ciphertexts: Vec<EncryptedField> = values
            .iter()
            .map(|v| EncryptedField(encrypt(*v, &election_keys.public, &mut self.rng).to_bytes()))
            .collect();
        let vote_id = Ballot::compute_vote_id(&process.id, &voter.address, &ciphertexts);
        let census_proof = self
            .parts
            .census
            .proof_by_root(&process.census.root, &voter.address)
            .expect("voter is in the census");

        let mut ballot = Ballot {
            process_id: process.id,
            address: voter.address,
            vote_id,
            ciphertexts,
            ballot_proof: BallotProof::default(),
            census_proof,
            signature: vec![],
        };
        ballot.signature =
            eth::sign_digest(&voter.secret, ballot.signed_digest()).expect("signing works");
        ballot.ballot_proof = BallotProof {
            proof: mock_ballot_proof(&ballot),
            public_inputs: vec![],
        };
        ballot
    }

    /// Waits until the monitor has both materialized the process and
    /// imported its census, so proofs can be generated against it.
    pub async fn wait_process_ready(&self, process: &Process) {
        self.wait_until("process and census materialized", || {
            self.parts.processes.contains(&process.id).unwrap_or(false)
                && (process.census.origin != CensusOrigin::MerkleTreeOffchainStatic
                    || self.parts.census.load_by_root(&process.census.root).is_ok())
        })
        .await;
    }

    /// Polls until `check` passes or the timeout elapses.
    pub async fn wait_until<F: Fn() -> bool>(&self, what: &str, check: F) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }
}
