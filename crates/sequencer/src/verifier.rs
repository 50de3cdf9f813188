//! The ballot verification stage: pending → verified.
//!
//! Four checks gate a ballot, cheapest first: structural shape, the
//! voter's ECDSA signature (recovered address must match the claimed one),
//! the census proof (root equality plus the origin verifier), and the
//! ballot's zero-knowledge proof. Survivors get their circuit inputs hash
//! computed and join the verified queue; everything else is dropped with
//! its locks released.

use std::sync::Arc;
use std::time::Duration;

use ark_bn254::Fr;
use scrutiny_census::VerifierRegistry;
use scrutiny_chain::ProcessStore;
use scrutiny_crypto::elgamal::Ciphertext;
use scrutiny_crypto::{eth, poseidon};
use scrutiny_interface::services::prover::ProofBackend;
use scrutiny_interface::{Ballot, Process, SequencerError, VerifiedBallot};

use crate::queue::BallotQueue;

/// How many pending ballots one verification tick processes.
const VERIFY_CHUNK: usize = 64;

/// The verification stage worker.
pub struct BallotVerifier {
    queue: Arc<BallotQueue>,
    processes: ProcessStore,
    registry: VerifierRegistry,
    backend: Arc<dyn ProofBackend>,
}

impl BallotVerifier {
    pub fn new(
        queue: Arc<BallotQueue>,
        processes: ProcessStore,
        backend: Arc<dyn ProofBackend>,
    ) -> Self {
        Self {
            queue,
            processes,
            registry: VerifierRegistry::default(),
            backend,
        }
    }

    /// Verifies one ballot against its process.
    pub fn verify_ballot(
        &self,
        process: &Process,
        ballot: &Ballot,
    ) -> Result<VerifiedBallot, SequencerError> {
        ballot
            .check_shape(process.ballot_mode.num_fields as usize)
            .map_err(SequencerError::InvalidProof)?;

        // The signature ties the ballot to the census entry: the recovered
        // signer must be the address the census proof certifies.
        let signer = eth::recover_address(&ballot.signature, ballot.signed_digest())?;
        if signer.0 != ballot.address {
            return Err(SequencerError::InvalidProof(format!(
                "signature recovers 0x{}, ballot claims 0x{}",
                hex::encode(signer.0),
                hex::encode(ballot.address)
            )));
        }

        if ballot.census_proof.root != process.census.root {
            return Err(SequencerError::InvalidProof(
                "census proof root differs from the process census".to_string(),
            ));
        }
        if ballot.census_proof.census_origin != process.census.origin {
            return Err(SequencerError::InvalidProof(
                "census proof origin differs from the process census".to_string(),
            ));
        }
        self.registry
            .verify(&ballot.process_id, &ballot.census_proof)
            .map_err(|e| SequencerError::InvalidProof(e.to_string()))?;

        self.backend.verify_ballot_proof(ballot)?;

        let inputs_hash = compute_inputs_hash(process, ballot)?;
        Ok(VerifiedBallot {
            process_id: ballot.process_id,
            address: ballot.address,
            vote_id: ballot.vote_id,
            inputs_hash,
            inner_proof: ballot.ballot_proof.proof.clone(),
            ciphertexts: ballot.ciphertexts.clone(),
            weight: ballot.census_proof.weight,
        })
    }

    /// One stage tick: drains a chunk of the pending queue. Returns how
    /// many ballots were verified.
    pub fn tick(&self) -> Result<usize, SequencerError> {
        let pending = self.queue.peek_pending(VERIFY_CHUNK)?;
        let mut verified = 0;
        for (key, ballot) in pending {
            let process = match self.processes.get(&ballot.process_id) {
                Ok(process) => process,
                Err(e) => {
                    tracing::warn!(
                        vote_id = %hex::encode(ballot.vote_id),
                        error = %e,
                        "dropping ballot for unknown process"
                    );
                    self.queue.reject_pending(&key, &ballot)?;
                    continue;
                }
            };
            match self.verify_ballot(&process, &ballot) {
                Ok(ballot_verified) => {
                    self.queue.mark_verified(&key, ballot_verified)?;
                    verified += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        vote_id = %hex::encode(ballot.vote_id),
                        error = %e,
                        "ballot rejected at verification"
                    );
                    self.queue.reject_pending(&key, &ballot)?;
                }
            }
        }
        Ok(verified)
    }

    /// The stage loop.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!(error = %e, "verification tick failed");
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

/// The ballot circuit's public inputs hash: a Poseidon chain over the
/// process parameters, the voter identity and the ciphertexts. This is the
/// value the aggregation circuit consumes per slot; its field order is
/// fixed and must never change for a deployed circuit.
pub fn compute_inputs_hash(process: &Process, ballot: &Ballot) -> Result<[u8; 32], SequencerError> {
    let mode = &process.ballot_mode;
    let mut inputs: Vec<Fr> = vec![
        poseidon::fr_from_be_bytes(&ballot.process_id.to_bytes()),
        Fr::from(mode.num_fields as u64),
        Fr::from(mode.max_value),
        Fr::from(mode.min_value),
        Fr::from(mode.max_value_sum),
        Fr::from(mode.min_value_sum),
        Fr::from(mode.unique_values as u64),
        Fr::from(mode.cost_exponent as u64),
        Fr::from(mode.cost_from_weight as u64),
    ];

    let (key_x, key_y) = process.encryption_key()?.coords();
    inputs.push(key_x);
    inputs.push(key_y);

    inputs.push(poseidon::fr_from_be_bytes(&ballot.address));
    inputs.push(poseidon::fr_from_be_bytes(&ballot.vote_id));

    for field in &ballot.ciphertexts {
        let ct = Ciphertext::from_bytes(field.as_ref())?;
        inputs.extend_from_slice(&ct.coords());
    }
    inputs.push(Fr::from(ballot.census_proof.census_origin.tag() as u64));

    let digest = poseidon::hash_chain(&inputs)?;
    Ok(poseidon::fr_to_be_bytes(&digest))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use scrutiny_census::CensusDb;
    use scrutiny_crypto::elgamal::{encrypt, KeyPair};
    use scrutiny_db::Db;
    use scrutiny_interface::{
        BallotMode, BallotProof, CensusInfo, CensusOrigin, EncryptedField, ProcessId,
        ProcessStatus,
    };
    use scrutiny_prover::{mock_ballot_proof, MockProofBackend};

    use super::*;

    struct Fixture {
        verifier: BallotVerifier,
        queue: Arc<BallotQueue>,
        process: Process,
        election_keys: KeyPair,
        census: CensusDb,
        _dir: tempfile::TempDir,
        rng: StdRng,
    }

    /// A voter key whose address we control: secret bytes -> eth address.
    fn voter(seed: u8) -> ([u8; 32], [u8; 20]) {
        let secret = [seed; 32];
        let address = eth::address_of(&secret).unwrap();
        (secret, address.0)
    }

    fn fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(77);
        let dir = tempfile::tempdir().unwrap();
        let main = Db::in_memory();
        let census = CensusDb::new(main.clone(), dir.path().join("censuses")).unwrap();
        let election_keys = KeyPair::generate(&mut rng);

        // Census with two voters.
        let working = census.new_census(uuid::Uuid::new_v4()).unwrap();
        let (_, a1) = voter(1);
        let (_, a2) = voter(2);
        census
            .insert_batch(&working, &[(a1.to_vec(), 1), (a2.to_vec(), 1)])
            .unwrap();
        let root = working.root().unwrap();
        let dest = census.new_by_root(&root).unwrap();
        census.publish(&working.id(), &dest).unwrap();

        let process = Process {
            id: ProcessId {
                chain_id: 1,
                organization: [1u8; 20],
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
                root: root.to_vec(),
                uri: String::new(),
                max_voters: 10,
            },
            encryption_key: election_keys.public.to_bytes(),
            start_time: 0,
            duration: 3600,
            state_root: [0u8; 32],
            voter_count: 0,
            overwrite_count: 0,
            result: None,
            organization_id: [1u8; 20],
            metadata_uri: String::new(),
        };
        let processes = ProcessStore::new(&main);
        processes.put(&process).unwrap();

        let queue = Arc::new(BallotQueue::open(main, 16).unwrap());
        let verifier = BallotVerifier::new(
            queue.clone(),
            processes,
            Arc::new(MockProofBackend::new()),
        );
        Fixture {
            verifier,
            queue,
            process,
            election_keys,
            census,
            _dir: dir,
            rng,
        }
    }

    fn make_ballot(fx: &mut Fixture, voter_seed: u8, value: u64) -> Ballot {
        let (secret, address) = voter(voter_seed);
        let ciphertexts = vec![EncryptedField(
            encrypt(value, &fx.election_keys.public, &mut fx.rng).to_bytes(),
        )];
        let vote_id = Ballot::compute_vote_id(&fx.process.id, &address, &ciphertexts);
        let census_proof = fx
            .census
            .proof_by_root(&fx.process.census.root, &address)
            .unwrap();
        let mut ballot = Ballot {
            process_id: fx.process.id,
            address,
            vote_id,
            ciphertexts,
            ballot_proof: BallotProof::default(),
            census_proof,
            signature: vec![],
        };
        ballot.signature = eth::sign_digest(&secret, ballot.signed_digest()).unwrap();
        ballot.ballot_proof = BallotProof {
            proof: mock_ballot_proof(&ballot),
            public_inputs: vec![],
        };
        ballot
    }

    #[test]
    fn valid_ballot_passes_and_reaches_verified() {
        let mut fx = fixture();
        let ballot = make_ballot(&mut fx, 1, 3);
        fx.queue.push(ballot, true).unwrap();

        assert_eq!(fx.verifier.tick().unwrap(), 1);
        assert_eq!(fx.queue.verified_len(&fx.process.id).unwrap(), 1);
    }

    #[test]
    fn forged_signature_is_dropped_and_unlocked() {
        let mut fx = fixture();
        let mut ballot = make_ballot(&mut fx, 1, 3);
        // Sign with someone else's key.
        let (other_secret, _) = voter(2);
        ballot.signature = eth::sign_digest(&other_secret, ballot.signed_digest()).unwrap();
        let vote_id = ballot.vote_id;

        fx.queue.push(ballot, true).unwrap();
        assert_eq!(fx.verifier.tick().unwrap(), 0);
        assert_eq!(fx.queue.verified_len(&fx.process.id).unwrap(), 0);
        // The drop released the locks.
        assert!(!fx.queue.vote_id_locked(&vote_id));
    }

    #[test]
    fn non_census_voter_is_dropped() {
        let mut fx = fixture();
        // Voter 3 is not in the census: no proof can be generated, so
        // forge one by reusing voter 1's siblings.
        let mut ballot = make_ballot(&mut fx, 1, 3);
        let (secret3, address3) = voter(3);
        ballot.address = address3;
        ballot.census_proof.address = address3;
        ballot.vote_id =
            Ballot::compute_vote_id(&fx.process.id, &address3, &ballot.ciphertexts);
        ballot.signature = eth::sign_digest(&secret3, ballot.signed_digest()).unwrap();
        ballot.ballot_proof.proof = mock_ballot_proof(&ballot);

        fx.queue.push(ballot, true).unwrap();
        assert_eq!(fx.verifier.tick().unwrap(), 0);
    }

    #[test]
    fn wrong_census_root_is_dropped() {
        let mut fx = fixture();
        let mut ballot = make_ballot(&mut fx, 1, 3);
        ballot.census_proof.root = vec![0xde; 32];
        // Re-sign and re-prove so only the root check can fail.
        let (secret, _) = voter(1);
        ballot.signature = eth::sign_digest(&secret, ballot.signed_digest()).unwrap();
        ballot.ballot_proof.proof = mock_ballot_proof(&ballot);

        fx.queue.push(ballot, true).unwrap();
        assert_eq!(fx.verifier.tick().unwrap(), 0);
    }

    #[test]
    fn bad_ballot_proof_is_dropped() {
        let mut fx = fixture();
        let mut ballot = make_ballot(&mut fx, 1, 3);
        ballot.ballot_proof.proof = vec![0xff; 32];
        fx.queue.push(ballot, true).unwrap();
        assert_eq!(fx.verifier.tick().unwrap(), 0);
    }

    #[test]
    fn inputs_hash_is_deterministic_and_input_sensitive() {
        let mut fx = fixture();
        let b1 = make_ballot(&mut fx, 1, 3);
        let h1 = compute_inputs_hash(&fx.process, &b1).unwrap();
        let h1_again = compute_inputs_hash(&fx.process, &b1).unwrap();
        assert_eq!(h1, h1_again);

        let b2 = make_ballot(&mut fx, 2, 3);
        let h2 = compute_inputs_hash(&fx.process, &b2).unwrap();
        assert_ne!(h1, h2);
    }
}
