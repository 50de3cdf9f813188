//! The master's job board.
//!
//! The sequencer is the single master: it holds the authoritative queue of
//! proving jobs. Workers are stateless clients that lease a job, prove it
//! and submit the result. Leases carry deadlines; a background sweeper
//! re-queues anything whose lease expired, and workers that keep failing
//! are banned for a while. Authentication is a bearer token derived from
//! the master seed and the worker's address.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scrutiny_interface::services::prover::ProofBackend;
use scrutiny_interface::{Address, SequencerError};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::job::{JobId, JobKind, JobPayload, ProofJob};

/// A job is abandoned (its completion fails) after this many lease
/// timeouts or rejected submissions.
const MAX_ATTEMPTS: u32 = 3;

/// How a completed job reports back to the pipeline.
pub type JobCompletion = oneshot::Receiver<Result<Vec<u8>, SequencerError>>;

struct QueuedJob {
    job: ProofJob,
    attempts: u32,
    notify: Option<oneshot::Sender<Result<Vec<u8>, SequencerError>>>,
}

struct Lease {
    queued: QueuedJob,
    worker: Address,
    deadline: Instant,
}

/// Per-worker accounting.
#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub successes: u64,
    pub failures: u32,
    pub banned_until: Option<Instant>,
}

struct BoardState {
    next_id: JobId,
    queue: VecDeque<QueuedJob>,
    leases: HashMap<JobId, Lease>,
    workers: HashMap<Address, WorkerStats>,
}

/// The authoritative proof job queue. Thread-safe; all methods take `&self`.
pub struct JobBoard {
    master_seed: Vec<u8>,
    worker_timeout: Duration,
    ban_timeout: Duration,
    failures_to_get_banned: u32,
    backend: Arc<dyn ProofBackend>,
    state: Mutex<BoardState>,
}

impl JobBoard {
    pub fn new(
        master_seed: Vec<u8>,
        worker_timeout: Duration,
        ban_timeout: Duration,
        failures_to_get_banned: u32,
        backend: Arc<dyn ProofBackend>,
    ) -> Self {
        Self {
            master_seed,
            worker_timeout,
            ban_timeout,
            failures_to_get_banned,
            backend,
            state: Mutex::new(BoardState {
                next_id: 0,
                queue: VecDeque::new(),
                leases: HashMap::new(),
                workers: HashMap::new(),
            }),
        }
    }

    /// The bearer token issued to `worker`: SHA-256 over the master seed
    /// and the worker address.
    pub fn token_for(&self, worker: &Address) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.master_seed);
        hasher.update(worker);
        hasher.finalize().into()
    }

    fn authenticate(&self, worker: &Address, token: &[u8]) -> Result<(), SequencerError> {
        let expected = self.token_for(worker);
        if token.len() == expected.len() && ct_eq(token, &expected) {
            Ok(())
        } else {
            Err(SequencerError::AuthRejected(format!(
                "bad token for worker 0x{}",
                hex::encode(worker)
            )))
        }
    }

    /// Queues a job and returns its id plus the completion channel the
    /// pipeline awaits.
    pub fn enqueue(&self, payload: JobPayload) -> (JobId, JobCompletion) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("job board lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back(QueuedJob {
            job: ProofJob { id, payload },
            attempts: 0,
            notify: Some(tx),
        });
        tracing::debug!(job = id, queued = state.queue.len(), "proof job queued");
        (id, rx)
    }

    /// Atomically leases the oldest queued job matching `kinds` to the
    /// worker, with a deadline of now + the worker timeout.
    pub fn lease(
        &self,
        worker: &Address,
        token: &[u8],
        kinds: &[JobKind],
        now: Instant,
    ) -> Result<Option<ProofJob>, SequencerError> {
        self.authenticate(worker, token)?;
        let mut state = self.state.lock().expect("job board lock poisoned");
        self.check_ban(&mut state, worker, now)?;

        let position = state
            .queue
            .iter()
            .position(|queued| kinds.contains(&queued.job.kind()));
        let Some(position) = position else {
            return Ok(None);
        };
        let queued = state
            .queue
            .remove(position)
            .expect("position comes from the same queue");
        let job = queued.job.clone();
        state.leases.insert(
            job.id,
            Lease {
                queued,
                worker: *worker,
                deadline: now + self.worker_timeout,
            },
        );
        tracing::debug!(job = job.id, worker = %hex::encode(worker), "job leased");
        Ok(Some(job))
    }

    /// Extends the lease of a job the worker currently holds.
    pub fn heartbeat(
        &self,
        worker: &Address,
        token: &[u8],
        job_id: JobId,
        now: Instant,
    ) -> Result<(), SequencerError> {
        self.authenticate(worker, token)?;
        let mut state = self.state.lock().expect("job board lock poisoned");
        let lease = state
            .leases
            .get_mut(&job_id)
            .ok_or_else(|| SequencerError::NotFound(format!("lease for job {job_id}")))?;
        if lease.worker != *worker {
            return Err(SequencerError::AuthRejected(format!(
                "job {job_id} is leased to another worker"
            )));
        }
        lease.deadline = now + self.worker_timeout;
        Ok(())
    }

    /// Accepts a proof for a leased job. The proof is verified before the
    /// job completes; a stale lease (expired and re-queued, or re-leased to
    /// someone else) is rejected with `AuthRejected`.
    pub fn submit(
        &self,
        worker: &Address,
        token: &[u8],
        job_id: JobId,
        proof: Vec<u8>,
        now: Instant,
    ) -> Result<(), SequencerError> {
        self.authenticate(worker, token)?;
        let mut state = self.state.lock().expect("job board lock poisoned");

        match state.leases.get(&job_id) {
            None => {
                return Err(SequencerError::AuthRejected(format!(
                    "no active lease for job {job_id}"
                )));
            }
            Some(lease) if lease.worker != *worker => {
                return Err(SequencerError::AuthRejected(format!(
                    "job {job_id} is leased to another worker"
                )));
            }
            Some(_) => {}
        }

        let verified = {
            let lease = state.leases.get(&job_id).expect("checked above");
            match &lease.queued.job.payload {
                JobPayload::Aggregation(witness) => {
                    self.backend.verify_aggregation(witness, &proof)
                }
                JobPayload::Transition(witness) => {
                    self.backend.verify_transition(witness, &proof)
                }
            }
        };

        match verified {
            Ok(()) => {
                let mut lease = state.leases.remove(&job_id).expect("checked above");
                if let Some(notify) = lease.queued.notify.take() {
                    let _ = notify.send(Ok(proof));
                }
                let entry = state.workers.entry(*worker).or_default();
                entry.successes += 1;
                entry.failures = 0;
                tracing::debug!(job = job_id, worker = %hex::encode(worker), "proof accepted");
                Ok(())
            }
            Err(e) => {
                let lease = state.leases.remove(&job_id).expect("checked above");
                self.record_failure(&mut state, worker, now);
                self.requeue(&mut state, lease.queued, &e);
                Err(e)
            }
        }
    }

    /// Re-queues every job whose lease deadline has passed, charging the
    /// failure to the worker that held it. Returns how many were swept.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut state = self.state.lock().expect("job board lock poisoned");
        let expired: Vec<JobId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for job_id in &expired {
            let Lease { queued, worker, .. } =
                state.leases.remove(job_id).expect("listed above");
            tracing::warn!(
                job = job_id,
                worker = %hex::encode(worker),
                "lease expired, re-queueing"
            );
            self.record_failure(&mut state, &worker, now);
            self.requeue(&mut state, queued, &SequencerError::JobTimeout);
        }
        expired.len()
    }

    /// The background sweeper task.
    pub async fn run_sweeper(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let period = (self.worker_timeout / 4).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Queued (unleased) job count.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("job board lock poisoned").queue.len()
    }

    /// Currently leased job count.
    pub fn leased(&self) -> usize {
        self.state.lock().expect("job board lock poisoned").leases.len()
    }

    /// A snapshot of one worker's accounting.
    pub fn worker_stats(&self, worker: &Address) -> Option<WorkerStats> {
        self.state
            .lock()
            .expect("job board lock poisoned")
            .workers
            .get(worker)
            .cloned()
    }

    fn check_ban(
        &self,
        state: &mut BoardState,
        worker: &Address,
        now: Instant,
    ) -> Result<(), SequencerError> {
        if let Some(entry) = state.workers.get_mut(worker) {
            if let Some(until) = entry.banned_until {
                if until > now {
                    return Err(SequencerError::Banned);
                }
                entry.banned_until = None;
            }
        }
        Ok(())
    }

    fn record_failure(&self, state: &mut BoardState, worker: &Address, now: Instant) {
        let threshold = self.failures_to_get_banned;
        let entry = state.workers.entry(*worker).or_default();
        entry.failures += 1;
        if entry.failures >= threshold {
            entry.banned_until = Some(now + self.ban_timeout);
            entry.failures = 0;
            tracing::warn!(worker = %hex::encode(worker), "worker banned");
        }
    }

    /// Puts a failed job back at the front of the queue, or abandons it
    /// once it has exhausted its attempts.
    fn requeue(&self, state: &mut BoardState, mut queued: QueuedJob, cause: &SequencerError) {
        queued.attempts += 1;
        if queued.attempts >= MAX_ATTEMPTS {
            tracing::error!(job = queued.job.id, %cause, "job abandoned");
            if let Some(notify) = queued.notify.take() {
                let _ = notify.send(Err(match cause {
                    SequencerError::JobTimeout => SequencerError::JobTimeout,
                    other => SequencerError::InvalidProof(other.to_string()),
                }));
            }
        } else {
            state.queue.push_front(queued);
        }
    }
}

/// Constant-time byte comparison for bearer tokens.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use scrutiny_interface::{BatchWitness, ProcessId, SlotWitness};

    use crate::backend::MockProofBackend;

    use super::*;

    const WORKER_TIMEOUT: Duration = Duration::from_secs(30);
    const BAN_TIMEOUT: Duration = Duration::from_secs(60);

    fn board() -> (Arc<JobBoard>, Arc<MockProofBackend>) {
        let backend = Arc::new(MockProofBackend::new());
        let board = Arc::new(JobBoard::new(
            b"seed".to_vec(),
            WORKER_TIMEOUT,
            BAN_TIMEOUT,
            3,
            backend.clone(),
        ));
        (board, backend)
    }

    fn witness() -> BatchWitness {
        BatchWitness {
            process_id: ProcessId {
                chain_id: 1,
                organization: [1u8; 20],
                nonce: 0,
            },
            slots: vec![SlotWitness::padding(); 2],
        }
    }

    fn aggregation_payload() -> JobPayload {
        JobPayload::Aggregation(witness())
    }

    const ALL_KINDS: &[JobKind] = &[JobKind::Aggregation, JobKind::StateTransition];

    #[test]
    fn auth_tokens_are_worker_bound() {
        let (board, _) = board();
        let w1 = [1u8; 20];
        let w2 = [2u8; 20];
        let t1 = board.token_for(&w1);
        assert_ne!(t1, board.token_for(&w2));

        assert!(board.lease(&w1, &t1, ALL_KINDS, Instant::now()).is_ok());
        assert!(matches!(
            board.lease(&w2, &t1, ALL_KINDS, Instant::now()),
            Err(SequencerError::AuthRejected(_))
        ));
    }

    #[tokio::test]
    async fn lease_submit_completes_the_job() {
        let (board, backend) = board();
        let worker = [1u8; 20];
        let token = board.token_for(&worker);
        let now = Instant::now();

        let (job_id, completion) = board.enqueue(aggregation_payload());
        let job = board.lease(&worker, &token, ALL_KINDS, now).unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(board.pending(), 0);
        assert_eq!(board.leased(), 1);

        let proof = backend.prove_aggregation(&witness()).unwrap();
        board
            .submit(&worker, &token, job_id, proof.clone(), now)
            .unwrap();
        assert_eq!(completion.await.unwrap().unwrap(), proof);
        assert_eq!(board.worker_stats(&worker).unwrap().successes, 1);
    }

    #[test]
    fn kinds_filter_which_jobs_a_worker_sees() {
        let (board, _) = board();
        let worker = [1u8; 20];
        let token = board.token_for(&worker);
        let now = Instant::now();

        board.enqueue(aggregation_payload());
        assert!(board
            .lease(&worker, &token, &[JobKind::StateTransition], now)
            .unwrap()
            .is_none());
        assert!(board
            .lease(&worker, &token, &[JobKind::Aggregation], now)
            .unwrap()
            .is_some());
    }

    #[test]
    fn expired_lease_is_swept_and_stale_submission_rejected() {
        let (board, backend) = board();
        let w = [1u8; 20];
        let w_prime = [2u8; 20];
        let t = board.token_for(&w);
        let t_prime = board.token_for(&w_prime);
        let start = Instant::now();

        let (job_id, _completion) = board.enqueue(aggregation_payload());
        board.lease(&w, &t, ALL_KINDS, start).unwrap().unwrap();

        // Nothing to sweep before the deadline.
        assert_eq!(board.sweep(start + Duration::from_secs(29)), 0);

        // At 31s the lease is expired and the job is re-queued.
        assert_eq!(board.sweep(start + Duration::from_secs(31)), 1);
        assert_eq!(board.pending(), 1);

        // Another worker picks it up.
        let job = board
            .lease(&w_prime, &t_prime, ALL_KINDS, start + Duration::from_secs(31))
            .unwrap()
            .unwrap();
        assert_eq!(job.id, job_id);

        // The original worker's submission lands on a stale lease.
        let proof = backend.prove_aggregation(&witness()).unwrap();
        assert!(matches!(
            board.submit(&w, &t, job_id, proof.clone(), start + Duration::from_secs(32)),
            Err(SequencerError::AuthRejected(_))
        ));

        // The new holder can still complete it.
        board
            .submit(&w_prime, &t_prime, job_id, proof, start + Duration::from_secs(32))
            .unwrap();
    }

    #[test]
    fn heartbeat_extends_the_lease() {
        let (board, _) = board();
        let worker = [1u8; 20];
        let token = board.token_for(&worker);
        let start = Instant::now();

        let (job_id, _completion) = board.enqueue(aggregation_payload());
        board.lease(&worker, &token, ALL_KINDS, start).unwrap().unwrap();

        board
            .heartbeat(&worker, &token, job_id, start + Duration::from_secs(25))
            .unwrap();
        // 31s after start but only 6s after the heartbeat.
        assert_eq!(board.sweep(start + Duration::from_secs(31)), 0);
        assert_eq!(board.sweep(start + Duration::from_secs(60)), 1);
    }

    #[tokio::test]
    async fn repeated_failures_ban_the_worker() {
        let (board, _backend) = board();
        let worker = [1u8; 20];
        let token = board.token_for(&worker);
        let now = Instant::now();

        // Three bogus submissions: failures 1, 2 and the ban.
        for round in 0..3 {
            let (job_id, _completion) = board.enqueue(aggregation_payload());
            board.lease(&worker, &token, ALL_KINDS, now).unwrap().unwrap();
            let result = board.submit(&worker, &token, job_id, vec![0xbb], now);
            assert!(result.is_err(), "round {round}");
        }

        assert!(matches!(
            board.lease(&worker, &token, ALL_KINDS, now),
            Err(SequencerError::Banned)
        ));

        // The ban lifts after its timeout.
        assert!(board
            .lease(&worker, &token, ALL_KINDS, now + BAN_TIMEOUT + Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test]
    async fn abandoned_jobs_complete_with_an_error() {
        let (board, _) = board();
        let worker = [1u8; 20];
        let token = board.token_for(&worker);
        let start = Instant::now();

        let (_job_id, completion) = board.enqueue(aggregation_payload());

        // Lease and let it expire MAX_ATTEMPTS times.
        let mut now = start;
        for _ in 0..3 {
            if board.lease(&worker, &token, ALL_KINDS, now).unwrap().is_none() {
                break;
            }
            now += Duration::from_secs(31);
            board.sweep(now);
        }

        assert!(matches!(
            completion.await.unwrap(),
            Err(SequencerError::JobTimeout)
        ));
        assert_eq!(board.pending(), 0);
    }
}
