//! The in-process prover.
//!
//! When no remote workers are configured, the sequencer drains its own job
//! board: this worker leases jobs like any other (same auth, same leases,
//! same sweeper) and proves them on a rayon pool sized to the machine. One
//! code path serves both deployments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scrutiny_interface::services::prover::ProofBackend;
use scrutiny_interface::Address;

use crate::board::JobBoard;
use crate::job::{JobKind, JobPayload, ProofJob};

/// The address the local worker authenticates as.
pub const LOCAL_WORKER_ADDRESS: Address = [0x1c; 20];

/// A worker that leases from the local board and proves on a thread pool.
pub struct LocalProver {
    board: Arc<JobBoard>,
    backend: Arc<dyn ProofBackend>,
    pool: rayon::ThreadPool,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    token: [u8; 32],
}

impl LocalProver {
    /// Builds a local prover with `num_threads` proving threads.
    pub fn new(
        board: Arc<JobBoard>,
        backend: Arc<dyn ProofBackend>,
        num_threads: usize,
    ) -> Self {
        let token = board.token_for(&LOCAL_WORKER_ADDRESS);
        Self {
            board,
            backend,
            pool: rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .expect("thread pool construction"),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: num_threads,
            token,
        }
    }

    /// Leases and dispatches at most one job. Returns whether a job was
    /// picked up.
    pub fn poll_once(&self) -> bool {
        if self.in_flight.load(Ordering::Acquire) >= self.max_in_flight {
            return false;
        }
        let leased = self.board.lease(
            &LOCAL_WORKER_ADDRESS,
            &self.token,
            &[JobKind::Aggregation, JobKind::StateTransition],
            Instant::now(),
        );
        let job = match leased {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, "local prover failed to lease");
                return false;
            }
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let board = self.board.clone();
        let backend = self.backend.clone();
        let token = self.token;
        let in_flight = self.in_flight.clone();
        self.pool.spawn(move || {
            prove_and_submit(&board, backend.as_ref(), &token, job);
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
        true
    }

    /// The worker loop: poll for jobs until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(25));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Drain greedily so a burst of jobs fills the pool.
                    while self.poll_once() {}
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Jobs currently being proven.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

fn prove_and_submit(
    board: &JobBoard,
    backend: &dyn ProofBackend,
    token: &[u8; 32],
    job: ProofJob,
) {
    let span = tracing::info_span!("local_proving", job = job.id);
    let _entered = span.enter();

    let result = match &job.payload {
        JobPayload::Aggregation(witness) => backend.prove_aggregation(witness),
        JobPayload::Transition(witness) => backend.prove_transition(witness),
    };

    match result {
        Ok(proof) => {
            if let Err(e) =
                board.submit(&LOCAL_WORKER_ADDRESS, token, job.id, proof, Instant::now())
            {
                tracing::error!(job = job.id, error = %e, "local proof rejected");
            }
        }
        Err(e) => {
            tracing::error!(job = job.id, error = %e, "local proving failed");
            // Leave the lease to expire; the sweeper re-queues or abandons
            // the job, which is what routes the failure to the pipeline.
        }
    }
}

#[cfg(test)]
mod tests {
    use scrutiny_interface::{BatchWitness, ProcessId, SlotWitness};

    use crate::backend::MockProofBackend;
    use crate::job::JobPayload;

    use super::*;

    fn payload() -> JobPayload {
        JobPayload::Aggregation(BatchWitness {
            process_id: ProcessId {
                chain_id: 1,
                organization: [1u8; 20],
                nonce: 0,
            },
            slots: vec![SlotWitness::padding(); 2],
        })
    }

    #[tokio::test]
    async fn local_prover_completes_queued_jobs() {
        let backend = Arc::new(MockProofBackend::new());
        let board = Arc::new(JobBoard::new(
            b"seed".to_vec(),
            Duration::from_secs(30),
            Duration::from_secs(60),
            3,
            backend.clone(),
        ));
        let prover = LocalProver::new(board.clone(), backend, 2);

        let (_, completion) = board.enqueue(payload());
        assert!(prover.poll_once());

        let proof = completion.await.unwrap().unwrap();
        assert!(!proof.is_empty());
        assert_eq!(board.pending(), 0);
        assert_eq!(board.leased(), 0);
    }

    #[tokio::test]
    async fn empty_board_yields_no_work() {
        let backend = Arc::new(MockProofBackend::new());
        let board = Arc::new(JobBoard::new(
            b"seed".to_vec(),
            Duration::from_secs(30),
            Duration::from_secs(60),
            3,
            backend.clone(),
        ));
        let prover = LocalProver::new(board, backend, 1);
        assert!(!prover.poll_once());
    }
}
