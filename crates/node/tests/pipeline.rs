//! End-to-end pipeline scenarios over a full node and an in-memory chain.

use scrutiny_interface::{ProcessStatus, PushResult};
use scrutiny_node::fixtures::{TestNode, Voter};

fn is_rejected_with(result: &PushResult, needle: &str) -> bool {
    matches!(result, PushResult::Rejected { reason } if reason.contains(needle))
}

#[tokio::test(flavor = "multi_thread")]
async fn ballot_settles_end_to_end() {
    let mut node = TestNode::start();
    let voter = Voter::new(1);
    let (process, election_keys) = node.register_election(1, &[voter], 10, 3600);

    // The monitor has to observe the process before ingress accepts.
    node.wait_process_ready(&process).await;

    let ballot = node.make_ballot(&process, &election_keys, &voter, &[7]);
    assert_eq!(node.parts.ingress.push(ballot), PushResult::Accepted);

    // Pending → verified → batch → proofs → chain settlement.
    node.wait_until("transition settled on chain", || {
        node.chain
            .process(&process.id)
            .map(|p| p.voter_count == 1 && p.state_root != [0u8; 32])
            .unwrap_or(false)
    })
    .await;

    // Lock release follows confirmation; give the bookkeeping its tick.
    node.wait_until("queues drained", || {
        node.parts
            .queue
            .stats()
            .map(|s| {
                s.pending == 0 && s.verified == 0 && s.open_batches == 0 && s.locked_vote_ids == 0
            })
            .unwrap_or(false)
    })
    .await;

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn address_lock_blocks_until_settlement_then_admits_again() {
    let mut node = TestNode::start();
    let voter = Voter::new(2);
    let (process, election_keys) = node.register_election(1, &[voter], 10, 3600);
    node.wait_process_ready(&process).await;

    // push(P, A, V1) → Accepted.
    let first = node.make_ballot(&process, &election_keys, &voter, &[3]);
    let v1 = first.vote_id;
    assert_eq!(node.parts.ingress.push(first), PushResult::Accepted);

    // push(P, A, V2) while V1 is in flight → AddressProcessing.
    let second = node.make_ballot(&process, &election_keys, &voter, &[5]);
    let v2 = second.vote_id;
    assert_ne!(v1, v2);
    let blocked = node.parts.ingress.push(second.clone());
    assert!(
        is_rejected_with(&blocked, "address"),
        "expected an address lock rejection, got {blocked:?}"
    );

    // Complete the pipeline for V1.
    node.wait_until("first ballot settled", || {
        node.chain
            .process(&process.id)
            .map(|p| p.voter_count == 1)
            .unwrap_or(false)
    })
    .await;
    node.wait_until("locks released", || {
        !node.parts.queue.vote_id_locked(&v1)
    })
    .await;

    // push(P, A, V2) → Accepted.
    assert_eq!(node.parts.ingress.push(second), PushResult::Accepted);

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn vote_id_replay_is_rejected_across_addresses() {
    let mut node = TestNode::start();
    let voter_a = Voter::new(3);
    let voter_b = Voter::new(4);
    let (process, election_keys) = node.register_election(1, &[voter_a, voter_b], 10, 3600);
    node.wait_process_ready(&process).await;

    let ballot_a = node.make_ballot(&process, &election_keys, &voter_a, &[1]);
    assert_eq!(node.parts.ingress.push(ballot_a.clone()), PushResult::Accepted);

    // A different address replaying the same vote id is caught by the
    // vote-id lock, before any verification.
    let mut replay = node.make_ballot(&process, &election_keys, &voter_b, &[1]);
    replay.vote_id = ballot_a.vote_id;
    let rejected = node.parts.ingress.push(replay);
    assert!(
        is_rejected_with(&rejected, "vote id"),
        "expected a vote id rejection, got {rejected:?}"
    );

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_is_charged_and_finalized_correctly() {
    let mut node = TestNode::start();
    let voter = Voter::new(5);
    let (process, election_keys) = node.register_election(1, &[voter], 10, 3600);
    node.wait_process_ready(&process).await;

    // Cast 3 and settle.
    let first = node.make_ballot(&process, &election_keys, &voter, &[3]);
    assert_eq!(node.parts.ingress.push(first), PushResult::Accepted);
    node.wait_until("first ballot settled", || {
        node.chain
            .process(&process.id)
            .map(|p| p.voter_count == 1)
            .unwrap_or(false)
    })
    .await;

    // Cast 5: an overwrite of the same address.
    let second = node.make_ballot(&process, &election_keys, &voter, &[5]);
    assert_eq!(node.parts.ingress.push(second), PushResult::Accepted);
    node.wait_until("overwrite settled", || {
        node.chain
            .process(&process.id)
            .map(|p| p.overwrite_count == 1)
            .unwrap_or(false)
    })
    .await;

    let settled = node.chain.process(&process.id).unwrap();
    assert_eq!(settled.voter_count, 1, "an overwrite adds no voter");

    // End the election and let the finalizer decrypt the accumulators.
    node.chain.set_status(&process.id, ProcessStatus::Ended);
    node.wait_until("results published", || {
        node.chain
            .process(&process.id)
            .map(|p| p.result.is_some())
            .unwrap_or(false)
    })
    .await;

    let finalized = node.chain.process(&process.id).unwrap();
    assert_eq!(finalized.result, Some(vec![5]), "the overwrite wins");
    assert_eq!(finalized.status, ProcessStatus::Results);

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_election_finalizes_to_a_zero_vector() {
    let mut node = TestNode::start();
    let voter = Voter::new(6);
    // Duration zero: the voting period is over as soon as it starts.
    let (process, _election_keys) = node.register_election(1, &[voter], 10, 0);
    node.wait_process_ready(&process).await;

    node.wait_until("results published", || {
        node.chain
            .process(&process.id)
            .map(|p| p.result.is_some())
            .unwrap_or(false)
    })
    .await;

    let finalized = node.chain.process(&process.id).unwrap();
    assert_eq!(finalized.result, Some(vec![0]));
    assert_eq!(finalized.voter_count, 0);

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn four_voters_fill_one_batch() {
    let mut node = TestNode::start();
    let voters: Vec<Voter> = (10..14).map(Voter::new).collect();
    let (process, election_keys) = node.register_election(1, &voters, 10, 3600);
    node.wait_process_ready(&process).await;

    for (i, voter) in voters.iter().enumerate() {
        let ballot = node.make_ballot(&process, &election_keys, voter, &[i as u64 + 1]);
        assert_eq!(node.parts.ingress.push(ballot), PushResult::Accepted);
    }

    node.wait_until("all four settled", || {
        node.chain
            .process(&process.id)
            .map(|p| p.voter_count == 4)
            .unwrap_or(false)
    })
    .await;

    // 1 + 2 + 3 + 4.
    node.chain.set_status(&process.id, ProcessStatus::Ended);
    node.wait_until("results published", || {
        node.chain
            .process(&process.id)
            .map(|p| p.result.is_some())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(node.chain.process(&process.id).unwrap().result, Some(vec![10]));

    node.running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_ballot_releases_locks_for_a_retry() {
    let mut node = TestNode::start();
    let voter = Voter::new(7);
    let (process, election_keys) = node.register_election(1, &[voter], 10, 3600);
    node.wait_process_ready(&process).await;

    // A ballot with a corrupt proof is accepted at ingress (the checks
    // there are only locks and depth), then dropped at verification.
    let mut bad = node.make_ballot(&process, &election_keys, &voter, &[2]);
    bad.ballot_proof.proof = vec![0xff; 8];
    let vote_id = bad.vote_id;
    assert_eq!(node.parts.ingress.push(bad), PushResult::Accepted);

    node.wait_until("ballot dropped and unlocked", || {
        !node.parts.queue.vote_id_locked(&vote_id)
    })
    .await;

    // The voter retries with a good ballot.
    let good = node.make_ballot(&process, &election_keys, &voter, &[2]);
    assert_eq!(node.parts.ingress.push(good), PushResult::Accepted);
    node.wait_until("retried ballot settled", || {
        node.chain
            .process(&process.id)
            .map(|p| p.voter_count == 1)
            .unwrap_or(false)
    })
    .await;

    node.running.shutdown().await;
}
