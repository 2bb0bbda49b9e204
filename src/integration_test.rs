use bytes::Bytes;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::harness::Harness;
use crate::raft::{EntryId, FailureOptions, Options, Server};

const TIMEOUT: Duration = Duration::from_secs(5);
const NAMES: [&str; 3] = ["A", "B", "C"];

#[tokio::test]
async fn test_start_and_elect_leader() {
    let harness = make_harness(&NAMES).await;

    let (term, leader) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;

    // Give the heartbeats a moment to reach everyone.
    sleep(Duration::from_millis(300)).await;
    let leaders = harness.leaders().await;
    assert_eq!(leaders, vec![(term, leader.clone())]);
    for name in NAMES {
        let raft = harness.member(name).await.expect("member");
        let (member_term, is_leader) = raft.get_state().await;
        assert_eq!(member_term, term);
        assert_eq!(is_leader, name == leader.name);
    }

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_start_and_elect_leader_many_nodes() {
    let n = 7;
    let owned: Vec<String> = (1..=n).map(|i| i.to_string()).collect();
    let names: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    let harness = make_harness(&names).await;

    harness.wait_for_leader(TIMEOUT, term_greater(0)).await;

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_disconnect_leader() {
    let harness = make_harness(&NAMES).await;

    // Wait for the initial leader and capture its term and server.
    let (term1, leader1) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let name1 = leader1.name.clone();
    harness.failures().lock().await.disconnect(name1.as_str());

    // Wait for a new leader (i.e, for a higher term).
    let (term2, leader2) = harness.wait_for_leader(TIMEOUT, term_greater(term1)).await;
    let name2 = leader2.name.clone();
    assert_ne!(&name2, &name1);

    // Now reconnect the original leader, and disconnect the second one.
    harness.failures().lock().await.reconnect(name1.as_str());
    harness.failures().lock().await.disconnect(name2.as_str());

    let (_, leader3) = harness.wait_for_leader(TIMEOUT, term_greater(term2)).await;
    assert_ne!(leader3.name, leader2.name);

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_commit() {
    let harness = make_harness(&NAMES).await;
    harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let client = harness.make_client();

    let entry_id = client.commit(Bytes::from("some-payload")).await.expect("commit");
    assert_eq!(entry_id.index, 1);

    let command = harness.wait_for_applied(1, NAMES.len(), TIMEOUT).await;
    assert_eq!(command, Bytes::from("some-payload"));

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_partitioned_leader_does_not_commit() {
    let harness = make_harness(&NAMES).await;
    let (term1, leader1) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let old_leader = harness.member(&leader1.name).await.expect("member");

    harness.failures().lock().await.disconnect(&leader1.name);
    let entry_id = old_leader
        .start(Bytes::from("x=1"))
        .await
        .expect("start")
        .expect("still believes to be leader");

    // The others move on without it.
    let (_, leader2) = harness.wait_for_leader(TIMEOUT, term_greater(term1)).await;
    assert_ne!(leader2.name, leader1.name);
    sleep(Duration::from_millis(300)).await;
    assert!(!applied_anywhere(&harness, "x=1").await);

    harness.failures().lock().await.reconnect(&leader1.name);
    let client = harness.make_client();
    let committed = client.commit(Bytes::from("y=2")).await.expect("commit");
    harness.wait_for_applied(committed.index, NAMES.len(), TIMEOUT).await;

    // Once healed, the entry was either overwritten or committed after all.
    // Either way, everyone agrees on what sits at its index.
    harness.wait_for_applied(entry_id.index, NAMES.len(), TIMEOUT).await;

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_crash_leader() {
    let harness = make_harness(&NAMES).await;
    let (term1, leader1) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;

    harness.crash(&leader1.name).await;
    let (term2, leader2) = harness.wait_for_leader(TIMEOUT, term_greater(term1)).await;
    assert!(term2 > term1);
    assert_ne!(leader2.name, leader1.name);

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_conflicting_follower_converges() {
    let harness = make_harness(&NAMES).await;
    let (term1, leader1) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let client = harness.make_client();
    client.commit(Bytes::from("shared")).await.expect("commit");

    // Cut off the leader and have it append entries nobody else sees.
    let old_leader = harness.member(&leader1.name).await.expect("member");
    harness.failures().lock().await.disconnect(&leader1.name);
    for i in 0..3 {
        let payload = Bytes::from(format!("lost-{}", i));
        old_leader.start(payload).await.expect("start");
    }

    // Meanwhile the rest of the cluster commits different entries.
    harness.wait_for_leader(TIMEOUT, term_greater(term1)).await;
    for i in 0..2 {
        let payload = Bytes::from(format!("kept-{}", i));
        client.commit(payload).await.expect("commit");
    }

    harness.failures().lock().await.reconnect(&leader1.name);
    let committed = client.commit(Bytes::from("after")).await.expect("commit");
    harness.wait_for_applied(committed.index, NAMES.len(), TIMEOUT).await;

    let reference = entry_ids(&harness, "A").await;
    for name in NAMES {
        assert_eq!(entry_ids(&harness, name).await, reference);
    }
    assert!(!applied_anywhere(&harness, "lost-0").await);

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_restart_keeps_state() {
    let harness = make_harness(&NAMES).await;
    let (_, leader) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let client = harness.make_client();
    for i in 0..3 {
        client.commit(Bytes::from(format!("cmd-{}", i))).await.expect("commit");
    }
    harness.wait_for_applied(3, NAMES.len(), TIMEOUT).await;

    let follower = NAMES
        .iter()
        .find(|name| **name != leader.name)
        .expect("follower");
    let before = harness.member(follower).await.expect("member").status().await;
    harness.crash(follower).await;
    harness.restart(follower).await.expect("restart");

    let after = harness.member(follower).await.expect("member").status().await;
    assert!(after.term >= before.term);
    assert!(after.last.index >= 3);
    if after.term == before.term {
        assert_eq!(after.voted_for, before.voted_for);
    }

    // The restarted member delivers the committed entries again, once it
    // learns about the commit index from the leader.
    let applied = wait_for_member_applied(&harness, follower, 3).await;
    let commands: Vec<Bytes> = applied.iter().take(3).map(|m| m.command.clone()).collect();
    assert_eq!(
        commands,
        vec![Bytes::from("cmd-0"), Bytes::from("cmd-1"), Bytes::from("cmd-2")]
    );

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_full_cluster_restart() {
    let harness = make_harness(&NAMES).await;
    harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let client = harness.make_client();
    client.commit(Bytes::from("one")).await.expect("commit");
    client.commit(Bytes::from("two")).await.expect("commit");

    for name in NAMES {
        harness.crash(name).await;
    }
    for name in NAMES {
        harness.restart(name).await.expect("restart");
    }

    // Older entries only commit along with an entry from the new term.
    let committed = client.commit(Bytes::from("three")).await.expect("commit");
    assert_eq!(committed.index, 3);
    harness.wait_for_applied(3, NAMES.len(), TIMEOUT).await;
    for name in NAMES {
        let commands: Vec<Bytes> = harness
            .applied(name)
            .await
            .iter()
            .map(|m| m.command.clone())
            .collect();
        assert_eq!(
            commands,
            vec![Bytes::from("one"), Bytes::from("two"), Bytes::from("three")]
        );
    }

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_preempt_leader() {
    let harness = make_harness(&NAMES).await;
    let (term1, _) = harness.wait_for_leader(TIMEOUT, term_greater(0)).await;
    let client = harness.make_client();

    client.preempt_leader().await.expect("preempt");
    harness.wait_for_leader(TIMEOUT, term_greater(term1)).await;

    harness.validate().await.expect("validate");
    harness.stop().await;
}

#[tokio::test]
async fn test_agreement_with_failures() {
    let failures = FailureOptions::fail_with_probability(0.05).with_latency(0.1, 20);
    let harness = Harness::builder(owned(&NAMES))
        .with_options(test_options())
        .with_failure(failures)
        .build()
        .await
        .expect("harness");
    harness.start().await;
    harness.wait_for_leader(TIMEOUT, term_greater(0)).await;

    let client = harness.make_client();
    let mut last = EntryId::sentinel();
    for i in 0..10 {
        // Individual commits may fail, the cluster has to stay consistent.
        if let Ok(entry_id) = client.commit(Bytes::from(format!("cmd-{}", i))).await {
            last = entry_id;
        }
    }
    assert!(last.index > 0, "nothing got committed");

    // Stop injecting failures so that everybody catches up.
    *harness.failures().lock().await = FailureOptions::no_failures();
    harness.wait_for_applied(last.index, NAMES.len(), TIMEOUT).await;

    harness.validate().await.expect("validate");
    harness.stop().await;
}

fn term_greater(n: i64) -> impl Fn(&(i64, Server)) -> bool {
    move |(term, _)| *term > n
}

fn test_options() -> Options {
    Options::default()
        .with_follower_timeout_ms(150..300)
        .with_candidate_timeout_ms(150..300)
        .with_leader_replicate_ms(20)
        .with_rpc_timeout_ms(100)
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn make_harness(names: &[&str]) -> Harness {
    let harness = Harness::builder(owned(names))
        .with_options(test_options())
        .build()
        .await
        .expect("harness");
    harness.start().await;
    harness
}

// Returns whether any member has applied the supplied command.
async fn applied_anywhere(harness: &Harness, command: &str) -> bool {
    for address in harness.addresses() {
        if harness
            .applied(&address.name)
            .await
            .iter()
            .any(|m| m.command == command.as_bytes())
        {
            return true;
        }
    }
    false
}

async fn entry_ids(harness: &Harness, name: &str) -> Vec<EntryId> {
    let raft = harness.member(name).await.expect("member");
    raft.entries().await.iter().map(|e| e.id()).collect()
}

async fn wait_for_member_applied(
    harness: &Harness,
    name: &str,
    index: i64,
) -> Vec<crate::raft::ApplyMsg> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let applied = harness.applied(name).await;
        if applied.len() as i64 >= index {
            return applied;
        }
        assert!(Instant::now() < deadline, "{} did not apply {}", name, index);
        sleep(Duration::from_millis(50)).await;
    }
}
