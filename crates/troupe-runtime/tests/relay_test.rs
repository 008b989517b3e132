//! Masked relay aggregation over served participants
//!
//! The initiator is a standalone actor, each participant a server on its own
//! endpoint. Participants that are not attached to the network are skipped.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use troupe_choreography::Play;
use troupe_core::TroupeError;
use troupe_runtime::{Actor, MemoryNetwork, Server};
use troupe_testkit::{init_tracing, Initiator, Participant, RelayAggregation};

const MASK: i64 = 1_000;

/// Run one relay over `participants` participants; those missing from
/// `present` never attach. Returns the initiator's outcome and final state.
async fn relay(participants: usize, present: &BTreeMap<usize, i64>) -> (Result<(), TroupeError>, Initiator) {
    init_tracing();
    let play = Play::new(RelayAggregation::new(participants, Duration::from_millis(100)));
    let network = MemoryNetwork::new();

    let mut servers = Vec::new();
    for (&i, &hidden) in present {
        let server = Server::new(
            play.interpret_as(&format!("p{i}")).unwrap(),
            Arc::new(network.attach(format!("p{i}"))),
            move || Participant::new(hidden, 111 * i as i64),
            2,
        )
        .unwrap();
        server.set_initial_address("initiator", "initiator").unwrap();
        for later in i + 1..=participants {
            let name = format!("p{later}");
            server.set_initial_address(&name, name.as_str()).unwrap();
        }
        server.start();
        servers.push(server);
    }

    let mut initiator = Actor::new(Initiator::new(MASK));
    initiator
        .load(play.interpret_as("initiator").unwrap(), Arc::new(network.attach("initiator")))
        .unwrap();
    initiator.set_initial_address("p1", "p1").unwrap();
    let outcome = initiator.perform().await;

    for server in &servers {
        server.stop().await;
    }
    (outcome, initiator.state().clone())
}

#[tokio::test(start_paused = true)]
async fn test_everyone_present() {
    let present = BTreeMap::from([(1, 10), (2, 20), (3, 30)]);
    let (outcome, initiator) = relay(3, &present).await;
    outcome.unwrap();
    assert_eq!(initiator.aggregate, Some(60));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_participant_is_skipped() {
    let present = BTreeMap::from([(1, 10), (2, 20), (4, 40)]);
    let (outcome, initiator) = relay(4, &present).await;
    outcome.unwrap();
    assert_eq!(initiator.aggregate, Some(70));
}

#[tokio::test(start_paused = true)]
async fn test_last_participants_missing() {
    let present = BTreeMap::from([(1, -5)]);
    let (outcome, initiator) = relay(3, &present).await;
    outcome.unwrap();
    assert_eq!(initiator.aggregate, Some(-5));
}

#[tokio::test(start_paused = true)]
async fn test_first_participant_missing_fails_the_seed() {
    let present = BTreeMap::from([(2, 20)]);
    let (outcome, initiator) = relay(2, &present).await;
    assert!(outcome.unwrap_err().is_transmission_failure());
    assert_eq!(initiator.aggregate, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_on_worker_threads() {
    let present = BTreeMap::from([(1, 7), (2, 11), (3, 13), (5, 17)]);
    let (outcome, initiator) = relay(5, &present).await;
    outcome.unwrap();
    assert_eq!(initiator.aggregate, Some(48));
}
