//! Acknowledged exchange between two standalone actors
//!
//! Covers the happy path, a lost acknowledgement with and without a handler,
//! and what happens to messages that show up again after being accepted.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use troupe_choreography::{Choreography, Play, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, RunId, SequentialRunIds, ShortMessage, TroupeError};
use troupe_runtime::{Actor, MemoryNetwork, Transport};
use troupe_testkit::{init_tracing, AcknowledgedExchange, Correspondent, LossyTransport, Recipient};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

struct Pair {
    sender: Actor<String, Correspondent>,
    receiver: Actor<String, Recipient>,
}

/// Sender on `sender`, receiver on `receiver` (or a lossy wrapper of it that
/// drops the first `lost_acks` acknowledgements).
fn pair(exchange: AcknowledgedExchange, lost_acks: usize) -> Pair {
    let play = Play::new(exchange);
    let network = MemoryNetwork::new();

    let mut sender = Actor::new(Correspondent::with_message("hello"))
        .with_run_ids(Arc::new(SequentialRunIds::starting_at(11)));
    sender
        .load(play.interpret_as("sender").unwrap(), Arc::new(network.attach("sender")))
        .unwrap();
    sender.set_initial_address("receiver", "receiver").unwrap();

    let lower: Arc<dyn Transport<String>> = Arc::new(network.attach("receiver"));
    let transport = Arc::new(LossyTransport::new(lower, "ack", lost_acks));
    let mut receiver = Actor::new(Recipient::default());
    receiver
        .load(play.interpret_as("receiver").unwrap(), transport)
        .unwrap();

    Pair { sender, receiver }
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_exchange_completes() {
    init_tracing();
    let Pair {
        mut sender,
        mut receiver,
    } = pair(AcknowledgedExchange::new(ms(50), ms(50)), 0);

    let served = tokio::spawn(async move {
        receiver.perform().await.map(|()| receiver.state().clone())
    });
    sender.perform().await.unwrap();

    assert!(sender.state().acknowledged);
    assert!(!sender.state().unacknowledged);
    assert_eq!(sender.run_id(), Some(RunId::new(11)));
    assert_eq!(sender.message("msg").unwrap(), "hello");

    let recipient = served.await.unwrap().unwrap();
    assert_eq!(recipient.received, vec!["hello".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_ack_without_handler_fails_the_run() {
    init_tracing();
    let Pair {
        mut sender,
        mut receiver,
    } = pair(AcknowledgedExchange::new(ms(50), ms(50)), 1);

    let served = tokio::spawn(async move { receiver.perform().await });
    let err = sender.perform().await.unwrap_err();

    assert_matches!(
        &err,
        TroupeError::ReceptionTimeout { message, protocol, run }
            if message == "ack" && protocol == "acknowledged-exchange" && run.0 == Some(RunId::new(11))
    );
    assert!(err.is_recoverable());
    assert!(!sender.state().acknowledged);
    served.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_ack_with_handler_runs_it() {
    init_tracing();
    let Pair {
        mut sender,
        mut receiver,
    } = pair(AcknowledgedExchange::new(ms(50), ms(50)).handled(), 1);

    let served = tokio::spawn(async move { receiver.perform().await });
    let started = tokio::time::Instant::now();
    sender.perform().await.unwrap();

    assert!(sender.state().unacknowledged);
    assert!(!sender.state().acknowledged);
    // The deadline is both tolerances after sending `msg`.
    assert!(started.elapsed() >= ms(100));
    served.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_receiver_is_a_transmission_failure() {
    let play = Play::new(AcknowledgedExchange::new(ms(50), ms(50)));
    let network = MemoryNetwork::new();
    let mut sender = Actor::new(Correspondent::with_message("hello"));
    sender
        .load(play.interpret_as("sender").unwrap(), Arc::new(network.attach("sender")))
        .unwrap();
    sender.set_initial_address("receiver", "nobody").unwrap();

    let err = sender.perform().await.unwrap_err();
    assert!(err.is_transmission_failure());
    assert!(sender.run_id().is_some());
}

/// Alice sends `first`, waits for Bob's `ok`, then sends `second`.
struct Sequence;

fn alice() -> Role<()> {
    Role::new("alice")
}

fn bob() -> Role<Vec<u32>> {
    Role::new("bob")
}

impl Choreography for Sequence {
    type Payload = u32;

    fn protocol_name(&self) -> troupe_core::ProtocolName {
        "sequence".into()
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<u32>) -> Scene {
        let tolerance = Delay::from_millis(200);
        stage.exchange(&alice(), &bob(), "first", tolerance, |_| Ok(1), |p, n| {
            p.state_mut().push(n);
            Ok(())
        })?;
        stage.send(&bob(), &alice(), "ok", tolerance)?;
        stage.exchange(&alice(), &bob(), "second", tolerance, |_| Ok(2), |p, n| {
            p.state_mut().push(n);
            Ok(())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_accepted_message_is_never_replaced() {
    init_tracing();
    let play = Play::new(Sequence);
    let network = MemoryNetwork::new();
    let raw = network.attach("alice");

    let mut alice = Actor::new(()).with_run_ids(Arc::new(SequentialRunIds::starting_at(9)));
    alice
        .load(play.interpret_as("alice").unwrap(), Arc::new(raw.clone()))
        .unwrap();
    alice.set_initial_address("bob", "bob").unwrap();

    let mut bob = Actor::new(Vec::<u32>::new());
    bob.load(play.interpret_as("bob").unwrap(), Arc::new(network.attach("bob")))
        .unwrap();

    // An early copy of `first` opens Bob's run; Alice's own `first` then
    // arrives after it was accepted and must not overwrite it.
    raw.send_message(
        ShortMessage::new(RunId::new(9), "sequence", "first", Some(7)),
        &"bob".into(),
    )
    .await
    .unwrap();

    let served = tokio::spawn(async move { bob.perform().await.map(|()| bob.state().clone()) });
    alice.perform().await.unwrap();

    assert_eq!(served.await.unwrap().unwrap(), vec![7, 2]);
}
