//! Server pool behavior
//!
//! Reports, actor reuse, capability checks at construction, and shutdown of
//! runs that never finish.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use troupe_choreography::{Choreography, Play, Role, RoleSpec, Scene, Stage};
use troupe_core::{
    Delay, ProtocolName, RunId, RuntimeConfig, SequentialRunIds, ShortMessage, TroupeError,
};
use troupe_runtime::{Actor, MemoryNetwork, Server, Transport};
use troupe_testkit::{init_tracing, AcknowledgedExchange, Correspondent, Recipient};

fn exchange() -> AcknowledgedExchange {
    AcknowledgedExchange::new(Duration::from_millis(50), Duration::from_millis(50))
}

#[tokio::test(start_paused = true)]
async fn test_sequential_runs_reuse_one_actor() {
    init_tracing();
    let play = Play::new(exchange());
    let network = MemoryNetwork::new();

    let created = Arc::new(AtomicUsize::new(0));
    let factory_created = created.clone();
    let server = Server::new(
        play.interpret_as("receiver").unwrap(),
        Arc::new(network.attach("receiver")),
        move || {
            factory_created.fetch_add(1, Ordering::SeqCst);
            Recipient::default()
        },
        4,
    )
    .unwrap();
    let mut reports = server.subscribe();
    server.start();

    let mut client = Actor::new(Correspondent::with_message("again"))
        .with_run_ids(Arc::new(SequentialRunIds::starting_at(1)));
    client
        .load(play.interpret_as("sender").unwrap(), Arc::new(network.attach("sender")))
        .unwrap();
    client.set_initial_address("receiver", "receiver").unwrap();

    for expected in 1..=3 {
        client.perform().await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.run, RunId::new(expected));
        assert!(report.outcome.is_ok());
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(server.idle_actors(), 1);
    assert_eq!(server.completed(), 3);
    assert_eq!(server.ongoing_runs(), 0);
    server.stop().await;
}

#[test]
fn test_server_rejects_state_of_another_type() {
    let play = Play::new(exchange());
    let network = MemoryNetwork::new();
    let built = Server::new(
        play.interpret_as("receiver").unwrap(),
        Arc::new(network.attach("receiver")),
        || 0u64,
        1,
    );
    let Err(err) = built else {
        panic!("a u64 state cannot play a Recipient role");
    };
    assert_matches!(err, TroupeError::CapabilityMismatch { .. });
}

/// The client opens and never closes.
struct Hold;

fn client() -> Role<()> {
    Role::new("client")
}

fn service() -> Role<()> {
    Role::new("service")
}

impl Choreography for Hold {
    type Payload = u8;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("hold")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![client().spec(), service().spec()]
    }

    fn scene(&self, stage: &mut Stage<u8>) -> Scene {
        stage.send(&client(), &service(), "open", Delay::UNBOUNDED)?;
        stage.send(&client(), &service(), "close", Delay::UNBOUNDED)
    }
}

fn hold_server(network: &Arc<MemoryNetwork<u8>>) -> Server<u8, ()> {
    let play = Play::new(Hold);
    Server::with_config(
        play.interpret_as("service").unwrap(),
        Arc::new(network.attach("service")),
        || (),
        &RuntimeConfig::testing(),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_stuck_runs_after_grace() {
    init_tracing();
    let network = MemoryNetwork::new();
    let server = hold_server(&network);
    let mut reports = server.subscribe();
    server.start();

    let raw = network.attach("client");
    raw.send_message(ShortMessage::new(RunId::new(4), "hold", "open", Some(1)), &"service".into())
        .await
        .unwrap();
    assert_eq!(server.ongoing_runs(), 1);

    let started = tokio::time::Instant::now();
    server.stop().await;
    assert!(started.elapsed() >= Duration::from_millis(100));

    let report = reports.recv().await.unwrap();
    assert_eq!(report.run, RunId::new(4));
    assert_matches!(report.outcome, Err(TroupeError::Aborted { .. }));
    assert_eq!(server.ongoing_runs(), 0);

    // Stopped servers take no new runs.
    raw.send_message(ShortMessage::new(RunId::new(5), "hold", "open", Some(1)), &"service".into())
        .await
        .unwrap();
    assert_eq!(server.ongoing_runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_message_of_unknown_run_starts_nothing() {
    init_tracing();
    let network = MemoryNetwork::new();
    let server = hold_server(&network);
    server.start();

    let raw = network.attach("client");
    raw.send_message(ShortMessage::new(RunId::new(8), "hold", "close", Some(0)), &"service".into())
        .await
        .unwrap();
    assert_eq!(server.ongoing_runs(), 0);

    raw.send_message(ShortMessage::new(RunId::new(8), "hold", "open", Some(0)), &"service".into())
        .await
        .unwrap();
    raw.send_message(ShortMessage::new(RunId::new(8), "hold", "close", Some(0)), &"service".into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(server.ongoing_runs(), 0);
    assert_eq!(server.completed(), 1);
    server.stop().await;
}
