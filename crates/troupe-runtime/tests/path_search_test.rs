//! Overtaking messages
//!
//! Alice may or may not send `c` between `a` and `b`. Whatever order the
//! messages reach Bob in, he must not settle for `a -> b` while `c` can still
//! arrive, and must settle for it once `c` has expired. A `c` without any
//! deadline is waited for indefinitely.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;
use troupe_choreography::{Choreography, Play, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, FullMessage, ProtocolName, RunId, SequentialRunIds, ShortMessage};
use troupe_runtime::{Actor, MemoryNetwork, MemoryTransport, ReceiveEvent, Transport};
use troupe_testkit::init_tracing;

const TOLERANCE: Delay = Delay::from_millis(50);

struct Detour {
    detour: Delay,
}

fn alice() -> Role<()> {
    Role::new("alice")
}

fn bob() -> Role<Vec<String>> {
    Role::new("bob")
}

impl Choreography for Detour {
    type Payload = u8;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("detour")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<u8>) -> Scene {
        stage.send(&bob(), &alice(), "start", TOLERANCE)?;
        stage.send(&alice(), &bob(), "a", TOLERANCE)?;
        if stage.test_named(&alice(), "detour", |_| Ok(true))? {
            stage.send(&alice(), &bob(), "c", self.detour)?;
        }
        stage.send(&alice(), &bob(), "b", TOLERANCE)?;
        stage.run_named(&bob(), "record", |p| {
            let seen = ["a", "c", "b"]
                .into_iter()
                .filter(|name| p.has_message(name))
                .map(str::to_owned)
                .collect();
            *p.state_mut() = seen;
            Ok(())
        })
    }
}

/// Reports the run of every `start` Bob sends.
struct Started(mpsc::UnboundedSender<RunId>);

impl ReceiveEvent<u8> for Started {
    fn offer(&self, message: FullMessage<u8>) -> Result<(), FullMessage<u8>> {
        if message.name.as_str() != "start" {
            return Err(message);
        }
        let _ = self.0.send(message.run);
        Ok(())
    }
}

type Recorded = tokio::task::JoinHandle<troupe_core::Result<Vec<String>>>;

/// Bob's run in progress against a scripted Alice.
struct Scripted {
    alice: MemoryTransport<u8>,
    run: RunId,
    bob: Recorded,
}

impl Scripted {
    /// Start Bob and wait for his `start`.
    async fn start(detour: Delay) -> Self {
        let play = Play::new(Detour { detour });
        let network = MemoryNetwork::new();
        let alice = network.attach("alice");
        let (started, mut runs) = mpsc::unbounded_channel();
        alice.add_receive_event(Arc::new(Started(started)));

        let mut bob =
            Actor::new(Vec::new()).with_run_ids(Arc::new(SequentialRunIds::starting_at(5)));
        bob.load(play.interpret_as("bob").unwrap(), Arc::new(network.attach("bob")))
            .unwrap();
        bob.set_initial_address("alice", "alice").unwrap();
        let bob = tokio::spawn(async move { bob.perform().await.map(|()| bob.state().clone()) });

        let run = runs.recv().await.unwrap();
        assert_eq!(run, RunId::new(5));
        Self { alice, run, bob }
    }

    async fn inject(&self, order: &[&str]) {
        for name in order {
            self.alice
                .send_message(ShortMessage::new(self.run, "detour", *name, Some(0)), &"bob".into())
                .await
                .unwrap();
        }
    }
}

/// Play Bob against a scripted Alice delivering `order`; returns what Bob
/// recorded.
async fn deliver(order: &[&str]) -> Vec<String> {
    let scripted = Scripted::start(TOLERANCE).await;
    scripted.inject(order).await;
    scripted.bob.await.unwrap().unwrap()
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_in_order_detour_is_taken() {
    init_tracing();
    assert_eq!(deliver(&["a", "c", "b"]).await, ["a", "c", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_overtaking_message_waits_for_the_detour() {
    init_tracing();
    assert_eq!(deliver(&["a", "b", "c"]).await, ["a", "c", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_detour_releases_the_short_path() {
    init_tracing();
    let started = tokio::time::Instant::now();
    assert_eq!(deliver(&["b", "a"]).await, ["a", "b"]);
    // `c` had to expire first: its deadline is three tolerances after `start`.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn test_detour_without_deadline_holds_the_short_path() {
    init_tracing();
    let mut scripted = Scripted::start(Delay::UNBOUNDED).await;
    scripted.inject(&["a", "b"]).await;
    let waited = tokio::time::timeout(Duration::from_secs(10), &mut scripted.bob).await;
    assert!(waited.is_err(), "settled for a -> b while c could still arrive");

    scripted.inject(&["c"]).await;
    assert_eq!(scripted.bob.await.unwrap().unwrap(), ["a", "c", "b"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_arrival_order_does_not_matter(
        order in Just(vec!["a", "b", "c"]).prop_shuffle(),
    ) {
        let recorded = paused_runtime().block_on(deliver(&order));
        prop_assert_eq!(recorded, vec!["a", "c", "b"]);
    }
}
