//! Choreographies played over multiplexed connections
//!
//! Upper messages are bincode-encoded and carried over an in-memory byte
//! network by runs of the acknowledged channel.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use troupe_choreography::Play;
use troupe_core::{
    BincodeCodec, FullMessage, MessageCodec, RunId, RunIdStrategy, RuntimeConfig, ShortMessage,
};
use troupe_runtime::{
    AcknowledgedChannel, Actor, Connection, MemoryNetwork, ReceiveEvent, Transport,
};
use troupe_testkit::{
    init_tracing, AcknowledgedExchange, Correspondent, LossyTransport, Recipient,
};

type Bytes = Vec<u8>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn connect(lower: Arc<dyn Transport<Bytes>>, seed: u64) -> Connection<String, Bytes> {
    let codec: Arc<dyn MessageCodec<ShortMessage<String>, Bytes>> =
        Arc::new(BincodeCodec::<ShortMessage<String>>::new());
    let config = RuntimeConfig {
        run_ids: RunIdStrategy::Seeded { seed },
        ..RuntimeConfig::testing()
    };
    Connection::new(lower, codec, AcknowledgedChannel::new(ms(20), ms(30)), &config).unwrap()
}

/// Forwards every upper message to a channel.
struct Collect(mpsc::UnboundedSender<FullMessage<String>>);

impl ReceiveEvent<String> for Collect {
    fn offer(&self, message: FullMessage<String>) -> Result<(), FullMessage<String>> {
        let _ = self.0.send(message);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_exchange_over_connections() {
    init_tracing();
    let network = MemoryNetwork::<Bytes>::new();
    let a = Arc::new(connect(Arc::new(network.attach("a")), 1));
    let b = Arc::new(connect(Arc::new(network.attach("b")), 2));

    let play = Play::new(AcknowledgedExchange::new(ms(200), ms(200)));
    let mut sender = Actor::new(Correspondent::with_message("over the wire"));
    sender.load(play.interpret_as("sender").unwrap(), a.clone()).unwrap();
    sender.set_initial_address("receiver", "b").unwrap();
    let mut receiver = Actor::new(Recipient::default());
    receiver.load(play.interpret_as("receiver").unwrap(), b.clone()).unwrap();

    let served = tokio::spawn(async move { receiver.perform().await.map(|()| receiver.state().clone()) });
    sender.perform().await.unwrap();
    assert!(sender.state().acknowledged);
    // Replies go back to the lower address the message came from.
    assert_eq!(
        served.await.unwrap().unwrap().received,
        vec!["over the wire".to_owned()]
    );

    tokio::time::sleep(ms(1)).await;
    assert_eq!(a.active_destinations(), 0);
    assert_eq!(b.active_destinations(), 0);
    a.close().await;
    b.close().await;
    assert_eq!(a.inbound_runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unattached_destination_fails_the_send() {
    init_tracing();
    let network = MemoryNetwork::<Bytes>::new();
    let a = connect(Arc::new(network.attach("a")), 1);

    let err = a
        .send_message(
            ShortMessage::new(RunId::new(1), "upper", "hello", Some("x".to_owned())),
            &"nowhere".into(),
        )
        .await
        .unwrap_err();
    assert!(err.is_transmission_failure());
    assert!(err.to_string().contains("nowhere"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_lost_lower_ack_fails_the_upper_send() {
    init_tracing();
    let network = MemoryNetwork::<Bytes>::new();
    let a = connect(Arc::new(network.attach("a")), 1);
    let lower_b: Arc<dyn Transport<Bytes>> = Arc::new(network.attach("b"));
    let b = connect(Arc::new(LossyTransport::new(lower_b, "ack", 1)), 2);

    let (collected, mut inbox) = mpsc::unbounded_channel();
    b.add_receive_event(Arc::new(Collect(collected)));

    let message = ShortMessage::new(RunId::new(3), "upper", "hello", Some("payload".to_owned()));
    let started = tokio::time::Instant::now();
    let err = a.send_message(message, &"b".into()).await.unwrap_err();
    assert!(err.is_transmission_failure());
    assert!(started.elapsed() >= ms(50));

    // The data itself got through; only its acknowledgement was lost.
    let delivered = inbox.recv().await.unwrap();
    assert_eq!(delivered.name.as_str(), "hello");
    assert_eq!(delivered.payload.as_deref(), Some("payload"));
    assert_eq!(delivered.from.as_str(), "a");

    // The next send to the same address gets a fresh sending actor.
    a.send_message(
        ShortMessage::new(RunId::new(4), "upper", "again", Some("payload".to_owned())),
        &"b".into(),
    )
    .await
    .unwrap();
    assert_eq!(inbox.recv().await.unwrap().run, RunId::new(4));
}
