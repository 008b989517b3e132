//! In-process transport for tests and local composition.
//!
//! A [`MemoryNetwork`] maps addresses to the receive-event registries of the
//! transports attached under them. Sending dispatches on the sender's task;
//! an address nobody is attached to cannot be reached.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;
use troupe_core::{Address, Result, ShortMessage, TroupeError};

use super::traits::{ReceiveEvent, ReceiveEventId, ReceiveEvents, Transport};

/// Shared switchboard of in-memory transports.
pub struct MemoryNetwork<P> {
    endpoints: RwLock<HashMap<Address, Arc<ReceiveEvents<P>>>>,
}

impl<P: Send + 'static> MemoryNetwork<P> {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    /// Attach a transport under `address`, replacing any previous one.
    pub fn attach(self: &Arc<Self>, address: impl Into<Address>) -> MemoryTransport<P> {
        let address = address.into();
        let events = Arc::new(ReceiveEvents::new());
        self.endpoints.write().insert(address.clone(), events.clone());
        MemoryTransport {
            network: self.clone(),
            address,
            events,
        }
    }

    /// Detach whatever is attached under `address`. Later sends to it fail.
    pub fn detach(&self, address: &Address) -> bool {
        self.endpoints.write().remove(address).is_some()
    }

    /// Whether something is attached under `address`.
    pub fn is_attached(&self, address: &Address) -> bool {
        self.endpoints.read().contains_key(address)
    }

    fn endpoint(&self, address: &Address) -> Option<Arc<ReceiveEvents<P>>> {
        self.endpoints.read().get(address).cloned()
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport<P> {
    network: Arc<MemoryNetwork<P>>,
    address: Address,
    events: Arc<ReceiveEvents<P>>,
}

impl<P> MemoryTransport<P> {
    /// Address this transport is attached under.
    pub fn address(&self) -> &Address {
        &self.address
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> Transport<P> for MemoryTransport<P> {
    fn add_receive_event(&self, event: Arc<dyn ReceiveEvent<P>>) -> ReceiveEventId {
        self.events.add(event)
    }

    fn remove_receive_event(&self, id: ReceiveEventId) -> bool {
        self.events.remove(id)
    }

    async fn send_message(&self, message: ShortMessage<P>, to: &Address) -> Result<()> {
        let endpoint = self.network.endpoint(to).ok_or_else(|| {
            TroupeError::transmission(format!("{to} is not attached to the network"))
        })?;
        trace!(
            from = %self.address,
            %to,
            run = %message.run,
            message = %message.name,
            "memory delivery"
        );
        endpoint.dispatch(message.lengthen(self.address.clone()));
        Ok(())
    }

    fn local_address(&self) -> Option<Address> {
        Some(self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use troupe_core::{FullMessage, RunId};

    #[derive(Default)]
    struct Collect(Mutex<Vec<FullMessage<u32>>>);

    impl ReceiveEvent<u32> for Collect {
        fn offer(&self, message: FullMessage<u32>) -> std::result::Result<(), FullMessage<u32>> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_carries_sender_address() {
        let network = MemoryNetwork::new();
        let alice = network.attach("alice");
        let bob = network.attach("bob");
        let inbox = Arc::new(Collect::default());
        bob.add_receive_event(inbox.clone());

        alice
            .send_message(
                ShortMessage::new(RunId::new(3), "p", "hello", Some(7)),
                &Address::new("bob"),
            )
            .await
            .unwrap();

        let received = inbox.0.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, Address::new("alice"));
        assert_eq!(received[0].payload, Some(7));
    }

    #[tokio::test]
    async fn test_detached_address_is_a_transmission_failure() {
        let network = MemoryNetwork::<u32>::new();
        let alice = network.attach("alice");
        let _bob = network.attach("bob");
        assert!(network.detach(&Address::new("bob")));

        let err = alice
            .send_message(
                ShortMessage::new(RunId::new(1), "p", "hello", None),
                &Address::new("bob"),
            )
            .await
            .unwrap_err();
        assert!(err.is_transmission_failure());
    }
}
