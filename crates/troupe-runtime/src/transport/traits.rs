//! Core transport trait definitions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;
use troupe_core::{Address, FullMessage, Result, ShortMessage};

/// Handle returned by [`Transport::add_receive_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiveEventId(u64);

impl std::fmt::Display for ReceiveEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event-{}", self.0)
    }
}

/// Inbound filter registered on a transport.
///
/// `offer` runs on the delivering task. It must not block and must not run
/// protocol logic: accepting a message means enqueueing it somewhere.
pub trait ReceiveEvent<P>: Send + Sync {
    /// Consume `message`, or hand it back for the next event to look at.
    fn offer(&self, message: FullMessage<P>) -> std::result::Result<(), FullMessage<P>>;
}

/// Uniform duplex message resource the runtime plays choreographies over.
#[async_trait]
pub trait Transport<P>: Send + Sync {
    /// Register an inbound filter. Events are offered messages in
    /// registration order and the first one to accept consumes it.
    fn add_receive_event(&self, event: Arc<dyn ReceiveEvent<P>>) -> ReceiveEventId;

    /// Unregister an inbound filter; returns whether it was registered.
    fn remove_receive_event(&self, id: ReceiveEventId) -> bool;

    /// Send `message` to `to`. Failing to reach the destination is a
    /// [`TroupeError::TransmissionFailure`](troupe_core::TroupeError::TransmissionFailure).
    async fn send_message(&self, message: ShortMessage<P>, to: &Address) -> Result<()>;

    /// Address peers see as the sender of this transport's messages.
    fn local_address(&self) -> Option<Address>;
}

/// First-acceptor dispatch registry shared by transport implementations.
pub struct ReceiveEvents<P> {
    next: AtomicU64,
    events: RwLock<Vec<(ReceiveEventId, Arc<dyn ReceiveEvent<P>>)>>,
}

impl<P> ReceiveEvents<P> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Register `event` after every existing one.
    pub fn add(&self, event: Arc<dyn ReceiveEvent<P>>) -> ReceiveEventId {
        let id = ReceiveEventId(self.next.fetch_add(1, Ordering::Relaxed));
        self.events.write().push((id, event));
        id
    }

    /// Unregister `id`.
    pub fn remove(&self, id: ReceiveEventId) -> bool {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|(registered, _)| *registered != id);
        events.len() != before
    }

    /// Number of registered events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether no event is registered.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Offer `message` to each event in turn. Returns the message if none
    /// accepted it.
    pub fn dispatch(&self, message: FullMessage<P>) -> Option<FullMessage<P>> {
        let events: Vec<_> = self
            .events
            .read()
            .iter()
            .map(|(_, event)| event.clone())
            .collect();

        let mut message = message;
        for event in events {
            match event.offer(message) {
                Ok(()) => return None,
                Err(declined) => message = declined,
            }
        }
        trace!(
            run = %message.run,
            protocol = %message.protocol,
            message = %message.name,
            from = %message.from,
            "no receive event accepted message"
        );
        Some(message)
    }
}

impl<P> Default for ReceiveEvents<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use troupe_core::RunId;

    struct Named {
        accepts: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl ReceiveEvent<u8> for Named {
        fn offer(&self, message: FullMessage<u8>) -> std::result::Result<(), FullMessage<u8>> {
            if message.name.as_str() == self.accepts {
                self.seen.lock().push(message.name.to_string());
                Ok(())
            } else {
                Err(message)
            }
        }
    }

    fn message(name: &str) -> FullMessage<u8> {
        ShortMessage::new(RunId::new(1), "p", name, None).lengthen(Address::new("a"))
    }

    #[test]
    fn test_first_acceptor_consumes() {
        let events = ReceiveEvents::new();
        let first = Arc::new(Named {
            accepts: "x",
            seen: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Named {
            accepts: "x",
            seen: Mutex::new(Vec::new()),
        });
        events.add(first.clone());
        let id = events.add(second.clone());

        assert!(events.dispatch(message("x")).is_none());
        assert_eq!(first.seen.lock().len(), 1);
        assert!(second.seen.lock().is_empty());

        let unclaimed = events.dispatch(message("y"));
        assert_eq!(unclaimed.map(|m| m.name.to_string()), Some("y".to_string()));

        assert!(events.remove(id));
        assert!(!events.remove(id));
        assert_eq!(events.len(), 1);
    }
}
