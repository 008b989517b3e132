//! Test Transport Utilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use troupe_core::{Address, MessageName, Result, ShortMessage};
use troupe_runtime::{ReceiveEvent, ReceiveEventId, Transport};

/// Wraps a transport and silently drops the first `count` messages named
/// `name`. Dropped sends report success, as a lossy network would.
pub struct LossyTransport<P> {
    inner: Arc<dyn Transport<P>>,
    name: MessageName,
    remaining: AtomicUsize,
    dropped: AtomicUsize,
}

impl<P> LossyTransport<P> {
    /// Lose the first `count` messages called `name` sent through `inner`.
    pub fn new(inner: Arc<dyn Transport<P>>, name: impl Into<MessageName>, count: usize) -> Self {
        Self {
            inner,
            name: name.into(),
            remaining: AtomicUsize::new(count),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn should_drop(&self, name: &MessageName) -> bool {
        *name == self.name
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> Transport<P> for LossyTransport<P> {
    fn add_receive_event(&self, event: Arc<dyn ReceiveEvent<P>>) -> ReceiveEventId {
        self.inner.add_receive_event(event)
    }

    fn remove_receive_event(&self, id: ReceiveEventId) -> bool {
        self.inner.remove_receive_event(id)
    }

    async fn send_message(&self, message: ShortMessage<P>, to: &Address) -> Result<()> {
        if self.should_drop(&message.name) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(run = %message.run, message = %message.name, %to, "message lost on purpose");
            return Ok(());
        }
        self.inner.send_message(message, to).await
    }

    fn local_address(&self) -> Option<Address> {
        self.inner.local_address()
    }
}
