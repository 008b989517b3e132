//! Receive event of a standalone actor.

use std::sync::Arc;

use tokio::sync::mpsc;
use troupe_choreography::Part;
use troupe_core::FullMessage;

use super::slots::SharedRun;
use crate::transport::ReceiveEvent;

/// Accepts messages of the actor's protocol that the part receives: those of
/// the current run, or, before a run id is known, those that open a run. An
/// opening message fixes the run id on the spot.
pub(crate) struct InboxEvent<P> {
    pub(crate) part: Arc<Part<P>>,
    pub(crate) run: SharedRun,
    pub(crate) sender: mpsc::UnboundedSender<FullMessage<P>>,
}

impl<P: Send + Sync + 'static> ReceiveEvent<P> for InboxEvent<P> {
    fn offer(&self, message: FullMessage<P>) -> std::result::Result<(), FullMessage<P>> {
        if message.protocol != *self.part.protocol()
            || self.part.incoming_id(message.name.as_str()).is_err()
        {
            return Err(message);
        }
        // Held across the send so that a follow-up dispatched right after
        // an opening message already sees the adopted run.
        let mut run = self.run.lock();
        match *run {
            Some(current) if current != message.run => return Err(message),
            Some(_) => {}
            None if self.part.is_initial(message.name.as_str()) => *run = Some(message.run),
            None => return Err(message),
        }
        self.sender.send(message).map_err(|closed| closed.0)
    }
}
