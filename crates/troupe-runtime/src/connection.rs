//! Transport multiplexing
//!
//! A [`Connection`] is a [`Transport`] for payload `P` built on a lower
//! transport for `M`. Every upper message is encoded into an `M` and carried
//! by one run of a [`TransportChoreography`]:
//!
//! - outbound, one sending actor per destination address works through the
//!   sends queued for it and goes away once its queue is empty; a failed run
//!   fails every send still queued for that address;
//! - inbound, a [`Server`] of receiving actors hands each carried payload to
//!   the connection, which decodes it and dispatches it to its own receive
//!   events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace, warn};
use troupe_choreography::{Part, Play};
use troupe_core::{
    Address, MessageCodec, Result, RoleName, RunIdGenerator, RuntimeConfig, ShortMessage,
    TroupeConfig, TroupeError,
};

use crate::actor::Actor;
use crate::channel::{Carrier, Sink, TransportChoreography};
use crate::server::Server;
use crate::transport::{ReceiveEvent, ReceiveEventId, ReceiveEvents, Transport};

struct Outbound<M> {
    payload: M,
    receipt: oneshot::Sender<Result<()>>,
}

struct Outgoing<P, M> {
    lower: Arc<dyn Transport<M>>,
    codec: Arc<dyn MessageCodec<ShortMessage<P>, M>>,
    part: Arc<Part<M>>,
    receiver: RoleName,
    run_ids: Arc<dyn RunIdGenerator>,
    permits: Arc<Semaphore>,
    queues: Mutex<HashMap<Address, mpsc::UnboundedSender<Outbound<M>>>>,
}

/// Upper transport multiplexed over a lower one.
pub struct Connection<P, M> {
    outgoing: Arc<Outgoing<P, M>>,
    events: Arc<ReceiveEvents<P>>,
    server: Server<M, Carrier<M>>,
}

impl<P, M> Connection<P, M>
where
    P: Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    /// Multiplex over `lower`, carrying messages with `channel` and encoding
    /// them with `codec`. Must be called within a Tokio runtime: the inbound
    /// server starts right away.
    pub fn new<C>(
        lower: Arc<dyn Transport<M>>,
        codec: Arc<dyn MessageCodec<ShortMessage<P>, M>>,
        channel: C,
        config: &RuntimeConfig,
    ) -> Result<Self>
    where
        C: TransportChoreography<M>,
    {
        config.validate()?;
        let (sender, receiver) = (channel.sender(), channel.receiver());
        let play = Play::with_config(channel, config);
        let sending = play.interpret_as(sender.as_str())?;
        let receiving = play.interpret_as(receiver.as_str())?;

        let events = Arc::new(ReceiveEvents::new());
        let sink = inbound_sink(codec.clone(), Arc::downgrade(&events));
        let inbound = RuntimeConfig {
            server_workers: config.connection_workers,
            ..config.clone()
        };
        let server = Server::with_config(
            receiving,
            lower.clone(),
            move || Carrier::receiving(sink.clone()),
            &inbound,
        )?;
        server.start();

        debug!(
            protocol = %sending.protocol(),
            local = ?lower.local_address(),
            "connection opened"
        );
        Ok(Self {
            outgoing: Arc::new(Outgoing {
                lower,
                codec,
                part: sending,
                receiver,
                run_ids: config.run_ids.generator(),
                permits: Arc::new(Semaphore::new(config.connection_workers)),
                queues: Mutex::new(HashMap::new()),
            }),
            events,
            server,
        })
    }

    /// Destinations with a sending actor.
    pub fn active_destinations(&self) -> usize {
        self.outgoing.queues.lock().len()
    }

    /// Inbound runs in progress.
    pub fn inbound_runs(&self) -> usize {
        self.server.ongoing_runs()
    }

    /// Stop receiving, letting inbound runs finish within the shutdown grace.
    pub async fn close(&self) {
        self.server.stop().await;
    }
}

fn inbound_sink<P, M>(
    codec: Arc<dyn MessageCodec<ShortMessage<P>, M>>,
    events: std::sync::Weak<ReceiveEvents<P>>,
) -> Sink<M>
where
    P: Send + Sync + 'static,
    M: Send + 'static,
{
    Arc::new(move |raw: M, from: Address| {
        let Some(events) = events.upgrade() else {
            return;
        };
        match codec.decode(raw) {
            Ok(message) => {
                trace!(run = %message.run, message = %message.name, %from, "carried message");
                events.dispatch(message.lengthen(from));
            }
            Err(err) => warn!(%from, error = %err, "dropping undecodable message"),
        }
    })
}

#[async_trait]
impl<P, M> Transport<P> for Connection<P, M>
where
    P: Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    fn add_receive_event(&self, event: Arc<dyn ReceiveEvent<P>>) -> ReceiveEventId {
        self.events.add(event)
    }

    fn remove_receive_event(&self, id: ReceiveEventId) -> bool {
        self.events.remove(id)
    }

    async fn send_message(&self, message: ShortMessage<P>, to: &Address) -> Result<()> {
        let payload = self.outgoing.codec.encode(&message)?;
        let (receipt, done) = oneshot::channel();
        self.outgoing.enqueue(to, Outbound { payload, receipt });
        done.await.unwrap_or_else(|_| {
            Err(TroupeError::transmission(format!(
                "sending actor for {to} went away"
            )))
        })
    }

    fn local_address(&self) -> Option<Address> {
        self.outgoing.lower.local_address()
    }
}

impl<P, M> Outgoing<P, M>
where
    P: Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
{
    /// Queue `item` for `to`, starting a sending actor if none is running.
    fn enqueue(self: &Arc<Self>, to: &Address, item: Outbound<M>) {
        let mut queues = self.queues.lock();
        let item = match queues.get(to) {
            Some(queue) => match queue.send(item) {
                Ok(()) => return,
                Err(closed) => closed.0,
            },
            None => item,
        };
        let (queue, pending) = mpsc::unbounded_channel();
        let _ = queue.send(item);
        queues.insert(to.clone(), queue);
        debug!(%to, "sending actor started");
        tokio::spawn(self.clone().drive(to.clone(), pending));
    }

    async fn drive(self: Arc<Self>, to: Address, mut pending: mpsc::UnboundedReceiver<Outbound<M>>) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            self.fail_all(&to, &mut pending, TroupeError::aborted("connection closed"));
            return;
        };
        let mut actor = match self.sending_actor(&to) {
            Ok(actor) => actor,
            Err(err) => {
                self.fail_all(&to, &mut pending, err);
                return;
            }
        };

        while let Some(next) = self.next_for(&to, &mut pending) {
            actor.state_mut().load(next.payload);
            match actor.perform().await {
                Ok(()) => {
                    let _ = next.receipt.send(Ok(()));
                }
                Err(err) => {
                    warn!(%to, error = %err, "carrying run failed");
                    let failure = TroupeError::transmission(format!("to {to}: {err}"));
                    let _ = next.receipt.send(Err(failure.clone()));
                    self.fail_all(&to, &mut pending, failure);
                    return;
                }
            }
        }
        debug!(%to, "sending actor retired");
    }

    fn sending_actor(&self, to: &Address) -> Result<Actor<M, Carrier<M>>> {
        let mut actor = Actor::new(Carrier::sending()).with_run_ids(self.run_ids.clone());
        actor.load(self.part.clone(), self.lower.clone())?;
        actor.set_initial_address(self.receiver.as_str(), to.clone())?;
        Ok(actor)
    }

    /// Next queued send, or `None` after retiring the queue. Retiring happens
    /// under the queue map lock so no send slips in between.
    fn next_for(
        &self,
        to: &Address,
        pending: &mut mpsc::UnboundedReceiver<Outbound<M>>,
    ) -> Option<Outbound<M>> {
        if let Ok(next) = pending.try_recv() {
            return Some(next);
        }
        let mut queues = self.queues.lock();
        match pending.try_recv() {
            Ok(next) => Some(next),
            Err(_) => {
                queues.remove(to);
                None
            }
        }
    }

    fn fail_all(
        &self,
        to: &Address,
        pending: &mut mpsc::UnboundedReceiver<Outbound<M>>,
        failure: TroupeError,
    ) {
        let mut queues = self.queues.lock();
        queues.remove(to);
        pending.close();
        drop(queues);
        let mut failed = 0usize;
        while let Ok(item) = pending.try_recv() {
            let _ = item.receipt.send(Err(failure.clone()));
            failed += 1;
        }
        if failed > 0 {
            warn!(%to, failed, error = %failure, "failed queued sends");
        }
    }
}
