//! Actor runtime
//!
//! An [`Actor`] executes one role of a choreography: it walks the role's
//! [`Part`], runs local steps against its state, sends through a
//! [`Transport`] and, whenever the part says to wait, collects incoming
//! messages until the path search picks a continuation.
//!
//! Actors are single threaded. Concurrency comes from running many of them,
//! see [`crate::server::Server`].

mod inbox;
mod phase;
mod search;
mod slots;

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use troupe_choreography::{EndKind, IncomingId, NextAction, Part, StepId, StepKind};
use troupe_core::{
    Address, FullMessage, MessageName, RandomRunIds, Result, RoleName, RunId, RunIdGenerator,
    ShortMessage, TroupeError,
};

use crate::transport::{ReceiveEventId, Transport};
use inbox::InboxEvent;
use phase::Phase;
use search::Verdict;
use slots::{read, stage, RunState, SharedRun, Slots};

/// Executor of one role.
///
/// `S` is the role state local steps operate on; it survives runs, while
/// message slots and committed addresses are per run.
pub struct Actor<P, S> {
    state: S,
    run_ids: Arc<dyn RunIdGenerator>,
    loaded: Option<Loaded<P>>,
}

struct Loaded<P> {
    part: Arc<Part<P>>,
    transport: Arc<dyn Transport<P>>,
    run: RunState<P>,
    inbox: mpsc::UnboundedReceiver<FullMessage<P>>,
    registration: Option<ReceiveEventId>,
}

impl<P> Drop for Loaded<P> {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            self.transport.remove_receive_event(id);
        }
    }
}

impl<P, S> Actor<P, S>
where
    P: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Create an unloaded actor around `state`.
    pub fn new(state: S) -> Self {
        Self {
            state,
            run_ids: Arc::new(RandomRunIds::from_entropy()),
            loaded: None,
        }
    }

    /// Draw run identifiers from `run_ids` instead of the default CSPRNG.
    pub fn with_run_ids(mut self, run_ids: Arc<dyn RunIdGenerator>) -> Self {
        self.run_ids = run_ids;
        self
    }

    /// Bind the actor to `part`, receiving through `transport`.
    ///
    /// An actor is loaded once; its state type must provide every capability
    /// the part's local steps need.
    pub fn load(&mut self, part: Arc<Part<P>>, transport: Arc<dyn Transport<P>>) -> Result<()> {
        self.check_loadable(&part)?;
        let run: SharedRun = SharedRun::default();
        let (sender, inbox) = mpsc::unbounded_channel();
        let registration = transport.add_receive_event(Arc::new(InboxEvent {
            part: part.clone(),
            run: run.clone(),
            sender,
        }));
        debug!(
            protocol = %part.protocol(),
            role = %part.role(),
            event = %registration,
            "actor loaded"
        );
        self.loaded = Some(Loaded {
            run: RunState::new(&part, run),
            part,
            transport,
            inbox,
            registration: Some(registration),
        });
        Ok(())
    }

    /// Load without a receive event of its own; a server feeds the inbox.
    pub(crate) fn load_served(
        &mut self,
        part: Arc<Part<P>>,
        transport: Arc<dyn Transport<P>>,
    ) -> Result<()> {
        self.check_loadable(&part)?;
        let (_, inbox) = mpsc::unbounded_channel();
        self.loaded = Some(Loaded {
            run: RunState::new(&part, SharedRun::default()),
            part,
            transport,
            inbox,
            registration: None,
        });
        Ok(())
    }

    fn check_loadable(&self, part: &Part<P>) -> Result<()> {
        if self.loaded.is_some() {
            return Err(TroupeError::AlreadyLoaded);
        }
        match part
            .capabilities()
            .iter()
            .find(|capability| !capability.is_provided_by::<S>())
        {
            Some(missing) => Err(TroupeError::capability_mismatch(
                missing.name(),
                std::any::type_name::<S>(),
            )),
            None => Ok(()),
        }
    }

    /// Whether a part is loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn loaded(&self) -> Result<&Loaded<P>> {
        self.loaded.as_ref().ok_or(TroupeError::NotLoaded)
    }

    fn loaded_mut(&mut self) -> Result<&mut Loaded<P>> {
        self.loaded.as_mut().ok_or(TroupeError::NotLoaded)
    }

    /// The loaded part.
    pub fn part(&self) -> Result<&Arc<Part<P>>> {
        Ok(&self.loaded()?.part)
    }

    /// The role state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The role state, mutably.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Payload of an accepted incoming message, or of a staged outgoing one.
    pub fn message(&self, name: &str) -> Result<&P> {
        let loaded = self.loaded()?;
        read(&loaded.part, &loaded.run, name)
    }

    /// Whether [`Actor::message`] would return a payload.
    pub fn has_message(&self, name: &str) -> bool {
        self.message(name).is_ok()
    }

    /// Stage the payload of an outgoing message.
    pub fn set_message(&mut self, name: &str, payload: P) -> Result<()> {
        let loaded = self.loaded_mut()?;
        stage(&loaded.part, &mut loaded.run, name, payload)
    }

    /// Address committed for `role` in the current run.
    pub fn address(&self, role: &str) -> Result<Option<&Address>> {
        let loaded = self.loaded()?;
        let peer = loaded.part.peer_id(role)?;
        Ok(loaded.run.addresses[peer.index()].as_ref())
    }

    /// Commit the address of `role` for the current run.
    pub fn set_address(&mut self, role: &str, address: impl Into<Address>) -> Result<()> {
        let loaded = self.loaded_mut()?;
        let peer = loaded.part.peer_id(role)?;
        loaded.run.addresses[peer.index()] = Some(address.into());
        Ok(())
    }

    /// Address of `role` every run starts with.
    pub fn set_initial_address(&mut self, role: &str, address: impl Into<Address>) -> Result<()> {
        let loaded = self.loaded_mut()?;
        let peer = loaded.part.peer_id(role)?;
        let address = address.into();
        loaded.run.initial_addresses[peer.index()] = Some(address.clone());
        loaded.run.addresses[peer.index()] = Some(address);
        Ok(())
    }

    /// Identifier of the current run, once assigned.
    pub fn run_id(&self) -> Option<RunId> {
        self.loaded.as_ref().and_then(|loaded| loaded.run.run_id())
    }

    /// Fix the identifier of the current run. Setting the same id twice is
    /// allowed; changing it is not.
    pub fn set_run_id(&mut self, run: RunId) -> Result<()> {
        let loaded = self.loaded_mut()?;
        let mut current = loaded.run.run.lock();
        match *current {
            Some(existing) if existing != run => Err(TroupeError::internal(format!(
                "run id already assigned: {existing}, refusing {run}"
            ))),
            _ => {
                *current = Some(run);
                Ok(())
            }
        }
    }

    /// Forget the current run: slots, addresses, deadlines and run id.
    ///
    /// Messages already queued for the actor are kept for the next run, and
    /// an opening message among them fixes its run id.
    pub fn reset(&mut self) -> Result<()> {
        let loaded = self.loaded_mut()?;
        let shared = loaded.run.run.clone();
        let mut current = shared.lock();
        *current = None;
        loaded.run.clear(&loaded.part);
        while let Ok(message) = loaded.inbox.try_recv() {
            if current.is_none() && loaded.part.is_initial(message.name.as_str()) {
                *current = Some(message.run);
            }
            loaded.run.held.push(message);
        }
        Ok(())
    }

    /// Execute one run from the start.
    pub async fn perform(&mut self) -> Result<()> {
        self.reset()?;
        self.perform_without_resetting().await
    }

    /// Execute one run keeping whatever was staged or committed beforehand.
    pub async fn perform_without_resetting(&mut self) -> Result<()> {
        let Self {
            state,
            run_ids,
            loaded,
        } = self;
        let loaded = loaded.as_mut().ok_or(TroupeError::NotLoaded)?;
        let span = info_span!(
            "run",
            protocol = %loaded.part.protocol(),
            role = %loaded.part.role()
        );
        loaded.play(state, run_ids.as_ref()).instrument(span).await
    }

    /// Execute the run `message` opens.
    pub async fn serve(&mut self, message: FullMessage<P>) -> Result<()> {
        let loaded = self.loaded_mut()?;
        loaded.run.reset(&loaded.part);
        self.set_run_id(message.run)?;
        self.loaded_mut()?.run.held.insert(0, message);
        self.perform_without_resetting().await
    }

    /// [`Actor::serve`] with the inbox a server routes the run's messages to.
    pub(crate) async fn serve_with_inbox(
        &mut self,
        message: FullMessage<P>,
        inbox: mpsc::UnboundedReceiver<FullMessage<P>>,
    ) -> Result<()> {
        self.loaded_mut()?.inbox = inbox;
        self.serve(message).await
    }
}

impl<P> Loaded<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn play<S: Send + 'static>(
        &mut self,
        state: &mut S,
        run_ids: &dyn RunIdGenerator,
    ) -> Result<()> {
        info!(run = ?self.run.run_id(), "run started");
        let mut action = NextAction::Step(self.part.root());
        let outcome = loop {
            let next = match action {
                NextAction::Step(step) => self.step(state, run_ids, step).await,
                NextAction::Await(initials) => self.wait(&initials).await.map(Some),
            };
            match next {
                Ok(Some(next)) => action = next,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let run = self.run.run_id();
        match &outcome {
            Ok(()) => info!(run = ?run, "run finished"),
            Err(err @ TroupeError::Aborted { .. }) => error!(run = ?run, error = %err, "run aborted"),
            Err(err) => info!(run = ?run, error = %err, "run failed"),
        }
        outcome
    }

    /// Execute `id`; `None` once the run is over.
    async fn step<S: Send + 'static>(
        &mut self,
        state: &mut S,
        run_ids: &dyn RunIdGenerator,
        id: StepId,
    ) -> Result<Option<NextAction>> {
        let part = self.part.clone();
        let next = match part.step(id).kind() {
            StepKind::Root { next } | StepKind::Compose { next, .. } => *next,
            StepKind::Run { label, action, next, .. } => {
                trace!(step = %id, label = %label, "run");
                let mut slots = Slots {
                    part: &part,
                    run: &mut self.run,
                };
                action(state as &mut dyn Any, &mut slots)?;
                *next
            }
            StepKind::Test {
                label,
                predicate,
                on_true,
                on_false,
                ..
            } => {
                let mut slots = Slots {
                    part: &part,
                    run: &mut self.run,
                };
                let held = predicate(state as &mut dyn Any, &mut slots)?;
                trace!(step = %id, label = %label, held, "test");
                if held {
                    *on_true
                } else {
                    *on_false
                }
            }
            StepKind::Send {
                receiver,
                message,
                ok,
                no_send,
                ..
            } => {
                let (receiver, message) = (receiver.clone(), message.clone());
                let (ok, no_send) = (*ok, *no_send);
                return self
                    .transmit(run_ids, &receiver, &message, ok, no_send)
                    .await
                    .map(Some);
            }
            StepKind::End(EndKind::Ok) => return Ok(None),
            StepKind::End(EndKind::NoSend) => {
                return Err(TroupeError::transmission(format!(
                    "run of {} ended on an unhandled transmission failure",
                    part.protocol()
                )))
            }
            StepKind::End(EndKind::NoReceive) => {
                let message = self
                    .run
                    .last_missed
                    .map_or_else(|| "<unknown>".to_owned(), |id| part.incoming_name(id).to_string());
                return Err(TroupeError::reception_timeout(
                    part.protocol().as_str(),
                    message,
                    self.run.run_id(),
                ));
            }
        };
        part.after(next).map(Some)
    }

    async fn transmit(
        &mut self,
        run_ids: &dyn RunIdGenerator,
        receiver: &RoleName,
        message: &MessageName,
        ok: StepId,
        no_send: StepId,
    ) -> Result<NextAction> {
        let part = self.part.clone();
        let out = part.outgoing_id(message.as_str())?;
        let peer = part.peer_id(receiver.as_str())?;
        let run = {
            let mut current = self.run.run.lock();
            *current.get_or_insert_with(|| run_ids.next_run_id())
        };

        let sent = match self.run.addresses[peer.index()].clone() {
            Some(to) => {
                let payload = self.run.staged[out.index()].clone();
                let envelope = ShortMessage::new(run, part.protocol().clone(), message.clone(), payload);
                trace!(%run, message = %message, %to, "sending");
                self.transport.send_message(envelope, &to).await
            }
            None => Err(TroupeError::transmission(format!(
                "no address known for role {receiver}"
            ))),
        };

        match sent {
            Ok(()) => {
                self.run.schedule(&part, out, Instant::now());
                part.after(ok)
            }
            Err(err) if err.is_transmission_failure() => {
                warn!(%run, message = %message, receiver = %receiver, error = %err, "transmission failed");
                if no_send == StepId::END_NO_SEND {
                    Err(err)
                } else {
                    part.after(no_send)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Collect messages until a path starting at `initials` completes.
    async fn wait(&mut self, initials: &[IncomingId]) -> Result<NextAction> {
        let part = self.part.clone();
        let mut phase = Phase::open(&part, initials, &mut self.run);
        for message in std::mem::take(&mut self.run.held) {
            phase.arrive(&part, &mut self.run, message);
        }

        loop {
            for id in self.run.expire(Instant::now()) {
                phase.expired(&part, &mut self.run, id);
            }
            match phase.evaluate(&part) {
                Verdict::Complete(path) => return phase.close(&part, &mut self.run, &path),
                Verdict::Dead => return Err(phase.missed(&part, &self.run)),
                Verdict::Waiting => {}
            }

            let received = match self.run.next_deadline() {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                        Ok(received) => received,
                        Err(_) => continue,
                    }
                }
                None => self.inbox.recv().await,
            };
            match received {
                Some(message) => phase.arrive(&part, &mut self.run, message),
                None => {
                    return Err(TroupeError::aborted(format!(
                        "inbox of {} closed while waiting",
                        part.role()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use troupe_choreography::{Choreography, Play, Role, RoleSpec, Scene, Stage};
    use troupe_core::{Delay, SequentialRunIds};

    struct Ping;

    fn client() -> Role<u32> {
        Role::new("client")
    }

    fn service() -> Role<String> {
        Role::new("service")
    }

    impl Choreography for Ping {
        type Payload = u32;

        fn roles(&self) -> Vec<RoleSpec> {
            vec![client().spec(), service().spec()]
        }

        fn scene(&self, stage: &mut Stage<u32>) -> Scene {
            stage.send_from(&client(), &service(), "ping", Delay::from_millis(50), |p| {
                Ok(*p.state())
            })?;
            stage.run(&service(), |p| {
                let value = p.message_cloned("ping")?;
                p.state_mut().push_str(&value.to_string());
                Ok(())
            })
        }
    }

    #[test]
    fn test_load_checks_capabilities() {
        let play = Play::new(Ping);
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.attach("a"));

        let mut wrong = Actor::<u32, u32>::new(0);
        let err = wrong
            .load(play.interpret_as("service").unwrap(), transport.clone())
            .unwrap_err();
        assert!(matches!(err, TroupeError::CapabilityMismatch { .. }));
        assert!(!wrong.is_loaded());

        let mut actor = Actor::<u32, u32>::new(0);
        actor
            .load(play.interpret_as("client").unwrap(), transport.clone())
            .unwrap();
        let again = actor
            .load(play.interpret_as("client").unwrap(), transport)
            .unwrap_err();
        assert_eq!(again, TroupeError::AlreadyLoaded);
    }

    #[test]
    fn test_unloaded_actor_refuses_slots() {
        let mut actor = Actor::<u32, u32>::new(0);
        assert_eq!(actor.message("ping").unwrap_err(), TroupeError::NotLoaded);
        assert_eq!(actor.reset().unwrap_err(), TroupeError::NotLoaded);
        assert!(actor.run_id().is_none());
    }

    #[test]
    fn test_run_id_is_fixed_once() {
        let play = Play::new(Ping);
        let network = MemoryNetwork::new();
        let mut actor = Actor::<u32, u32>::new(0);
        actor
            .load(play.interpret_as("client").unwrap(), Arc::new(network.attach("a")))
            .unwrap();

        actor.set_run_id(RunId::new(7)).unwrap();
        actor.set_run_id(RunId::new(7)).unwrap();
        assert!(actor.set_run_id(RunId::new(8)).is_err());
        actor.reset().unwrap();
        assert!(actor.run_id().is_none());
    }

    #[tokio::test]
    async fn test_ping_reaches_service() {
        let play = Play::new(Ping);
        let network = MemoryNetwork::new();

        let mut service = Actor::<u32, String>::new(String::new());
        service
            .load(play.interpret_as("service").unwrap(), Arc::new(network.attach("s")))
            .unwrap();
        let mut client = Actor::<u32, u32>::new(42)
            .with_run_ids(Arc::new(SequentialRunIds::starting_at(5)));
        client
            .load(play.interpret_as("client").unwrap(), Arc::new(network.attach("c")))
            .unwrap();
        client.set_initial_address("service", "s").unwrap();

        let served = tokio::spawn(async move {
            service.perform().await.map(|()| service.state().clone())
        });
        client.perform().await.unwrap();
        assert_eq!(client.run_id(), Some(RunId::new(5)));
        assert_eq!(client.message("ping").unwrap(), &42);
        assert_eq!(served.await.unwrap().unwrap(), "42");
    }

    #[tokio::test]
    async fn test_missing_address_is_a_transmission_failure() {
        let play = Play::new(Ping);
        let network = MemoryNetwork::new();
        let mut client = Actor::<u32, u32>::new(1);
        client
            .load(play.interpret_as("client").unwrap(), Arc::new(network.attach("c")))
            .unwrap();
        let err = client.perform().await.unwrap_err();
        assert!(err.is_transmission_failure());
    }
}
