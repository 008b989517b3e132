//! Inbound run pool
//!
//! A [`Server`] plays one role for every run other roles open towards it.
//! Dispatch happens on the delivering task and only routes: a message of an
//! ongoing run goes to that run's inbox, an initial message of an unknown run
//! is queued. A supervisor task drains the queue, waits for a worker permit
//! and serves the run on an idle actor, creating one when none is idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use troupe_choreography::Part;
use troupe_core::{
    Address, FullMessage, RandomRunIds, Result, RunId, RunIdGenerator, RuntimeConfig,
    TroupeConfig, TroupeError,
};

use crate::actor::Actor;
use crate::transport::{ReceiveEvent, ReceiveEventId, Transport};

/// Capacity of the completion broadcast.
const REPORT_CAPACITY: usize = 256;

/// Outcome of one served run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The run
    pub run: RunId,
    /// How it ended
    pub outcome: Result<()>,
}

type Queued<P> = (FullMessage<P>, mpsc::UnboundedReceiver<FullMessage<P>>);

struct RunEntry<P> {
    inbox: mpsc::UnboundedSender<FullMessage<P>>,
    task: Option<AbortHandle>,
}

struct Shared<P, S> {
    part: Arc<Part<P>>,
    transport: Arc<dyn Transport<P>>,
    factory: Box<dyn Fn() -> S + Send + Sync>,
    run_ids: Arc<dyn RunIdGenerator>,
    initial_addresses: Mutex<Vec<(String, Address)>>,
    runs: Mutex<HashMap<RunId, RunEntry<P>>>,
    idle: Mutex<Vec<Actor<P, S>>>,
    permits: Arc<Semaphore>,
    queue: Mutex<Option<mpsc::UnboundedSender<Queued<P>>>>,
    completed: AtomicU64,
    reports: broadcast::Sender<RunReport>,
    drained: Notify,
    grace: Duration,
}

/// Pool of actors serving one role over one transport.
pub struct Server<P, S> {
    shared: Arc<Shared<P, S>>,
    registration: Mutex<Option<ReceiveEventId>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<P, S> Server<P, S>
where
    P: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    /// Serve `part` over `transport` with at most `workers` concurrent runs.
    /// Every actor's state comes from `factory`.
    pub fn new(
        part: Arc<Part<P>>,
        transport: Arc<dyn Transport<P>>,
        factory: impl Fn() -> S + Send + Sync + 'static,
        workers: usize,
    ) -> Result<Self> {
        let config = RuntimeConfig {
            server_workers: workers,
            ..RuntimeConfig::default()
        };
        Self::build(
            part,
            transport,
            Box::new(factory),
            &config,
            Arc::new(RandomRunIds::from_entropy()),
        )
    }

    /// Like [`Server::new`], sized and seeded from `config`.
    pub fn with_config(
        part: Arc<Part<P>>,
        transport: Arc<dyn Transport<P>>,
        factory: impl Fn() -> S + Send + Sync + 'static,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        Self::build(
            part,
            transport,
            Box::new(factory),
            config,
            config.run_ids.generator(),
        )
    }

    fn build(
        part: Arc<Part<P>>,
        transport: Arc<dyn Transport<P>>,
        factory: Box<dyn Fn() -> S + Send + Sync>,
        config: &RuntimeConfig,
        run_ids: Arc<dyn RunIdGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(missing) = part
            .capabilities()
            .iter()
            .find(|capability| !capability.is_provided_by::<S>())
        {
            return Err(TroupeError::capability_mismatch(
                missing.name(),
                std::any::type_name::<S>(),
            ));
        }
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                part,
                transport,
                factory,
                run_ids,
                initial_addresses: Mutex::new(Vec::new()),
                runs: Mutex::new(HashMap::new()),
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(config.server_workers)),
                queue: Mutex::new(None),
                completed: AtomicU64::new(0),
                reports,
                drained: Notify::new(),
                grace: config.shutdown_grace(),
            }),
            registration: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    /// The served part.
    pub fn part(&self) -> &Arc<Part<P>> {
        &self.shared.part
    }

    /// Address of `role` every served run starts with.
    pub fn set_initial_address(&self, role: &str, address: impl Into<Address>) -> Result<()> {
        self.shared.part.peer_id(role)?;
        let address = address.into();
        for actor in self.shared.idle.lock().iter_mut() {
            actor.set_initial_address(role, address.clone())?;
        }
        let mut addresses = self.shared.initial_addresses.lock();
        addresses.retain(|(known, _)| known != role);
        addresses.push((role.to_owned(), address));
        Ok(())
    }

    /// Start accepting runs. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return;
        }
        let (queue, pending) = mpsc::unbounded_channel();
        *self.shared.queue.lock() = Some(queue);
        *self.supervisor.lock() = Some(tokio::spawn(supervise(self.shared.clone(), pending)));
        *registration = Some(self.shared.transport.add_receive_event(Arc::new(FreshRunEvent {
            shared: Arc::downgrade(&self.shared),
        })));
        info!(
            protocol = %self.shared.part.protocol(),
            role = %self.shared.part.role(),
            "server started"
        );
    }

    /// Stop accepting runs, give running ones the shutdown grace period to
    /// finish, then abort the rest.
    pub async fn stop(&self) {
        self.unregister();
        let deadline = Instant::now() + self.shared.grace;
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.runs.lock().is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }
        self.abort();
    }

    /// Stop accepting runs and cancel every running one.
    pub fn abort(&self) {
        self.unregister();
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        let aborted: Vec<(RunId, RunEntry<P>)> = self.shared.runs.lock().drain().collect();
        for (run, entry) in aborted {
            if let Some(task) = entry.task {
                task.abort();
            }
            error!(protocol = %self.shared.part.protocol(), %run, "run aborted");
            let _ = self.shared.reports.send(RunReport {
                run,
                outcome: Err(TroupeError::aborted("server shut down")),
            });
        }
        self.shared.drained.notify_waiters();
    }

    fn unregister(&self) {
        if let Some(id) = self.registration.lock().take() {
            self.shared.transport.remove_receive_event(id);
            *self.shared.queue.lock() = None;
            info!(
                protocol = %self.shared.part.protocol(),
                role = %self.shared.part.role(),
                "server stopped"
            );
        }
    }

    /// Runs queued or executing.
    pub fn ongoing_runs(&self) -> usize {
        self.shared.runs.lock().len()
    }

    /// Runs that ended, successfully or not.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Idle actors kept for reuse.
    pub fn idle_actors(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Stream of run reports from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.shared.reports.subscribe()
    }
}

impl<P, S> Drop for Server<P, S> {
    fn drop(&mut self) {
        if let Some(id) = self.registration.get_mut().take() {
            self.shared.transport.remove_receive_event(id);
        }
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
        for entry in self.shared.runs.lock().values() {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
    }
}

struct FreshRunEvent<P, S> {
    shared: Weak<Shared<P, S>>,
}

impl<P, S> ReceiveEvent<P> for FreshRunEvent<P, S>
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    fn offer(&self, message: FullMessage<P>) -> std::result::Result<(), FullMessage<P>> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(message);
        };
        let part = &shared.part;
        if message.protocol != *part.protocol() || part.incoming_id(message.name.as_str()).is_err() {
            return Err(message);
        }

        let mut runs = shared.runs.lock();
        if let Some(entry) = runs.get(&message.run) {
            trace!(run = %message.run, message = %message.name, "routed to ongoing run");
            return entry.inbox.send(message).map_err(|closed| closed.0);
        }
        if !part.is_initial(message.name.as_str()) {
            return Err(message);
        }
        let queue = shared.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Err(message);
        };

        let run = message.run;
        let (inbox, pending) = mpsc::unbounded_channel();
        match queue.send((message, pending)) {
            Ok(()) => {
                runs.insert(run, RunEntry { inbox, task: None });
                debug!(protocol = %part.protocol(), %run, "run queued");
                Ok(())
            }
            Err(closed) => Err((closed.0).0),
        }
    }
}

async fn supervise<P, S>(shared: Arc<Shared<P, S>>, mut pending: mpsc::UnboundedReceiver<Queued<P>>)
where
    P: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    while let Some((message, inbox)) = pending.recv().await {
        let Ok(permit) = shared.permits.clone().acquire_owned().await else {
            break;
        };
        let run = message.run;
        let mut actor = match checkout(&shared) {
            Ok(actor) => actor,
            Err(err) => {
                warn!(%run, error = %err, "could not create an actor");
                finish(&shared, run, Err(err), None);
                continue;
            }
        };

        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            let outcome = actor.serve_with_inbox(message, inbox).await;
            finish(&task_shared, run, outcome, Some(actor));
            drop(permit);
        });
        if let Some(entry) = shared.runs.lock().get_mut(&run) {
            entry.task = Some(task.abort_handle());
        }
    }
}

fn checkout<P, S>(shared: &Shared<P, S>) -> Result<Actor<P, S>>
where
    P: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    if let Some(actor) = shared.idle.lock().pop() {
        return Ok(actor);
    }
    let mut actor = Actor::new((shared.factory)()).with_run_ids(shared.run_ids.clone());
    actor.load_served(shared.part.clone(), shared.transport.clone())?;
    for (role, address) in shared.initial_addresses.lock().iter() {
        actor.set_initial_address(role, address.clone())?;
    }
    debug!(role = %shared.part.role(), "actor created");
    Ok(actor)
}

fn finish<P, S>(shared: &Shared<P, S>, run: RunId, outcome: Result<()>, actor: Option<Actor<P, S>>)
where
    P: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    let was_ongoing = shared.runs.lock().remove(&run).is_some();
    if !was_ongoing {
        // Already reported by an abort.
        return;
    }
    if let Some(actor) = actor {
        shared.idle.lock().push(actor);
    }
    shared.completed.fetch_add(1, Ordering::Relaxed);
    match &outcome {
        Ok(()) => debug!(%run, "run served"),
        Err(err) => warn!(%run, error = %err, "served run failed"),
    }
    let _ = shared.reports.send(RunReport { run, outcome });
    shared.drained.notify_waiters();
}
