//! Graph builder.
//!
//! A scene is an ordinary Rust function that describes one run of the
//! protocol through calls on a [`Stage`]. The builder replays it once per
//! unexplored branch: calls along a recorded decision trail return their
//! recorded outcome without effect, the first call past the trail creates a
//! step and pushes its alternative outcomes onto a worklist. Reaching a call
//! that already has a step links the current branch into it and closes the
//! branch; this is how loops become cycles of the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use tracing::{debug, trace};
use troupe_core::{Delay, MessageName, ProtocolName, Result, RoleName, TroupeError};

use crate::frontier::{FrontierId, Frontiers};
use crate::graph::{EndKind, Outcome, Step, StepGraph, StepId, StepKind};
use crate::performer::{
    erase_action, erase_predicate, scope_action, scope_predicate, scoped_name, Performer, Scope,
    StepAction, StepPredicate,
};
use crate::play::Choreography;
use crate::role::{Capability, Role, RoleSpec};

/// Upper bound on the steps a single choreography may produce.
const STEP_LIMIT: usize = 1 << 16;

/// What a scene, or any part of one, returns.
pub type Scene = std::result::Result<(), Interrupt>;

/// Control transfer raised by stage calls.
///
/// `Transmission` and `Reception` mark the failure branches of a send and may
/// be caught to describe handlers. `Closed` ends the branch being explored and
/// must be propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    /// The sender could not transmit the message.
    #[error("{sender} could not transmit '{message}'")]
    Transmission {
        /// Sending role
        sender: RoleName,
        /// Message name
        message: MessageName,
    },

    /// The receiver missed the message.
    #[error("{receiver} did not receive '{message}'")]
    Reception {
        /// Receiving role
        receiver: RoleName,
        /// Message name
        message: MessageName,
    },

    /// The branch joined an explored step, or the builder hit an error.
    #[error("branch closed")]
    Closed,
}

impl Interrupt {
    /// Whether this is the transmission-failure branch.
    pub fn is_transmission(&self) -> bool {
        matches!(self, Self::Transmission { .. })
    }

    /// Whether this is the reception-failure branch.
    pub fn is_reception(&self) -> bool {
        matches!(self, Self::Reception { .. })
    }

    /// Whether the branch was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Assignment of a sub-choreography's roles to roles of the enclosing one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cast {
    roles: BTreeMap<RoleName, RoleName>,
}

impl Cast {
    /// Empty cast.
    pub fn new() -> Self {
        Self::default()
    }

    /// Play the sub-choreography's `inner` role as `outer`.
    pub fn with(mut self, inner: impl Into<RoleName>, outer: impl Into<RoleName>) -> Self {
        self.roles.insert(inner.into(), outer.into());
        self
    }

    /// Outer role playing `inner`.
    pub fn get(&self, inner: &str) -> Option<&RoleName> {
        self.roles.get(inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StepKey {
    Local { role: RoleName, label: String },
    Send { receiver: RoleName, message: MessageName },
    Compose { protocol: ProtocolName, prefix: String },
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKey::Local { role, label } => write!(f, "{role} at '{label}'"),
            StepKey::Send { receiver, message } => write!(f, "'{message}' to {receiver}"),
            StepKey::Compose { protocol, prefix } => write!(f, "{protocol} as '{prefix}'"),
        }
    }
}

struct Pending {
    trail: Vec<(StepId, Outcome)>,
    frontiers: Frontiers,
}

/// The builder a scene describes its protocol to.
pub struct Stage<P> {
    graph: StepGraph<P>,
    explored: HashMap<StepKey, StepId>,
    pending: Vec<Pending>,
    trail: Vec<(StepId, Outcome)>,
    cursor: usize,
    frontiers: Frontiers,
    scopes: Vec<Arc<Scope>>,
    closed: bool,
    fatal: Option<TroupeError>,
    default_tolerance: Delay,
}

fn call_site(location: &Location<'_>) -> String {
    format!("{}:{}:{}", location.file(), location.line(), location.column())
}

impl<P> Stage<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn new(protocol: ProtocolName, roles: Vec<RoleSpec>, default_tolerance: Delay) -> Self {
        let graph = StepGraph::new(protocol, roles);
        let frontiers = graph.causality().initial();
        Self {
            graph,
            explored: HashMap::new(),
            pending: Vec::new(),
            trail: vec![(StepId::ROOT, Outcome::Ok)],
            cursor: 1,
            frontiers,
            scopes: Vec::new(),
            closed: false,
            fatal: None,
            default_tolerance,
        }
    }

    /// Protocol being built.
    pub fn protocol(&self) -> &ProtocolName {
        self.graph.protocol()
    }

    /// Tolerance configured for sends that name none in particular.
    pub fn default_tolerance(&self) -> Delay {
        self.default_tolerance
    }

    /// Local step of `role`, keyed by its call site.
    #[track_caller]
    pub fn run<S, F>(&mut self, role: &Role<S>, action: F) -> Scene
    where
        S: 'static,
        F: Fn(&mut Performer<'_, P, S>) -> Result<()> + Send + Sync + 'static,
    {
        let label = call_site(Location::caller());
        self.local_run(role, label, erase_action(action))
    }

    /// Local step of `role`, keyed by `name`.
    pub fn run_named<S, F>(&mut self, role: &Role<S>, name: &str, action: F) -> Scene
    where
        S: 'static,
        F: Fn(&mut Performer<'_, P, S>) -> Result<()> + Send + Sync + 'static,
    {
        self.local_run(role, name.to_owned(), erase_action(action))
    }

    /// Local branch of `role`, keyed by its call site.
    #[track_caller]
    pub fn test<S, F>(&mut self, role: &Role<S>, predicate: F) -> std::result::Result<bool, Interrupt>
    where
        S: 'static,
        F: Fn(&mut Performer<'_, P, S>) -> Result<bool> + Send + Sync + 'static,
    {
        let label = call_site(Location::caller());
        self.local_test(role, label, erase_predicate(predicate))
    }

    /// Local branch of `role`, keyed by `name`.
    pub fn test_named<S, F>(
        &mut self,
        role: &Role<S>,
        name: &str,
        predicate: F,
    ) -> std::result::Result<bool, Interrupt>
    where
        S: 'static,
        F: Fn(&mut Performer<'_, P, S>) -> Result<bool> + Send + Sync + 'static,
    {
        self.local_test(role, name.to_owned(), erase_predicate(predicate))
    }

    /// Message `name` from `from` to `to`, expected within `tolerance`.
    ///
    /// The payload is whatever the sender staged under `name`, if anything.
    pub fn send<A, B>(
        &mut self,
        from: &Role<A>,
        to: &Role<B>,
        name: &str,
        tolerance: impl Into<Delay>,
    ) -> Scene
    where
        A: 'static,
        B: 'static,
    {
        let sender = self.resolve(from)?;
        let receiver = self.resolve(to)?;
        if sender == receiver {
            return Err(self.fail(TroupeError::compile(format!(
                "role {sender} sends '{name}' to itself"
            ))));
        }
        let message = MessageName::new(self.scoped(name));
        let tolerance = tolerance.into();
        let key = StepKey::Send {
            receiver: receiver.clone(),
            message: message.clone(),
        };

        let outcome = self.visit(key, |stage| {
            let id = stage.declare(Step::new(
                Some(sender.clone()),
                StepKind::Send {
                    receiver: receiver.clone(),
                    message: message.clone(),
                    tolerance,
                    ok: StepId::END_OK,
                    no_send: StepId::END_NO_SEND,
                    no_receive: StepId::END_NO_RECEIVE,
                },
            ))?;

            let sender_at = stage.marker(&sender)?;
            let receiver_was = stage.marker(&receiver)?;
            let causality = stage.graph.causality_mut();
            causality.bind(id, sender_at);
            let receiver_at = causality.branch(receiver_was, Delay::ZERO);
            causality.cause(sender_at, receiver_at, tolerance);
            let sender_ok = causality.branch(sender_at, Delay::ZERO);
            let sender_failed = causality.branch(sender_at, Delay::ZERO);
            let receiver_ok = causality.branch(receiver_at, Delay::ZERO);
            let receiver_missed = causality.branch(receiver_at, Delay::ZERO);

            let no_send = stage.moved(&[(&sender, sender_failed), (&receiver, receiver_at)]);
            stage.defer(id, Outcome::NoSend, no_send);
            let no_receive = stage.moved(&[(&sender, sender_ok), (&receiver, receiver_missed)]);
            stage.defer(id, Outcome::NoReceive, no_receive);

            stage.frontiers.insert(sender.clone(), sender_ok);
            stage.frontiers.insert(receiver.clone(), receiver_ok);
            Ok((id, Outcome::Ok))
        })?;

        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::NoSend => Err(Interrupt::Transmission { sender, message }),
            Outcome::NoReceive => Err(Interrupt::Reception { receiver, message }),
            other => Err(self.fail(TroupeError::internal(format!(
                "send of '{message}' replayed as {other:?}"
            )))),
        }
    }

    /// Send whose payload `producer` computes on the sender right before.
    pub fn send_from<A, B, F>(
        &mut self,
        from: &Role<A>,
        to: &Role<B>,
        name: &str,
        tolerance: impl Into<Delay>,
        producer: F,
    ) -> Scene
    where
        A: 'static,
        B: 'static,
        F: Fn(&mut Performer<'_, P, A>) -> Result<P> + Send + Sync + 'static,
    {
        self.stage_payload(from, to, name, producer)?;
        self.send(from, to, name, tolerance)
    }

    /// Send whose payload `consumer` handles on the receiver right after.
    pub fn send_to<A, B, G>(
        &mut self,
        from: &Role<A>,
        to: &Role<B>,
        name: &str,
        tolerance: impl Into<Delay>,
        consumer: G,
    ) -> Scene
    where
        A: 'static,
        B: 'static,
        G: Fn(&mut Performer<'_, P, B>, P) -> Result<()> + Send + Sync + 'static,
    {
        self.send(from, to, name, tolerance)?;
        self.consume_payload(from, to, name, consumer)
    }

    /// [`Stage::send_from`] and [`Stage::send_to`] at once.
    pub fn exchange<A, B, F, G>(
        &mut self,
        from: &Role<A>,
        to: &Role<B>,
        name: &str,
        tolerance: impl Into<Delay>,
        producer: F,
        consumer: G,
    ) -> Scene
    where
        A: 'static,
        B: 'static,
        F: Fn(&mut Performer<'_, P, A>) -> Result<P> + Send + Sync + 'static,
        G: Fn(&mut Performer<'_, P, B>, P) -> Result<()> + Send + Sync + 'static,
    {
        self.stage_payload(from, to, name, producer)?;
        self.send(from, to, name, tolerance)?;
        self.consume_payload(from, to, name, consumer)
    }

    /// Request from `client` answered by `server`.
    ///
    /// `request` builds `{name}.query` on the client, `process` turns it into
    /// `{name}.response` on the server. Both legs share `tolerance`; the
    /// client reads the response from its mailbox afterwards.
    pub fn query<A, B, F, G>(
        &mut self,
        client: &Role<A>,
        server: &Role<B>,
        name: &str,
        tolerance: impl Into<Delay>,
        request: F,
        process: G,
    ) -> Scene
    where
        A: 'static,
        B: 'static,
        F: Fn(&mut Performer<'_, P, A>) -> Result<P> + Send + Sync + 'static,
        G: Fn(&mut Performer<'_, P, B>, P) -> Result<P> + Send + Sync + 'static,
    {
        let tolerance = tolerance.into();
        let query = format!("{name}.query");
        let response = format!("{name}.response");

        self.send_from(client, server, &query, tolerance, request)?;
        let (asked, answer) = (query.clone(), response.clone());
        self.run_named(server, &format!("on querying {name}"), move |p| {
            let payload = p.message_cloned(&asked)?;
            let reply = process(p, payload)?;
            p.set_message(&answer, reply)
        })?;
        self.send(server, client, &response, tolerance)
    }

    /// Inline `sub` with its roles played by `cast` and its message names
    /// prefixed by `prefix`.
    pub fn compose<C>(&mut self, sub: &C, cast: &Cast, prefix: &str) -> Scene
    where
        C: Choreography<Payload = P>,
    {
        if self.closed {
            return Err(Interrupt::Closed);
        }
        let protocol = sub.protocol_name();

        let mut roles = BTreeMap::new();
        for spec in sub.roles() {
            let Some(outer) = cast.get(spec.name.as_str()) else {
                return Err(self.fail(TroupeError::compile(format!(
                    "cast of {protocol} leaves role {} unassigned",
                    spec.name
                ))));
            };
            let outer = match self.scopes.last() {
                Some(scope) => match scope.roles.get(outer.as_str()) {
                    Some(outermost) => outermost.clone(),
                    None => {
                        return Err(self.fail(TroupeError::compile(format!(
                            "role {outer} is not part of the cast"
                        ))))
                    }
                },
                None => outer.clone(),
            };
            let found = self.graph.role(outer.as_str()).map(|declared| declared.capability);
            match found {
                Some(capability) if capability == spec.capability => {}
                Some(capability) => {
                    return Err(self.fail(TroupeError::compile(format!(
                        "{outer} cannot play {} of {protocol}: needs {}, has {capability}",
                        spec.name, spec.capability
                    ))))
                }
                None => {
                    return Err(self.fail(TroupeError::compile(format!(
                        "{protocol} is cast with undeclared role {outer}"
                    ))))
                }
            }
            roles.insert(spec.name, outer);
        }

        let prefix = self.scoped(prefix);
        let key = StepKey::Compose {
            protocol: protocol.clone(),
            prefix: prefix.clone(),
        };
        self.visit(key, |stage| {
            let id = stage.declare(Step::new(
                None,
                StepKind::Compose {
                    protocol,
                    prefix: prefix.clone(),
                    next: StepId::END_OK,
                },
            ))?;
            Ok((id, Outcome::Ok))
        })?;

        self.scopes.push(Arc::new(Scope { prefix, roles }));
        let result = sub.scene(self);
        self.scopes.pop();
        result
    }

    fn local_run<S: 'static>(&mut self, role: &Role<S>, label: String, action: StepAction<P>) -> Scene {
        let owner = self.resolve(role)?;
        let label = self.scoped(&label);
        let action = match self.scopes.last() {
            Some(scope) => scope_action(scope.clone(), action),
            None => action,
        };
        let key = StepKey::Local {
            role: owner.clone(),
            label: label.clone(),
        };
        self.visit(key, |stage| {
            let id = stage.declare(Step::new(
                Some(owner.clone()),
                StepKind::Run {
                    label,
                    capability: Capability::of::<S>(),
                    action,
                    next: StepId::END_OK,
                },
            ))?;
            let marker = stage.marker(&owner)?;
            let causality = stage.graph.causality_mut();
            causality.bind(id, marker);
            let next = causality.branch(marker, Delay::ZERO);
            stage.frontiers.insert(owner.clone(), next);
            Ok((id, Outcome::Ok))
        })
        .map(|_| ())
    }

    fn local_test<S: 'static>(
        &mut self,
        role: &Role<S>,
        label: String,
        predicate: StepPredicate<P>,
    ) -> std::result::Result<bool, Interrupt> {
        let owner = self.resolve(role)?;
        let label = self.scoped(&label);
        let predicate = match self.scopes.last() {
            Some(scope) => scope_predicate(scope.clone(), predicate),
            None => predicate,
        };
        let key = StepKey::Local {
            role: owner.clone(),
            label: label.clone(),
        };
        let outcome = self.visit(key, |stage| {
            let id = stage.declare(Step::new(
                Some(owner.clone()),
                StepKind::Test {
                    label,
                    capability: Capability::of::<S>(),
                    predicate,
                    on_true: StepId::END_OK,
                    on_false: StepId::END_OK,
                },
            ))?;
            let marker = stage.marker(&owner)?;
            let causality = stage.graph.causality_mut();
            causality.bind(id, marker);
            let on_true = causality.branch(marker, Delay::ZERO);
            let on_false = causality.branch(marker, Delay::ZERO);
            let alternative = stage.moved(&[(&owner, on_false)]);
            stage.defer(id, Outcome::False, alternative);
            stage.frontiers.insert(owner.clone(), on_true);
            Ok((id, Outcome::True))
        })?;
        Ok(outcome == Outcome::True)
    }

    fn stage_payload<A, B, F>(&mut self, from: &Role<A>, to: &Role<B>, name: &str, producer: F) -> Scene
    where
        A: 'static,
        B: 'static,
        F: Fn(&mut Performer<'_, P, A>) -> Result<P> + Send + Sync + 'static,
    {
        let label = format!("on sending {name} to {}", to.name());
        let message = name.to_owned();
        self.run_named(from, &label, move |p| {
            let payload = producer(p)?;
            p.set_message(&message, payload)
        })
    }

    fn consume_payload<A, B, G>(&mut self, from: &Role<A>, to: &Role<B>, name: &str, consumer: G) -> Scene
    where
        A: 'static,
        B: 'static,
        G: Fn(&mut Performer<'_, P, B>, P) -> Result<()> + Send + Sync + 'static,
    {
        let label = format!("on receiving {name} from {}", from.name());
        let message = name.to_owned();
        self.run_named(to, &label, move |p| {
            let payload = p.message_cloned(&message)?;
            consumer(p, payload)
        })
    }

    /// Outer name of `role`, checked against its declaration.
    fn resolve<S: 'static>(&mut self, role: &Role<S>) -> std::result::Result<RoleName, Interrupt> {
        if self.closed {
            return Err(Interrupt::Closed);
        }
        let name = match self.scopes.last() {
            Some(scope) => match scope.roles.get(role.name().as_str()) {
                Some(outer) => outer.clone(),
                None => {
                    return Err(self.fail(TroupeError::compile(format!(
                        "role {} is not part of the cast",
                        role.name()
                    ))))
                }
            },
            None => role.name().clone(),
        };
        let declared = self.graph.role(name.as_str()).map(|spec| spec.capability);
        match declared {
            Some(capability) if capability == role.capability() => Ok(name),
            Some(capability) => Err(self.fail(TroupeError::compile(format!(
                "role {name} is declared with {capability} but used with {}",
                role.capability()
            )))),
            None => Err(self.fail(TroupeError::compile(format!(
                "role {name} is not declared by {}",
                self.graph.protocol()
            )))),
        }
    }

    fn scoped(&self, name: &str) -> String {
        match self.scopes.last() {
            Some(scope) => scoped_name(&scope.prefix, name),
            None => name.to_owned(),
        }
    }

    fn marker(&self, role: &RoleName) -> Result<FrontierId> {
        self.frontiers
            .get(role)
            .copied()
            .ok_or_else(|| TroupeError::internal(format!("role {role} has no frontier")))
    }

    fn moved(&self, changes: &[(&RoleName, FrontierId)]) -> Frontiers {
        let mut frontiers = self.frontiers.clone();
        for (role, marker) in changes {
            frontiers.insert((*role).clone(), *marker);
        }
        frontiers
    }

    fn defer(&mut self, step: StepId, outcome: Outcome, frontiers: Frontiers) {
        let mut trail = self.trail.clone();
        trail.push((step, outcome));
        self.pending.push(Pending { trail, frontiers });
    }

    /// Push `step` and link it from the end of the trail.
    fn declare(&mut self, step: Step<P>) -> Result<StepId> {
        if self.graph.len() >= STEP_LIMIT {
            return Err(TroupeError::compile(format!(
                "{} produced more than {STEP_LIMIT} steps",
                self.graph.protocol()
            )));
        }
        trace!(protocol = %self.graph.protocol(), step = ?step, "step created");
        let id = self.graph.push(step);
        let (last, outcome) = self.tail();
        self.graph.link(last, outcome, id)?;
        Ok(id)
    }

    fn tail(&self) -> (StepId, Outcome) {
        self.trail
            .last()
            .copied()
            .unwrap_or((StepId::ROOT, Outcome::Ok))
    }

    fn fail(&mut self, error: TroupeError) -> Interrupt {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        self.closed = true;
        Interrupt::Closed
    }

    /// Replay, join or create the step for `key`.
    fn visit<F>(&mut self, key: StepKey, create: F) -> std::result::Result<Outcome, Interrupt>
    where
        F: FnOnce(&mut Self) -> Result<(StepId, Outcome)>,
    {
        if self.closed {
            return Err(Interrupt::Closed);
        }

        if let Some(&(expected, outcome)) = self.trail.get(self.cursor) {
            self.cursor += 1;
            if self.explored.get(&key) == Some(&expected) {
                return Ok(outcome);
            }
            return Err(self.fail(TroupeError::compile(format!(
                "{} does not replay deterministically: {key} reached where {expected} was recorded",
                self.graph.protocol()
            ))));
        }

        if let Some(&existing) = self.explored.get(&key) {
            let (last, outcome) = self.tail();
            if let Err(error) = self.graph.link(last, outcome, existing) {
                return Err(self.fail(error));
            }
            if let Some(owner) = self.graph.step(existing).owner().cloned() {
                if let Some(&current) = self.frontiers.get(&owner) {
                    self.graph.causality_mut().close_loop(current, existing);
                }
            }
            debug!(protocol = %self.graph.protocol(), %key, step = %existing, "branch joined explored step");
            self.closed = true;
            return Err(Interrupt::Closed);
        }

        match create(self) {
            Ok((id, outcome)) => {
                self.explored.insert(key, id);
                self.trail.push((id, outcome));
                self.cursor = self.trail.len();
                Ok(outcome)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn finish_branch(&mut self, result: Scene) -> Result<()> {
        if let Some(error) = self.fatal.take() {
            return Err(error);
        }
        if self.closed {
            return Ok(());
        }
        if self.cursor < self.trail.len() {
            return Err(TroupeError::compile(format!(
                "{} does not replay deterministically: the scene ended before step {}",
                self.graph.protocol(),
                self.trail[self.cursor].0
            )));
        }
        let end = match result {
            Ok(()) => EndKind::Ok,
            Err(Interrupt::Transmission { .. }) => EndKind::NoSend,
            Err(Interrupt::Reception { .. }) => EndKind::NoReceive,
            Err(Interrupt::Closed) => {
                return Err(TroupeError::compile(format!(
                    "{} returned a closed branch the stage never closed",
                    self.graph.protocol()
                )))
            }
        };
        let (last, outcome) = self.tail();
        self.graph.link(last, outcome, StepGraph::<P>::end(end))
    }

    fn resume(&mut self, pending: Pending) {
        self.trail = pending.trail;
        self.frontiers = pending.frontiers;
        self.cursor = 1;
        self.closed = false;
        self.scopes.clear();
    }
}

/// Trace `choreography` into its shared step graph.
pub(crate) fn compile<C>(choreography: &C, default_tolerance: Delay) -> Result<StepGraph<C::Payload>>
where
    C: Choreography,
{
    let roles = choreography.roles();
    let protocol = choreography.protocol_name();
    if roles.is_empty() {
        return Err(TroupeError::compile(format!("{protocol} declares no roles")));
    }
    let mut seen = BTreeSet::new();
    for spec in &roles {
        if !seen.insert(spec.name.clone()) {
            return Err(TroupeError::compile(format!(
                "{protocol} declares role {} twice",
                spec.name
            )));
        }
    }

    let mut stage = Stage::new(protocol, roles, default_tolerance);
    let mut branches = 0usize;
    loop {
        branches += 1;
        let result = choreography.scene(&mut stage);
        stage.finish_branch(result)?;
        match stage.pending.pop() {
            Some(pending) => stage.resume(pending),
            None => break,
        }
    }

    debug!(
        protocol = %stage.graph.protocol(),
        steps = stage.graph.len(),
        branches,
        "choreography compiled"
    );
    Ok(stage.graph)
}
