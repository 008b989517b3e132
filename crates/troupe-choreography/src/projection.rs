//! Projection of the shared graph onto one role.
//!
//! Starting at the root, the projector walks the role's own steps directly.
//! Whenever control passes to another role it searches forward through the
//! other roles' steps until it meets either exactly one step of the role or a
//! set of messages addressed to the role; each such message is resolved the
//! same way from its successful delivery. The causal frontier graph then
//! gives every outgoing message the deadlines of the messages it may cause.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, trace};
use troupe_core::{Delay, MessageName, Result, RoleName, TroupeError};

use crate::graph::{Outcome, StepGraph, StepId, StepKind};
use crate::part::{IncomingId, NextAction, OutgoingId, Part, PeerId};
use crate::role::Capability;

struct Projector<'g, P> {
    graph: &'g StepGraph<P>,
    role: RoleName,

    incoming: IndexSet<MessageName>,
    incoming_steps: Vec<StepId>,
    outgoing: IndexSet<MessageName>,
    peers: IndexSet<RoleName>,
    sender_of: Vec<PeerId>,
    next: Vec<Option<NextAction>>,
    fallbacks: Vec<Option<NextAction>>,

    scheduled: HashSet<StepId>,
    active: VecDeque<StepId>,
    own_sends: Vec<StepId>,
    unresolved: VecDeque<IncomingId>,
    passive: HashMap<StepId, NextAction>,
    capabilities: BTreeSet<Capability>,
}

/// Project `graph` onto `role`.
pub(crate) fn project<P>(graph: Arc<StepGraph<P>>, role: &str) -> Result<Part<P>> {
    let spec = graph
        .role(role)
        .cloned()
        .ok_or_else(|| TroupeError::no_such_role(role))?;

    let mut projector = Projector {
        graph: &graph,
        role: spec.name.clone(),
        incoming: IndexSet::new(),
        incoming_steps: Vec::new(),
        outgoing: IndexSet::new(),
        peers: IndexSet::new(),
        sender_of: Vec::new(),
        next: Vec::new(),
        fallbacks: Vec::new(),
        scheduled: HashSet::new(),
        active: VecDeque::new(),
        own_sends: Vec::new(),
        unresolved: VecDeque::new(),
        passive: HashMap::new(),
        capabilities: BTreeSet::from([spec.capability]),
    };
    projector.schedule(StepId::ROOT);
    projector.drain()?;

    let count = projector.incoming.len();
    let mut next_step = Vec::with_capacity(count);
    let mut successors = Vec::with_capacity(count);
    for action in &projector.next {
        match action {
            Some(NextAction::Step(step)) => {
                next_step.push(Some(*step));
                successors.push(Vec::new());
            }
            Some(NextAction::Await(ids)) => {
                next_step.push(None);
                successors.push(ids.clone());
            }
            None => {
                return Err(TroupeError::internal(format!(
                    "role {} left a message unresolved",
                    projector.role
                )))
            }
        }
    }
    let mut predecessors = vec![Vec::new(); count];
    for (from, targets) in successors.iter().enumerate() {
        for to in targets {
            predecessors[to.index()].push(IncomingId::new(from));
        }
    }
    let topological = projector.order(&successors)?;
    let causes = projector.causes();
    let last_causes = projector.last_causes(&causes);
    let spontaneous = projector.spontaneous();
    let initials = projector.initials()?;

    debug!(
        protocol = %graph.protocol(),
        role = %projector.role,
        incoming = count,
        outgoing = projector.outgoing.len(),
        "projection complete"
    );

    let Projector {
        role,
        capabilities,
        incoming,
        outgoing,
        peers,
        sender_of,
        fallbacks,
        passive,
        ..
    } = projector;

    Ok(Part {
        role,
        protocol: graph.protocol().clone(),
        capabilities,
        graph: graph.clone(),
        incoming,
        outgoing,
        peers,
        sender_of,
        next_step,
        successors,
        predecessors,
        topological,
        fallbacks,
        causes,
        last_causes,
        spontaneous,
        initials,
        passive,
    })
}

impl<P> Projector<'_, P> {
    fn is_mine(&self, step: StepId) -> bool {
        let step = self.graph.step(step);
        step.is_owned_by(&self.role) || step.is_transparent()
    }

    fn schedule(&mut self, step: StepId) {
        if self.scheduled.insert(step) {
            self.active.push_back(step);
        }
    }

    fn peer(&mut self, role: &RoleName) -> PeerId {
        PeerId::new(self.peers.insert_full(role.clone()).0)
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            if let Some(step) = self.active.pop_front() {
                self.visit_active(step)?;
            } else if let Some(id) = self.unresolved.pop_front() {
                self.resolve(id)?;
            } else {
                return Ok(());
            }
        }
    }

    fn visit_active(&mut self, id: StepId) -> Result<()> {
        let graph = self.graph;
        let step = graph.step(id);
        if let Some(capability) = step.capability() {
            self.capabilities.insert(capability);
        }
        if let StepKind::Send {
            receiver, message, ..
        } = step.kind()
        {
            self.outgoing.insert(message.clone());
            self.peer(receiver);
            self.own_sends.push(id);
        }

        for (outcome, target) in step.successors() {
            // Only the receiver learns that a message went missing.
            if outcome == Outcome::NoReceive || graph.step(target).is_end() {
                continue;
            }
            if self.is_mine(target) {
                self.schedule(target);
            } else if !self.passive.contains_key(&target) {
                let action = self.search(target, false)?;
                self.passive.insert(target, action);
            }
        }
        Ok(())
    }

    /// Search through other roles' steps from `start`. When `start` is a
    /// message to this role, the search begins at its delivery.
    fn search(&mut self, start: StepId, delivered: bool) -> Result<NextAction> {
        let graph = self.graph;
        let mut queue = VecDeque::new();
        if delivered {
            queue.extend(graph.step(start).successor(Outcome::Ok));
        } else {
            queue.push_back(start);
        }

        let mut seen = HashSet::new();
        let mut found: Option<StepId> = None;
        let mut messages = Vec::new();
        while let Some(id) = queue.pop_front() {
            let step = graph.step(id);
            if step.is_end() || !seen.insert(id) {
                continue;
            }
            if step.is_owned_by(&self.role) {
                if let Some(other) = found {
                    return Err(TroupeError::compile(format!(
                        "role {} of {} has an ambiguous bifurcation: {start} reaches both {other} ({:?}) and {id} ({step:?})",
                        self.role,
                        graph.protocol(),
                        graph.step(other)
                    )));
                }
                if !messages.is_empty() {
                    return Err(self.mixed(start, id));
                }
                found = Some(id);
                continue;
            }
            if step.is_send_to(&self.role) {
                if let Some(active) = found {
                    return Err(self.mixed(start, active));
                }
                messages.push(id);
                continue;
            }
            for (outcome, next) in step.successors() {
                if outcome != Outcome::NoReceive {
                    queue.push_back(next);
                }
            }
        }

        if let Some(active) = found {
            self.schedule(active);
            return Ok(NextAction::Step(active));
        }
        if messages.is_empty() {
            return Ok(NextAction::Step(StepId::END_OK));
        }
        let mut ids = Vec::with_capacity(messages.len());
        for step in messages {
            let id = self.inscribe(step)?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(NextAction::Await(ids))
    }

    fn mixed(&self, start: StepId, active: StepId) -> TroupeError {
        TroupeError::compile(format!(
            "role {} of {} has mixed next actions: {start} reaches its own step {active} ({:?}) as well as incoming messages",
            self.role,
            self.graph.protocol(),
            self.graph.step(active)
        ))
    }

    fn inscribe(&mut self, step: StepId) -> Result<IncomingId> {
        let graph = self.graph;
        let target = graph.step(step);
        let (Some(sender), Some(message)) = (target.owner(), target.message()) else {
            return Err(TroupeError::internal(format!("{step} is not a message")));
        };
        if let Some(index) = self.incoming.get_index_of(message.as_str()) {
            return Ok(IncomingId::new(index));
        }

        let (index, _) = self.incoming.insert_full(message.clone());
        let id = IncomingId::new(index);
        let peer = self.peer(sender);
        self.incoming_steps.push(step);
        self.sender_of.push(peer);
        self.next.push(None);
        self.fallbacks.push(None);
        self.unresolved.push_back(id);
        trace!(role = %self.role, message = %message, %id, "incoming message inscribed");
        Ok(id)
    }

    fn resolve(&mut self, id: IncomingId) -> Result<()> {
        let graph = self.graph;
        let step = self.incoming_steps[id.index()];
        let next = self.search(step, true)?;
        self.next[id.index()] = Some(next);

        let missed = graph
            .step(step)
            .successor(Outcome::NoReceive)
            .unwrap_or(StepId::END_NO_RECEIVE);
        let fallback = if missed == StepId::END_NO_RECEIVE {
            None
        } else if graph.step(missed).is_end() {
            Some(NextAction::Step(missed))
        } else if self.is_mine(missed) {
            self.schedule(missed);
            Some(NextAction::Step(missed))
        } else {
            Some(self.search(missed, false)?)
        };
        self.fallbacks[id.index()] = fallback;
        Ok(())
    }

    fn order(&self, successors: &[Vec<IncomingId>]) -> Result<Vec<IncomingId>> {
        let mut dag: DiGraph<(), ()> = DiGraph::with_capacity(successors.len(), 0);
        for _ in successors {
            dag.add_node(());
        }
        for (from, targets) in successors.iter().enumerate() {
            for to in targets {
                dag.add_edge(NodeIndex::new(from), NodeIndex::new(to.index()), ());
            }
        }
        match toposort(&dag, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|node| IncomingId::new(node.index()))
                .collect()),
            Err(cycle) => Err(TroupeError::compile(format!(
                "role {} of {} expects '{}' in a loop of messages with no step of its own in between",
                self.role,
                self.graph.protocol(),
                self.incoming[cycle.node_id().index()]
            ))),
        }
    }

    fn causes(&self) -> Vec<Vec<(IncomingId, Delay)>> {
        let causality = self.graph.causality();
        let mut merged: Vec<BTreeMap<IncomingId, Delay>> =
            vec![BTreeMap::new(); self.outgoing.len()];

        for &send in &self.own_sends {
            let step = self.graph.step(send);
            let (Some(message), Some(start)) = (step.message(), causality.marker_of(send)) else {
                continue;
            };
            let Some(out) = self.outgoing.get_index_of(message.as_str()) else {
                continue;
            };
            for (marker, distance) in causality.longest_paths(start, &self.role) {
                let Some(caused) = causality.step_of(marker) else {
                    continue;
                };
                let caused = self.graph.step(caused);
                if !caused.is_send_to(&self.role) {
                    continue;
                }
                let (Some(name), StepKind::Send { tolerance, .. }) = (caused.message(), caused.kind())
                else {
                    continue;
                };
                let Some(index) = self.incoming.get_index_of(name.as_str()) else {
                    continue;
                };
                let total = distance + *tolerance;
                let slot = merged[out].entry(IncomingId::new(index)).or_insert(total);
                *slot = (*slot).max(total);
            }
        }

        merged
            .into_iter()
            .map(|caused| caused.into_iter().collect::<Vec<_>>())
            .collect()
    }

    /// For every incoming message, the causing sends met first when walking
    /// the graph backwards from it.
    fn last_causes(&self, causes: &[Vec<(IncomingId, Delay)>]) -> Vec<BTreeSet<OutgoingId>> {
        let reverse = self.graph.predecessors();
        let mut last = vec![BTreeSet::new(); self.incoming.len()];

        for (index, &step) in self.incoming_steps.iter().enumerate() {
            let id = IncomingId::new(index);
            let causing: HashSet<StepId> = self
                .own_sends
                .iter()
                .copied()
                .filter(|send| {
                    self.graph
                        .step(*send)
                        .message()
                        .and_then(|name| self.outgoing.get_index_of(name.as_str()))
                        .map_or(false, |out| causes[out].iter().any(|(caused, _)| *caused == id))
                })
                .collect();
            if causing.is_empty() {
                continue;
            }

            let mut seen = HashSet::new();
            let mut queue: VecDeque<StepId> = reverse[step.index()].iter().copied().collect();
            while let Some(current) = queue.pop_front() {
                if !seen.insert(current) {
                    continue;
                }
                if causing.contains(&current) {
                    if let Some(out) = self
                        .graph
                        .step(current)
                        .message()
                        .and_then(|name| self.outgoing.get_index_of(name.as_str()))
                    {
                        last[index].insert(OutgoingId::new(out));
                    }
                    continue;
                }
                queue.extend(reverse[current.index()].iter().copied());
            }
        }
        last
    }

    /// Messages reachable from the root without the role sending anything.
    fn spontaneous(&self) -> BTreeSet<IncomingId> {
        let mut found = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([StepId::ROOT]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let step = self.graph.step(id);
            if step.is_send_to(&self.role) {
                if let Some(index) = step
                    .message()
                    .and_then(|name| self.incoming.get_index_of(name.as_str()))
                {
                    found.insert(IncomingId::new(index));
                }
            }
            if step.is_owned_by(&self.role) && step.message().is_some() {
                continue;
            }
            queue.extend(step.successors().into_iter().map(|(_, next)| next));
        }
        found
    }

    fn initials(&self) -> Result<Vec<IncomingId>> {
        let mut step = StepId::ROOT;
        let mut hops = 0;
        while self.graph.step(step).is_transparent() {
            step = self
                .graph
                .step(step)
                .successor(Outcome::Ok)
                .unwrap_or(StepId::END_OK);
            hops += 1;
            if hops > self.graph.len() {
                return Err(TroupeError::compile(format!(
                    "{} starts with a loop of empty compositions",
                    self.graph.protocol()
                )));
            }
        }
        if self.is_mine(step) || self.graph.step(step).is_end() {
            return Ok(Vec::new());
        }
        Ok(match self.passive.get(&step) {
            Some(NextAction::Await(ids)) => ids.clone(),
            _ => Vec::new(),
        })
    }
}
