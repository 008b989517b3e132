//! Per-role compiled automaton.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexSet;
use troupe_core::{Delay, MessageName, ProtocolName, Result, RoleName, TroupeError};

use crate::graph::{Step, StepGraph, StepId};
use crate::role::Capability;

macro_rules! dense_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index)
            }

            /// Position in the part's tables.
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}"), self.0)
            }
        }
    };
}

dense_id!(
    /// Dense id of a message the role receives.
    IncomingId,
    "in"
);
dense_id!(
    /// Dense id of a message the role sends.
    OutgoingId,
    "out"
);
dense_id!(
    /// Dense id of a role the role talks to.
    PeerId,
    "peer"
);

/// What a role does after reaching a point of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Execute this step: one of the role's own, a transparent one or a
    /// terminal.
    Step(StepId),
    /// Wait until a path through these messages completes.
    Await(Vec<IncomingId>),
}

/// Everything one role needs to play its part, and nothing about how the
/// other roles play theirs.
///
/// Parts are immutable once projected and shared between every actor of the
/// role.
pub struct Part<P> {
    pub(crate) role: RoleName,
    pub(crate) protocol: ProtocolName,
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) graph: Arc<StepGraph<P>>,

    pub(crate) incoming: IndexSet<MessageName>,
    pub(crate) outgoing: IndexSet<MessageName>,
    pub(crate) peers: IndexSet<RoleName>,
    pub(crate) sender_of: Vec<PeerId>,

    pub(crate) next_step: Vec<Option<StepId>>,
    pub(crate) successors: Vec<Vec<IncomingId>>,
    pub(crate) predecessors: Vec<Vec<IncomingId>>,
    pub(crate) topological: Vec<IncomingId>,
    pub(crate) fallbacks: Vec<Option<NextAction>>,

    pub(crate) causes: Vec<Vec<(IncomingId, Delay)>>,
    pub(crate) last_causes: Vec<BTreeSet<OutgoingId>>,
    pub(crate) spontaneous: BTreeSet<IncomingId>,
    pub(crate) initials: Vec<IncomingId>,

    pub(crate) passive: HashMap<StepId, NextAction>,
}

impl<P> Part<P> {
    /// The role this part belongs to.
    pub fn role(&self) -> &RoleName {
        &self.role
    }

    /// Protocol name.
    pub fn protocol(&self) -> &ProtocolName {
        &self.protocol
    }

    /// State types the part's local steps operate on.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// The shared graph the part was projected from.
    pub fn graph(&self) -> &Arc<StepGraph<P>> {
        &self.graph
    }

    /// A step of the shared graph.
    pub fn step(&self, id: StepId) -> &Step<P> {
        self.graph.step(id)
    }

    /// Where every run starts.
    pub fn root(&self) -> StepId {
        StepId::ROOT
    }

    /// Number of incoming messages.
    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// Number of outgoing messages.
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of peer roles.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Every incoming message id, in id order.
    pub fn incoming_ids(&self) -> impl Iterator<Item = IncomingId> {
        (0..self.incoming.len()).map(IncomingId)
    }

    /// Id of an incoming message.
    pub fn incoming_id(&self, name: &str) -> Result<IncomingId> {
        self.incoming
            .get_index_of(name)
            .map(IncomingId)
            .ok_or_else(|| self.no_such_message("receive", name))
    }

    /// Name of an incoming message.
    pub fn incoming_name(&self, id: IncomingId) -> &MessageName {
        &self.incoming[id.0]
    }

    /// Id of an outgoing message.
    pub fn outgoing_id(&self, name: &str) -> Result<OutgoingId> {
        self.outgoing
            .get_index_of(name)
            .map(OutgoingId)
            .ok_or_else(|| self.no_such_message("send", name))
    }

    /// Name of an outgoing message.
    pub fn outgoing_name(&self, id: OutgoingId) -> &MessageName {
        &self.outgoing[id.0]
    }

    /// Id of a peer role.
    pub fn peer_id(&self, name: &str) -> Result<PeerId> {
        self.peers
            .get_index_of(name)
            .map(PeerId)
            .ok_or_else(|| {
                TroupeError::no_such_role(format!(
                    "{name} (role {} of {} talks to {:?})",
                    self.role, self.protocol, self.peers
                ))
            })
    }

    /// Name of a peer role.
    pub fn peer_name(&self, id: PeerId) -> &RoleName {
        &self.peers[id.0]
    }

    /// All peer roles, in id order.
    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &RoleName)> {
        self.peers.iter().enumerate().map(|(i, name)| (PeerId(i), name))
    }

    /// The role sending an incoming message.
    pub fn sender_of(&self, id: IncomingId) -> PeerId {
        self.sender_of[id.0]
    }

    /// Step taken once `id` completes a path; `None` unless `id` is final.
    pub fn next_step(&self, id: IncomingId) -> Option<StepId> {
        self.next_step[id.0]
    }

    /// Whether receiving `id` can complete a path.
    pub fn is_final(&self, id: IncomingId) -> bool {
        self.next_step[id.0].is_some()
    }

    /// Messages expected right after `id`.
    pub fn successors(&self, id: IncomingId) -> &[IncomingId] {
        &self.successors[id.0]
    }

    /// Messages expected right before `id`.
    pub fn predecessors(&self, id: IncomingId) -> &[IncomingId] {
        &self.predecessors[id.0]
    }

    /// Incoming messages ordered so that every message precedes its
    /// successors.
    pub fn topological_order(&self) -> &[IncomingId] {
        &self.topological
    }

    /// Where control goes when `id` times out; `None` when a timeout ends
    /// the run.
    pub fn fallback(&self, id: IncomingId) -> Option<&NextAction> {
        self.fallbacks[id.0].as_ref()
    }

    /// Incoming messages an outgoing one may cause, with the longest delay
    /// after which each has either arrived or cannot arrive any more.
    pub fn causes(&self, id: OutgoingId) -> &[(IncomingId, Delay)] {
        &self.causes[id.0]
    }

    /// Outgoing messages whose sending completes the causes of `id`.
    pub fn last_causes(&self, id: IncomingId) -> &BTreeSet<OutgoingId> {
        &self.last_causes[id.0]
    }

    /// Whether sending `out` completes the causes of `id`.
    pub fn is_last_cause(&self, id: IncomingId, out: OutgoingId) -> bool {
        self.last_causes[id.0].contains(&out)
    }

    /// Whether `id` can arrive before the role sends anything.
    pub fn is_spontaneous(&self, id: IncomingId) -> bool {
        self.spontaneous.contains(&id)
    }

    /// Messages the role waits for before taking any step.
    pub fn initials(&self) -> &[IncomingId] {
        &self.initials
    }

    /// Whether `name` opens a run of this role.
    pub fn is_initial(&self, name: &str) -> bool {
        self.incoming
            .get_index_of(name)
            .map_or(false, |index| self.initials.contains(&IncomingId(index)))
    }

    /// What the role does once control reaches `step`.
    pub fn after(&self, step: StepId) -> Result<NextAction> {
        let target = self.graph.step(step);
        if target.is_end() || target.is_transparent() || target.is_owned_by(&self.role) {
            return Ok(NextAction::Step(step));
        }
        self.passive.get(&step).cloned().ok_or_else(|| {
            TroupeError::internal(format!(
                "role {} of {} reached {step}, which it never projected",
                self.role, self.protocol
            ))
        })
    }

    fn no_such_message(&self, direction: &str, name: &str) -> TroupeError {
        TroupeError::no_such_message(format!(
            "{name} (role {} of {} does not {direction} it)",
            self.role, self.protocol
        ))
    }
}

impl<P> fmt::Debug for Part<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("peers", &self.peers)
            .field("next_step", &self.next_step)
            .field("successors", &self.successors)
            .field("fallbacks", &self.fallbacks)
            .field("causes", &self.causes)
            .field("last_causes", &self.last_causes)
            .field("spontaneous", &self.spontaneous)
            .field("initials", &self.initials)
            .finish()
    }
}
