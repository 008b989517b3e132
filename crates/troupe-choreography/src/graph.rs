//! Shared step graph.
//!
//! Steps live in an arena and refer to each other by [`StepId`]. The three
//! terminal states and the root occupy fixed slots, so every edge always has a
//! valid target: edges that were never explored point at the terminal that
//! matches their outcome.

use std::fmt;

use troupe_core::{Delay, MessageName, ProtocolName, Result, RoleName, TroupeError};

use crate::frontier::Causality;
use crate::performer::{StepAction, StepPredicate};
use crate::role::{Capability, RoleSpec};

/// Index of a step in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(usize);

impl StepId {
    /// Normal completion.
    pub const END_OK: StepId = StepId(0);
    /// Completion through an unhandled transmission failure.
    pub const END_NO_SEND: StepId = StepId(1);
    /// Completion through an unhandled reception failure.
    pub const END_NO_RECEIVE: StepId = StepId(2);
    /// Entry point of every role.
    pub const ROOT: StepId = StepId(3);

    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndKind {
    /// The scene completed.
    Ok,
    /// A transmission failure was not handled.
    NoSend,
    /// A reception failure was not handled.
    NoReceive,
}

impl EndKind {
    fn step_id(self) -> StepId {
        match self {
            EndKind::Ok => StepId::END_OK,
            EndKind::NoSend => StepId::END_NO_SEND,
            EndKind::NoReceive => StepId::END_NO_RECEIVE,
        }
    }
}

/// Label of an edge: the outcome of the step it leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Run, root and compose continuation; successful send.
    Ok,
    /// Test held.
    True,
    /// Test failed.
    False,
    /// The sender could not transmit.
    NoSend,
    /// The receiver missed the message.
    NoReceive,
}

/// Step payload, by kind.
pub enum StepKind<P> {
    /// Entry point.
    Root {
        /// First step of the scene
        next: StepId,
    },
    /// Local action of the owner.
    Run {
        /// Label the step was registered under
        label: String,
        /// State type the action needs
        capability: Capability,
        /// The action
        action: StepAction<P>,
        /// Continuation
        next: StepId,
    },
    /// Local branch of the owner.
    Test {
        /// Label the step was registered under
        label: String,
        /// State type the predicate needs
        capability: Capability,
        /// The predicate
        predicate: StepPredicate<P>,
        /// Continuation when the predicate holds
        on_true: StepId,
        /// Continuation otherwise
        on_false: StepId,
    },
    /// Message from the owner to `receiver`.
    Send {
        /// Receiving role
        receiver: RoleName,
        /// Message name
        message: MessageName,
        /// Declared transmission tolerance
        tolerance: Delay,
        /// Continuation after a successful send
        ok: StepId,
        /// Continuation when the sender could not transmit
        no_send: StepId,
        /// Continuation when the receiver missed the message
        no_receive: StepId,
    },
    /// Entry of an inlined sub-choreography.
    Compose {
        /// Protocol of the sub-choreography
        protocol: ProtocolName,
        /// Prefix applied to its message names
        prefix: String,
        /// First step of the sub-choreography
        next: StepId,
    },
    /// Terminal state.
    End(EndKind),
}

/// A node of the step graph.
pub struct Step<P> {
    owner: Option<RoleName>,
    kind: StepKind<P>,
}

impl<P> Step<P> {
    pub(crate) fn new(owner: Option<RoleName>, kind: StepKind<P>) -> Self {
        Self { owner, kind }
    }

    /// Role executing the step; `None` for root, compose and end steps.
    pub fn owner(&self) -> Option<&RoleName> {
        self.owner.as_ref()
    }

    /// The step payload.
    pub fn kind(&self) -> &StepKind<P> {
        &self.kind
    }

    /// Whether this is a terminal step.
    pub fn is_end(&self) -> bool {
        matches!(self.kind, StepKind::End(_))
    }

    /// Root and compose steps belong to nobody and are stepped through by
    /// every role.
    pub fn is_transparent(&self) -> bool {
        matches!(self.kind, StepKind::Root { .. } | StepKind::Compose { .. })
    }

    /// Whether `role` executes this step.
    pub fn is_owned_by(&self, role: &RoleName) -> bool {
        self.owner.as_ref() == Some(role)
    }

    /// Whether this step sends a message to `role`.
    pub fn is_send_to(&self, role: &RoleName) -> bool {
        matches!(&self.kind, StepKind::Send { receiver, .. } if receiver == role)
    }

    /// Message name, for sends.
    pub fn message(&self) -> Option<&MessageName> {
        match &self.kind {
            StepKind::Send { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Capability needed by local run and test steps.
    pub fn capability(&self) -> Option<Capability> {
        match &self.kind {
            StepKind::Run { capability, .. } | StepKind::Test { capability, .. } => {
                Some(*capability)
            }
            _ => None,
        }
    }

    /// Outgoing edges with their labels.
    pub fn successors(&self) -> Vec<(Outcome, StepId)> {
        match &self.kind {
            StepKind::Root { next } | StepKind::Run { next, .. } | StepKind::Compose { next, .. } => {
                vec![(Outcome::Ok, *next)]
            }
            StepKind::Test {
                on_true, on_false, ..
            } => vec![(Outcome::True, *on_true), (Outcome::False, *on_false)],
            StepKind::Send {
                ok,
                no_send,
                no_receive,
                ..
            } => vec![
                (Outcome::Ok, *ok),
                (Outcome::NoSend, *no_send),
                (Outcome::NoReceive, *no_receive),
            ],
            StepKind::End(_) => Vec::new(),
        }
    }

    /// Target of the edge labelled `outcome`.
    pub fn successor(&self, outcome: Outcome) -> Option<StepId> {
        self.successors()
            .into_iter()
            .find_map(|(label, target)| (label == outcome).then_some(target))
    }

    fn set_successor(&mut self, outcome: Outcome, target: StepId) -> Result<()> {
        let slot = match (&mut self.kind, outcome) {
            (StepKind::Root { next }, Outcome::Ok)
            | (StepKind::Run { next, .. }, Outcome::Ok)
            | (StepKind::Compose { next, .. }, Outcome::Ok) => Some(next),
            (StepKind::Test { on_true, .. }, Outcome::True) => Some(on_true),
            (StepKind::Test { on_false, .. }, Outcome::False) => Some(on_false),
            (StepKind::Send { ok, .. }, Outcome::Ok) => Some(ok),
            (StepKind::Send { no_send, .. }, Outcome::NoSend) => Some(no_send),
            (StepKind::Send { no_receive, .. }, Outcome::NoReceive) => Some(no_receive),
            _ => None,
        };
        match slot {
            Some(slot) => {
                *slot = target;
                Ok(())
            }
            None => Err(TroupeError::compile(format!(
                "no {outcome:?} edge on a step of {}; the scene does not replay deterministically",
                self.owner.as_ref().map_or("<nobody>", RoleName::as_str)
            ))),
        }
    }
}

impl<P> fmt::Debug for Step<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.as_ref().map_or("*", RoleName::as_str);
        match &self.kind {
            StepKind::Root { .. } => write!(f, "root"),
            StepKind::Run { label, .. } => write!(f, "{owner} run '{label}'"),
            StepKind::Test { label, .. } => write!(f, "{owner} test '{label}'"),
            StepKind::Send {
                receiver,
                message,
                tolerance,
                ..
            } => write!(f, "{owner} send '{message}' to {receiver} within {tolerance}"),
            StepKind::Compose {
                protocol, prefix, ..
            } => write!(f, "compose {protocol} as '{prefix}'"),
            StepKind::End(kind) => write!(f, "end {kind:?}"),
        }
    }
}

/// The compiled choreography: every reachable step of every role.
pub struct StepGraph<P> {
    protocol: ProtocolName,
    roles: Vec<RoleSpec>,
    steps: Vec<Step<P>>,
    causality: Causality,
}

impl<P> StepGraph<P> {
    pub(crate) fn new(protocol: ProtocolName, roles: Vec<RoleSpec>) -> Self {
        let causality = Causality::new(roles.iter().map(|spec| spec.name.clone()));
        let steps = vec![
            Step::new(None, StepKind::End(EndKind::Ok)),
            Step::new(None, StepKind::End(EndKind::NoSend)),
            Step::new(None, StepKind::End(EndKind::NoReceive)),
            Step::new(
                None,
                StepKind::Root {
                    next: StepId::END_OK,
                },
            ),
        ];
        Self {
            protocol,
            roles,
            steps,
            causality,
        }
    }

    /// Protocol name.
    pub fn protocol(&self) -> &ProtocolName {
        &self.protocol
    }

    /// Declared roles.
    pub fn roles(&self) -> &[RoleSpec] {
        &self.roles
    }

    /// Declaration of `name`.
    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.roles.iter().find(|spec| spec.name.as_str() == name)
    }

    /// Number of steps, terminals and root included.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the scene produced no step beyond root and terminals.
    pub fn is_empty(&self) -> bool {
        self.first() == StepId::END_OK
    }

    /// The step at `id`.
    ///
    /// Ids come from this graph, so lookups never fail for them.
    pub fn step(&self, id: StepId) -> &Step<P> {
        &self.steps[id.0]
    }

    /// Look up a step by an id of unknown origin.
    pub fn get(&self, id: StepId) -> Option<&Step<P>> {
        self.steps.get(id.0)
    }

    /// First step of the scene.
    pub fn first(&self) -> StepId {
        self.step(StepId::ROOT)
            .successor(Outcome::Ok)
            .unwrap_or(StepId::END_OK)
    }

    /// All steps with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (StepId, &Step<P>)> {
        self.steps.iter().enumerate().map(|(i, step)| (StepId(i), step))
    }

    /// Predecessors of every step, indexed by step.
    pub fn predecessors(&self) -> Vec<Vec<StepId>> {
        let mut reverse = vec![Vec::new(); self.steps.len()];
        for (id, step) in self.iter() {
            for (_, target) in step.successors() {
                if !reverse[target.0].contains(&id) {
                    reverse[target.0].push(id);
                }
            }
        }
        reverse
    }

    pub(crate) fn causality(&self) -> &Causality {
        &self.causality
    }

    pub(crate) fn causality_mut(&mut self) -> &mut Causality {
        &mut self.causality
    }

    pub(crate) fn push(&mut self, step: Step<P>) -> StepId {
        self.steps.push(step);
        StepId(self.steps.len() - 1)
    }

    pub(crate) fn link(&mut self, from: StepId, outcome: Outcome, to: StepId) -> Result<()> {
        let step = self
            .steps
            .get_mut(from.0)
            .ok_or_else(|| TroupeError::internal(format!("unknown step {from}")))?;
        step.set_successor(outcome, to)
    }

    pub(crate) fn end(kind: EndKind) -> StepId {
        kind.step_id()
    }
}

impl<P> fmt::Display for StepGraph<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "protocol {}", self.protocol)?;
        for (id, step) in self.iter() {
            write!(f, "{id:>5} {step:?}")?;
            let edges = step.successors();
            if !edges.is_empty() {
                let rendered: Vec<String> = edges
                    .iter()
                    .map(|(outcome, target)| format!("{outcome:?}->{target}"))
                    .collect();
                write!(f, "  [{}]", rendered.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<P> fmt::Debug for StepGraph<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
