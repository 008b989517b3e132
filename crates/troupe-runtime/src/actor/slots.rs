//! Per-run state of an actor: payload slots, addresses and deadlines.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use troupe_choreography::{IncomingId, Mailbox, OutgoingId, Part};
use troupe_core::{Address, FullMessage, Result, RoleName, RunId, TroupeError};

/// When an incoming message is expected to have arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expectation {
    /// Caused by a send that has not happened yet.
    Idle,
    /// Due by this instant.
    Until(Instant),
    /// No deadline can be derived for it.
    Forever,
    /// Its deadline passed.
    Expired,
}

/// Run identifier shared with the actor's receive event so that filtering
/// follows the run without going through the actor.
pub(crate) type SharedRun = Arc<Mutex<Option<RunId>>>;

pub(crate) struct RunState<P> {
    pub(crate) run: SharedRun,
    pub(crate) received: Vec<Option<P>>,
    pub(crate) staged: Vec<Option<P>>,
    pub(crate) accepted: Vec<bool>,
    pub(crate) addresses: Vec<Option<Address>>,
    pub(crate) initial_addresses: Vec<Option<Address>>,
    pub(crate) expectations: Vec<Expectation>,
    pub(crate) deadlines: BinaryHeap<Reverse<(Instant, IncomingId)>>,
    pub(crate) held: Vec<FullMessage<P>>,
    pub(crate) last_missed: Option<IncomingId>,
}

impl<P> RunState<P> {
    pub(crate) fn new(part: &Part<P>, run: SharedRun) -> Self {
        let mut state = Self {
            run,
            received: Vec::new(),
            staged: Vec::new(),
            accepted: Vec::new(),
            addresses: Vec::new(),
            initial_addresses: vec![None; part.peer_count()],
            expectations: Vec::new(),
            deadlines: BinaryHeap::new(),
            held: Vec::new(),
            last_missed: None,
        };
        state.reset(part);
        state
    }

    /// Back to the state before any run; initial addresses survive.
    pub(crate) fn reset(&mut self, part: &Part<P>) {
        *self.run.lock() = None;
        self.clear(part);
    }

    /// [`RunState::reset`] leaving the run id to the caller.
    pub(crate) fn clear(&mut self, part: &Part<P>) {
        self.received = (0..part.incoming_count()).map(|_| None).collect();
        self.staged = (0..part.outgoing_count()).map(|_| None).collect();
        self.accepted = vec![false; part.incoming_count()];
        self.addresses = self.initial_addresses.clone();
        self.expectations = part
            .incoming_ids()
            .map(|id| {
                if part.is_spontaneous(id) || part.last_causes(id).is_empty() {
                    Expectation::Forever
                } else {
                    Expectation::Idle
                }
            })
            .collect();
        self.deadlines.clear();
        self.held.clear();
        self.last_missed = None;
    }

    pub(crate) fn run_id(&self) -> Option<RunId> {
        *self.run.lock()
    }

    /// Extend the deadlines of everything `out` may cause, sent at `now`.
    pub(crate) fn schedule(&mut self, part: &Part<P>, out: OutgoingId, now: Instant) {
        for &(id, delay) in part.causes(out) {
            let Some(tolerance) = delay.as_duration() else {
                // Absorbs any earlier deadline; the message may arrive anytime.
                self.expectations[id.index()] = Expectation::Forever;
                continue;
            };
            let proposed = now + tolerance;
            let slot = &mut self.expectations[id.index()];
            let deadline = match *slot {
                Expectation::Forever => continue,
                Expectation::Idle | Expectation::Expired => proposed,
                Expectation::Until(current) => current.max(proposed),
            };
            *slot = Expectation::Until(deadline);
            if part.is_last_cause(id, out) {
                self.deadlines.push(Reverse((deadline, id)));
            }
        }
    }

    /// Earliest deadline still in force; stale heap entries are dropped.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.expectations[id.index()] == Expectation::Until(deadline) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Expire every deadline up to `now`, returning the expired messages.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<IncomingId> {
        let mut expired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.deadlines.pop() {
                self.expectations[id.index()] = Expectation::Expired;
                expired.push(id);
            }
        }
        expired
    }
}

/// The mailbox a step closure sees.
pub(crate) struct Slots<'a, P> {
    pub(crate) part: &'a Part<P>,
    pub(crate) run: &'a mut RunState<P>,
}

impl<P> Mailbox<P> for Slots<'_, P> {
    fn role(&self) -> &RoleName {
        self.part.role()
    }

    fn message(&self, name: &str) -> Result<&P> {
        read(self.part, &*self.run, name)
    }

    fn has_message(&self, name: &str) -> bool {
        read(self.part, &*self.run, name).is_ok()
    }

    fn set_message(&mut self, name: &str, payload: P) -> Result<()> {
        stage(self.part, self.run, name, payload)
    }

    fn address(&self, role: &str) -> Result<Option<&Address>> {
        let peer = self.part.peer_id(role)?;
        Ok(self.run.addresses[peer.index()].as_ref())
    }

    fn set_address(&mut self, role: &str, address: Address) -> Result<()> {
        let peer = self.part.peer_id(role)?;
        self.run.addresses[peer.index()] = Some(address);
        Ok(())
    }

    fn run_id(&self) -> Option<RunId> {
        self.run.run_id()
    }
}

/// Payload of an accepted incoming message, else of a staged outgoing one.
pub(crate) fn read<'r, P>(part: &Part<P>, run: &'r RunState<P>, name: &str) -> Result<&'r P> {
    let incoming = part.incoming_id(name).ok();
    let outgoing = part.outgoing_id(name).ok();
    if incoming.is_none() && outgoing.is_none() {
        return Err(TroupeError::no_such_message(format!(
            "{name} (role {} of {} neither sends nor receives it)",
            part.role(),
            part.protocol()
        )));
    }
    incoming
        .and_then(|id| run.received[id.index()].as_ref())
        .or_else(|| outgoing.and_then(|id| run.staged[id.index()].as_ref()))
        .ok_or_else(|| {
            TroupeError::no_such_message(format!(
                "{name} (no payload in the current run of {})",
                part.role()
            ))
        })
}

pub(crate) fn stage<P>(part: &Part<P>, run: &mut RunState<P>, name: &str, payload: P) -> Result<()> {
    let id = part.outgoing_id(name)?;
    run.staged[id.index()] = Some(payload);
    Ok(())
}
