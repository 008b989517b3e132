//! One waiting phase of a run.
//!
//! A phase opens when control reaches a set of expected messages and closes
//! once the path search picks a chain of them. Arrivals are validated on the
//! fly; deadlines that pass turn into soft or hard timeouts.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};
use troupe_choreography::{IncomingId, NextAction, Part};
use troupe_core::{Address, FullMessage, Result, TroupeError};

use super::search::{self, PhaseView, Status, Verdict};
use super::slots::{Expectation, RunState};

pub(crate) struct Phase<P> {
    initials: Vec<IncomingId>,
    scope: Vec<bool>,
    status: Vec<Status>,
    arrivals: Vec<Option<FullMessage<P>>>,
    claims: Vec<Option<Address>>,
}

impl<P> Phase<P> {
    /// Open a phase on `initials`. Messages already expired count as timed
    /// out from the start.
    pub(crate) fn open(part: &Part<P>, initials: &[IncomingId], run: &mut RunState<P>) -> Self {
        let count = part.incoming_count();
        let mut scope = vec![false; count];
        let mut queue: VecDeque<IncomingId> = initials.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if std::mem::replace(&mut scope[id.index()], true) {
                continue;
            }
            queue.extend(part.successors(id).iter().copied());
        }

        let mut phase = Self {
            initials: initials.to_vec(),
            scope,
            status: vec![Status::Unreceived; count],
            arrivals: (0..count).map(|_| None).collect(),
            claims: vec![None; part.peer_count()],
        };
        for id in part.incoming_ids() {
            if phase.scope[id.index()] && run.expectations[id.index()] == Expectation::Expired {
                phase.time_out(part, run, id);
            }
        }
        phase
    }

    pub(crate) fn in_scope(&self, id: IncomingId) -> bool {
        self.scope[id.index()]
    }

    /// Validate and record an arrival.
    pub(crate) fn arrive(&mut self, part: &Part<P>, run: &mut RunState<P>, message: FullMessage<P>) {
        if message.protocol != *part.protocol() {
            trace!(protocol = %message.protocol, message = %message.name, "foreign protocol ignored");
            return;
        }
        let Ok(id) = part.incoming_id(message.name.as_str()) else {
            warn!(
                protocol = %part.protocol(),
                role = %part.role(),
                message = %message.name,
                "spurious message: not received by this role"
            );
            return;
        };

        match run.run_id() {
            Some(current) if current != message.run => {
                trace!(run = %message.run, %current, message = %message.name, "message of another run ignored");
                return;
            }
            Some(_) => {}
            None if self.in_scope(id) && part.is_initial(message.name.as_str()) => {
                *run.run.lock() = Some(message.run);
                debug!(protocol = %part.protocol(), role = %part.role(), run = %message.run, "run adopted");
            }
            None => {
                trace!(message = %message.name, "message before any run ignored");
                return;
            }
        }

        if !self.in_scope(id) {
            if run.accepted[id.index()] {
                warn!(
                    protocol = %part.protocol(),
                    role = %part.role(),
                    run = %message.run,
                    message = %message.name,
                    "spurious message: already accepted"
                );
            } else {
                trace!(message = %message.name, "message held for a later phase");
                run.held.push(message);
            }
            return;
        }

        if self.status[id.index()] == Status::Received {
            warn!(
                protocol = %part.protocol(),
                role = %part.role(),
                run = %message.run,
                message = %message.name,
                "spurious message: duplicate"
            );
            return;
        }

        let peer = part.sender_of(id).index();
        let claimed = run.addresses[peer].as_ref().or(self.claims[peer].as_ref());
        if let Some(expected) = claimed {
            if *expected != message.from {
                warn!(
                    protocol = %part.protocol(),
                    role = %part.role(),
                    run = %message.run,
                    message = %message.name,
                    from = %message.from,
                    %expected,
                    "spurious message: sender address conflicts"
                );
                return;
            }
        }

        if self.status[id.index()] != Status::Unreceived {
            debug!(message = %message.name, "late arrival accepted");
        }
        trace!(run = %message.run, message = %message.name, from = %message.from, "message received");
        self.claims[peer] = Some(message.from.clone());
        self.status[id.index()] = Status::Received;
        self.arrivals[id.index()] = Some(message);
    }

    /// A deadline passed for `id`.
    pub(crate) fn expired(&mut self, part: &Part<P>, run: &mut RunState<P>, id: IncomingId) {
        if self.in_scope(id) && self.status[id.index()] == Status::Unreceived {
            self.time_out(part, run, id);
        }
    }

    fn time_out(&mut self, part: &Part<P>, run: &mut RunState<P>, id: IncomingId) {
        run.last_missed = Some(id);
        if part.fallback(id).is_some() {
            warn!(
                protocol = %part.protocol(),
                role = %part.role(),
                message = %part.incoming_name(id),
                "soft timeout"
            );
            self.status[id.index()] = Status::SoftTimeout;
        } else {
            debug!(
                protocol = %part.protocol(),
                role = %part.role(),
                message = %part.incoming_name(id),
                "hard timeout"
            );
            self.status[id.index()] = Status::HardTimeout;
        }
    }

    pub(crate) fn evaluate(&self, part: &Part<P>) -> Verdict {
        search::search(
            part,
            &PhaseView {
                initials: &self.initials,
                scope: &self.scope,
                status: &self.status,
            },
        )
    }

    /// Accept the messages of `path` and decide where control goes.
    pub(crate) fn close(
        mut self,
        part: &Part<P>,
        run: &mut RunState<P>,
        path: &[IncomingId],
    ) -> Result<NextAction> {
        let Some(&end) = path.last() else {
            return Err(TroupeError::internal("path search produced an empty path"));
        };
        for &id in path {
            let Some(message) = self.arrivals[id.index()].take() else {
                continue;
            };
            let peer = part.sender_of(id).index();
            if run.addresses[peer].is_none() {
                run.addresses[peer] = Some(message.from.clone());
            }
            run.accepted[id.index()] = true;
            run.received[id.index()] = message.payload;
            trace!(role = %part.role(), message = %part.incoming_name(id), "message accepted");
        }
        run.held.extend(self.arrivals.into_iter().flatten());

        match self.status[end.index()] {
            Status::Received => match part.next_step(end) {
                Some(step) => part.after(step),
                None => Err(TroupeError::internal(format!(
                    "path ends at {} which completes nothing",
                    part.incoming_name(end)
                ))),
            },
            _ => {
                warn!(
                    protocol = %part.protocol(),
                    role = %part.role(),
                    message = %part.incoming_name(end),
                    "continuing at fallback"
                );
                part.fallback(end).cloned().ok_or_else(|| {
                    TroupeError::internal(format!("{} has no fallback", part.incoming_name(end)))
                })
            }
        }
    }

    /// The timeout that kills a dead phase.
    pub(crate) fn missed(&self, part: &Part<P>, run: &RunState<P>) -> TroupeError {
        let message = run
            .last_missed
            .filter(|id| self.in_scope(*id))
            .or_else(|| self.initials.first().copied())
            .map_or_else(|| "<none>".to_string(), |id| part.incoming_name(id).to_string());
        TroupeError::reception_timeout(part.protocol().as_str(), message, run.run_id())
    }
}
