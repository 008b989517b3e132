//! Path search over the expected-message DAG of a waiting phase.
//!
//! A phase completes along a chain of messages that starts at one of the
//! messages the phase opened with and ends either at a received final
//! message or at a soft-timed-out one. The longest such chain wins. A chain
//! is held back while some message that could still arrive would lengthen
//! one of its links: a later message overtaking an earlier one must not end
//! the phase before the earlier one had its chance.

use std::collections::VecDeque;

use troupe_choreography::{IncomingId, Part};

/// Status of an incoming message within one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Still expected.
    Unreceived,
    /// Arrived and usable.
    Received,
    /// Expired; control may continue at its fallback.
    SoftTimeout,
    /// Expired with nowhere to go.
    HardTimeout,
}

impl Status {
    pub(crate) fn is_usable(self) -> bool {
        matches!(self, Status::Received | Status::SoftTimeout)
    }

    fn is_live(self) -> bool {
        self != Status::HardTimeout
    }
}

/// Outcome of evaluating a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Messages of the chosen chain, first to last.
    Complete(Vec<IncomingId>),
    /// Nothing completes yet, but something still can.
    Waiting,
    /// No chain can complete any more.
    Dead,
}

/// The view of a phase the search needs.
pub(crate) struct PhaseView<'a> {
    pub(crate) initials: &'a [IncomingId],
    pub(crate) scope: &'a [bool],
    pub(crate) status: &'a [Status],
}

impl PhaseView<'_> {
    fn status(&self, id: IncomingId) -> Status {
        self.status[id.index()]
    }

    fn in_scope(&self, id: IncomingId) -> bool {
        self.scope[id.index()]
    }

    fn is_initial(&self, id: IncomingId) -> bool {
        self.initials.contains(&id)
    }
}

pub(crate) fn search<P>(part: &Part<P>, phase: &PhaseView<'_>) -> Verdict {
    let count = part.incoming_count();
    let order = part.topological_order();
    let mut rank = vec![usize::MAX; count];
    for (position, id) in order.iter().enumerate() {
        rank[id.index()] = position;
    }

    // Longest usable chain ending at each message, with its predecessor.
    let mut best: Vec<Option<(usize, Option<IncomingId>)>> = vec![None; count];
    for &id in order {
        if !phase.in_scope(id) || !phase.status(id).is_usable() {
            continue;
        }
        let mut here = phase.is_initial(id).then_some((1, None));
        let mut predecessors = part.predecessors(id).to_vec();
        predecessors.sort_by_key(|p| rank[p.index()]);
        for p in predecessors {
            if let Some((length, _)) = best[p.index()] {
                if here.map_or(true, |(current, _)| length + 1 > current) {
                    here = Some((length + 1, Some(p)));
                }
            }
        }
        best[id.index()] = here;
    }

    let mut chosen: Option<(usize, Vec<IncomingId>)> = None;
    for &id in order {
        let Some((length, _)) = best[id.index()] else {
            continue;
        };
        let completes = match phase.status(id) {
            Status::Received => part.is_final(id),
            Status::SoftTimeout => true,
            _ => false,
        };
        if !completes || chosen.as_ref().map_or(false, |(current, _)| *current >= length) {
            continue;
        }
        let path = trace_back(&best, id);
        if is_premature(part, phase, &path) {
            continue;
        }
        chosen = Some((length, path));
    }

    match chosen {
        Some((_, path)) => Verdict::Complete(path),
        None if can_complete(part, phase) => Verdict::Waiting,
        None => Verdict::Dead,
    }
}

fn trace_back(best: &[Option<(usize, Option<IncomingId>)>], end: IncomingId) -> Vec<IncomingId> {
    let mut path = vec![end];
    let mut current = end;
    while let Some((_, Some(previous))) = best[current.index()] {
        path.push(previous);
        current = previous;
    }
    path.reverse();
    path
}

/// Whether some link `u -> v` of `path` also has a longer route through
/// messages that may still arrive.
fn is_premature<P>(part: &Part<P>, phase: &PhaseView<'_>, path: &[IncomingId]) -> bool {
    path.windows(2).any(|link| {
        let (from, to) = (link[0], link[1]);
        part.successors(from)
            .iter()
            .filter(|&&next| next != to && phase.in_scope(next) && phase.status(next).is_live())
            .any(|&next| reaches(part, phase, next, to))
    })
}

fn reaches<P>(part: &Part<P>, phase: &PhaseView<'_>, start: IncomingId, target: IncomingId) -> bool {
    let mut seen = vec![false; part.incoming_count()];
    let mut queue = VecDeque::from([start]);
    seen[start.index()] = true;
    while let Some(id) = queue.pop_front() {
        for &next in part.successors(id) {
            if next == target {
                return true;
            }
            if !seen[next.index()] && phase.in_scope(next) && phase.status(next).is_live() {
                seen[next.index()] = true;
                queue.push_back(next);
            }
        }
    }
    false
}

/// Whether a chain from a live initial message can still reach a message
/// that ends the phase: a final one, or one with a fallback.
fn can_complete<P>(part: &Part<P>, phase: &PhaseView<'_>) -> bool {
    let mut seen = vec![false; part.incoming_count()];
    let mut queue: VecDeque<IncomingId> = phase
        .initials
        .iter()
        .copied()
        .filter(|&id| phase.in_scope(id) && phase.status(id).is_live())
        .collect();
    for id in &queue {
        seen[id.index()] = true;
    }
    while let Some(id) = queue.pop_front() {
        if part.is_final(id) || part.fallback(id).is_some() {
            return true;
        }
        for &next in part.successors(id) {
            if !seen[next.index()] && phase.in_scope(next) && phase.status(next).is_live() {
                seen[next.index()] = true;
                queue.push_back(next);
            }
        }
    }
    false
}
