//! Causal frontier graph.
//!
//! While a scene is traced every role owns a chain of frontier markers. A
//! marker is the point a role has reached; edges carry the maximum delay
//! between two points. Sends add a cross-role edge weighted by the declared
//! tolerance, local steps only advance the owner's chain. The graph exists at
//! compile time only: projection reads it to size each role's deadlines.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use troupe_core::{Delay, RoleName};

use crate::graph::StepId;

/// Index of a frontier marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FrontierId(usize);

#[derive(Debug)]
struct Frontier {
    owner: RoleName,
    edges: BTreeMap<FrontierId, Delay>,
}

/// Current marker of every role; snapshotted with each pending branch.
pub(crate) type Frontiers = BTreeMap<RoleName, FrontierId>;

#[derive(Debug)]
pub(crate) struct Causality {
    frontiers: Vec<Frontier>,
    initial: Frontiers,
    at_step: HashMap<StepId, FrontierId>,
    step_at: HashMap<FrontierId, StepId>,
}

impl Causality {
    pub(crate) fn new(roles: impl IntoIterator<Item = RoleName>) -> Self {
        let mut causality = Self {
            frontiers: Vec::new(),
            initial: BTreeMap::new(),
            at_step: HashMap::new(),
            step_at: HashMap::new(),
        };
        for role in roles {
            let marker = causality.spawn(role.clone());
            causality.initial.insert(role, marker);
        }
        causality
    }

    pub(crate) fn initial(&self) -> Frontiers {
        self.initial.clone()
    }

    fn spawn(&mut self, owner: RoleName) -> FrontierId {
        self.frontiers.push(Frontier {
            owner,
            edges: BTreeMap::new(),
        });
        FrontierId(self.frontiers.len() - 1)
    }

    /// New marker of the same owner, reachable from `from` within `delay`.
    pub(crate) fn branch(&mut self, from: FrontierId, delay: Delay) -> FrontierId {
        let owner = self.frontiers[from.0].owner.clone();
        let marker = self.spawn(owner);
        self.frontiers[from.0].edges.insert(marker, delay);
        marker
    }

    /// Edge from `from` to `to`, replacing any previous weight.
    pub(crate) fn cause(&mut self, from: FrontierId, to: FrontierId, delay: Delay) {
        self.frontiers[from.0].edges.insert(to, delay);
    }

    /// Record that `step` was executed from `marker`.
    pub(crate) fn bind(&mut self, step: StepId, marker: FrontierId) {
        self.at_step.insert(step, marker);
        self.step_at.insert(marker, step);
    }

    pub(crate) fn marker_of(&self, step: StepId) -> Option<FrontierId> {
        self.at_step.get(&step).copied()
    }

    pub(crate) fn step_of(&self, marker: FrontierId) -> Option<StepId> {
        self.step_at.get(&marker).copied()
    }

    /// A loop returned to `step`: the owner's current marker leads back to
    /// the marker the step was first executed from.
    pub(crate) fn close_loop(&mut self, current: FrontierId, step: StepId) {
        if let Some(target) = self.marker_of(step) {
            self.cause(current, target, Delay::ZERO);
        }
    }

    /// Markers reachable from `start` without passing through markers that
    /// `role` owns or that lead nowhere. `start` is always expanded and
    /// always included, as are the first markers of every other chain.
    pub(crate) fn reach(&self, start: FrontierId, role: &RoleName) -> BTreeSet<FrontierId> {
        let mut found = BTreeSet::from([start]);
        let mut expanded = BTreeSet::new();
        let mut queue: VecDeque<FrontierId> =
            self.frontiers[start.0].edges.keys().copied().collect();
        found.extend(queue.iter().copied());

        while let Some(marker) = queue.pop_front() {
            let frontier = &self.frontiers[marker.0];
            if frontier.edges.is_empty() || &frontier.owner == role || !expanded.insert(marker) {
                continue;
            }
            for next in frontier.edges.keys() {
                found.insert(*next);
                queue.push_back(*next);
            }
        }
        found
    }

    /// Longest delay from `start` to every marker it reaches on behalf of
    /// `role` (see [`Causality::reach`]).
    ///
    /// Bellman-Ford with the comparison inverted, over saturating sums. Only
    /// `start` and markers of other roles propagate. Markers that sit on, or
    /// behind, a cycle of positive weight can be reached by arbitrarily long
    /// paths and are reported as unbounded. Unreached markers are absent.
    pub(crate) fn longest_paths(
        &self,
        start: FrontierId,
        role: &RoleName,
    ) -> BTreeMap<FrontierId, Delay> {
        let domain = self.reach(start, role);
        let propagates =
            |marker: FrontierId| marker == start || &self.frontiers[marker.0].owner != role;
        let mut distance = BTreeMap::from([(start, Delay::ZERO)]);

        for _ in 1..domain.len() {
            let mut changed = false;
            let settled: Vec<(FrontierId, Delay)> =
                distance.iter().map(|(m, d)| (*m, *d)).collect();
            for (marker, total) in settled {
                if !propagates(marker) {
                    continue;
                }
                for (next, delay) in &self.frontiers[marker.0].edges {
                    if !domain.contains(next) {
                        continue;
                    }
                    let relaxed = total + *delay;
                    if distance.get(next).map_or(true, |current| relaxed > *current) {
                        distance.insert(*next, relaxed);
                        changed = true;
                    }
                }
            }
            if !changed {
                return distance;
            }
        }

        // Edges that still relax after |domain| - 1 rounds lie on a
        // positive cycle.
        let mut looping = BTreeSet::new();
        for (marker, total) in &distance {
            if !propagates(*marker) {
                continue;
            }
            for (next, delay) in &self.frontiers[marker.0].edges {
                let relaxed = *total + *delay;
                if domain.contains(next) && distance.get(next).map_or(true, |c| relaxed > *c) {
                    looping.insert(*next);
                }
            }
        }
        let mut queue: VecDeque<FrontierId> = looping.iter().copied().collect();
        while let Some(marker) = queue.pop_front() {
            if !propagates(marker) {
                continue;
            }
            for next in self.frontiers[marker.0].edges.keys() {
                if domain.contains(next) && looping.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        for marker in looping {
            distance.insert(marker, Delay::UNBOUNDED);
        }
        distance
    }
}
