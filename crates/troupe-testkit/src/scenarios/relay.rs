//! Masked relay aggregation.
//!
//! The initiator hands a random mask to the first participant. Every
//! participant it reaches reports its hidden value plus its own mask, adds
//! that mask to the carried total and relays the total onwards, skipping
//! participants it cannot reach. The last one reports the total. Masks
//! cancel out, so the initiator learns the sum of the hidden values of the
//! participants that were reached and nothing else.

use troupe_choreography::{Choreography, Interrupt, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, ProtocolName, TroupeError};

/// State of the initiator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Initiator {
    /// Mask seeding the relay
    pub mask: i64,
    /// Sum computed at the end of a run
    pub aggregate: Option<i64>,
}

impl Initiator {
    /// An initiator seeding with `mask`.
    pub fn new(mask: i64) -> Self {
        Self {
            mask,
            aggregate: None,
        }
    }
}

/// State of a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    /// Value to aggregate
    pub hidden: i64,
    /// Mask hiding it
    pub mask: i64,
    /// Total carried onwards
    pub carried: i64,
}

impl Participant {
    /// A participant holding `hidden` behind `mask`.
    pub fn new(hidden: i64, mask: i64) -> Self {
        Self {
            hidden,
            mask,
            carried: 0,
        }
    }

    fn masked(&self) -> i64 {
        self.hidden.wrapping_add(self.mask)
    }

    fn absorb(&mut self, carried: i64) {
        self.carried = carried.wrapping_add(self.mask);
    }
}

/// Relay over `participants` participants named `p1`, `p2`, ...
#[derive(Debug, Clone)]
pub struct RelayAggregation {
    /// Number of participants; at least one
    pub participants: usize,
    /// Tolerance of every message
    pub tolerance: Delay,
}

impl RelayAggregation {
    /// Relay over `participants` participants.
    pub fn new(participants: usize, tolerance: impl Into<Delay>) -> Self {
        Self {
            participants,
            tolerance: tolerance.into(),
        }
    }

    /// Names of the participant roles, in relay order.
    pub fn participant_names(&self) -> Vec<String> {
        (1..=self.participants).map(|i| format!("p{i}")).collect()
    }
}

/// The initiating role.
pub fn initiator() -> Role<Initiator> {
    Role::new("initiator")
}

/// Participant `i`, counting from one.
pub fn participant(i: usize) -> Role<Participant> {
    Role::new(format!("p{i}"))
}

impl Choreography for RelayAggregation {
    type Payload = i64;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("relay-aggregation")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        std::iter::once(initiator().spec())
            .chain((1..=self.participants).map(|i| participant(i).spec()))
            .collect()
    }

    fn scene(&self, stage: &mut Stage<i64>) -> Scene {
        let n = self.participants;
        let tolerance = self.tolerance;
        let lead = initiator();

        stage.exchange(
            &lead,
            &participant(1),
            "seed",
            tolerance,
            |p| Ok(p.state().mask),
            |p, seed| {
                p.state_mut().absorb(seed);
                Ok(())
            },
        )?;

        let mut current = 1;
        loop {
            let at = participant(current);
            stage.send_from(&at, &lead, &format!("masked-{current}"), tolerance, |p| {
                Ok(p.state().masked())
            })?;

            let mut reached = None;
            for next in current + 1..=n {
                let relayed = stage.exchange(
                    &at,
                    &participant(next),
                    &format!("relay-{current}"),
                    tolerance,
                    |p| Ok(p.state().carried),
                    |p, carried| {
                        p.state_mut().absorb(carried);
                        Ok(())
                    },
                );
                match relayed {
                    Ok(()) => {
                        reached = Some(next);
                        break;
                    }
                    Err(Interrupt::Transmission { .. }) => {
                        stage.send(&at, &lead, &format!("skipped-{current}-{next}"), tolerance)?;
                    }
                    Err(interrupt) => return Err(interrupt),
                }
            }

            match reached {
                Some(next) => current = next,
                None => break,
            }
        }

        stage.send_from(
            &participant(current),
            &lead,
            &format!("total-{current}"),
            tolerance,
            |p| Ok(p.state().carried),
        )?;

        stage.run_named(&lead, "aggregate", move |p| {
            let mut masked: i64 = 0;
            let mut total = None;
            for i in 1..=n {
                if let Ok(value) = p.message(&format!("masked-{i}")) {
                    masked = masked.wrapping_add(*value);
                }
                if let Ok(value) = p.message(&format!("total-{i}")) {
                    total = Some(*value);
                }
            }
            let total = total.ok_or_else(|| TroupeError::no_such_message("total"))?;
            let mask = p.state().mask;
            p.state_mut().aggregate = Some(masked.wrapping_sub(total).wrapping_add(mask));
            Ok(())
        })
    }
}
