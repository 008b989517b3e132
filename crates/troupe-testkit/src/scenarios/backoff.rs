//! Resend until acknowledged.

use std::time::Duration;

use troupe_choreography::{Choreography, Interrupt, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, ProtocolName};

/// State of the retrying role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Acknowledgements missed so far
    pub timeouts: u32,
    /// Wait the next attempt would use; doubles after each miss
    pub timeout: Duration,
    /// Set once `ACK` arrived
    pub acknowledged: bool,
}

impl Backoff {
    /// Start backing off from `timeout`.
    pub fn starting_at(timeout: Duration) -> Self {
        Self {
            timeouts: 0,
            timeout,
            acknowledged: false,
        }
    }
}

/// Alice sends `MSG` until Bob's `ACK` makes it back.
///
/// Tolerances belong to call sites, so every attempt is compiled with the
/// same one; the doubling is tracked in Alice's state.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Tolerance of both `MSG` and `ACK`
    pub tolerance: Delay,
}

impl ExponentialBackoff {
    /// Retry loop with `tolerance` per leg.
    pub fn new(tolerance: impl Into<Delay>) -> Self {
        Self {
            tolerance: tolerance.into(),
        }
    }
}

/// The retrying role.
pub fn alice() -> Role<Backoff> {
    Role::new("alice")
}

/// The acknowledging role.
pub fn bob() -> Role<()> {
    Role::new("bob")
}

impl Choreography for ExponentialBackoff {
    type Payload = String;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("backoff")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<String>) -> Scene {
        let (alice, bob) = (alice(), bob());
        loop {
            stage.send(&alice, &bob, "MSG", self.tolerance)?;
            match stage.send(&bob, &alice, "ACK", self.tolerance) {
                Ok(()) => {
                    return stage.run_named(&alice, "acknowledged", |p| {
                        p.state_mut().acknowledged = true;
                        Ok(())
                    })
                }
                Err(Interrupt::Reception { .. }) => {
                    stage.run_named(&alice, "back off", |p| {
                        let state = p.state_mut();
                        state.timeouts += 1;
                        state.timeout *= 2;
                        Ok(())
                    })?;
                }
                Err(interrupt) => return Err(interrupt),
            }
        }
    }
}
