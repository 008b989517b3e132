//! `msg` answered by `ack`.

use troupe_choreography::{Choreography, Interrupt, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, ProtocolName};

/// State of the sending role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correspondent {
    /// Payload of `msg`
    pub outgoing: String,
    /// Set once `ack` arrived
    pub acknowledged: bool,
    /// Set when the timeout handler ran
    pub unacknowledged: bool,
}

impl Correspondent {
    /// A sender with `outgoing` ready to go.
    pub fn with_message(outgoing: impl Into<String>) -> Self {
        Self {
            outgoing: outgoing.into(),
            ..Self::default()
        }
    }
}

/// State of the receiving role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    /// Every `msg` payload received, across runs
    pub received: Vec<String>,
}

/// Sender transmits `msg`, receiver answers `ack`.
///
/// Without a handler, a missing `ack` fails the sender's run with a reception
/// timeout. With one, the sender runs `unacknowledged` instead.
#[derive(Debug, Clone)]
pub struct AcknowledgedExchange {
    /// Tolerance of `msg`
    pub msg: Delay,
    /// Tolerance of `ack`
    pub ack: Delay,
    /// Whether a missing `ack` is handled
    pub handle_timeout: bool,
}

impl AcknowledgedExchange {
    /// Unhandled exchange with the given tolerances.
    pub fn new(msg: impl Into<Delay>, ack: impl Into<Delay>) -> Self {
        Self {
            msg: msg.into(),
            ack: ack.into(),
            handle_timeout: false,
        }
    }

    /// Handle a missing `ack` on the sender.
    pub fn handled(mut self) -> Self {
        self.handle_timeout = true;
        self
    }
}

/// The sending role.
pub fn sender() -> Role<Correspondent> {
    Role::new("sender")
}

/// The receiving role.
pub fn receiver() -> Role<Recipient> {
    Role::new("receiver")
}

impl Choreography for AcknowledgedExchange {
    type Payload = String;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("acknowledged-exchange")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![sender().spec(), receiver().spec()]
    }

    fn scene(&self, stage: &mut Stage<String>) -> Scene {
        let (from, to) = (sender(), receiver());
        stage.exchange(
            &from,
            &to,
            "msg",
            self.msg,
            |p| Ok(p.state().outgoing.clone()),
            |p, payload| {
                p.state_mut().received.push(payload);
                Ok(())
            },
        )?;

        match stage.send(&to, &from, "ack", self.ack) {
            Ok(()) => stage.run_named(&from, "acknowledged", |p| {
                p.state_mut().acknowledged = true;
                Ok(())
            }),
            Err(Interrupt::Reception { .. }) if self.handle_timeout => {
                stage.run_named(&from, "unacknowledged", |p| {
                    p.state_mut().unacknowledged = true;
                    Ok(())
                })
            }
            Err(interrupt) => Err(interrupt),
        }
    }
}
