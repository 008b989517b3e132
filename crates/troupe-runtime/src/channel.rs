//! Transport choreographies
//!
//! A [`Connection`](crate::connection::Connection) carries each upper-layer
//! message through one run of a two-role choreography over the lower
//! transport. The sending actor holds the encoded message in its
//! [`Carrier`]; the receiving actor hands what arrives to the carrier's sink.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use troupe_choreography::{Choreography, Role, RoleSpec, Scene, Stage};
use troupe_core::{Address, Delay, ProtocolName, Result, RoleName, TroupeError};

/// Where a receiving carrier delivers payloads, with their sender address.
pub type Sink<M> = Arc<dyn Fn(M, Address) + Send + Sync>;

/// Actor state of both roles of a transport choreography.
pub struct Carrier<M> {
    outgoing: Option<M>,
    sink: Option<Sink<M>>,
}

impl<M> Carrier<M> {
    /// State of a sending actor.
    pub fn sending() -> Self {
        Self {
            outgoing: None,
            sink: None,
        }
    }

    /// State of a receiving actor delivering to `sink`.
    pub fn receiving(sink: Sink<M>) -> Self {
        Self {
            outgoing: None,
            sink: Some(sink),
        }
    }

    /// Hold `payload` for the next run.
    pub fn load(&mut self, payload: M) {
        self.outgoing = Some(payload);
    }

    /// The held payload; a run carries exactly one.
    pub fn take_outgoing(&mut self) -> Result<M> {
        self.outgoing
            .take()
            .ok_or_else(|| TroupeError::internal("carrier has nothing to send"))
    }

    /// Hand a received payload to the sink.
    pub fn deliver(&self, payload: M, from: Address) -> Result<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| TroupeError::internal("sending carrier cannot deliver"))?;
        sink(payload, from);
        Ok(())
    }
}

impl<M> fmt::Debug for Carrier<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Carrier")
            .field("loaded", &self.outgoing.is_some())
            .field("receiving", &self.sink.is_some())
            .finish()
    }
}

/// A two-role choreography able to carry one message per run.
///
/// Both roles run against [`Carrier`] state: the sender takes its payload out
/// of it, the receiver delivers into it together with the sender address.
pub trait TransportChoreography<M>: Choreography<Payload = M> {
    /// Role holding the payload.
    fn sender(&self) -> RoleName;

    /// Role delivering the payload.
    fn receiver(&self) -> RoleName;
}

/// Data message answered by an acknowledgement.
///
/// The sender's run fails with a reception timeout when the acknowledgement
/// misses its deadline, which the connection reports as a transmission
/// failure of the upper message.
pub struct AcknowledgedChannel<M> {
    data: Delay,
    ack: Delay,
    _payload: PhantomData<fn() -> M>,
}

impl<M> AcknowledgedChannel<M> {
    /// Channel with the given tolerances for data and acknowledgement.
    pub fn new(data: impl Into<Delay>, ack: impl Into<Delay>) -> Self {
        Self {
            data: data.into(),
            ack: ack.into(),
            _payload: PhantomData,
        }
    }
}

impl<M> Default for AcknowledgedChannel<M> {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(500))
    }
}

fn sender<M: 'static>() -> Role<Carrier<M>> {
    Role::new("sender")
}

fn receiver<M: 'static>() -> Role<Carrier<M>> {
    Role::new("receiver")
}

impl<M> Choreography for AcknowledgedChannel<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Payload = M;

    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new("troupe.acknowledged-channel")
    }

    fn roles(&self) -> Vec<RoleSpec> {
        vec![sender::<M>().spec(), receiver::<M>().spec()]
    }

    fn scene(&self, stage: &mut Stage<M>) -> Scene {
        let (from, to) = (sender::<M>(), receiver::<M>());
        stage.exchange(
            &from,
            &to,
            "data",
            self.data,
            |p| p.state_mut().take_outgoing(),
            |p, payload| {
                let origin = p
                    .address("sender")?
                    .cloned()
                    .ok_or_else(|| TroupeError::internal("data arrived without a sender"))?;
                p.state().deliver(payload, origin)
            },
        )?;
        stage.send(&to, &from, "ack", self.ack)
    }
}

impl<M> TransportChoreography<M> for AcknowledgedChannel<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn sender(&self) -> RoleName {
        sender::<M>().name().clone()
    }

    fn receiver(&self) -> RoleName {
        receiver::<M>().name().clone()
    }
}
