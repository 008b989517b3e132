//! Wire messages.
//!
//! The shape is uniform across transports: a run identifier and a protocol
//! name correlate the messages of one execution, the message name selects the
//! step, and the payload is optional (acknowledgements usually carry none).

use serde::{Deserialize, Serialize};

use crate::ids::{Address, MessageName, ProtocolName, RunId};

/// A message as handed to a transport for sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortMessage<P> {
    /// Run the message belongs to
    pub run: RunId,
    /// Protocol the run executes
    pub protocol: ProtocolName,
    /// Message name
    pub name: MessageName,
    /// Application payload
    pub payload: Option<P>,
}

impl<P> ShortMessage<P> {
    /// Create a message.
    pub fn new(
        run: RunId,
        protocol: impl Into<ProtocolName>,
        name: impl Into<MessageName>,
        payload: Option<P>,
    ) -> Self {
        Self {
            run,
            protocol: protocol.into(),
            name: name.into(),
            payload,
        }
    }

    /// Attach the sender address, as a transport does on delivery.
    pub fn lengthen(self, from: Address) -> FullMessage<P> {
        FullMessage {
            run: self.run,
            protocol: self.protocol,
            name: self.name,
            from,
            payload: self.payload,
        }
    }

    /// Transform the payload, keeping the envelope.
    pub fn map_payload<Q, E>(
        self,
        f: impl FnOnce(P) -> Result<Q, E>,
    ) -> Result<ShortMessage<Q>, E> {
        Ok(ShortMessage {
            run: self.run,
            protocol: self.protocol,
            name: self.name,
            payload: self.payload.map(f).transpose()?,
        })
    }
}

/// A message as delivered by a transport, with its sender address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullMessage<P> {
    /// Run the message belongs to
    pub run: RunId,
    /// Protocol the run executes
    pub protocol: ProtocolName,
    /// Message name
    pub name: MessageName,
    /// Sender address
    pub from: Address,
    /// Application payload
    pub payload: Option<P>,
}

impl<P> FullMessage<P> {
    /// Drop the sender address.
    pub fn shorten(self) -> (ShortMessage<P>, Address) {
        (
            ShortMessage {
                run: self.run,
                protocol: self.protocol,
                name: self.name,
                payload: self.payload,
            },
            self.from,
        )
    }

    /// Transform the payload, keeping the envelope.
    pub fn map_payload<Q, E>(self, f: impl FnOnce(P) -> Result<Q, E>) -> Result<FullMessage<Q>, E> {
        let (short, from) = self.shorten();
        Ok(short.map_payload(f)?.lengthen(from))
    }
}
