//! Troupe Runtime - executing choreographies
//!
//! Actors play the parts projected by `troupe-choreography` over a
//! [`Transport`]:
//!
//! - [`Actor`]: executes one role, one run at a time
//! - [`Server`]: pool of actors serving the runs other roles open
//! - [`Connection`]: an upper transport multiplexed over a lower one through
//!   a [`TransportChoreography`] such as [`AcknowledgedChannel`]
//! - [`MemoryNetwork`]: in-process transport for tests and local composition

#![forbid(unsafe_code)]

/// Actor runtime and path search
pub mod actor;

/// Transport choreographies and carriers
pub mod channel;

/// Transport multiplexing
pub mod connection;

/// Inbound run pools
pub mod server;

/// Transport contract
pub mod transport;

pub use actor::Actor;
pub use channel::{AcknowledgedChannel, Carrier, Sink, TransportChoreography};
pub use connection::Connection;
pub use server::{RunReport, Server};
pub use transport::{
    MemoryNetwork, MemoryTransport, ReceiveEvent, ReceiveEventId, ReceiveEvents, Transport,
};
