//! Scenario choreographies
//!
//! Small protocols covering the behaviors the runtime has to get right:
//! acknowledgement timeouts, retries after soft timeouts and routing around
//! unreachable participants.

pub mod acknowledged;
pub mod backoff;
pub mod relay;

pub use acknowledged::{AcknowledgedExchange, Correspondent, Recipient};
pub use backoff::{Backoff, ExponentialBackoff};
pub use relay::{Initiator, Participant, RelayAggregation};
