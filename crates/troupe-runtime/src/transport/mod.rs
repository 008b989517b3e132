//! Transport contract and the in-memory implementation.

pub mod memory;
pub mod traits;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use traits::{ReceiveEvent, ReceiveEventId, ReceiveEvents, Transport};
