//! Troupe Core - shared vocabulary
//!
//! Types used by every layer of troupe: the choreography compiler, the actor
//! runtime and the transports plugged underneath it.
//!
//! - Identifiers: `RoleName`, `MessageName`, `ProtocolName`, `Address`, `RunId`
//! - `Delay`: saturating tolerances where "unbounded" is a sentinel maximum
//! - Wire messages: `ShortMessage` (outbound) and `FullMessage` (delivered)
//! - Codecs between application payloads and transport representations
//! - Run identifier generators
//! - The unified `TroupeError` and layered configuration

#![forbid(unsafe_code)]

/// Layered configuration
pub mod config;

/// Payload codecs
pub mod codec;

/// Saturating delays
pub mod delay;

/// Unified error handling
pub mod errors;

/// Identifier newtypes
pub mod ids;

/// Wire messages
pub mod message;

/// Run identifier generators
pub mod run_id;

pub use codec::{Base64Codec, BincodeCodec, FnCodec, IdentityCodec, MessageCodec};
pub use config::{RunIdStrategy, RuntimeConfig, TroupeConfig};
pub use delay::Delay;
pub use errors::{Result, RunLabel, TroupeError};
pub use ids::{Address, MessageName, ProtocolName, RoleName, RunId};
pub use message::{FullMessage, ShortMessage};
pub use run_id::{RandomRunIds, RunIdGenerator, SequentialRunIds};
