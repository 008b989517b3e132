//! Unified error system for troupe
//!
//! A single error type shared by the compiler, the actor runtime and the
//! transports. Choreography-visible failures (transmission and reception) are
//! distinguished from precondition violations, which are never recoverable.

use serde::{Deserialize, Serialize};

use crate::ids::RunId;

/// Unified error type for all troupe operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TroupeError {
    /// A send could not be completed by the transport
    #[error("Transmission failure: {message}")]
    TransmissionFailure {
        /// Error message describing the failed transmission
        message: String,
    },

    /// An expected message missed its causally derived deadline
    #[error("Reception timeout: message '{message}' of protocol '{protocol}' in run {run}")]
    ReceptionTimeout {
        /// Protocol of the run that timed out
        protocol: String,
        /// Name of the message that never arrived
        message: String,
        /// Run identifier, if one was assigned
        run: RunLabel,
    },

    /// A message name absent from the compiled part
    #[error("No such message: {name}")]
    NoSuchMessage {
        /// The offending message name
        name: String,
    },

    /// A role name absent from the compiled part or the choreography
    #[error("No such role: {name}")]
    NoSuchRole {
        /// The offending role name
        name: String,
    },

    /// The choreography cannot be compiled or projected
    #[error("Compile error: {message}")]
    Compile {
        /// Error message describing the design error
        message: String,
    },

    /// A payload could not be encoded or decoded
    #[error("Encoding failure: {message}")]
    Encoding {
        /// Error message describing the codec failure
        message: String,
    },

    /// The actor has no part loaded
    #[error("Actor has no part loaded")]
    NotLoaded,

    /// The actor was already bound to a part
    #[error("Actor is already loaded")]
    AlreadyLoaded,

    /// The actor state does not provide what the part requires
    #[error("Capability mismatch: part requires {expected}, actor provides {found}")]
    CapabilityMismatch {
        /// Capability required by the part
        expected: String,
        /// Capability provided by the actor
        found: String,
    },

    /// The run was cancelled
    #[error("Aborted: {message}")]
    Aborted {
        /// Error message describing why the run stopped
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the invalid configuration
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

/// Display helper for an optional run identifier inside error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunLabel(pub Option<RunId>);

impl std::fmt::Display for RunLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(run) => write!(f, "{run}"),
            None => write!(f, "<unassigned>"),
        }
    }
}

impl TroupeError {
    /// Create a transmission failure
    pub fn transmission(message: impl Into<String>) -> Self {
        Self::TransmissionFailure {
            message: message.into(),
        }
    }

    /// Create a reception timeout for `message` in the given run
    pub fn reception_timeout(
        protocol: impl Into<String>,
        message: impl Into<String>,
        run: Option<RunId>,
    ) -> Self {
        Self::ReceptionTimeout {
            protocol: protocol.into(),
            message: message.into(),
            run: RunLabel(run),
        }
    }

    /// Create a no such message error
    pub fn no_such_message(name: impl Into<String>) -> Self {
        Self::NoSuchMessage { name: name.into() }
    }

    /// Create a no such role error
    pub fn no_such_role(name: impl Into<String>) -> Self {
        Self::NoSuchRole { name: name.into() }
    }

    /// Create a compile error
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a capability mismatch error
    pub fn capability_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::CapabilityMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a transmission failure
    pub fn is_transmission_failure(&self) -> bool {
        matches!(self, Self::TransmissionFailure { .. })
    }

    /// Whether this is a reception timeout
    pub fn is_reception_timeout(&self) -> bool {
        matches!(self, Self::ReceptionTimeout { .. })
    }

    /// Whether a choreography may handle this failure.
    ///
    /// Only transmission failures and reception timeouts are visible to the
    /// protocol; everything else is a precondition violation.
    pub fn is_recoverable(&self) -> bool {
        self.is_transmission_failure() || self.is_reception_timeout()
    }
}

/// Standard Result type for troupe operations
pub type Result<T> = std::result::Result<T, TroupeError>;

impl From<std::io::Error> for TroupeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::config(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for TroupeError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("Invalid TOML: {err}"))
    }
}

impl From<serde_json::Error> for TroupeError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("Invalid JSON: {err}"))
    }
}

impl From<bincode::Error> for TroupeError {
    fn from(err: bincode::Error) -> Self {
        Self::encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TroupeError::compile("ambiguous bifurcation");
        assert!(matches!(err, TroupeError::Compile { .. }));
        assert_eq!(err.to_string(), "Compile error: ambiguous bifurcation");
    }

    #[test]
    fn test_reception_timeout_names_everything() {
        let err = TroupeError::reception_timeout("ack-channel", "ack", Some(RunId::new(7)));
        let text = err.to_string();
        assert!(text.contains("ack-channel"));
        assert!(text.contains("'ack'"));
        assert!(text.contains('7'));

        let unassigned = TroupeError::reception_timeout("p", "m", None);
        assert!(unassigned.to_string().contains("<unassigned>"));
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(TroupeError::transmission("peer gone").is_recoverable());
        assert!(TroupeError::reception_timeout("p", "m", None).is_recoverable());
        assert!(!TroupeError::no_such_message("x").is_recoverable());
        assert!(!TroupeError::compile("x").is_recoverable());
        assert!(!TroupeError::encoding("x").is_recoverable());
        assert!(!TroupeError::NotLoaded.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = TroupeError::from(io_err);
        assert!(matches!(err, TroupeError::Config { .. }));

        let bad: std::result::Result<u32, bincode::Error> = bincode::deserialize(&[]);
        let err = TroupeError::from(bad.unwrap_err());
        assert!(matches!(err, TroupeError::Encoding { .. }));
    }
}
