//! Layered configuration: defaults, file, environment.

pub mod runtime;
pub mod traits;

pub use runtime::{RunIdStrategy, RuntimeConfig};
pub use traits::{parse_value, TroupeConfig, ENV_PREFIX};
