//! Runtime configuration
//!
//! Pool sizes, run identifier strategy and the default send tolerance.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::traits::{parse_value, TroupeConfig};
use crate::delay::Delay;
use crate::errors::{Result, TroupeError};
use crate::run_id::{RandomRunIds, RunIdGenerator, SequentialRunIds};

/// How run identifiers are produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunIdStrategy {
    /// CSPRNG seeded from the operating system
    Random,
    /// CSPRNG with a fixed seed
    Seeded {
        /// Seed of the stream
        seed: u64,
    },
    /// Consecutive integers
    Sequential {
        /// First identifier handed out
        start: u64,
    },
}

impl RunIdStrategy {
    /// Build a generator following this strategy
    pub fn generator(&self) -> Arc<dyn RunIdGenerator> {
        match self {
            Self::Random => Arc::new(RandomRunIds::from_entropy()),
            Self::Seeded { seed } => Arc::new(RandomRunIds::seeded(*seed)),
            Self::Sequential { start } => Arc::new(SequentialRunIds::starting_at(*start)),
        }
    }
}

impl std::str::FromStr for RunIdStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "random" => Ok(Self::Random),
            None if s == "sequential" => Ok(Self::Sequential { start: 1 }),
            Some(("seeded", seed)) => seed
                .parse()
                .map(|seed| Self::Seeded { seed })
                .map_err(|e| format!("bad seed: {e}")),
            Some(("sequential", start)) => start
                .parse()
                .map(|start| Self::Sequential { start })
                .map_err(|e| format!("bad start: {e}")),
            _ => Err(format!("unknown run id strategy '{s}'")),
        }
    }
}

/// Runtime settings shared by servers and connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of inbound runs a server executes concurrently
    pub server_workers: usize,

    /// Maximum number of concurrently active actors per connection direction
    pub connection_workers: usize,

    /// Run identifier strategy
    pub run_ids: RunIdStrategy,

    /// Tolerance applied by sends declared without one, in milliseconds;
    /// absent means unbounded
    pub default_tolerance_ms: Option<u64>,

    /// How long `stop` waits for running actors before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_workers: 4,
            connection_workers: 8,
            run_ids: RunIdStrategy::Random,
            default_tolerance_ms: None,
            shutdown_grace_ms: 1_000,
        }
    }
}

impl RuntimeConfig {
    /// Configuration for tests: deterministic ids and small pools
    pub fn testing() -> Self {
        Self {
            server_workers: 2,
            connection_workers: 2,
            run_ids: RunIdStrategy::Sequential { start: 1 },
            shutdown_grace_ms: 100,
            ..Default::default()
        }
    }

    /// Configuration for deployments with larger pools
    pub fn production() -> Self {
        Self {
            server_workers: 64,
            connection_workers: 64,
            ..Default::default()
        }
    }

    /// The default send tolerance
    pub fn default_tolerance(&self) -> Delay {
        self.default_tolerance_ms
            .map_or(Delay::UNBOUNDED, Delay::from_millis)
    }

    /// The shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl TroupeConfig for RuntimeConfig {
    fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server_workers" => self.server_workers = parse_value(key, value)?,
            "connection_workers" => self.connection_workers = parse_value(key, value)?,
            "run_ids" => self.run_ids = parse_value(key, value)?,
            "default_tolerance_ms" => {
                self.default_tolerance_ms = match value {
                    "" | "unbounded" => None,
                    millis => Some(parse_value(key, millis)?),
                }
            }
            "shutdown_grace_ms" => self.shutdown_grace_ms = parse_value(key, value)?,
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server_workers == 0 {
            return Err(TroupeError::config("server_workers must be greater than 0"));
        }

        if self.connection_workers == 0 {
            return Err(TroupeError::config(
                "connection_workers must be greater than 0",
            ));
        }

        Ok(())
    }
}
