//! Choreography authoring trait and the compiled, memoized play.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;
use troupe_core::{Delay, ProtocolName, Result, RoleName, RuntimeConfig, TroupeError};

use crate::graph::StepGraph;
use crate::part::Part;
use crate::projection;
use crate::role::RoleSpec;
use crate::stage::{self, Scene, Stage};

/// A protocol described once, from the point of view of all its roles.
pub trait Choreography: Send + Sync + 'static {
    /// Message payload type shared by every role.
    type Payload: Clone + Send + Sync + 'static;

    /// Protocol name carried by every message of a run.
    fn protocol_name(&self) -> ProtocolName {
        ProtocolName::new(std::any::type_name::<Self>())
    }

    /// Declared roles, in a stable order.
    fn roles(&self) -> Vec<RoleSpec>;

    /// The protocol itself. It is replayed once per branch, so it must make
    /// the same calls for the same outcomes and have no side effects of its
    /// own.
    fn scene(&self, stage: &mut Stage<Self::Payload>) -> Scene;
}

/// A choreography with its compiled graph and parts, built on first use.
pub struct Play<C: Choreography> {
    choreography: C,
    default_tolerance: Delay,
    graph: OnceCell<Arc<StepGraph<C::Payload>>>,
    parts: Mutex<HashMap<RoleName, Arc<Part<C::Payload>>>>,
}

impl<C: Choreography> Play<C> {
    /// Wrap `choreography`; nothing is compiled yet.
    pub fn new(choreography: C) -> Self {
        Self {
            choreography,
            default_tolerance: Delay::UNBOUNDED,
            graph: OnceCell::new(),
            parts: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap `choreography`, taking the default send tolerance from `config`.
    pub fn with_config(choreography: C, config: &RuntimeConfig) -> Self {
        Self {
            default_tolerance: config.default_tolerance(),
            ..Self::new(choreography)
        }
    }

    /// The wrapped choreography.
    pub fn choreography(&self) -> &C {
        &self.choreography
    }

    /// Declared roles.
    pub fn roles(&self) -> Vec<RoleSpec> {
        self.choreography.roles()
    }

    /// The shared step graph, compiled on first call.
    pub fn graph(&self) -> Result<Arc<StepGraph<C::Payload>>> {
        self.graph
            .get_or_try_init(|| {
                stage::compile(&self.choreography, self.default_tolerance).map(Arc::new)
            })
            .cloned()
    }

    /// The part of `role`, projected on first call and shared afterwards.
    pub fn interpret_as(&self, role: &str) -> Result<Arc<Part<C::Payload>>> {
        if let Some(part) = self.parts.lock().get(role) {
            return Ok(part.clone());
        }

        let graph = self.graph()?;
        if graph.role(role).is_none() {
            return Err(TroupeError::no_such_role(role));
        }
        let part = Arc::new(projection::project(graph, role)?);
        debug!(
            protocol = %part.protocol(),
            role,
            incoming = part.incoming_count(),
            outgoing = part.outgoing_count(),
            "part projected"
        );

        let mut parts = self.parts.lock();
        Ok(parts
            .entry(RoleName::new(role))
            .or_insert(part)
            .clone())
    }
}
