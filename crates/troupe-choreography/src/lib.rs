//! Troupe Choreography - protocol compiler
//!
//! A choreography describes a protocol once, from the point of view of all
//! its roles. This crate turns that description into what each role needs to
//! play its part:
//!
//! - [`Stage`] traces the scene into a shared [`StepGraph`], one branch at a
//!   time, closing loops when a branch reaches a step it already recorded
//! - a causal frontier graph, kept alongside, bounds how long each role must
//!   wait for the messages its own sends may cause
//! - projection cuts the graph down to one [`Part`] per role: message tables,
//!   the expected-message DAG, fallbacks and deadlines
//! - [`Play`] memoizes the graph and the parts so they are built once and
//!   shared by every actor of a role

#![forbid(unsafe_code)]

mod frontier;
mod projection;

/// Shared step graph
pub mod graph;

/// Per-role compiled automaton
pub mod part;

/// Step closures and the mailbox they see
pub mod performer;

/// Choreography trait and memoized compilation
pub mod play;

/// Typed role handles
pub mod role;

/// Graph builder
pub mod stage;

pub use graph::{EndKind, Outcome, Step, StepGraph, StepId, StepKind};
pub use part::{IncomingId, NextAction, OutgoingId, Part, PeerId};
pub use performer::{Mailbox, Performer, StepAction, StepPredicate};
pub use play::{Choreography, Play};
pub use role::{Capability, Role, RoleSpec};
pub use stage::{Cast, Interrupt, Scene, Stage};

pub use troupe_core::{Delay, Result, TroupeError};
