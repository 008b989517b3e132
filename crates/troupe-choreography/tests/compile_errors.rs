//! Choreographies the compiler must refuse
//!
//! Every design error surfaces as `TroupeError::Compile` (or `NoSuchRole` for
//! lookups), either when the shared graph is traced or when a role is
//! projected out of it.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};

use assert_matches::assert_matches;
use troupe_choreography::{Choreography, Play, Role, RoleSpec, Scene, Stage};
use troupe_core::{Delay, TroupeError};

const TOLERANCE: Delay = Delay::from_millis(100);

fn alice() -> Role<()> {
    Role::new("alice")
}

fn bob() -> Role<()> {
    Role::new("bob")
}

/// Alice decides locally which of two steps Bob takes next; Bob has no way
/// of telling which one.
struct Ambiguous;

impl Choreography for Ambiguous {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        if stage.test_named(&alice(), "coin", |_| Ok(true))? {
            stage.run_named(&bob(), "heads", |_| Ok(()))
        } else {
            stage.run_named(&bob(), "tails", |_| Ok(()))
        }
    }
}

/// One of Alice's branches messages Bob, the other makes him act on his own.
struct Mixed;

impl Choreography for Mixed {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        if stage.test_named(&alice(), "coin", |_| Ok(true))? {
            stage.send(&alice(), &bob(), "heads", TOLERANCE)
        } else {
            stage.run_named(&bob(), "idle", |_| Ok(()))
        }
    }
}

/// Bob receives `tick` forever without ever taking a step of his own.
struct Ticker;

impl Choreography for Ticker {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        loop {
            stage.send(&alice(), &bob(), "tick", TOLERANCE)?;
        }
    }
}

struct Undeclared;

impl Choreography for Undeclared {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        stage.send(&alice(), &bob(), "hello", TOLERANCE)
    }
}

/// Bob is declared holding `()` but used as if he held a counter.
struct WrongState;

impl Choreography for WrongState {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        let counting: Role<u64> = Role::new("bob");
        stage.send(&alice(), &counting, "hello", TOLERANCE)
    }
}

struct Roles(Vec<RoleSpec>);

impl Choreography for Roles {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        self.0.clone()
    }

    fn scene(&self, _stage: &mut Stage<()>) -> Scene {
        Ok(())
    }
}

struct Monologue;

impl Choreography for Monologue {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        stage.send(&alice(), &alice(), "note to self", TOLERANCE)
    }
}

/// Makes different calls every time it is replayed.
#[derive(Default)]
struct Fickle {
    replays: AtomicUsize,
}

impl Choreography for Fickle {
    type Payload = ();

    fn roles(&self) -> Vec<RoleSpec> {
        vec![alice().spec(), bob().spec()]
    }

    fn scene(&self, stage: &mut Stage<()>) -> Scene {
        let replay = self.replays.fetch_add(1, Ordering::SeqCst);
        stage.send(&alice(), &bob(), "first", TOLERANCE)?;
        stage.send(&alice(), &bob(), &format!("second-{replay}"), TOLERANCE)
    }
}

fn compile_message(result: troupe_core::Result<impl std::fmt::Debug>) -> String {
    match result.unwrap_err() {
        TroupeError::Compile { message } => message,
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn test_ambiguous_bifurcation_is_rejected() {
    let play = Play::new(Ambiguous);
    play.graph().unwrap();
    play.interpret_as("alice").unwrap();

    let message = compile_message(play.interpret_as("bob"));
    assert!(message.contains("ambiguous"), "{message}");
}

#[test]
fn test_mixed_next_actions_are_rejected() {
    let play = Play::new(Mixed);
    let message = compile_message(play.interpret_as("bob"));
    assert!(message.contains("mixed"), "{message}");
}

#[test]
fn test_message_cycle_without_own_step_is_rejected() {
    let play = Play::new(Ticker);
    play.interpret_as("alice").unwrap();

    let message = compile_message(play.interpret_as("bob"));
    assert!(message.contains("tick"), "{message}");
}

#[test]
fn test_undeclared_role_is_rejected() {
    let message = compile_message(Play::new(Undeclared).graph());
    assert!(message.contains("bob"), "{message}");
}

#[test]
fn test_role_used_with_another_state_is_rejected() {
    let message = compile_message(Play::new(WrongState).graph());
    assert!(message.contains("declared with"), "{message}");
}

#[test]
fn test_role_declarations_are_checked() {
    compile_message(Play::new(Roles(Vec::new())).graph());
    compile_message(Play::new(Roles(vec![alice().spec(), alice().spec()])).graph());
    Play::new(Roles(vec![alice().spec(), bob().spec()])).graph().unwrap();
}

#[test]
fn test_self_send_is_rejected() {
    let message = compile_message(Play::new(Monologue).graph());
    assert!(message.contains("itself"), "{message}");
}

#[test]
fn test_nondeterministic_scene_is_rejected() {
    let message = compile_message(Play::new(Fickle::default()).graph());
    assert!(message.contains("deterministically"), "{message}");
}

#[test]
fn test_unknown_role_cannot_be_projected() {
    let play = Play::new(Roles(vec![alice().spec(), bob().spec()]));
    assert_matches!(play.interpret_as("carol"), Err(TroupeError::NoSuchRole { .. }));
}
