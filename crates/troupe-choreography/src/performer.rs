//! The view a local step has of its actor.
//!
//! Step closures are written against a typed [`Performer`]; the graph stores
//! them type-erased so one shared graph can hold the steps of every role.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use troupe_core::{Address, Result, RoleName, RunId, TroupeError};

/// Per-run message slots and peer addresses of an actor.
///
/// Implemented by the runtime; names are resolved against the actor's part.
pub trait Mailbox<P> {
    /// The role this mailbox belongs to.
    fn role(&self) -> &RoleName;

    /// Payload of an accepted incoming message, or of a staged outgoing one.
    fn message(&self, name: &str) -> Result<&P>;

    /// Whether [`Mailbox::message`] would return a payload.
    fn has_message(&self, name: &str) -> bool;

    /// Stage the payload of an outgoing message.
    fn set_message(&mut self, name: &str, payload: P) -> Result<()>;

    /// Currently committed address of a peer role.
    fn address(&self, role: &str) -> Result<Option<&Address>>;

    /// Commit the address of a peer role for the rest of the run.
    fn set_address(&mut self, role: &str, address: Address) -> Result<()>;

    /// Identifier of the current run, once assigned.
    fn run_id(&self) -> Option<RunId>;
}

/// What a local step sees: the role's state plus the run's mailbox.
pub struct Performer<'a, P, S> {
    state: &'a mut S,
    mailbox: &'a mut dyn Mailbox<P>,
}

impl<'a, P, S> Performer<'a, P, S> {
    /// Pair a state with a mailbox.
    pub fn new(state: &'a mut S, mailbox: &'a mut dyn Mailbox<P>) -> Self {
        Self { state, mailbox }
    }

    /// The role state.
    pub fn state(&self) -> &S {
        self.state
    }

    /// The role state, mutably.
    pub fn state_mut(&mut self) -> &mut S {
        self.state
    }

    /// The performing role.
    pub fn role(&self) -> &RoleName {
        self.mailbox.role()
    }

    /// See [`Mailbox::message`].
    pub fn message(&self, name: &str) -> Result<&P> {
        self.mailbox.message(name)
    }

    /// See [`Mailbox::has_message`].
    pub fn has_message(&self, name: &str) -> bool {
        self.mailbox.has_message(name)
    }

    /// See [`Mailbox::set_message`].
    pub fn set_message(&mut self, name: &str, payload: P) -> Result<()> {
        self.mailbox.set_message(name, payload)
    }

    /// See [`Mailbox::address`].
    pub fn address(&self, role: &str) -> Result<Option<&Address>> {
        self.mailbox.address(role)
    }

    /// See [`Mailbox::set_address`].
    pub fn set_address(&mut self, role: &str, address: impl Into<Address>) -> Result<()> {
        self.mailbox.set_address(role, address.into())
    }

    /// See [`Mailbox::run_id`].
    pub fn run_id(&self) -> Option<RunId> {
        self.mailbox.run_id()
    }
}

impl<P: Clone, S> Performer<'_, P, S> {
    /// Clone of a message payload.
    pub fn message_cloned(&self, name: &str) -> Result<P> {
        self.message(name).cloned()
    }
}

/// Type-erased local action.
pub type StepAction<P> =
    Arc<dyn Fn(&mut dyn Any, &mut dyn Mailbox<P>) -> Result<()> + Send + Sync>;

/// Type-erased local predicate.
pub type StepPredicate<P> =
    Arc<dyn Fn(&mut dyn Any, &mut dyn Mailbox<P>) -> Result<bool> + Send + Sync>;

fn downcast<S: 'static>(state: &mut dyn Any) -> Result<&mut S> {
    state.downcast_mut::<S>().ok_or_else(|| {
        TroupeError::capability_mismatch(std::any::type_name::<S>(), "a different state type")
    })
}

pub(crate) fn erase_action<P, S, F>(action: F) -> StepAction<P>
where
    P: 'static,
    S: 'static,
    F: Fn(&mut Performer<'_, P, S>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |state: &mut dyn Any, mailbox: &mut dyn Mailbox<P>| {
        let state = downcast::<S>(state)?;
        action(&mut Performer::new(state, mailbox))
    })
}

pub(crate) fn erase_predicate<P, S, F>(predicate: F) -> StepPredicate<P>
where
    P: 'static,
    S: 'static,
    F: Fn(&mut Performer<'_, P, S>) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(move |state: &mut dyn Any, mailbox: &mut dyn Mailbox<P>| {
        let state = downcast::<S>(state)?;
        predicate(&mut Performer::new(state, mailbox))
    })
}

/// Name mapping of an inlined sub-choreography: its message prefix and the
/// outer names of its roles.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    pub(crate) prefix: String,
    pub(crate) roles: BTreeMap<RoleName, RoleName>,
}

impl Scope {
    pub(crate) fn message(&self, name: &str) -> String {
        scoped_name(&self.prefix, name)
    }

    pub(crate) fn role<'a>(&'a self, name: &'a str) -> &'a str {
        self.roles.get(name).map_or(name, RoleName::as_str)
    }
}

pub(crate) fn scoped_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

struct ScopedMailbox<'a, P> {
    inner: &'a mut dyn Mailbox<P>,
    scope: &'a Scope,
}

impl<P> Mailbox<P> for ScopedMailbox<'_, P> {
    fn role(&self) -> &RoleName {
        self.inner.role()
    }

    fn message(&self, name: &str) -> Result<&P> {
        self.inner.message(&self.scope.message(name))
    }

    fn has_message(&self, name: &str) -> bool {
        self.inner.has_message(&self.scope.message(name))
    }

    fn set_message(&mut self, name: &str, payload: P) -> Result<()> {
        let name = self.scope.message(name);
        self.inner.set_message(&name, payload)
    }

    fn address(&self, role: &str) -> Result<Option<&Address>> {
        self.inner.address(self.scope.role(role))
    }

    fn set_address(&mut self, role: &str, address: Address) -> Result<()> {
        let role = self.scope.role(role).to_owned();
        self.inner.set_address(&role, address)
    }

    fn run_id(&self) -> Option<RunId> {
        self.inner.run_id()
    }
}

/// Wrap a step of an inlined sub-choreography so it sees its own names.
pub(crate) fn scope_action<P: 'static>(scope: Arc<Scope>, action: StepAction<P>) -> StepAction<P> {
    Arc::new(move |state: &mut dyn Any, mailbox: &mut dyn Mailbox<P>| {
        let mut scoped = ScopedMailbox {
            inner: mailbox,
            scope: &scope,
        };
        action(state, &mut scoped)
    })
}

pub(crate) fn scope_predicate<P: 'static>(
    scope: Arc<Scope>,
    predicate: StepPredicate<P>,
) -> StepPredicate<P> {
    Arc::new(move |state: &mut dyn Any, mailbox: &mut dyn Mailbox<P>| {
        let mut scoped = ScopedMailbox {
            inner: mailbox,
            scope: &scope,
        };
        predicate(state, &mut scoped)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Slots {
        role: RoleName,
        messages: HashMap<String, u32>,
        addresses: HashMap<String, Address>,
    }

    impl Mailbox<u32> for Slots {
        fn role(&self) -> &RoleName {
            &self.role
        }

        fn message(&self, name: &str) -> Result<&u32> {
            self.messages
                .get(name)
                .ok_or_else(|| TroupeError::no_such_message(name))
        }

        fn has_message(&self, name: &str) -> bool {
            self.messages.contains_key(name)
        }

        fn set_message(&mut self, name: &str, payload: u32) -> Result<()> {
            self.messages.insert(name.to_owned(), payload);
            Ok(())
        }

        fn address(&self, role: &str) -> Result<Option<&Address>> {
            Ok(self.addresses.get(role))
        }

        fn set_address(&mut self, role: &str, address: Address) -> Result<()> {
            self.addresses.insert(role.to_owned(), address);
            Ok(())
        }

        fn run_id(&self) -> Option<RunId> {
            None
        }
    }

    fn slots() -> Slots {
        Slots {
            role: RoleName::new("alice"),
            messages: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    #[test]
    fn test_erased_action_reaches_typed_state() {
        let action = erase_action::<u32, u32, _>(|p| {
            *p.state_mut() += 1;
            let count = *p.state();
            p.set_message("count", count)
        });
        let mut state = 41u32;
        let mut mailbox = slots();
        action(&mut state, &mut mailbox).unwrap();
        assert_eq!(state, 42);
        assert_eq!(mailbox.messages["count"], 42);
    }

    #[test]
    fn test_wrong_state_type_is_rejected() {
        let action = erase_action::<u32, String, _>(|_| Ok(()));
        let mut state = 0u8;
        let err = action(&mut state, &mut slots()).unwrap_err();
        assert!(matches!(err, TroupeError::CapabilityMismatch { .. }));
    }

    #[test]
    fn test_scoped_action_prefixes_names() {
        let scope = Arc::new(Scope {
            prefix: "link".into(),
            roles: BTreeMap::from([(RoleName::new("sender"), RoleName::new("alice"))]),
        });
        let action = scope_action(
            scope,
            erase_action::<u32, (), _>(|p| {
                p.set_address("sender", "mem://a")?;
                p.set_message("data", 7)
            }),
        );
        let mut mailbox = slots();
        action(&mut (), &mut mailbox).unwrap();
        assert_eq!(mailbox.messages["link.data"], 7);
        assert_eq!(mailbox.addresses["alice"], Address::new("mem://a"));
    }
}
