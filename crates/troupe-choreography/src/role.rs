//! Typed role handles and capability tags.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;

use troupe_core::RoleName;

/// Implementation-capability tag of a role: the actor state type its local
/// steps operate on.
///
/// Parts record the capabilities their steps need, and an actor can only be
/// loaded with a part whose capabilities its state type provides.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    id: TypeId,
    name: &'static str,
}

impl Capability {
    /// Capability of the state type `S`.
    pub fn of<S: 'static>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: std::any::type_name::<S>(),
        }
    }

    /// Human-readable type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a state of type `S` provides this capability.
    pub fn is_provided_by<S: 'static>(&self) -> bool {
        self.id == TypeId::of::<S>()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({})", self.name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Declaration of a role: its name and capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    /// Role name
    pub name: RoleName,
    /// State type the role's steps run against
    pub capability: Capability,
}

/// Handle to a role whose actors hold state of type `S`.
///
/// Handles are cheap to clone and carry no state themselves; stage calls use
/// them to type the closures attached to local steps.
pub struct Role<S> {
    name: RoleName,
    _state: PhantomData<fn() -> S>,
}

impl<S: 'static> Role<S> {
    /// Declare a role.
    pub fn new(name: impl Into<RoleName>) -> Self {
        Self {
            name: name.into(),
            _state: PhantomData,
        }
    }

    /// The role name.
    pub fn name(&self) -> &RoleName {
        &self.name
    }

    /// The role's capability tag.
    pub fn capability(&self) -> Capability {
        Capability::of::<S>()
    }

    /// Declaration for [`Choreography::roles`](crate::Choreography::roles).
    pub fn spec(&self) -> RoleSpec {
        RoleSpec {
            name: self.name.clone(),
            capability: self.capability(),
        }
    }
}

impl<S> Clone for Role<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _state: PhantomData,
        }
    }
}

impl<S> fmt::Debug for Role<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("state", &std::any::type_name::<S>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    #[test]
    fn test_capability_identity() {
        let role: Role<Counter> = Role::new("counter");
        assert!(role.capability().is_provided_by::<Counter>());
        assert!(!role.capability().is_provided_by::<()>());
        assert!(role.capability().name().ends_with("Counter"));
    }

    #[test]
    fn test_spec_carries_name_and_capability() {
        let role: Role<()> = Role::new("alice");
        let spec = role.spec();
        assert_eq!(spec.name, RoleName::new("alice"));
        assert_eq!(spec.capability, Capability::of::<()>());
    }
}
