use std::fmt;

use serde::{Deserialize, Serialize};

/// A storage operation a driver may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    List,
    Info,
    Remove,
    PathCreate,
    PathRemove,
    PathSync,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Read,
        Capability::Write,
        Capability::List,
        Capability::Info,
        Capability::Remove,
        Capability::PathCreate,
        Capability::PathRemove,
        Capability::PathSync,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
            Self::Info => "info",
            Self::Remove => "remove",
            Self::PathCreate => "path-create",
            Self::PathRemove => "path-remove",
            Self::PathSync => "path-sync",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed subset of [`Capability`] values a driver declares.
///
/// Built with `const` constructors so each driver's set is known at compile
/// time; the remote driver is the only one that adopts a set at runtime (the
/// one its peer reports).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        let mut bits = 0;
        let mut idx = 0;
        while idx < Capability::ALL.len() {
            bits |= Capability::ALL[idx].bit();
            idx += 1;
        }
        Self(bits)
    }

    /// Capabilities of a flat object store: no real directories.
    pub const fn object_store() -> Self {
        Self::empty()
            .with(Capability::Read)
            .with(Capability::Write)
            .with(Capability::List)
            .with(Capability::Info)
            .with(Capability::Remove)
            .with(Capability::PathRemove)
    }

    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub const fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Rebuild from bits received from a peer; unknown bits are dropped.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::all().0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.name())).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, c| set.with(c))
    }
}
