//! Capability model.
//!
//! Every file handle reports the set of operations it supports up front, so
//! callers can grey out affordances or pick another strategy before trying.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// One discrete operation a file handle may support.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    /// Sequential read stream.
    Read,
    /// Truncating write stream.
    Write,
    /// Appending write stream.
    Append,
    /// Seekable reader.
    RandomRead,
    /// Seekable writer that can also truncate.
    RandomWrite,
    /// Seekable writer that can only extend the file, never shrink it.
    GrowOnlyRandomWrite,
    /// Enumerate children.
    List,
    /// Create a directory.
    Mkdir,
    Delete,
    /// Rename within the same backend realm.
    Rename,
    /// Server-side copy to another handle of the same backend.
    CopyRemotely,
    ChangeDate,
    ChangePermissions,
    GetOwner,
    GetGroup,
    GetFreeSpace,
    GetTotalSpace,
}

impl Capability {
    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of [`Capability`] values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Self = Self(0);

    /// Build a set from a list (usable in `const` items).
    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Every capability.
    pub fn all() -> Self {
        Capability::iter().collect()
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub const fn without(self, cap: Capability) -> Self {
        Self(self.0 & !cap.bit())
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Supported capabilities in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::iter().filter(move |c| self.contains(*c))
    }

    /// Capabilities *not* in this set.
    pub fn missing(self) -> impl Iterator<Item = Capability> {
        Capability::iter().filter(move |c| !self.contains(*c))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_set() {
        const READ_ONLY: Capabilities = Capabilities::of(&[Capability::Read, Capability::List]);
        assert!(READ_ONLY.contains(Capability::Read));
        assert!(READ_ONLY.contains(Capability::List));
        assert!(!READ_ONLY.contains(Capability::Write));
        assert_eq!(READ_ONLY.iter().count(), 2);
    }

    #[test]
    fn test_all_and_missing() {
        let all = Capabilities::all();
        assert_eq!(all.missing().count(), 0);
        let some = all.without(Capability::Rename);
        assert_eq!(some.missing().collect::<Vec<_>>(), vec![Capability::Rename]);
        assert!(Capabilities::NONE.is_empty());
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(Capability::GrowOnlyRandomWrite.to_string(), "grow-only-random-write");
        assert_eq!(
            "copy-remotely".parse::<Capability>().unwrap(),
            Capability::CopyRemotely
        );
        let set = Capabilities::of(&[Capability::List, Capability::Read]);
        assert_eq!(set.to_string(), "read,list");
    }
}
