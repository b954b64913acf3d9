//! Small value types shared by the whole analysis.
//!
//! Newtype wrappers keep identifiers, program locations and bit offsets
//! apart at compile time.

use std::borrow::Borrow;
use std::fmt;
use std::rc::Rc;

/// Name of a program variable (or function) as it appears in the symbol table.
///
/// Cloning is cheap: the name is reference-counted.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Identifier(Rc<str>);

impl Identifier {
    pub fn new(name: &str) -> Self {
        Identifier(Rc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parameters may be anonymous; those carry an empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Identifier::new("")
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::new(name)
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A program point: the index of an instruction in the flat goto program.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Location(usize);

impl Location {
    pub const fn new(index: usize) -> Self {
        Location(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// The location directly following this one in program order.
    pub const fn next(self) -> Self {
        Location(self.0 + 1)
    }

    /// The location directly preceding this one, or `None` at the very start.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Location)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl From<usize> for Location {
    fn from(index: usize) -> Self {
        Location(index)
    }
}

/// A bit offset inside an object.
///
/// As a range end, [`UNKNOWN_END`] stands for "unknown or unbounded size".
pub type RangeSpec = i64;

/// End sentinel for objects of unknown or unbounded size.
pub const UNKNOWN_END: RangeSpec = -1;

/// Three-valued truth.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Ternary {
    False,
    True,
    Unknown,
}

impl Ternary {
    pub fn is_known(self) -> bool {
        self != Ternary::Unknown
    }

    pub fn is_true(self) -> bool {
        self == Ternary::True
    }

    pub fn is_false(self) -> bool {
        self == Ternary::False
    }
}

impl From<bool> for Ternary {
    fn from(value: bool) -> Self {
        if value {
            Ternary::True
        } else {
            Ternary::False
        }
    }
}

impl fmt::Display for Ternary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ternary::False => "FALSE",
            Ternary::True => "TRUE",
            Ternary::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier() {
        let x = Identifier::new("x");
        let y: Identifier = "y".into();
        assert_eq!(x.as_str(), "x");
        assert!(x < y);
        assert!(!x.is_empty());
        assert!(Identifier::new("").is_empty());
        assert_eq!(x.to_string(), "x");
    }

    #[test]
    fn test_location_navigation() {
        let l0 = Location::new(0);
        let l1 = l0.next();
        assert_eq!(l1.index(), 1);
        assert_eq!(l1.prev(), Some(l0));
        assert_eq!(l0.prev(), None);
        assert_eq!(l1.to_string(), "L1");
    }

    #[test]
    fn test_ternary() {
        assert!(Ternary::from(true).is_true());
        assert!(Ternary::from(false).is_false());
        assert!(Ternary::False.is_known());
        assert!(!Ternary::Unknown.is_known());
        assert_eq!(Ternary::False.to_string(), "FALSE");
    }
}
