//! Record status bitmask.
//!
//! Every store key carries a status word: one of four mutually exclusive
//! core states (EMPTY, READY, DESTROYED, NON_EXISTENT) combined bitwise
//! with transient flags (LOADING, COMMITTING, NEW, DIRTY, OBSOLETE).
//! All predicates are bit tests; the status is never decomposed into
//! separate booleans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Status bitmask for a record or a query.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u32);

impl Status {
    /// No information known about the record.
    pub const EMPTY: Status = Status(1);
    /// Data is loaded in memory.
    pub const READY: Status = Status(1 << 1);
    /// Record destroyed, locally and/or remotely.
    pub const DESTROYED: Status = Status(1 << 2);
    /// Server confirmed the record does not exist.
    pub const NON_EXISTENT: Status = Status(1 << 3);
    /// A fetch is in flight.
    pub const LOADING: Status = Status(1 << 4);
    /// A commit is in flight.
    pub const COMMITTING: Status = Status(1 << 5);
    /// Not yet created at the source.
    pub const NEW: Status = Status(1 << 6);
    /// Local changes not yet committed.
    pub const DIRTY: Status = Status(1 << 7);
    /// The server may have newer data.
    pub const OBSOLETE: Status = Status(1 << 8);

    /// The zero status, distinct from EMPTY. Used as the identity for
    /// bitwise accumulation; a record never rests in this state.
    pub const NONE: Status = Status(0);

    /// All four mutually exclusive core states.
    pub const CORE: Status =
        Status(Self::EMPTY.0 | Self::READY.0 | Self::DESTROYED.0 | Self::NON_EXISTENT.0);

    /// Flags that make a record ineligible for unloading.
    pub const UNSAVED: Status = Status(Self::COMMITTING.0 | Self::NEW.0 | Self::DIRTY.0);

    /// True if any bit of `mask` is set.
    #[inline]
    pub fn is(self, mask: Status) -> bool {
        self.0 & mask.0 != 0
    }

    /// True if every bit of `mask` is set.
    #[inline]
    pub fn contains(self, mask: Status) -> bool {
        self.0 & mask.0 == mask.0
    }

    /// The core state with all transient flags stripped.
    #[inline]
    pub fn core(self) -> Status {
        self & Self::CORE
    }

    /// True while a fetch or commit is in flight.
    #[inline]
    pub fn in_flight(self) -> bool {
        self.is(Self::LOADING | Self::COMMITTING)
    }

    /// Replace the core state, keeping the transient flags.
    #[inline]
    pub fn with_core(self, core: Status) -> Status {
        (self & !Self::CORE) | core
    }
}

impl BitOr for Status {
    type Output = Status;
    #[inline]
    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    #[inline]
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Status {
    type Output = Status;
    #[inline]
    fn bitand(self, rhs: Status) -> Status {
        Status(self.0 & rhs.0)
    }
}

impl Not for Status {
    type Output = Status;
    #[inline]
    fn not(self) -> Status {
        Status(!self.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Status, &str); 9] = [
            (Status::EMPTY, "EMPTY"),
            (Status::READY, "READY"),
            (Status::DESTROYED, "DESTROYED"),
            (Status::NON_EXISTENT, "NON_EXISTENT"),
            (Status::LOADING, "LOADING"),
            (Status::COMMITTING, "COMMITTING"),
            (Status::NEW, "NEW"),
            (Status::DIRTY, "DIRTY"),
            (Status::OBSOLETE, "OBSOLETE"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.is(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_states_are_disjoint_bits() {
        let cores = [
            Status::EMPTY,
            Status::READY,
            Status::DESTROYED,
            Status::NON_EXISTENT,
        ];
        for (i, a) in cores.iter().enumerate() {
            for (j, b) in cores.iter().enumerate() {
                if i != j {
                    assert_eq!((*a & *b).0, 0);
                }
            }
        }
    }

    #[test]
    fn is_tests_any_bit() {
        let status = Status::READY | Status::DIRTY;
        assert!(status.is(Status::READY));
        assert!(status.is(Status::DIRTY));
        assert!(status.is(Status::DIRTY | Status::COMMITTING));
        assert!(!status.is(Status::COMMITTING));
    }

    #[test]
    fn contains_tests_all_bits() {
        let status = Status::READY | Status::NEW | Status::DIRTY;
        assert!(status.contains(Status::READY | Status::NEW));
        assert!(!status.contains(Status::READY | Status::COMMITTING));
    }

    #[test]
    fn with_core_swaps_core_keeps_flags() {
        let status = Status::EMPTY | Status::LOADING;
        let next = status.with_core(Status::READY);
        assert_eq!(next, Status::READY | Status::LOADING);
    }

    #[test]
    fn in_flight() {
        assert!((Status::READY | Status::COMMITTING).in_flight());
        assert!((Status::EMPTY | Status::LOADING).in_flight());
        assert!(!(Status::READY | Status::DIRTY).in_flight());
    }

    #[test]
    fn debug_lists_set_bits() {
        let status = Status::READY | Status::NEW | Status::DIRTY;
        assert_eq!(format!("{status:?}"), "READY|NEW|DIRTY");
        assert_eq!(format!("{:?}", Status::NONE), "NONE");
    }
}
