use std::cmp;
use std::fmt;

const HALF_RANGE: u16 = 1 << 15;

/// A 16-bit packet sequence number.
///
/// Ordering is serial-number arithmetic: `a < b` iff the forward distance from `a` to `b` is
/// nonzero and less than half the sequence space. This is consistent as long as the values being
/// compared lie within 2^15 of one another.
///
/// Zero is reserved to mark unreliable packets and is never produced by [`Sequence::next`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sequence(u16);

impl Sequence {
    /// The unsequenced marker.
    pub const NONE: Sequence = Sequence(0);

    /// The first sequence number assigned on a fresh channel.
    pub const FIRST: Sequence = Sequence(1);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// True for every value but zero.
    pub const fn is_reliable(self) -> bool {
        self.0 != 0
    }

    /// Returns the following sequence number, skipping zero on wrap.
    pub fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            value => Self(value),
        }
    }

    /// Returns the current value and advances `self` past it.
    pub fn advance(&mut self) -> Self {
        let current = *self;
        *self = current.next();
        current
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        let gap = other.0.wrapping_sub(self.0);

        if gap == 0 {
            cmp::Ordering::Equal
        } else if gap < HALF_RANGE {
            cmp::Ordering::Less
        } else {
            cmp::Ordering::Greater
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
