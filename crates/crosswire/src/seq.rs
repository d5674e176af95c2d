//! See [`Seq`].

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Sequence ID assigned to each reliable or notify message sent over a
/// connection.
///
/// Stored as a [`u16`], so it wraps around fairly quickly under real game
/// traffic - a peer sending 30 reliable messages per tick at 60 Hz wraps in
/// about half a minute. All comparisons must therefore go through
/// [`Seq::gap_since`] or the custom [`Ord`] impl, which treat the value as a
/// point on a circle rather than a plain integer.
///
/// # Wraparound
///
/// The ID space can be visualized as an infinite line where [`u16::MAX`] sits
/// immediately before `0`:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [`Add`] and [`Sub`] always wrap. Apparent gaps larger than `±2^15` are
/// reinterpreted as the short way around the circle, so `Seq(0)` is *newer*
/// than `Seq(65535)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence ID with value [`u16::MAX`].
    pub const MAX: Seq = Seq(u16::MAX);

    /// Returns the current value and advances this ID by one.
    #[must_use]
    pub fn next(&mut self) -> Seq {
        let seq = *self;
        self.0 = self.0.wrapping_add(1);
        seq
    }

    /// Signed number of sequence IDs elapsed between `rhs` and `self`.
    ///
    /// This is `self - rhs` modulo 2^16, mapped into `[-2^15, 2^15)`: positive
    /// when `self` is newer than `rhs`, negative when older, always the
    /// shortest path around the circle.
    ///
    /// # Example
    ///
    /// ```
    /// # use crosswire::seq::Seq;
    /// assert_eq!(Seq(5).gap_since(Seq(5)), 0);
    /// assert_eq!(Seq(5).gap_since(Seq(3)), 2);
    /// assert_eq!(Seq(3).gap_since(Seq(5)), -2);
    ///
    /// // wraparound takes the short way around
    /// assert_eq!(Seq(0).gap_since(Seq::MAX), 1);
    /// assert_eq!(Seq::MAX.gap_since(Seq(0)), -1);
    /// assert_eq!(Seq(2).gap_since(Seq(u16::MAX - 2)), 5);
    /// ```
    #[must_use]
    pub const fn gap_since(self, rhs: Seq) -> i16 {
        #[allow(clippy::cast_possible_wrap)] // the wrap is the point
        (self.0.wrapping_sub(rhs.0) as i16)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for Seq {
    /// Compares respecting wraparound: `0 cmp 1` is [`Less`] as expected, but
    /// `0 cmp 65535` is [`Greater`].
    ///
    /// If the real difference between the two values is `2^15` or more, no
    /// ordering guarantees are upheld.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        self.gap_since(*other).cmp(&0)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<u16> for Seq {
    type Output = Seq;

    fn add(self, rhs: u16) -> Seq {
        Seq(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for Seq {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl Sub<u16> for Seq {
    type Output = Seq;

    fn sub(self, rhs: u16) -> Seq {
        Seq(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u16> for Seq {
    fn sub_assign(&mut self, rhs: u16) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_is_antisymmetric() {
        for (a, b) in [(0u16, 0u16), (3, 5), (100, 40), (65530, 2), (2, 65530)] {
            let (a, b) = (Seq(a), Seq(b));
            assert_eq!(a.gap_since(b), -b.gap_since(a), "{a} vs {b}");
        }
    }

    #[test]
    fn gap_wraps_the_short_way() {
        assert_eq!(Seq(0).gap_since(Seq::MAX), 1);
        assert_eq!(Seq(10).gap_since(Seq(u16::MAX - 10)), 21);
        assert_eq!(Seq(u16::MAX - 10).gap_since(Seq(10)), -21);
    }

    #[test]
    fn ordering_across_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));
        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX - 3) < Seq(2));

        // differences around 2^15 are explicitly unspecified: a message
        // arriving 32k IDs late means the connection is unusable anyway
    }

    #[test]
    fn next_wraps() {
        let mut seq = Seq::MAX;
        assert_eq!(seq.next(), Seq::MAX);
        assert_eq!(seq.next(), Seq(0));
        assert_eq!(seq, Seq(1));
    }
}
