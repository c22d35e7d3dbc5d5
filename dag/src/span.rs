//! Closed integer intervals used for regions and loop bounds.

use std::fmt;

/// A closed interval `[min, max]` with a flag recording whether its extent is
/// known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    min: i64,
    max: i64,
    constant_extent: bool,
}

impl Span {
    pub const fn new(min: i64, max: i64, constant_extent: bool) -> Self {
        Self { min, max, constant_extent }
    }

    /// Interval of `extent` points starting at zero.
    pub const fn with_extent(extent: i64) -> Self {
        Self { min: 0, max: extent - 1, constant_extent: true }
    }

    /// Identity element for [`Span::union`].
    pub const fn empty() -> Self {
        Self { min: i64::MAX, max: i64::MIN, constant_extent: true }
    }

    pub const fn min(&self) -> i64 {
        self.min
    }

    pub const fn max(&self) -> i64 {
        self.max
    }

    pub const fn constant_extent(&self) -> bool {
        self.constant_extent
    }

    pub const fn is_empty(&self) -> bool {
        self.max < self.min
    }

    /// Number of points covered; zero for an empty span.
    pub const fn extent(&self) -> i64 {
        if self.is_empty() { 0 } else { self.max - self.min + 1 }
    }

    pub fn union(&mut self, other: &Span) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.constant_extent = self.constant_extent && other.constant_extent;
    }

    pub fn set_extent(&mut self, extent: i64) {
        self.max = self.min + extent - 1;
    }

    pub fn translate(&mut self, delta: i64) {
        self.min += delta;
        self.max += delta;
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)?;
        if !self.constant_extent {
            write!(f, "?")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(Span::new(0, 9, true), 10; "from zero")]
    #[test_case(Span::new(-3, 3, true), 7; "negative min")]
    #[test_case(Span::new(5, 5, false), 1; "single point")]
    #[test_case(Span::empty(), 0; "empty")]
    fn test_extent(s: Span, extent: i64) {
        assert_eq!(s.extent(), extent);
    }

    #[test]
    fn test_union_drops_constant_flag() {
        let mut s = Span::new(0, 3, true);
        s.union(&Span::new(2, 8, false));
        assert_eq!(s.min(), 0);
        assert_eq!(s.max(), 8);
        assert!(!s.constant_extent());
    }

    #[test]
    fn test_set_extent_and_translate() {
        let mut s = Span::new(4, 4, true);
        s.set_extent(8);
        s.translate(16);
        assert_eq!(s, Span::new(20, 27, true));
    }

    fn arb_span() -> impl Strategy<Value = Span> {
        (-1000i64..1000, 0i64..500, any::<bool>()).prop_map(|(min, len, c)| Span::new(min, min + len, c))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn union_with_empty_is_identity(s in arb_span()) {
            let mut u = Span::empty();
            u.union(&s);
            prop_assert_eq!(u, s);
        }

        #[test]
        fn union_is_commutative_and_covering(a in arb_span(), b in arb_span()) {
            let mut ab = a;
            ab.union(&b);
            let mut ba = b;
            ba.union(&a);
            prop_assert_eq!(ab, ba);
            prop_assert!(ab.min() <= a.min().min(b.min()) && ab.max() >= a.max().max(b.max()));
            prop_assert!(ab.extent() >= a.extent().max(b.extent()));
        }
    }
}
