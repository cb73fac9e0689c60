//! Phase unit conversions.
//!
//! Tags, setpoints and phase shifts count in DMTD phase units with
//! `1 << tag_bits` units per reference clock period. The public API talks
//! picoseconds. Boards that feed the DMTD clocks through a divide-by-two
//! double the picosecond weight of one shifter unit.

use miniconf::Tree;
use serde::{Deserialize, Serialize};

/// Scale between picoseconds and DMTD phase units.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct PhaseScale {
    /// Reference clock period in picoseconds.
    pub clock_period_ps: i64,
    /// Tag counter bits. One clock period spans `1 << tag_bits` units.
    pub tag_bits: u32,
    /// The DMTD clocks reach the taggers through a divide-by-two.
    pub divide_dmtd_by_2: bool,
}

impl Default for PhaseScale {
    fn default() -> Self {
        Self {
            clock_period_ps: 8000,
            tag_bits: 14,
            divide_dmtd_by_2: false,
        }
    }
}

impl PhaseScale {
    /// Tag counter modulus.
    pub const fn span(&self) -> i32 {
        1 << self.tag_bits
    }

    /// Convert picoseconds to phase units, truncating toward zero.
    pub fn from_picos(&self, ps: i64) -> i32 {
        (ps * (1i64 << self.tag_bits) / self.clock_period_ps) as i32
    }

    /// Convert phase units to picoseconds.
    pub fn to_picos(&self, units: i64) -> i64 {
        (units * self.clock_period_ps) >> self.tag_bits
    }

    /// Phase unit weight multiplier of the divided DMTD clock.
    pub const fn divider(&self) -> i32 {
        if self.divide_dmtd_by_2 {
            2
        } else {
            1
        }
    }

    /// Convert a phase shift request in picoseconds to shifter units.
    pub fn shift_from_picos(&self, ps: i64) -> i32 {
        self.from_picos(ps) / self.divider()
    }

    /// Convert a shifter position in units to picoseconds.
    pub fn shift_to_picos(&self, units: i32) -> i64 {
        self.to_picos(units as i64 * self.divider() as i64)
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    quickcheck! {
        fn picos_round_trip_is_tight(ps: i64) -> bool {
            let ps = ps % (1 << 29);
            let s = PhaseScale::default();
            (s.to_picos(s.from_picos(ps) as i64) - ps).abs() <= 1
        }
    }

    #[test]
    fn picos_round_trip() {
        let s = PhaseScale::default();
        assert_eq!(s.from_picos(8000), 1 << 14);
        assert_eq!(s.from_picos(-4000), -(1 << 13));
        assert_eq!(s.to_picos(1 << 14), 8000);
        assert_eq!(s.to_picos(-(1 << 14)), -8000);
    }

    #[test]
    fn divided_clocks_halve_the_request() {
        let s = PhaseScale {
            divide_dmtd_by_2: true,
            ..Default::default()
        };
        assert_eq!(s.shift_from_picos(8000), 1 << 13);
        assert_eq!(s.shift_to_picos(1 << 13), 8000);
    }

    #[test]
    fn undivided_is_identity() {
        let s = PhaseScale::default();
        assert_eq!(s.shift_from_picos(1000), s.from_picos(1000));
        assert_eq!(s.shift_to_picos(100), s.to_picos(100));
    }
}
