//! Logical Block Addressing.
//!
//! Unlike the BCD-encoded [`Msf`](crate::msf::Msf) timestamp, an `Lba` is a
//! flat signed sector index: the program area starts at LBA 0 (MSF
//! `00:02:00`) and the lead-in, which precedes it on the disc, is
//! addressed with negative values down to `-45150` (MSF `90:00:00`).

use crate::msf::Msf;

/// Disc radix: 75 frames/sector per second, 60 seconds per minute.
const FRAMES_PER_SECOND: i32 = 75;
const SECONDS_PER_MINUTE: i32 = 60;

/// `LBA = 75*(60*M+S) + F - 150`, see `original_source/cd.hh`.
const MSF_LBA_SHIFT: i32 = -150;

/// Minutes at and above this value address the lead-in, which wraps
/// the LBA space into the negative region.
const MSF_MINUTES_WRAP: i32 = 90;

/// `100 * 60 * 75`: the size of the full BCD-MSF address space.
const LBA_LIMIT: i32 = 100 * SECONDS_PER_MINUTE * FRAMES_PER_SECOND;

/// A signed logical block address. Negative values address the
/// lead-in; non-negative values address the program area starting at
/// the nominal INDEX 00 origin.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Lba(pub i32);

impl Lba {
    /// Lowest LBA ever representable by a capture file: the origin of
    /// the lead-in region, `MSF_to_LBA(90:00:00)`.
    pub const CAPTURE_ORIGIN: Lba = Lba(-45150);

    pub fn new(lba: i32) -> Lba {
        Lba(lba)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn checked_add(self, rhs: i32) -> Option<Lba> {
        self.0.checked_add(rhs).map(Lba)
    }

    pub fn checked_sub_lba(self, rhs: Lba) -> Option<i32> {
        self.0.checked_sub(rhs.0)
    }
}

impl std::ops::Add<i32> for Lba {
    type Output = Lba;

    fn add(self, rhs: i32) -> Lba {
        Lba(self.0 + rhs)
    }
}

impl std::ops::Sub<i32> for Lba {
    type Output = Lba;

    fn sub(self, rhs: i32) -> Lba {
        Lba(self.0 - rhs)
    }
}

impl std::fmt::Display for Lba {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Convert a binary (decimal, not BCD) `m:s:f` triplet to an `Lba`.
pub fn msf_to_lba(m: u32, s: u32, f: u32) -> Lba {
    let msf_total = FRAMES_PER_SECOND * (SECONDS_PER_MINUTE * m as i32 + s as i32) + f as i32;
    let mut lba = msf_total + MSF_LBA_SHIFT;

    if m as i32 >= MSF_MINUTES_WRAP {
        lba -= LBA_LIMIT;
    }

    Lba(lba)
}

/// Convert an `Lba` to a binary (decimal) `(m, s, f)` triplet.
pub fn lba_to_msf(lba: Lba) -> (u32, u32, u32) {
    let mut v = lba.0 - MSF_LBA_SHIFT;

    if v < 0 {
        v += LBA_LIMIT;
    }

    let f = v % FRAMES_PER_SECOND;
    v /= FRAMES_PER_SECOND;
    let s = v % SECONDS_PER_MINUTE;
    v /= SECONDS_PER_MINUTE;
    let m = v;

    (m as u32, s as u32, f as u32)
}

/// Convert a BCD-encoded [`Msf`] to an `Lba`.
pub fn bcdmsf_to_lba(msf: Msf) -> Lba {
    msf_to_lba(
        msf.minute().binary() as u32,
        msf.second().binary() as u32,
        msf.frame().binary() as u32,
    )
}

/// Convert an `Lba` to a BCD-encoded [`Msf`]. Returns `None` if the
/// resulting fields don't fit in a 2-digit BCD byte (shouldn't happen
/// for any `Lba` reachable from a real disc address).
pub fn lba_to_bcdmsf(lba: Lba) -> Option<Msf> {
    let (m, s, f) = lba_to_msf(lba);

    if m > 99 {
        return None;
    }

    Msf::from_binary(m as u8, s as u8, f as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_boundaries() {
        let cases = [
            ((0, 0, 0), -150),
            ((0, 0, 74), -76),
            ((0, 2, 0), 0),
            ((79, 59, 74), 359849),
            ((90, 0, 0), -45150),
            ((99, 59, 74), -151),
        ];

        for &((m, s, f), expected) in &cases {
            let lba = msf_to_lba(m, s, f);
            assert_eq!(lba, Lba(expected), "msf_to_lba({m}:{s}:{f})");

            let (m2, s2, f2) = lba_to_msf(lba);
            assert_eq!((m2, s2, f2), (m, s, f), "lba_to_msf({lba})");
        }
    }

    #[test]
    fn bcd_round_trip() {
        let msf = Msf::from_binary(12, 34, 56).unwrap();
        let lba = bcdmsf_to_lba(msf);
        assert_eq!(lba_to_bcdmsf(lba).unwrap(), msf);
    }

    #[test]
    fn capture_origin_matches_lead_in_start() {
        assert_eq!(msf_to_lba(90, 0, 0), Lba::CAPTURE_ORIGIN);
    }
}
