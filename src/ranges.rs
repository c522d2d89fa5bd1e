//! Inclusive LBA ranges, used for `--skip` parsing and for the
//! expected-error / skip-range bookkeeping of the dump loop and the
//! protection scanner.

use crate::error::{CdResult, Error};

/// An inclusive `[first, last]` LBA range.
pub type Range = (i32, i32);

/// Parse a colon-separated list of `first-last` ranges, e.g.
/// `"0-10:2000-2010"`.
pub fn string_to_ranges(s: &str) -> CdResult<Vec<Range>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }

    s.split(':')
        .map(|chunk| {
            let (first, last) = chunk
                .split_once('-')
                .ok_or_else(|| Error::Protocol(format!("invalid range `{chunk}`")))?;

            let first: i32 = first
                .trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid range bound `{first}`")))?;
            let last: i32 = last
                .trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid range bound `{last}`")))?;

            Ok((first, last))
        })
        .collect()
}

/// Render ranges back to the colon-separated `first-last` form.
pub fn ranges_to_string(ranges: &[Range]) -> String {
    ranges
        .iter()
        .map(|(first, last)| format!("{first}-{last}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Return the range containing `lba`, if any.
pub fn inside_range(lba: i32, ranges: &[Range]) -> Option<Range> {
    ranges
        .iter()
        .copied()
        .find(|&(first, last)| lba >= first && lba <= last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ranges = string_to_ranges("0-10:2000-2010").unwrap();
        assert_eq!(ranges, vec![(0, 10), (2000, 2010)]);
        assert_eq!(ranges_to_string(&ranges), "0-10:2000-2010");
    }

    #[test]
    fn lookup() {
        let ranges = vec![(0, 10), (2000, 2010)];
        assert_eq!(inside_range(5, &ranges), Some((0, 10)));
        assert_eq!(inside_range(2005, &ranges), Some((2000, 2010)));
        assert_eq!(inside_range(1000, &ranges), None);
    }

    #[test]
    fn empty_is_ok() {
        assert_eq!(string_to_ranges("").unwrap(), Vec::new());
    }
}
