//! Write-offset detection.
//!
//! A drive's analog-to-digital path is phase-shifted from the
//! physical disc by a constant number of 4-byte samples (its "read
//! offset" or "write offset", since redump conventionally expresses
//! it as the correction a *writer* would need to apply). Before a
//! data track can be descrambled and verified, the split engine needs
//! to know this shift so it can read each sector's 2352 bytes
//! starting at the right byte within the capture rather than at the
//! sector-aligned boundary the drive happened to report.

use crate::bcd::Bcd;
use crate::capture::{Store, SCRAM_SIZE};
use crate::error::{CdResult, Error};
use crate::lba::{bcdmsf_to_lba, Lba};
use crate::msf::Msf;
use crate::scrambler;

const SAMPLE_SIZE: i64 = 4;

const SYNC: [u8; 12] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC.len()).position(|w| w == SYNC)
}

fn header_lba(sector: &[u8; SCRAM_SIZE]) -> Option<Lba> {
    let m = Bcd::from_bcd(sector[12])?;
    let s = Bcd::from_bcd(sector[13])?;
    let f = Bcd::from_bcd(sector[14])?;
    let msf = Msf::new(m, s, f)?;
    Some(bcdmsf_to_lba(msf))
}

/// Detect the write offset (in samples) of a data track whose
/// captured sync pattern is expected somewhere near LBA `probe`.
///
/// Reads two consecutive sectors' worth of scrambled bytes starting
/// at `probe`, locates the 12-byte sync pattern, descrambles the
/// sector it introduces to recover its true LBA from the header, and
/// solves `write_offset = (p - (sector_lba - probe) * 2352) / 4`.
pub fn detect(store: &mut Store, probe: Lba) -> CdResult<i32> {
    let mut window = [0u8; SCRAM_SIZE * 2];
    store.read_scram_at(probe, 0, &mut window)?;

    let p = find_sync(&window).ok_or(Error::BadSyncPattern)?;
    if window.len() - p < SCRAM_SIZE {
        return Err(Error::BadSyncPattern);
    }

    let mut sector = [0u8; SCRAM_SIZE];
    sector.copy_from_slice(&window[p..p + SCRAM_SIZE]);
    if !scrambler::descramble_sector(&mut sector, None) {
        return Err(Error::BadSyncPattern);
    }

    let sector_lba = header_lba(&sector).ok_or(Error::InvalidMsf)?;
    let delta_sectors = sector_lba.checked_sub_lba(probe).ok_or(Error::InvalidMsf)? as i64;
    let byte_offset = p as i64 - delta_sectors * SCRAM_SIZE as i64;

    Ok((byte_offset / SAMPLE_SIZE) as i32)
}

/// Fraction of a pre-gap window, expressed in sectors examined vs.
/// sectors with a recognizable descrambled sync, above which a
/// CDI-Ready pre-gap is considered confirmed (SPEC_FULL §4.3/§4.8
/// rule 3).
const CDI_READY_SYNC_THRESHOLD: f64 = 0.5;

/// Scan an audio disc's first-track pre-gap for a CDI-Ready data
/// signature: if more than half of the probed sectors descramble to a
/// recognizable CD-ROM sync, the pre-gap is treated as the offset
/// source and the caller should extend the first track and relabel
/// the disc type.
pub fn detect_cdi_ready(store: &mut Store, pregap_start: Lba, pregap_len: i32) -> CdResult<Option<i32>> {
    if pregap_len <= 0 {
        return Ok(None);
    }

    let mut hits = 0;
    let mut offset_guess = None;

    for i in 0..pregap_len {
        let lba = pregap_start + i;
        if let Ok(offset) = detect(store, lba) {
            hits += 1;
            offset_guess.get_or_insert(offset);
        }
    }

    if (hits as f64) / (pregap_len as f64) > CDI_READY_SYNC_THRESHOLD {
        Ok(offset_guess)
    } else {
        Ok(None)
    }
}

/// Result of a mid-track offset-shift correction (SPEC_FULL §4.8 rule
/// 4): the bytes that sat between the old sector boundary and the
/// newly found sync (written to a `{track}.{lba:06}` side file by the
/// caller) and the write offset to use from this sector onward.
pub struct ShiftResult {
    pub garbage: Vec<u8>,
    pub new_write_offset: i32,
}

/// CDI/VCD mastering artefact: a data track can contain a single
/// point where the byte-exact write offset changes. When the sector
/// expected at `lba` doesn't have a sync at its nominal position,
/// search up to `max_ahead` further sectors for one, recompute the
/// offset from its header, and report the skipped bytes so the
/// caller can preserve them in a side file.
pub fn detect_shift(store: &mut Store, lba: Lba, current_write_offset: i32, track_end: Lba) -> CdResult<Option<ShiftResult>> {
    let max_ahead = 4i32.min((track_end.as_i32() - lba.as_i32()).max(0));
    if max_ahead <= 0 {
        return Ok(None);
    }

    let byte_shift = current_write_offset as i64 * SAMPLE_SIZE;
    let mut probe = [0u8; SCRAM_SIZE];
    if store.read_scram_at(lba, byte_shift, &mut probe).is_ok() && probe[0..12] == SYNC {
        return Ok(None);
    }

    let window_len = (max_ahead as usize + 1) * SCRAM_SIZE;
    let mut window = vec![0u8; window_len];
    store.read_scram_at(lba, byte_shift, &mut window)?;

    let p = match find_sync(&window) {
        Some(p) => p,
        None => return Ok(None),
    };

    if window.len() - p < SCRAM_SIZE {
        return Ok(None);
    }

    let mut sector = [0u8; SCRAM_SIZE];
    sector.copy_from_slice(&window[p..p + SCRAM_SIZE]);
    if !scrambler::descramble_sector(&mut sector, None) {
        return Ok(None);
    }

    let sector_lba = header_lba(&sector).ok_or(Error::InvalidMsf)?;
    let new_byte_offset = byte_shift + p as i64 - (sector_lba.checked_sub_lba(lba).ok_or(Error::InvalidMsf)? as i64) * SCRAM_SIZE as i64;

    Ok(Some(ShiftResult {
        garbage: window[0..p].to_vec(),
        new_write_offset: (new_byte_offset / SAMPLE_SIZE) as i32,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{self, ReadState};
    use tempfile::tempdir;

    fn synthesize_sector(lba: Lba) -> [u8; SCRAM_SIZE] {
        let mut sector = [0u8; SCRAM_SIZE];
        sector[0..12].copy_from_slice(&SYNC);
        let msf = crate::lba::lba_to_bcdmsf(lba).unwrap();
        let (m, s, f) = msf.into_bcd();
        sector[12] = m.bcd();
        sector[13] = s.bcd();
        sector[14] = f.bcd();
        sector[15] = 1;
        scrambler::process(&mut sector, 0);
        sector
    }

    #[test]
    fn detects_zero_offset() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        for i in 0..4 {
            let lba = Lba::new(i);
            let sector = synthesize_sector(lba);
            store.write_entry(lba, &sector, &[0u8; 96], &capture::uniform(ReadState::Success)).unwrap();
        }

        let offset = detect(&mut store, Lba::new(0)).unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn detects_nonzero_offset() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        // Simulate a drive that is phase-shifted 10 samples (40 bytes)
        // early: sector N's true bytes start 40 bytes into file-sector N.
        let shift_bytes = 40usize;
        let mut stream = Vec::new();
        for i in 0..4 {
            stream.extend_from_slice(&synthesize_sector(Lba::new(i)));
        }

        for i in 0..3 {
            let lba = Lba::new(i);
            let mut chunk = [0u8; SCRAM_SIZE];
            chunk.copy_from_slice(&stream[i as usize * SCRAM_SIZE + shift_bytes..i as usize * SCRAM_SIZE + shift_bytes + SCRAM_SIZE]);
            store.write_entry(lba, &chunk, &[0u8; 96], &capture::uniform(ReadState::Success)).unwrap();
        }

        // The capture holds data that is `shift_bytes` ahead of its
        // nominal sector boundary, so correcting for it means reading
        // `shift_bytes` *earlier* than the naive sector-aligned offset.
        let offset = detect(&mut store, Lba::new(0)).unwrap();
        assert_eq!(offset, -((shift_bytes / 4) as i32));
    }
}
