//! Track-splitting engine (C9).
//!
//! Drives the offset detector, descrambles and verifies each data
//! sector against its EDC/ECC fields, fills unreadable sectors by
//! policy, accumulates redump-style hashes, and emits one binary per
//! track.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use sha1::Digest;

use crate::capture::{self, Store, SCRAM_SIZE, SUBCODE_SIZE};
use crate::ecc;
use crate::edc;
use crate::error::{CdResult, Error};
use crate::lba::Lba;
use crate::offset;
use crate::ranges::Range;
use crate::scrambler;
use crate::subchannel::{extract_channel, QData, SubChannelQ};
use crate::{Track, TrackFormat};

const Q_CHANNEL_BIT: u8 = 1;

/// User-visible fill byte for a synthesized data sector that falls
/// inside a known skip range and the user asked for zero-fill instead
/// of the default `0x55`.
pub const DEFAULT_SKIP_FILL: u8 = 0x55;

/// Options steering the per-track emit loop.
pub struct SplitOptions {
    /// Ranges that are expected to be unreadable (multisession gaps,
    /// protection-scanner findings); sectors here are filled silently.
    pub skip_ranges: Vec<Range>,
    /// Fill byte for synthesized user data inside a skip range.
    pub skip_fill: u8,
    /// Emit tracks even if unfilled read errors remain outside any
    /// skip range.
    pub force_split: bool,
}

impl Default for SplitOptions {
    fn default() -> SplitOptions {
        SplitOptions { skip_ranges: Vec::new(), skip_fill: DEFAULT_SKIP_FILL, force_split: false }
    }
}

/// Per-track integrity and hash accounting, used for the `P_split.txt`
/// / `P_info.txt` reports.
#[derive(Debug, Clone, Default)]
pub struct TrackStats {
    pub sectors: u32,
    pub filled_sectors: u32,
    pub ecc_errors: u32,
    pub edc_errors: u32,
    pub subheader_errors: u32,
    pub redump_errors: u32,
    pub crc32: u32,
    pub md5: [u8; 16],
    pub sha1: [u8; 20],
}

const SYNC: [u8; 12] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

fn synthesize_data_sector(lba: Lba, fill: u8) -> CdResult<[u8; SCRAM_SIZE]> {
    let mut sector = [fill; SCRAM_SIZE];
    sector[0..12].copy_from_slice(&SYNC);

    let msf = crate::lba::lba_to_bcdmsf(lba).ok_or(Error::InvalidMsf)?;
    let (m, s, f) = msf.into_bcd();
    sector[12] = m.bcd();
    sector[13] = s.bcd();
    sector[14] = f.bcd();
    sector[15] = 1;

    Ok(sector)
}

/// EDC over sync+header+user, Reed-Solomon P/Q over header+user+EDC+zero,
/// per the canonical ECMA-130 Mode 1 layout.
fn verify_mode1(sector: &mut [u8; SCRAM_SIZE]) -> (bool, bool) {
    let stored_edc = u32::from_le_bytes([sector[2064], sector[2065], sector[2066], sector[2067]]);
    let computed_edc = edc::compute_block(0, &sector[0..2064]);
    let edc_ok = stored_edc == computed_edc;

    let (p, q) = ecc::generate(&sector[12..2076]);
    let stored_p = &sector[2076..2248];
    let stored_q = &sector[2248..2352];
    let ecc_ok = p[..] == stored_p[..] && q[..] == stored_q[..];

    (edc_ok, ecc_ok)
}

/// Mode 2 Form 1: the 8-byte subheader is copied twice (bytes
/// 16..24); ECC treats the 4-byte header as zero. Returns
/// `(subheader_ok, edc_ok, ecc_ok)`.
fn verify_mode2_form1(sector: &[u8; SCRAM_SIZE]) -> (bool, bool, bool) {
    let subheader_ok = sector[16..20] == sector[20..24];

    // header(4) + subheader(8) + user(2048) + edc(4) = 2064 bytes,
    // the same span size Mode 1's ECC covers, with the 4-byte CD-ROM
    // header zeroed before the parity calculation (restored by the
    // caller, who only ever sees a local copy here).
    let mut scratch = [0u8; 2064];
    scratch.copy_from_slice(&sector[12..2076]);
    scratch[0..4].fill(0);

    // EDC spans subheader+user+edc only — the zeroed header is excluded
    // here even though the ECC pass below still covers it.
    let stored_edc = u32::from_le_bytes([sector[2072], sector[2073], sector[2074], sector[2075]]);
    let computed_edc = edc::compute_block(0, &scratch[4..2060]);
    let edc_ok = stored_edc == computed_edc;

    let (p, q) = ecc::generate(&scratch);
    let stored_p = &sector[2076..2248];
    let stored_q = &sector[2248..2352];
    let ecc_ok = p[..] == stored_p[..] && q[..] == stored_q[..];

    (subheader_ok, edc_ok, ecc_ok)
}

/// Mode 2 Form 2: a stored EDC of zero is a valid "not computed"
/// marker, never flagged as an error.
fn verify_mode2_form2(sector: &[u8; SCRAM_SIZE]) -> bool {
    let stored_edc = u32::from_le_bytes([sector[2348], sector[2349], sector[2350], sector[2351]]);
    if stored_edc == 0 {
        return true;
    }

    let computed_edc = edc::compute_block(0, &sector[16..2348]);
    stored_edc == computed_edc
}

/// Split one track out of `store` into `out_path`, applying
/// `write_offset` samples of byte-level correction to every sector
/// read and verifying data-track integrity per [`TrackFormat`]. A
/// CDI/VCD mid-track offset shift, if detected, moves `write_offset`
/// forward from that LBA on and spills its skipped bytes to a
/// `{track}.{lba:06}` side file next to `out_path`.
pub fn split_track(store: &mut Store, track: &Track, write_offset: i32, opts: &SplitOptions, out_path: &Path) -> CdResult<TrackStats> {
    let start = track.lba(crate::msf::Msf::zero())?;
    let sector_count = track.length.sector_index();

    let mut out = File::create(out_path).map_err(Error::Io)?;
    let mut stats = TrackStats::default();
    let mut crc = crc32fast::Hasher::new();
    let mut md5_ctx = md5::Context::new();
    let mut sha1_hasher = sha1::Sha1::new();

    let mut write_offset = write_offset;
    let mut byte_shift = write_offset as i64 * 4;
    let mut lba = start;
    let end = start.checked_add(sector_count as i32).ok_or(Error::InvalidMsf)?;
    let mut unfilled_outside_skip = false;

    while lba < end {
        if track.format.is_cdrom() {
            if let Some(shift) = offset::detect_shift(store, lba, write_offset, end)? {
                let side_path = out_path.with_file_name(format!("{}.{:06}", out_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(), lba.as_i32()));
                fs::write(side_path, &shift.garbage).map_err(Error::Io)?;

                write_offset = shift.new_write_offset;
                byte_shift = write_offset as i64 * 4;
            }
        }

        let states = store.read_states(lba)?;
        let in_skip = crate::ranges::inside_range(lba.as_i32(), &opts.skip_ranges).is_some();

        let mut sector = if capture::any_unreliable(&states) && !opts.force_split {
            stats.filled_sectors += 1;
            if !in_skip {
                unfilled_outside_skip = true;
            }
            let fill = if in_skip { opts.skip_fill } else { DEFAULT_SKIP_FILL };

            if track.format.is_audio() {
                [0u8; SCRAM_SIZE]
            } else {
                synthesize_data_sector(lba, fill)?
            }
        } else {
            let mut buf = [0u8; SCRAM_SIZE];
            store.read_scram_at(lba, byte_shift, &mut buf)?;
            buf
        };

        if track.format.is_cdrom() {
            let expected = crate::lba::lba_to_bcdmsf(lba).ok_or(Error::InvalidMsf)?.into_bcd();
            let expected_mode = match track.format {
                TrackFormat::Mode1 => 1,
                _ => 2,
            };
            scrambler::descramble_sector(&mut sector, Some((expected.0.bcd(), expected.1.bcd(), expected.2.bcd(), expected_mode)));

            match track.format {
                TrackFormat::Mode1 => {
                    let (edc_ok, ecc_ok) = verify_mode1(&mut sector);
                    if !edc_ok {
                        stats.edc_errors += 1;
                    }
                    if !ecc_ok {
                        stats.ecc_errors += 1;
                    }
                    if !edc_ok || !ecc_ok {
                        stats.redump_errors += 1;
                    }
                }
                TrackFormat::Mode2Xa => {
                    // Form is advertised in the subheader submode bit;
                    // infer it the same way `Sector::mode2_xa_payload` does.
                    let form2 = sector[18] & (1 << 5) != 0;
                    if form2 {
                        if !verify_mode2_form2(&sector) {
                            stats.edc_errors += 1;
                            stats.redump_errors += 1;
                        }
                    } else {
                        let (subheader_ok, edc_ok, ecc_ok) = verify_mode2_form1(&sector);
                        if !subheader_ok {
                            stats.subheader_errors += 1;
                            stats.redump_errors += 1;
                        }
                        if !edc_ok {
                            stats.edc_errors += 1;
                        }
                        if !ecc_ok {
                            stats.ecc_errors += 1;
                        }
                        if (!edc_ok || !ecc_ok) && subheader_ok {
                            stats.redump_errors += 1;
                        }
                    }
                }
                TrackFormat::Mode2CdI => {
                    if !verify_mode2_form2(&sector) {
                        stats.edc_errors += 1;
                        stats.redump_errors += 1;
                    }
                }
                TrackFormat::Audio => unreachable!("is_cdrom() implies a data format"),
            }
        }

        out.write_all(&sector).map_err(Error::Io)?;
        crc.update(&sector);
        md5_ctx.consume(&sector);
        sha1_hasher.update(&sector);

        stats.sectors += 1;
        lba = lba.checked_add(1).ok_or(Error::InvalidMsf)?;
    }

    stats.crc32 = crc.finalize();
    stats.md5 = *md5_ctx.compute();
    stats.sha1 = sha1_hasher.finalize().into();

    if unfilled_outside_skip && !opts.force_split {
        return Err(Error::UnfilledErrors);
    }

    Ok(stats)
}

/// Build a "QTOC" of gap-filled Q blocks by running [`crate::subchannel::synthesize_mode1`]
/// over consecutive captured Q entries that share a track/index but
/// skip an LBA (a drive C2 error that corrupted just the subchannel).
/// Returns the repaired Q stream in capture order.
pub fn fill_subchannel_gaps(entries: &[(Lba, [u8; SUBCODE_SIZE])]) -> Vec<(Lba, SubChannelQ)> {
    let mut repaired = Vec::with_capacity(entries.len());
    let mut last_good: Option<(Lba, SubChannelQ)> = None;

    for &(lba, subcode) in entries {
        let raw = extract_channel(&subcode, Q_CHANNEL_BIT);
        let q = SubChannelQ::new(raw);

        if q.is_valid() {
            repaired.push((lba, q));
            last_good = Some((lba, q));
            continue;
        }

        if let Some((good_lba, good_q)) = last_good {
            let delta = lba.checked_sub_lba(good_lba).unwrap_or(0);
            if let QData::Mode1(track, index, msf, ap_msf) = good_q.parse_data() {
                if let Some(synth) = crate::subchannel::synthesize_mode1(track, index, msf, ap_msf, delta) {
                    repaired.push((lba, synth));
                    continue;
                }
            }
        }

        // Nothing to repair from; keep the corrupted block as-is so
        // downstream MCN/ISRC stitching can at least see it was attempted.
        repaired.push((lba, q));
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcd::Bcd;
    use crate::capture::ReadState;
    use crate::msf::Msf;
    use crate::subchannel::AdrControl;
    use tempfile::tempdir;

    fn mode1_sector(lba: Lba) -> [u8; SCRAM_SIZE] {
        let mut sector = synthesize_data_sector(lba, 0).unwrap();
        let (p, q) = ecc::generate(&sector[12..2076]);
        let edc = edc::compute_block(0, &sector[12..2064]);
        sector[2064..2068].copy_from_slice(&edc.to_le_bytes());
        sector[2076..2248].copy_from_slice(&p);
        sector[2248..2352].copy_from_slice(&q);
        sector
    }

    #[test]
    fn splits_a_perfect_mode1_track() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        for i in 0..4 {
            let lba = Lba::new(i);
            let mut sector = mode1_sector(lba);
            scrambler::process(&mut sector, 0);
            store.write_entry(lba, &sector, &[0u8; SUBCODE_SIZE], &capture::uniform(ReadState::Success)).unwrap();
        }

        let track = Track {
            track: Bcd::from_binary(1).unwrap(),
            format: TrackFormat::Mode1,
            start: Msf::from_binary(0, 2, 0).unwrap(),
            length: Msf::from_binary(0, 0, 4).unwrap(),
            control: AdrControl::DATA,
        };

        let out_path = dir.path().join("track01.bin");
        let stats = split_track(&mut store, &track, 0, &SplitOptions::default(), &out_path).unwrap();

        assert_eq!(stats.sectors, 4);
        assert_eq!(stats.edc_errors, 0);
        assert_eq!(stats.ecc_errors, 0);
        assert_eq!(stats.filled_sectors, 0);
        assert_eq!(std::fs::metadata(&out_path).unwrap().len(), 4 * SCRAM_SIZE as u64);
    }

    #[test]
    fn fills_unreadable_sectors_with_the_fill_byte() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        store.write_entry(Lba::new(0), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &capture::uniform(ReadState::ErrorC2)).unwrap();

        let track = Track {
            track: Bcd::from_binary(1).unwrap(),
            format: TrackFormat::Mode1,
            start: Msf::from_binary(0, 2, 0).unwrap(),
            length: Msf::from_binary(0, 0, 1).unwrap(),
            control: AdrControl::DATA,
        };

        let out_path = dir.path().join("track01.bin");
        let opts = SplitOptions { force_split: true, ..SplitOptions::default() };
        let stats = split_track(&mut store, &track, 0, &opts, &out_path).unwrap();

        assert_eq!(stats.filled_sectors, 1);
        let data = std::fs::read(&out_path).unwrap();
        assert_eq!(data[16], DEFAULT_SKIP_FILL);
    }

    #[test]
    fn unfilled_errors_outside_skip_range_abort_without_force() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();
        store.write_entry(Lba::new(0), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &capture::uniform(ReadState::ErrorC2)).unwrap();

        let track = Track {
            track: Bcd::from_binary(1).unwrap(),
            format: TrackFormat::Mode1,
            start: Msf::from_binary(0, 2, 0).unwrap(),
            length: Msf::from_binary(0, 0, 1).unwrap(),
            control: AdrControl::DATA,
        };

        let out_path = dir.path().join("track01.bin");
        let result = split_track(&mut store, &track, 0, &SplitOptions::default(), &out_path);
        assert!(matches!(result, Err(Error::UnfilledErrors)));
    }
}
