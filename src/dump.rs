//! Dump/refine main loop.
//!
//! Pulls raw sectors off a SCSI/MMC drive into a [`capture::Store`],
//! tracking per-sector read state so a later refine pass can target
//! just the sectors that came back bad. The loop is a single
//! sequential LBA walk; everything that makes it interesting is
//! policy around that walk: a BE-mode guard for mixed-content discs,
//! multisession gap bookkeeping, drive-quirk-aware read method
//! selection, and C2-derived per-sector state.

use std::collections::BTreeMap;

use crate::capture::{self, ReadState, Store, SAMPLES_PER_SECTOR, SCRAM_SIZE, SUBCODE_SIZE};
use crate::drive::{CacheQuirk, DriveProfile, ReadMethod};
use crate::error::{CdResult, Error};
use crate::lba::Lba;
use crate::ranges::{inside_range, Range};
use crate::scsi::{Transport, ASUS_CACHE_ENTRY_SIZE};
use crate::subchannel::{extract_channel, mode1_lba, SubChannelQ};
use crate::toc::{Toc, TocTrack};

/// Size, in bytes, of the C2 error-pointer bitmap READ CD appends
/// after the 2352-byte main channel (one bit per user-data byte).
const C2_SIZE: usize = 294;

/// Options controlling one dump or refine run, gathered from CLI
/// flags and the `config` sidecar (never from the drive).
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub speed_kb_s: Option<u16>,
    pub retries: u32,
    pub refine: bool,
    pub refine_subchannel: bool,
    pub stop_lba: Option<Lba>,
    pub force_toc: bool,
    pub unsupported: bool,
    pub skip_ranges: Vec<Range>,
}

impl Default for DumpOptions {
    fn default() -> DumpOptions {
        DumpOptions {
            speed_kb_s: None,
            retries: 1,
            refine: false,
            refine_subchannel: false,
            stop_lba: None,
            force_toc: false,
            unsupported: false,
            skip_ranges: Vec::new(),
        }
    }
}

/// Running counters for one dump/refine invocation, printed as the
/// final summary line (§7).
#[derive(Debug, Clone, Default)]
pub struct DumpStats {
    pub sectors_read: u64,
    pub scsi_errors: u64,
    pub c2_errors: u64,
    pub q_errors: u64,
}

/// Derive a sector's 588 per-sample `.state` bytes from its 294-byte
/// C2 bitmap: each sample's 4-bit C2 nibble is `c2[i/2]`'s high nibble
/// for even `i`, low nibble for odd `i`; a nonzero nibble downgrades
/// that sample to `ErrorC2`, everything else stays at `baseline`.
///
/// `baseline` is the state a clean sample gets for this read path:
/// `Success` for a normal READ CD, `SuccessC2Off` for a D8 read (which
/// never returns C2 data, so its `c2` is all zero and this is a no-op),
/// `SuccessScsiOff` for an ASUS/LG cache hit.
pub fn derive_states(c2: &[u8], baseline: ReadState) -> [ReadState; SAMPLES_PER_SECTOR] {
    std::array::from_fn(|i| {
        let byte = c2[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        if nibble != 0 {
            ReadState::ErrorC2
        } else {
            baseline
        }
    })
}

/// Abort dumping with the profile's plain READ CD (BE) method if the
/// disc mixes data and audio tracks: BE's descrambling can't be
/// trusted across that boundary. `unsupported` is `--unsupported`,
/// which lets the caller explicitly accept the risk.
pub fn be_mode_guard(toc: &Toc, profile: &DriveProfile, unsupported: bool) -> CdResult<()> {
    if profile.read_method != ReadMethod::Be || unsupported {
        return Ok(());
    }

    let has_data = toc.tracks.iter().any(|t| t.is_data());
    let has_audio = toc.tracks.iter().any(|t| !t.is_data());

    if has_data && has_audio {
        return Err(Error::UnsupportedBeMixedMode);
    }

    Ok(())
}

/// Build the expected-error LBA ranges spanning the gap between one
/// session's last observed track start and the next session's program
/// start, so the main loop doesn't count failures to read them as
/// real errors.
pub fn multisession_gap_ranges(toc: &Toc, pregap_start: i32) -> Vec<Range> {
    let mut by_session: BTreeMap<u8, Vec<&TocTrack>> = BTreeMap::new();
    for track in &toc.tracks {
        by_session.entry(track.session).or_default().push(track);
    }

    let mut bounds: Vec<(u8, Lba, Lba)> = by_session
        .into_iter()
        .map(|(session, tracks)| {
            let start = tracks.iter().map(|t| t.start_lba()).min().unwrap_or(Lba::new(0));
            let end = tracks.iter().map(|t| t.start_lba()).max().unwrap_or(start);
            (session, start, end)
        })
        .collect();
    bounds.sort_by_key(|&(session, _, _)| session);

    bounds
        .windows(2)
        .map(|pair| {
            let (_, _, prev_end) = pair[0];
            let (_, next_start, _) = pair[1];
            (prev_end.as_i32(), (next_start.as_i32() + pregap_start).max(prev_end.as_i32()))
        })
        .collect()
}

/// LBA the main loop should start walking from: the first track's
/// recorded pre-gap, or 150 sectors before its INDEX 01 if no pre-gap
/// was observed.
fn initial_lba_start(toc: &Toc) -> Lba {
    toc.tracks
        .first()
        .map(|t| t.pregap_lba().unwrap_or(t.start_lba() - 150))
        .unwrap_or(Lba::new(0))
}

fn subchannel_ok(store: &mut Store, lba: Lba) -> CdResult<bool> {
    let (_, subcode, _) = store.read_entry(lba)?;
    Ok(SubChannelQ::new(extract_channel(&subcode, 1)).is_valid())
}

/// Baseline state a clean sample gets for this profile's read method
/// (SPEC_FULL §4.7/§4.8): D8 never returns C2 pointers, so its samples
/// can only ever be confirmed "read", not "read clean".
fn read_method_baseline(profile: &DriveProfile) -> ReadState {
    match profile.read_method {
        ReadMethod::D8 => ReadState::SuccessC2Off,
        ReadMethod::Be | ReadMethod::Bebat => ReadState::Success,
    }
}

/// Issue the profile's preferred read for one sector and split the
/// response into its main/C2/subcode parts. D8 (Plextor CDDA) never
/// returns C2 pointers, so its sectors are always reported clean.
fn read_one(transport: &Transport, profile: &DriveProfile, lba: Lba) -> CdResult<([u8; SCRAM_SIZE], Vec<u8>, [u8; SUBCODE_SIZE])> {
    match profile.read_method {
        ReadMethod::D8 => {
            let buf = transport.read_cdda(lba, 1)?;
            let mut scram = [0u8; SCRAM_SIZE];
            scram.copy_from_slice(&buf[0..SCRAM_SIZE]);
            let mut subcode = [0u8; SUBCODE_SIZE];
            subcode.copy_from_slice(&buf[SCRAM_SIZE..SCRAM_SIZE + SUBCODE_SIZE]);
            Ok((scram, vec![0u8; C2_SIZE], subcode))
        }
        ReadMethod::Be | ReadMethod::Bebat => {
            let buf = transport.read_cd(lba, 1)?;
            let mut scram = [0u8; SCRAM_SIZE];
            scram.copy_from_slice(&buf[0..SCRAM_SIZE]);
            let c2 = buf[SCRAM_SIZE..SCRAM_SIZE + C2_SIZE].to_vec();
            let mut subcode = [0u8; SUBCODE_SIZE];
            subcode.copy_from_slice(&buf[SCRAM_SIZE + C2_SIZE..SCRAM_SIZE + C2_SIZE + SUBCODE_SIZE]);
            Ok((scram, c2, subcode))
        }
    }
}

/// Plextor lead-in pre-pass (SPEC_FULL §4.7): before the main loop,
/// walk the negative-LBA pre-gap with READ CDDA and persist whatever
/// comes back, so the main loop's negative-LBA range starts from real
/// data instead of silence. Simplified from the full algorithm: reads
/// sequentially rather than matching the longest buffer per session,
/// since this crate targets single-session captures first.
fn plextor_leadin_prepass(transport: &Transport, store: &mut Store, lba_start: Lba) -> CdResult<()> {
    let pregap_start = Lba::new(Lba::CAPTURE_ORIGIN.as_i32().max(lba_start.as_i32() - 19999));
    let mut lba = pregap_start;

    while lba < lba_start {
        if let Ok(buf) = transport.read_cdda(lba, 1) {
            if buf.len() >= SCRAM_SIZE + SUBCODE_SIZE {
                let mut scram = [0u8; SCRAM_SIZE];
                scram.copy_from_slice(&buf[0..SCRAM_SIZE]);
                let mut subcode = [0u8; SUBCODE_SIZE];
                subcode.copy_from_slice(&buf[SCRAM_SIZE..SCRAM_SIZE + SUBCODE_SIZE]);
                store.write_entry(lba, &scram, &subcode, &capture::uniform(ReadState::SuccessC2Off))?;
            }
        }
        lba = lba + 1;
    }

    Ok(())
}

/// ASUS/LG cache mining (SPEC_FULL §4.7 rule 2): pull `window_entries`
/// entries from the drive's internal cache ring and search them for
/// the one whose Q subchannel addresses `target`. Simplified from the
/// full algorithm: searches from the start of the ring each call
/// rather than tracking a running cache index across calls.
fn asus_cache_mine(transport: &Transport, target: Lba, window_entries: u32) -> CdResult<Option<([u8; SCRAM_SIZE], [u8; SUBCODE_SIZE], [u8; C2_SIZE])>> {
    const SUBCODE_OFFSET: usize = 0x930;
    const C2_OFFSET: usize = 0x9A4;

    let raw = transport.asus_cache_read(0, window_entries)?;

    for chunk in raw.chunks_exact(ASUS_CACHE_ENTRY_SIZE) {
        if chunk.len() < SUBCODE_OFFSET + SUBCODE_SIZE || chunk.len() < C2_OFFSET + C2_SIZE {
            continue;
        }

        let mut subcode = [0u8; SUBCODE_SIZE];
        subcode.copy_from_slice(&chunk[SUBCODE_OFFSET..SUBCODE_OFFSET + SUBCODE_SIZE]);

        let q = SubChannelQ::new(extract_channel(&subcode, 1));
        if !q.is_valid() {
            continue;
        }

        if mode1_lba(&q.parse_data()) == Some(target) {
            let mut main = [0u8; SCRAM_SIZE];
            main.copy_from_slice(&chunk[0..SCRAM_SIZE]);
            let mut c2 = [0u8; C2_SIZE];
            c2.copy_from_slice(&chunk[C2_OFFSET..C2_OFFSET + C2_SIZE]);
            return Ok(Some((main, subcode, c2)));
        }
    }

    Ok(None)
}

/// Drive the main sequential dump/refine loop: walk every LBA from
/// the program area start to the current overread boundary, issuing
/// the profile's preferred read method, deriving per-sector state from
/// the C2 bitmap, and writing into `store` (in refine mode, only the
/// better of the old and new state survives).
///
/// `on_progress` is called once per LBA visited, with the LBA just
/// processed and the running stats, so a caller can drive a progress
/// bar (§7) without this loop knowing anything about terminals.
pub fn run(
    transport: &Transport,
    store: &mut Store,
    toc: &Toc,
    profile: &DriveProfile,
    opts: &DumpOptions,
    mut on_progress: impl FnMut(Lba, &DumpStats),
) -> CdResult<DumpStats> {
    be_mode_guard(toc, profile, opts.unsupported)?;
    transport.set_cd_speed(opts.speed_kb_s)?;

    let lba_start = initial_lba_start(toc);
    let mut lba_overread = opts.stop_lba.unwrap_or(toc.lead_out);
    let gap_ranges = multisession_gap_ranges(toc, -150);
    let mut stats = DumpStats::default();

    if profile.can_read_lead_in && !opts.refine {
        plextor_leadin_prepass(transport, store, lba_start)?;
    }

    let mut lba = lba_start;
    while lba < lba_overread {
        if inside_range(lba.as_i32(), &opts.skip_ranges).is_some() {
            on_progress(lba, &stats);
            lba = lba + 1;
            continue;
        }

        let in_gap = inside_range(lba.as_i32(), &gap_ranges).is_some();
        let entering_cache_window = in_gap || lba + 1 == lba_overread;

        if profile.cache == CacheQuirk::AsusCacheMining && entering_cache_window {
            if let Ok(Some((scram, subcode, c2))) = asus_cache_mine(transport, lba, profile.max_read_sectors) {
                let states = derive_states(&c2, ReadState::SuccessScsiOff);
                store.write_entry(lba, &scram, &subcode, &states)?;
                stats.sectors_read += 1;
                on_progress(lba, &stats);
                lba = lba + 1;
                continue;
            }
        }

        if opts.refine {
            let existing = store.read_states(lba)?;
            let needs_refine = capture::any_unreliable(&existing) || (opts.refine_subchannel && !subchannel_ok(store, lba)?);
            if !needs_refine {
                on_progress(lba, &stats);
                lba = lba + 1;
                continue;
            }
        }

        let mut last_err = None;
        let mut wrote = false;

        for _attempt in 0..opts.retries.max(1) {
            match read_one(transport, profile, lba) {
                Ok((scram, c2, subcode)) => {
                    let baseline = read_method_baseline(profile);
                    let mut states = derive_states(&c2, baseline);
                    if in_gap {
                        states = states.map(|s| if s == ReadState::ErrorC2 { baseline } else { s });
                    }

                    let final_states = if opts.refine {
                        let (_, _, prev_states) = store.read_entry(lba)?;
                        capture::better_states(&prev_states, &states)
                    } else {
                        states
                    };
                    store.write_entry(lba, &scram, &subcode, &final_states)?;

                    if states.iter().any(|&s| s == ReadState::ErrorC2) {
                        stats.c2_errors += 1;
                    }
                    if !SubChannelQ::new(extract_channel(&subcode, 1)).is_valid() {
                        stats.q_errors += 1;
                    }

                    stats.sectors_read += 1;
                    wrote = true;
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        if !wrote {
            stats.scsi_errors += 1;
            if !in_gap {
                store.write_entry(lba, &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &capture::uniform(ReadState::ErrorC2))?;
            }
            if let Some(e) = last_err {
                log::warn!("read failed at {lba}: {e}");
            }
        }

        if opts.stop_lba.is_none() {
            if wrote && lba + 1 == lba_overread {
                lba_overread = lba_overread + 1;
            } else if !wrote && lba + 1 == lba_overread {
                lba_overread = lba;
            }
        }

        on_progress(lba, &stats);
        lba = lba + 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcd::Bcd;
    use crate::toc::TocIndex;
    use crate::SessionFormat;

    fn track(track: u8, session: u8, control: u8, start: i32) -> TocTrack {
        TocTrack {
            track: Bcd::from_binary(track).unwrap(),
            session,
            control,
            is_cdi: false,
            indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(start) }],
        }
    }

    #[test]
    fn derive_states_flags_only_the_sample_with_a_set_c2_nibble() {
        let states = derive_states(&[0u8; C2_SIZE], ReadState::Success);
        assert!(states.iter().all(|&s| s == ReadState::Success));

        // byte 5 covers samples 10 (high nibble) and 11 (low nibble).
        let mut c2 = [0u8; C2_SIZE];
        c2[5] = 0xF0;
        let states = derive_states(&c2, ReadState::Success);
        assert_eq!(states[10], ReadState::ErrorC2);
        assert_eq!(states[11], ReadState::Success);
    }

    #[test]
    fn derive_states_d8_baseline_has_no_downgrade() {
        let states = derive_states(&[0u8; C2_SIZE], ReadState::SuccessC2Off);
        assert!(states.iter().all(|&s| s == ReadState::SuccessC2Off));
    }

    #[test]
    fn better_states_prefers_success_over_error() {
        let old = capture::uniform(ReadState::ErrorC2);
        let new = capture::uniform(ReadState::Success);
        assert_eq!(capture::better_states(&old, &new), capture::uniform(ReadState::Success));
        assert_eq!(capture::better_states(&new, &old), capture::uniform(ReadState::Success));
    }

    #[test]
    fn be_guard_rejects_mixed_content() {
        let profile = DriveProfile {
            vendor: "",
            product: "",
            read_method: ReadMethod::Be,
            cache: crate::drive::CacheQuirk::None,
            can_read_lead_in: false,
            max_read_sectors: 27,
            sector_order: crate::drive::SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: -150,
        };
        let toc = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![track(1, 1, 0x04, 0), track(2, 1, 0x00, 20000)],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        assert!(be_mode_guard(&toc, &profile, false).is_err());
        assert!(be_mode_guard(&toc, &profile, true).is_ok());
    }

    #[test]
    fn be_guard_allows_single_format_discs() {
        let profile = DriveProfile {
            vendor: "",
            product: "",
            read_method: ReadMethod::Be,
            cache: crate::drive::CacheQuirk::None,
            can_read_lead_in: false,
            max_read_sectors: 27,
            sector_order: crate::drive::SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: -150,
        };
        let toc = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![track(1, 1, 0x00, 0), track(2, 1, 0x00, 20000)],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        assert!(be_mode_guard(&toc, &profile, false).is_ok());
    }

    #[test]
    fn multisession_gap_spans_session_boundary() {
        let toc = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![track(1, 1, 0x00, 0), track(2, 2, 0x04, 20000)],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        let gaps = multisession_gap_ranges(&toc, -150);
        assert_eq!(gaps, vec![(0, 19850)]);
    }
}
