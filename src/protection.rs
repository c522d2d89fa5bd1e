//! Copy-protection scanner (C11).
//!
//! Some PS2 discs substitute a deliberately unreadable run of sectors
//! inside their own filesystem for a region a naive dumper would
//! otherwise retry forever. This module recognizes the Datel pattern:
//! a single data track whose ISO9660 root directory's first file
//! (`DATA.DAT` or `BIG.DAT`, whichever extent is lower) starts at LBA
//! 23, followed by a contiguous run of C2-errored sectors somewhere in
//! LBA 25..5000. Once found, that run can be folded into the
//! skip-range set so refine/split treat it as expected-bad instead of
//! fatal.

use crate::capture::{self, ReadState, Store, SCRAM_SIZE};
use crate::error::CdResult;
use crate::lba::Lba;
use crate::ranges::Range;
use crate::scrambler;
use crate::toc::Toc;

const SCAN_START_LBA: i32 = 25;
const SCAN_END_LBA: i32 = 5000;
const PROTECTED_FILE_LBA: u32 = 23;

/// One located protection instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionFinding {
    /// Name of the filesystem entry that triggered the match
    /// (`DATA.DAT` or `BIG.DAT`).
    pub filename: String,
    /// The contiguous C2-errored LBA range found past the file.
    pub range: Range,
}

impl ProtectionFinding {
    /// Human-readable summary line.
    pub fn describe(&self) -> String {
        format!(
            "PS2/Datel {}, C2: {}, range: {}-{}",
            self.filename,
            self.range.1 - self.range.0,
            self.range.0,
            self.range.1 - 1
        )
    }
}

fn read_descrambled(store: &mut Store, lba: Lba, byte_shift: i64) -> CdResult<Option<[u8; SCRAM_SIZE]>> {
    let mut buf = [0u8; SCRAM_SIZE];
    store.read_scram_at(lba, byte_shift, &mut buf)?;
    Ok(if scrambler::descramble_sector(&mut buf, None) { Some(buf) } else { None })
}

struct DirEntry {
    name: String,
    extent_lba: u32,
}

/// Walk one directory extent's raw 2048-byte user data for its
/// records, following the ISO9660 `DirectoryRecord` layout: a 1-byte
/// length prefix, the extent LBA (LE u32) at offset 2, the identifier
/// length at offset 32, and the identifier itself from offset 33.
fn parse_directory_records(data: &[u8]) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos + 33 <= data.len() {
        let len = data[pos] as usize;
        if len == 0 || pos + len > data.len() {
            break;
        }

        let name_len = data[pos + 32] as usize;
        let name_start = pos + 33;
        if name_start + name_len <= data.len() {
            let raw = &data[name_start..name_start + name_len];
            let name = String::from_utf8_lossy(raw).split(';').next().unwrap_or("").to_string();
            let extent_lba = u32::from_le_bytes([data[pos + 2], data[pos + 3], data[pos + 4], data[pos + 5]]);
            entries.push(DirEntry { name, extent_lba });
        }

        pos += len;
    }

    entries
}

/// Locate the Primary Volume Descriptor at `track_start + 16` and
/// walk its root directory extent, returning every entry found.
fn root_directory_entries(store: &mut Store, track_start: Lba, write_offset: i32) -> CdResult<Vec<DirEntry>> {
    let byte_shift = write_offset as i64 * 4;

    let pvd = match read_descrambled(store, track_start + 16, byte_shift)? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };

    let user = &pvd[16..2064];
    if user[0] != 1 {
        return Ok(Vec::new());
    }

    let root_record = &user[156..156 + 34];
    let root_extent = u32::from_le_bytes([root_record[2], root_record[3], root_record[4], root_record[5]]);
    let root_size = u32::from_le_bytes([root_record[10], root_record[11], root_record[12], root_record[13]]);
    let root_sectors = (root_size + 2047) / 2048;

    let mut entries = Vec::new();
    for i in 0..root_sectors.max(1) {
        let lba = track_start + (root_extent + i) as i32;
        let sector = match read_descrambled(store, lba, byte_shift)? {
            Some(s) => s,
            None => break,
        };
        entries.extend(parse_directory_records(&sector[16..2064]));
    }

    Ok(entries)
}

/// Scan a single-data-track disc for the PS2 Datel fake-TOC pattern.
/// Returns `None` if the disc has more than one track, the sole track
/// isn't data, or no `DATA.DAT`/`BIG.DAT` entry starts at LBA 23.
pub fn scan(store: &mut Store, toc: &Toc, write_offset: i32) -> CdResult<Option<ProtectionFinding>> {
    if toc.tracks.len() != 1 || !toc.tracks[0].is_data() {
        return Ok(None);
    }

    let track_start = toc.tracks[0].start_lba();
    let entries = root_directory_entries(store, track_start, write_offset)?;

    let protected = entries
        .iter()
        .filter(|e| e.name == "DATA.DAT" || e.name == "BIG.DAT")
        .min_by_key(|e| e.extent_lba);

    let protected = match protected {
        Some(e) if e.extent_lba == PROTECTED_FILE_LBA => e,
        _ => return Ok(None),
    };

    let scan_end = SCAN_END_LBA.min(toc.lead_out.as_i32());
    let mut range: Option<Range> = None;

    for lba in SCAN_START_LBA..scan_end {
        // Only a confirmed C2 error counts as the protected run; an
        // unread/skipped sector doesn't distinguish "protected" from
        // "we just haven't captured this disc region yet".
        let errored = store.read_states(Lba::new(lba))?.iter().any(|&s| s == ReadState::ErrorC2);

        match (&mut range, errored) {
            (Some(r), true) => r.1 = lba + 1,
            (Some(_), false) => break,
            (None, true) => range = Some((lba, lba + 1)),
            (None, false) => {}
        }
    }

    Ok(range.map(|r| ProtectionFinding { filename: protected.name.clone(), range: r }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcd::Bcd;
    use crate::capture::SUBCODE_SIZE;
    use crate::toc::{TocIndex, TocTrack};
    use crate::SessionFormat;
    use tempfile::tempdir;

    const SYNC: [u8; 12] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

    fn data_sector(lba: Lba, user: &[u8]) -> [u8; SCRAM_SIZE] {
        let mut sector = [0u8; SCRAM_SIZE];
        sector[0..12].copy_from_slice(&SYNC);
        let msf = crate::lba::lba_to_bcdmsf(lba).unwrap().into_bcd();
        sector[12] = msf.0.bcd();
        sector[13] = msf.1.bcd();
        sector[14] = msf.2.bcd();
        sector[15] = 1;
        sector[16..16 + user.len()].copy_from_slice(user);
        sector
    }

    fn build_record(identifier: &[u8], extent_lba: u32, size: u32) -> Vec<u8> {
        let id_len = identifier.len();
        let mut len = 33 + id_len;
        if len % 2 == 1 {
            len += 1;
        }
        let mut rec = vec![0u8; len];
        rec[0] = len as u8;
        rec[2..6].copy_from_slice(&extent_lba.to_le_bytes());
        rec[6..10].copy_from_slice(&extent_lba.to_be_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[14..18].copy_from_slice(&size.to_be_bytes());
        rec[32] = id_len as u8;
        rec[33..33 + id_len].copy_from_slice(identifier);
        rec
    }

    fn write_scrambled(store: &mut Store, lba: Lba, sector: [u8; SCRAM_SIZE], state: ReadState) {
        let mut scrambled = sector;
        scrambler::process(&mut scrambled, 0);
        store.write_entry(lba, &scrambled, &[0u8; SUBCODE_SIZE], &capture::uniform(state)).unwrap();
    }

    fn toc_with_single_data_track(lead_out: i32) -> Toc {
        Toc {
            disc_type: SessionFormat::CdXa,
            tracks: vec![TocTrack {
                track: Bcd::from_binary(1).unwrap(),
                session: 1,
                control: 0x04,
                is_cdi: false,
                indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(0) }],
            }],
            lead_out: Lba::new(lead_out),
            mcn: None,
        }
    }

    #[test]
    fn detects_ps2_datel_pattern() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        let mut pvd_user = vec![0u8; 2048];
        pvd_user[0] = 1;
        let root_record = build_record(&[0u8], 20, 2048);
        pvd_user[156..156 + root_record.len()].copy_from_slice(&root_record);
        write_scrambled(&mut store, Lba::new(16), data_sector(Lba::new(16), &pvd_user), ReadState::Success);

        let mut dir_user = vec![0u8; 2048];
        let mut pos = 0;
        for rec in [build_record(&[0u8], 20, 2048), build_record(&[1u8], 20, 2048), build_record(b"DATA.DAT;1", 23, 1_000_000)] {
            dir_user[pos..pos + rec.len()].copy_from_slice(&rec);
            pos += rec.len();
        }
        write_scrambled(&mut store, Lba::new(20), data_sector(Lba::new(20), &dir_user), ReadState::Success);

        for lba in 21..100 {
            let state = if (30..40).contains(&lba) { ReadState::ErrorC2 } else { ReadState::Success };
            store.write_entry(Lba::new(lba), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &capture::uniform(state)).unwrap();
        }

        let toc = toc_with_single_data_track(100_000);
        let finding = scan(&mut store, &toc, 0).unwrap().unwrap();
        assert_eq!(finding.filename, "DATA.DAT");
        assert_eq!(finding.range, (30, 40));
        assert_eq!(finding.describe(), "PS2/Datel DATA.DAT, C2: 10, range: 30-39");
    }

    #[test]
    fn ignores_multi_track_discs() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        let toc = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![
                TocTrack { track: Bcd::from_binary(1).unwrap(), session: 1, control: 0x04, is_cdi: false, indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(0) }] },
                TocTrack { track: Bcd::from_binary(2).unwrap(), session: 1, control: 0x00, is_cdi: false, indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(20000) }] },
            ],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        assert_eq!(scan(&mut store, &toc, 0).unwrap(), None);
    }

    #[test]
    fn no_match_when_file_starts_elsewhere() {
        let dir = tempdir().unwrap();
        let mut store = Store::create(&dir.path().join("capture")).unwrap();

        let mut pvd_user = vec![0u8; 2048];
        pvd_user[0] = 1;
        let root_record = build_record(&[0u8], 20, 2048);
        pvd_user[156..156 + root_record.len()].copy_from_slice(&root_record);
        write_scrambled(&mut store, Lba::new(16), data_sector(Lba::new(16), &pvd_user), ReadState::Success);

        let mut dir_user = vec![0u8; 2048];
        let rec = build_record(b"DATA.DAT;1", 99, 1_000_000);
        dir_user[0..rec.len()].copy_from_slice(&rec);
        write_scrambled(&mut store, Lba::new(20), data_sector(Lba::new(20), &dir_user), ReadState::Success);

        let toc = toc_with_single_data_track(100_000);
        assert_eq!(scan(&mut store, &toc, 0).unwrap(), None);
    }
}
