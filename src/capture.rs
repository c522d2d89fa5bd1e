//! Capture store.
//!
//! A capture is three parallel, fixed-stride files sharing one index
//! space (the signed LBA, offset by [`Lba::CAPTURE_ORIGIN`] so every
//! entry — lead-in included — maps to a non-negative file offset):
//!
//! - `.scram`: 2352 raw (still scrambled) bytes per sector.
//! - `.subcode`: 96 bytes of interleaved P-W subcode per sector.
//! - `.state`: 588 [`ReadState`] bytes per sector, one per 4-byte audio
//!   sample, so refine can inherit a sector's still-good samples
//!   instead of re-reading ones that already came back clean.
//!
//! Mirrors the `BinaryBlob` file-handle idiom used for the reader
//! side of this crate's predecessor: a thin wrapper around a `File`
//! with seek-then-read/write at a computed byte offset.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{CdResult, Error};
use crate::lba::Lba;

/// Size in bytes of one raw (scrambled) sector.
pub const SCRAM_SIZE: usize = 2352;
/// Size in bytes of one sector's interleaved subcode.
pub const SUBCODE_SIZE: usize = 96;
/// Number of 4-byte audio samples per sector, and so the number of
/// `.state` bytes per sector.
pub const SAMPLES_PER_SECTOR: usize = 588;

/// Per-sample read outcome, recorded in the `.state` file. Ordered
/// worst to best: the derived `Ord` is what refine uses to decide
/// whether a freshly read sample should replace what's already
/// stored (never downgrade).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReadState {
    /// Never read, or inside a known-bad `--skip` range. Must stay
    /// `0` so a sparse, randomly-offset write into a freshly extended
    /// `.state` file defaults every untouched sample to this state.
    ErrorSkip = 0,
    /// Read, but the drive's C2 bitmap flagged this sample.
    ErrorC2 = 1,
    /// Read without C2 reporting available (the Plextor lead-in CDDA
    /// prepass, or a D8 drive that never returns C2 pointers).
    SuccessC2Off = 2,
    /// Recovered from a vendor cache ring rather than a direct read.
    SuccessScsiOff = 3,
    /// Read cleanly through the normal path with a clean C2 bitmap.
    Success = 4,
}

/// An all-`state` array, for writes where every sample shares one
/// outcome (a lead-in sector with no C2 data, a synthetic test
/// fixture, a fully-failed read).
pub fn uniform(state: ReadState) -> [ReadState; SAMPLES_PER_SECTOR] {
    [state; SAMPLES_PER_SECTOR]
}

/// True if any sample is `ErrorC2` or `ErrorSkip` — unread, skipped,
/// or flagged bad — the refine-needed / needs-synthesis predicate used
/// by both `dump`'s refine gate and `split`'s fill policy.
pub fn any_unreliable(states: &[ReadState; SAMPLES_PER_SECTOR]) -> bool {
    states.iter().any(|&s| s <= ReadState::ErrorC2)
}

/// True if any sample in this sector has ever been read (i.e. is not
/// still at its untouched `ErrorSkip` default).
pub fn any_read(states: &[ReadState; SAMPLES_PER_SECTOR]) -> bool {
    states.iter().any(|&s| s != ReadState::ErrorSkip)
}

/// Keep the better (per the worst-to-best `Ord`) of each corresponding
/// pair of samples from an old and a freshly read state array.
pub fn better_states(old: &[ReadState; SAMPLES_PER_SECTOR], new: &[ReadState; SAMPLES_PER_SECTOR]) -> [ReadState; SAMPLES_PER_SECTOR] {
    std::array::from_fn(|i| old[i].max(new[i]))
}

fn round_up(value: u64, base: u64) -> u64 {
    let base = base - 1;
    (value + base) & !base
}

/// A file-backed capture store rooted at `base_path` (three sibling
/// files: `base_path.scram`, `base_path.subcode`, `base_path.state`).
pub struct Store {
    scram: File,
    subcode: File,
    state: File,
    origin: Lba,
}

impl Store {
    /// Create (or truncate) a fresh capture store at `base_path`.
    pub fn create(base_path: &Path) -> CdResult<Store> {
        Self::open_with(base_path, true)
    }

    /// Open an existing capture store for read/refine.
    pub fn open(base_path: &Path) -> CdResult<Store> {
        Self::open_with(base_path, false)
    }

    fn open_with(base_path: &Path, truncate: bool) -> CdResult<Store> {
        let open = |ext: &str| -> CdResult<File> {
            let path = Self::sibling(base_path, ext);
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(truncate)
                .open(&path)
                .map_err(|e| Error::Format { path, desc: e.to_string() })
        };

        Ok(Store { scram: open("scram")?, subcode: open("subcode")?, state: open("state")?, origin: Lba::CAPTURE_ORIGIN })
    }

    fn sibling(base_path: &Path, ext: &str) -> PathBuf {
        base_path.with_extension(ext)
    }

    fn index(&self, lba: Lba) -> CdResult<u64> {
        let delta = lba.checked_sub_lba(self.origin).ok_or(Error::InvalidMsf)?;
        if delta < 0 {
            return Err(Error::Format { path: PathBuf::from("<capture>"), desc: format!("{lba} is before the capture origin") });
        }
        Ok(delta as u64)
    }

    /// Write one sector's worth of data at `lba`, with one
    /// [`ReadState`] per sample.
    pub fn write_entry(&mut self, lba: Lba, scram: &[u8; SCRAM_SIZE], subcode: &[u8; SUBCODE_SIZE], states: &[ReadState; SAMPLES_PER_SECTOR]) -> CdResult<()> {
        let index = self.index(lba)?;

        self.scram.seek(SeekFrom::Start(index * SCRAM_SIZE as u64)).map_err(Error::Io)?;
        self.scram.write_all(scram).map_err(Error::Io)?;

        self.subcode.seek(SeekFrom::Start(index * SUBCODE_SIZE as u64)).map_err(Error::Io)?;
        self.subcode.write_all(subcode).map_err(Error::Io)?;

        let state_bytes: [u8; SAMPLES_PER_SECTOR] = std::array::from_fn(|i| states[i].into());
        self.state.seek(SeekFrom::Start(index * SAMPLES_PER_SECTOR as u64)).map_err(Error::Io)?;
        self.state.write_all(&state_bytes).map_err(Error::Io)?;

        Ok(())
    }

    /// Read back one sector's worth of data at `lba`.
    pub fn read_entry(&mut self, lba: Lba) -> CdResult<([u8; SCRAM_SIZE], [u8; SUBCODE_SIZE], [ReadState; SAMPLES_PER_SECTOR])> {
        let index = self.index(lba)?;

        let mut scram = [0u8; SCRAM_SIZE];
        self.scram.seek(SeekFrom::Start(index * SCRAM_SIZE as u64)).map_err(Error::Io)?;
        self.scram.read_exact(&mut scram).map_err(Error::Io)?;

        let mut subcode = [0u8; SUBCODE_SIZE];
        self.subcode.seek(SeekFrom::Start(index * SUBCODE_SIZE as u64)).map_err(Error::Io)?;
        self.subcode.read_exact(&mut subcode).map_err(Error::Io)?;

        let states = self.read_states(lba)?;

        Ok((scram, subcode, states))
    }

    /// Read just the per-sample state bytes for `lba`, without
    /// touching the (much larger) scram/subcode files. Used by the
    /// refine loop's pass to find sectors still needing a reread, and
    /// by the protection scanner.
    pub fn read_states(&mut self, lba: Lba) -> CdResult<[ReadState; SAMPLES_PER_SECTOR]> {
        let index = self.index(lba)?;
        let mut state_bytes = [0u8; SAMPLES_PER_SECTOR];
        self.state.seek(SeekFrom::Start(index * SAMPLES_PER_SECTOR as u64)).map_err(Error::Io)?;

        match self.state.read_exact(&mut state_bytes) {
            Ok(()) => Ok(std::array::from_fn(|i| ReadState::try_from_primitive(state_bytes[i]).unwrap_or(ReadState::ErrorSkip))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(uniform(ReadState::ErrorSkip)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read `out.len()` raw scrambled bytes starting `byte_shift` bytes
    /// into the sector at `lba` (negative shifts reach back into the
    /// previous sector). Used by the offset detector and the split
    /// engine, which both need byte-granular access across sector
    /// boundaries once a drive's write offset is known.
    pub fn read_scram_at(&mut self, lba: Lba, byte_shift: i64, out: &mut [u8]) -> CdResult<()> {
        let index = self.index(lba)? as i64;
        let pos = index * SCRAM_SIZE as i64 + byte_shift;
        if pos < 0 {
            return Err(Error::Format { path: PathBuf::from("<capture>"), desc: "offset read starts before the capture origin".into() });
        }

        self.scram.seek(SeekFrom::Start(pos as u64)).map_err(Error::Io)?;
        self.scram.read_exact(out).map_err(Error::Io)
    }

    /// Number of sectors currently represented by the `.state` file
    /// (`file_size(.state) / SAMPLES_PER_SECTOR`).
    pub fn sector_count(&mut self) -> CdResult<u64> {
        let bytes = self.state.seek(SeekFrom::End(0)).map_err(Error::Io)?;
        Ok(bytes / SAMPLES_PER_SECTOR as u64)
    }

    /// Pad all three files out so their lengths are aligned to a
    /// `sector_stride`-sector boundary, writing `ReadState::ErrorSkip`
    /// (and zeroed data) into the gap. Used after a capture run ends
    /// mid-stride so every subsequent offset computation stays exact.
    pub fn write_align(&mut self, sector_stride: u64) -> CdResult<()> {
        let sectors = self.sector_count()?;
        let aligned = round_up(sectors.max(1), sector_stride);
        if aligned == sectors {
            return Ok(());
        }

        for i in sectors..aligned {
            let lba = Lba::new(self.origin.as_i32() + i as i32);
            self.write_entry(lba, &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &uniform(ReadState::ErrorSkip))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_an_entry() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();

        let lba = Lba::new(0);
        let scram = [0x42u8; SCRAM_SIZE];
        let subcode = [0x7eu8; SUBCODE_SIZE];
        store.write_entry(lba, &scram, &subcode, &uniform(ReadState::Success)).unwrap();

        let (r_scram, r_subcode, states) = store.read_entry(lba).unwrap();
        assert_eq!(r_scram, scram);
        assert_eq!(r_subcode, subcode);
        assert_eq!(states, uniform(ReadState::Success));
    }

    #[test]
    fn unwritten_entry_reads_as_error_skip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();
        store.write_entry(Lba::new(10), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &uniform(ReadState::Success)).unwrap();

        assert_eq!(store.read_states(Lba::new(5)).unwrap(), uniform(ReadState::ErrorSkip));
    }

    #[test]
    fn state_file_is_588_bytes_per_sector() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();
        for i in 0..3 {
            store.write_entry(Lba::new(i), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &uniform(ReadState::Success)).unwrap();
        }

        let state_path = Store::sibling(&base, "state");
        let len = std::fs::metadata(&state_path).unwrap().len();
        assert_eq!(len, 3 * SAMPLES_PER_SECTOR as u64);
    }

    #[test]
    fn partial_sample_errors_keep_the_rest_of_the_sector_intact() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();

        let mut states = uniform(ReadState::Success);
        states[3] = ReadState::ErrorC2;
        store.write_entry(Lba::new(0), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &states).unwrap();

        let read_back = store.read_states(Lba::new(0)).unwrap();
        assert_eq!(read_back[3], ReadState::ErrorC2);
        assert_eq!(read_back[0], ReadState::Success);
        assert!(any_unreliable(&read_back));
    }

    #[test]
    fn better_states_never_downgrades() {
        let mut old = uniform(ReadState::Success);
        old[0] = ReadState::ErrorC2;
        let mut new = uniform(ReadState::ErrorC2);
        new[0] = ReadState::Success;

        let merged = better_states(&old, &new);
        assert_eq!(merged[0], ReadState::Success);
        assert_eq!(merged[1], ReadState::Success);
    }

    #[test]
    fn write_align_pads_to_stride() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();
        store.write_entry(Lba::new(0), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &uniform(ReadState::Success)).unwrap();

        store.write_align(16).unwrap();
        assert_eq!(store.sector_count().unwrap(), 16);
    }

    #[test]
    fn lba_before_origin_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("capture");
        let mut store = Store::create(&base).unwrap();
        assert!(store.write_entry(Lba::new(-99999), &[0u8; SCRAM_SIZE], &[0u8; SUBCODE_SIZE], &uniform(ReadState::Success)).is_err());
    }
}
