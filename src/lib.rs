//! Raw optical disc dumping, subchannel reconciliation and
//! redump-style track splitting.
//!
//! The pipeline is split into three phases: a *dump* phase that pulls
//! raw sectors and subchannel data off a drive into a [`capture`]
//! store, a *refine* phase that repeatedly rereads unreliable sectors
//! until the subchannel Q reconstructs a consistent [`toc::Toc`], and a
//! *split* phase that slices the capture into redump-compatible track
//! files plus a cue sheet.

#![warn(missing_docs)]

pub mod bcd;
pub mod capture;
pub mod config;
pub mod crc16;
pub mod cue;
pub mod drive;
pub mod dump;
pub mod ecc;
pub mod edc;
pub mod error;
pub mod lba;
pub mod msf;
pub mod offset;
pub mod protection;
pub mod ranges;
pub mod scrambler;
pub mod scsi;
pub mod sector;
pub mod split;
pub mod subchannel;
pub mod toc;

pub use bcd::Bcd;
pub use error::{CdResult, Error};
pub use lba::Lba;
pub use msf::Msf;
pub use sector::Sector;
pub use toc::Toc;

/// Abstract read-only interface to an image format. Implemented
/// directly by [`capture::Store`] and by the redump track set emitted
/// by [`split`].
pub trait Image {
    /// Return a string identifying the image format in a
    /// human-readable way.
    fn image_format(&self) -> String;

    /// Read a single sector at the given absolute LBA.
    fn read_sector(&mut self, position: Lba) -> CdResult<Sector>;

    /// Get the table of contents.
    fn toc(&self) -> &Toc;
}

/// Struct representing a track's attributes
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, Eq)]
pub struct Track {
    /// Track number
    pub track: Bcd,
    /// Track format
    pub format: TrackFormat,
    /// Absolute MSF for the first sector of the track
    pub start: Msf,
    /// Length of the track
    pub length: Msf,
    /// Value of the control bits for this track (upper 4 bits of the
    /// first byte of SUBQ data: pre-emphasis, audio/data flag,
    /// digital copy flag and 4-channel audio flag)
    pub control: subchannel::AdrControl,
}

impl Track {
    /// Return the absolute Msf for the position `track_msf` in
    /// `track`. Returns an error if `track_msf` is outside of the
    /// track.
    pub fn absolute_msf(&self, track_msf: Msf) -> CdResult<Msf> {
        if track_msf < self.length {
            self.start.checked_add(track_msf).ok_or(Error::InvalidMsf)
        } else {
            Err(Error::EndOfTrack)
        }
    }

    /// Return the absolute LBA for the position `track_msf` in
    /// `track`.
    pub fn lba(&self, track_msf: Msf) -> CdResult<Lba> {
        self.absolute_msf(track_msf).map(lba::bcdmsf_to_lba)
    }
}

/// Possible session formats.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SessionFormat {
    /// CD-DA (audio CD, "red book" specification) or CD-ROM ("yellow
    /// book" specification) session
    CdDaCdRom,
    /// CD-i (compact disc interactive, "green book"
    /// specification). Used on Philips' CD-i console.
    Cdi,
    /// CD-ROM XA (extended architecture). Used on Sony's PlayStation
    /// console.
    CdXa,
}

/// Possible track types
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrackFormat {
    /// CD-DA audio track (red book audio)
    Audio,
    /// CD-ROM Mode1 data
    Mode1,
    /// CD-ROM XA Mode 2 data
    Mode2Xa,
    /// CD-i Mode 2 data
    Mode2CdI,
}

impl TrackFormat {
    /// Return the CD-ROM mode for this track format, or `None` if
    /// this is not a CD-ROM format
    pub fn cdrom_mode(self) -> Option<sector::CdRomMode> {
        let m = match self {
            TrackFormat::Mode1 => sector::CdRomMode::Mode1,
            TrackFormat::Mode2Xa => sector::CdRomMode::Mode2,
            TrackFormat::Mode2CdI => sector::CdRomMode::Mode2,
            _ => return None,
        };

        Some(m)
    }

    /// Return true if this is a CD-ROM track
    pub fn is_cdrom(self) -> bool {
        self.cdrom_mode().is_some()
    }

    /// Returns true if this is an audio track
    pub fn is_audio(self) -> bool {
        self == TrackFormat::Audio
    }
}
