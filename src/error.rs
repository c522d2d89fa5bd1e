//! Crate-wide error type.
//!
//! Every fallible entry point in this crate returns [`CdResult`]. Component
//! modules are free to return their own narrower error type internally, but
//! fold it into [`Error`] via `#[from]` at the module boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Status bytes returned by a failed SCSI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiStatus {
    pub status_code: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl std::fmt::Display for ScsiStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "status={:#04x} sense_key={:#04x} asc={:#04x} ascq={:#04x}",
            self.status_code, self.sense_key, self.asc, self.ascq
        )
    }
}

/// Crate-wide error sum type.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("SCSI command failed: {0}")]
    Scsi(ScsiStatus),

    #[error("drive not ready")]
    DriveNotReady,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected or corrupted format in `{path}`: {desc}")]
    Format { path: PathBuf, desc: String },

    #[error("{0}")]
    Fatal(String),

    #[error("attempted to access an invalid track number")]
    BadTrack,

    #[error("attempted to access a track past its end")]
    EndOfTrack,

    #[error("the sync pattern at the start of a CD-ROM sector was invalid")]
    BadSyncPattern,

    #[error("attempted to parse invalid BCD data")]
    BadBcd,

    #[error("invalid Q subchannel CRC")]
    InvalidSubQCrc,

    #[error("empty table of contents")]
    EmptyToc,

    #[error("invalid or unexpected MSF format")]
    InvalidMsf,

    #[error("refusing to refine: this does not appear to be the same disc (TOC mismatch)")]
    DifferentDisc,

    #[error("disc contains both data and audio tracks, and the drive's read method (BE) cannot reliably descramble audio-adjacent data; pass --unsupported to override")]
    UnsupportedBeMixedMode,

    #[error("split requested with unfilled read errors remaining; pass --force-split to override")]
    UnfilledErrors,

    #[error("format mismatch: {0}")]
    BadFormat(String),
}

/// Convenience alias for `Result<R, Error>`.
pub type CdResult<R> = std::result::Result<R, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_displayable() {
        let e = Error::BadTrack;
        assert_eq!(e.to_string(), "attempted to access an invalid track number");
    }

    #[test]
    fn scsi_status_formats() {
        let s = ScsiStatus { status_code: 2, sense_key: 5, asc: 0x21, ascq: 0 };
        assert!(Error::Scsi(s).to_string().contains("sense_key=0x05"));
    }
}
