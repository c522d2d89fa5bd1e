//! Cue sheet emission.
//!
//! Renders a [`Toc`] plus the track list the split engine produced
//! into redump-style CUE sheet text: one `FILE`/`TRACK` pair per
//! track, `INDEX 00`/`INDEX 01` positions, a `FLAGS` line aggregated
//! from the Q control nibble, and the `REM LEAD-OUT` / `REM SESSION`
//! / `REM LEAD-IN` / `REM PREGAP` comments multi-session tools expect
//! at session boundaries.

use std::fs;
use std::path::Path;

use crate::error::{CdResult, Error};
use crate::lba::lba_to_msf;
use crate::subchannel::AdrControl;
use crate::toc::Toc;
use crate::{Track, TrackFormat};

/// CUE `TRACK` type tag, collapsed from [`TrackFormat`] (the cue sheet
/// doesn't distinguish XA from CD-i at the track-type level; both are
/// plain `MODE2/2352`).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum CueTrackType {
    Audio,
    Mode1Raw,
    Mode2Raw,
}

impl CueTrackType {
    fn from_format(format: TrackFormat) -> CueTrackType {
        match format {
            TrackFormat::Audio => CueTrackType::Audio,
            TrackFormat::Mode1 => CueTrackType::Mode1Raw,
            TrackFormat::Mode2Xa | TrackFormat::Mode2CdI => CueTrackType::Mode2Raw,
        }
    }

    fn cue_name(self) -> &'static str {
        match self {
            CueTrackType::Audio => "AUDIO",
            CueTrackType::Mode1Raw => "MODE1/2352",
            CueTrackType::Mode2Raw => "MODE2/2352",
        }
    }
}

/// Aggregate the `FLAGS` line contents from a track's Q control
/// nibble: any of 4-channel audio, digital-copy-permitted, or
/// pre-emphasis being set emits the corresponding flag.
fn flags_for(control: AdrControl) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if control.contains(AdrControl::FOUR_CHANNEL) {
        flags.push("4CH");
    }
    if control.contains(AdrControl::DIGITAL_COPY_PERMITTED) {
        flags.push("DCP");
    }
    if control.contains(AdrControl::PRE_EMPHASIS) {
        flags.push("PRE");
    }
    flags
}

/// Per-track output file name: a single-track image keeps the bare
/// image name, a multi-track image gets ` (Track NN)` appended, per
/// the split engine's own naming (SPEC_FULL §4.9).
pub fn track_filename(image_name: &str, number: usize, total: usize, width: usize) -> String {
    if total <= 1 {
        format!("{image_name}.bin")
    } else {
        format!("{image_name} (Track {number:0width$}).bin")
    }
}

/// Render `toc`/`tracks` (as produced by [`crate::split`]) into CUE
/// sheet text for image `image_name`. `tracks` and `toc.tracks` must
/// correspond 1:1 in track order.
pub fn emit(toc: &Toc, tracks: &[Track], image_name: &str) -> String {
    let mut out = String::new();
    let width = tracks.len().to_string().len().max(2);

    let mut sessions: Vec<u8> = toc.tracks.iter().map(|t| t.session).collect();
    sessions.sort_unstable();
    sessions.dedup();

    for session in sessions.iter().skip(1) {
        out.push_str("REM LEAD-OUT 00:90:00\n");
        out.push_str(&format!("REM SESSION {session:02}\n"));
        out.push_str("REM LEAD-IN 00:60:00\n");
        out.push_str("REM PREGAP 00:02:00\n");
    }

    if let Some(mcn) = &toc.mcn {
        out.push_str(&format!("CATALOG {mcn}\n"));
    }

    for (i, (track, toc_track)) in tracks.iter().zip(toc.tracks.iter()).enumerate() {
        let number = i + 1;
        let filename = track_filename(image_name, number, tracks.len(), width);
        out.push_str(&format!("FILE \"{filename}\" BINARY\n"));

        let ty = CueTrackType::from_format(track.format);
        out.push_str(&format!("  TRACK {number:0width$} {}\n", ty.cue_name()));

        let flags = flags_for(track.control);
        if !flags.is_empty() {
            out.push_str(&format!("    FLAGS {}\n", flags.join(" ")));
        }

        let index1 = toc_track.start_lba();
        if let Some(pregap) = toc_track.pregap_lba() {
            if pregap < index1 {
                let (m, s, f) = lba_to_msf(pregap);
                out.push_str(&format!("    INDEX 00 {m:02}:{s:02}:{f:02}\n"));
            }
        }

        let (m, s, f) = lba_to_msf(index1);
        out.push_str(&format!("    INDEX 01 {m:02}:{s:02}:{f:02}\n"));
    }

    out
}

/// Render and write the cue sheet for `image_name` into `out_dir` as
/// `{image_name}.cue`.
pub fn write_cue(toc: &Toc, tracks: &[Track], image_name: &str, out_dir: &Path) -> CdResult<()> {
    let text = emit(toc, tracks, image_name);
    let path = out_dir.join(format!("{image_name}.cue"));
    fs::write(path, text).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcd::Bcd;
    use crate::lba::Lba;
    use crate::msf::Msf;
    use crate::toc::{TocIndex, TocTrack};
    use crate::SessionFormat;

    fn fixture() -> (Toc, Vec<Track>) {
        let toc = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![
                TocTrack {
                    track: Bcd::from_binary(1).unwrap(),
                    session: 1,
                    control: 0x04,
                    is_cdi: false,
                    indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(0) }],
                },
                TocTrack {
                    track: Bcd::from_binary(2).unwrap(),
                    session: 1,
                    control: 0x20,
                    is_cdi: false,
                    indices: vec![
                        TocIndex { index: Bcd::zero(), start: Lba::new(19850) },
                        TocIndex { index: Bcd::one(), start: Lba::new(20000) },
                    ],
                },
            ],
            lead_out: Lba::new(40000),
            mcn: Some("0123456789012".to_string()),
        };

        let tracks = vec![
            Track {
                track: Bcd::from_binary(1).unwrap(),
                format: TrackFormat::Mode1,
                start: Msf::zero(),
                length: Msf::from_binary(0, 0, 1).unwrap(),
                control: AdrControl::DATA,
            },
            Track {
                track: Bcd::from_binary(2).unwrap(),
                format: TrackFormat::Audio,
                start: Msf::zero(),
                length: Msf::from_binary(0, 0, 1).unwrap(),
                control: AdrControl::DIGITAL_COPY_PERMITTED,
            },
        ];

        (toc, tracks)
    }

    #[test]
    fn emits_track_types_and_catalog() {
        let (toc, tracks) = fixture();
        let cue = emit(&toc, &tracks, "image");

        assert!(cue.contains("CATALOG 0123456789012"));
        assert!(cue.contains("TRACK 01 MODE1/2352"));
        assert!(cue.contains("TRACK 02 AUDIO"));
        assert!(cue.contains("FLAGS DCP"));
    }

    #[test]
    fn emits_pregap_index_zero_only_when_present() {
        let (toc, tracks) = fixture();
        let cue = emit(&toc, &tracks, "image");

        assert!(cue.contains("INDEX 00 04:26:50"));
        assert_eq!(cue.matches("INDEX 00").count(), 1);
    }

    #[test]
    fn single_track_image_keeps_bare_filename() {
        let (toc, tracks) = fixture();
        let cue = emit(&toc, &tracks[0..1], "image");
        assert!(cue.contains("FILE \"image.bin\" BINARY"));
    }

    #[test]
    fn multi_track_image_names_each_file() {
        let (toc, tracks) = fixture();
        let cue = emit(&toc, &tracks, "image");
        assert!(cue.contains("FILE \"image.bin\" BINARY"));
        assert!(cue.contains("FILE \"image (Track 02).bin\" BINARY"));
    }
}
