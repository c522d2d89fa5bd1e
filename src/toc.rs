//! Table of contents model, parsing and reconciliation.
//!
//! A disc's table of contents is read twice during a dump: once from
//! the drive's own READ TOC/FULL TOC response (fast, but occasionally
//! wrong about pregap lengths or CD-i/XA session typing, and sometimes
//! outright lied to by copy protection), and once by walking the Q
//! subchannel of every sector captured (slow, but ground truth).
//! [`Toc::reconcile`] merges the two: the subcode-built QTOC wins on
//! indices and lengths, the drive TOC wins when the subcode run was
//! too short to observe a track at all, and any track the QTOC saw
//! that the drive never reported at all is appended outright — unless
//! `--force-toc` says to trust the drive's track list as final.

use crate::bcd::Bcd;
use crate::error::{CdResult, Error};
use crate::lba::{bcdmsf_to_lba, Lba};
use crate::msf::Msf;
use crate::subchannel::{QData, SubChannelQ};
use crate::SessionFormat;

/// One INDEX entry: the index number and the absolute LBA it starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocIndex {
    pub index: Bcd,
    pub start: Lba,
}

/// One track's worth of TOC data.
#[derive(Debug, Clone)]
pub struct TocTrack {
    pub track: Bcd,
    pub session: u8,
    pub control: u8,
    pub is_cdi: bool,
    pub indices: Vec<TocIndex>,
}

impl TocTrack {
    /// True if this track carries CD-ROM data (control bit 2 set).
    pub fn is_data(&self) -> bool {
        self.control & 0x4 != 0
    }

    /// LBA of INDEX 01 (the start of the track proper, after the
    /// pregap), or the first index if INDEX 01 was never observed.
    pub fn start_lba(&self) -> Lba {
        self.indices
            .iter()
            .find(|i| i.index.bcd() == 1)
            .or_else(|| self.indices.first())
            .map(|i| i.start)
            .unwrap_or(Lba::new(0))
    }

    /// LBA of INDEX 00 (the pregap start), if a pregap was recorded.
    pub fn pregap_lba(&self) -> Option<Lba> {
        self.indices.iter().find(|i| i.index.bcd() == 0).map(|i| i.start)
    }
}

/// The disc's full table of contents.
#[derive(Debug, Clone)]
pub struct Toc {
    pub disc_type: SessionFormat,
    pub tracks: Vec<TocTrack>,
    pub lead_out: Lba,
    pub mcn: Option<String>,
}

impl Toc {
    /// Look up the track containing `lba`, if any (lead-in returns `None`).
    pub fn track_at(&self, lba: Lba) -> Option<&TocTrack> {
        let mut candidate = None;
        for track in &self.tracks {
            if track.start_lba() <= lba {
                candidate = Some(track);
            }
        }
        candidate.filter(|t| lba < self.lead_out)
    }

    /// Retrieve a track by its BCD track number.
    pub fn track(&self, track: Bcd) -> Option<&TocTrack> {
        self.tracks.iter().find(|t| t.track == track)
    }

    /// Parse a standard (format 0000) READ TOC/PMA/ATIP response: a
    /// 4-byte header (length, first/last track) followed by 8-byte
    /// track descriptors.
    pub fn parse_toc(raw: &[u8]) -> CdResult<Toc> {
        if raw.len() < 4 {
            return Err(Error::Format { path: "<toc>".into(), desc: "short TOC response".into() });
        }

        let mut tracks = Vec::new();
        let mut lead_out = Lba::new(0);

        for chunk in raw[4..].chunks_exact(8) {
            let control = chunk[1] & 0x0f;
            let track_no = chunk[2];
            let lba = i32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);

            if track_no == 0xaa {
                lead_out = Lba::new(lba);
                continue;
            }

            let track = Bcd::from_binary(track_no).ok_or(Error::BadTrack)?;
            tracks.push(TocTrack {
                track,
                session: 1,
                control,
                is_cdi: false,
                indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(lba) }],
            });
        }

        if tracks.is_empty() {
            return Err(Error::EmptyToc);
        }

        Ok(Toc { disc_type: SessionFormat::CdDaCdRom, tracks, lead_out, mcn: None })
    }

    /// Parse a FULL TOC (format 0010) response. Unlike the plain TOC
    /// this includes per-session lead-in point descriptors (`0xa0`,
    /// `0xa1`, `0xa2`) that carry the disc's session format.
    pub fn parse_full_toc(raw: &[u8]) -> CdResult<Toc> {
        if raw.len() < 4 {
            return Err(Error::Format { path: "<full-toc>".into(), desc: "short FULL TOC response".into() });
        }

        let mut tracks: Vec<TocTrack> = Vec::new();
        let mut lead_out = Lba::new(0);
        let mut disc_type = SessionFormat::CdDaCdRom;

        for chunk in raw[4..].chunks_exact(11) {
            let session = chunk[0];
            let control = chunk[1] & 0x0f;
            let point = chunk[3];
            let pmin = chunk[8];
            let psec = chunk[9];
            let pframe = chunk[10];

            let msf = Msf::from_binary(pmin, psec, pframe).ok_or(Error::InvalidMsf)?;
            let lba = bcdmsf_to_lba(msf);

            match point {
                0xa0 => {
                    disc_type = match psec {
                        0x00 => SessionFormat::CdDaCdRom,
                        0x10 => SessionFormat::Cdi,
                        0x20 => SessionFormat::CdXa,
                        _ => disc_type,
                    };
                }
                0xa2 => lead_out = lba,
                0x01..=0x63 => {
                    let track = Bcd::from_binary(point).ok_or(Error::BadTrack)?;
                    tracks.push(TocTrack {
                        track,
                        session,
                        control,
                        is_cdi: false,
                        indices: vec![TocIndex { index: Bcd::one(), start: lba }],
                    });
                }
                _ => {}
            }
        }

        if tracks.is_empty() {
            return Err(Error::EmptyToc);
        }

        Ok(Toc { disc_type, tracks, lead_out, mcn: None })
    }

    /// Build a "QTOC" by walking a run of decoded Q-subchannel blocks
    /// (typically the program area of a capture) and collecting every
    /// INDEX transition actually observed.
    pub fn from_subq(entries: &[SubChannelQ], lead_out: Lba) -> CdResult<Toc> {
        let mut tracks: Vec<TocTrack> = Vec::new();
        let mut mcn = None;

        for q in entries {
            if !q.is_valid() {
                continue;
            }

            match q.parse_data() {
                QData::Mode1(track, index, _, ap_msf) => {
                    let lba = bcdmsf_to_lba(ap_msf);
                    let entry = match tracks.iter_mut().find(|t| t.track == track) {
                        Some(t) => t,
                        None => {
                            tracks.push(TocTrack {
                                track,
                                session: 1,
                                control: 0,
                                is_cdi: false,
                                indices: Vec::new(),
                            });
                            tracks.last_mut().unwrap()
                        }
                    };

                    if !entry.indices.iter().any(|i| i.index == index) {
                        entry.indices.push(TocIndex { index, start: lba });
                    }
                }
                QData::Mcn(digits, _) => mcn = Some(digits),
                _ => {}
            }
        }

        if tracks.is_empty() {
            return Err(Error::EmptyToc);
        }

        for track in &mut tracks {
            track.indices.sort_by_key(|i| i.index.bcd());
        }
        tracks.sort_by_key(|t| t.track.bcd());

        Ok(Toc { disc_type: SessionFormat::CdDaCdRom, tracks, lead_out, mcn })
    }

    /// Reconcile a drive-reported TOC (`self`) with a subcode-derived
    /// QTOC (`observed`): indices and control bits from `observed`
    /// win wherever a track was actually seen; tracks absent from
    /// `observed` (too short a capture, or a fake TOC substituted by
    /// copy protection) fall back to the drive's own report. Any track
    /// the QTOC saw that the drive never reported at all — a hidden
    /// track a fake TOC omitted — is appended after the merge, unless
    /// `force_toc` is set, in which case the drive's track list is
    /// trusted as complete and such tracks are dropped.
    pub fn reconcile(&self, observed: &Toc, force_toc: bool) -> Toc {
        let mut tracks = Vec::with_capacity(self.tracks.len());

        for drive_track in &self.tracks {
            if let Some(obs) = observed.track(drive_track.track) {
                let mut merged = obs.clone();
                merged.control = drive_track.control;
                merged.session = drive_track.session;
                tracks.push(merged);
            } else {
                tracks.push(drive_track.clone());
            }
        }

        if !force_toc {
            for obs_track in &observed.tracks {
                if self.track(obs_track.track).is_none() {
                    tracks.push(obs_track.clone());
                }
            }
            tracks.sort_by_key(|t| t.track.bcd());
        }

        Toc {
            disc_type: observed.disc_type,
            tracks,
            lead_out: self.lead_out,
            mcn: observed.mcn.clone().or_else(|| self.mcn.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toc_bytes(tracks: &[(u8, u8, i32)], lead_out_lba: i32) -> Vec<u8> {
        let mut buf = vec![0u8, 0, tracks.first().map(|t| t.0).unwrap_or(1), tracks.last().map(|t| t.0).unwrap_or(1)];
        for &(track, control, lba) in tracks {
            buf.extend_from_slice(&[0, control, track, 0]);
            buf.extend_from_slice(&lba.to_be_bytes());
        }
        buf.extend_from_slice(&[0, 0x14, 0xaa, 0]);
        buf.extend_from_slice(&lead_out_lba.to_be_bytes());
        let len = (buf.len() - 2) as u16;
        buf[0] = (len >> 8) as u8;
        buf[1] = len as u8;
        buf
    }

    #[test]
    fn parses_simple_toc() {
        let raw = toc_bytes(&[(1, 0x04, 0), (2, 0x00, 20000)], 40000);
        let toc = Toc::parse_toc(&raw).unwrap();
        assert_eq!(toc.tracks.len(), 2);
        assert_eq!(toc.lead_out, Lba::new(40000));
        assert!(toc.tracks[0].is_data());
        assert!(!toc.tracks[1].is_data());
    }

    #[test]
    fn track_at_finds_containing_track() {
        let raw = toc_bytes(&[(1, 0x04, 0), (2, 0x00, 20000)], 40000);
        let toc = Toc::parse_toc(&raw).unwrap();
        let track = toc.track_at(Lba::new(20500)).unwrap();
        assert_eq!(track.track, Bcd::from_binary(2).unwrap());
    }

    #[test]
    fn reconcile_prefers_observed_indices() {
        let drive = Toc::parse_toc(&toc_bytes(&[(1, 0x04, 0)], 10000)).unwrap();

        let observed = Toc {
            disc_type: SessionFormat::CdXa,
            tracks: vec![TocTrack {
                track: Bcd::from_binary(1).unwrap(),
                session: 1,
                control: 0,
                is_cdi: false,
                indices: vec![
                    TocIndex { index: Bcd::zero(), start: Lba::new(-150) },
                    TocIndex { index: Bcd::one(), start: Lba::new(0) },
                ],
            }],
            lead_out: Lba::new(10000),
            mcn: Some("1234567890123".to_string()),
        };

        let merged = drive.reconcile(&observed, false);
        assert_eq!(merged.disc_type, SessionFormat::CdXa);
        assert_eq!(merged.tracks[0].pregap_lba(), Some(Lba::new(-150)));
        assert_eq!(merged.tracks[0].control, 0x04);
        assert_eq!(merged.mcn.as_deref(), Some("1234567890123"));
    }

    fn track_entry(track: u8, start: i32) -> TocTrack {
        TocTrack { track: Bcd::from_binary(track).unwrap(), session: 1, control: 0, is_cdi: false, indices: vec![TocIndex { index: Bcd::one(), start: Lba::new(start) }] }
    }

    #[test]
    fn reconcile_appends_qtoc_only_tracks() {
        let drive = Toc::parse_toc(&toc_bytes(&[(1, 0x00, 0)], 40000)).unwrap();

        let observed = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![track_entry(1, 0), track_entry(2, 20000)],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        let merged = drive.reconcile(&observed, false);
        assert_eq!(merged.tracks.len(), 2);
        assert_eq!(merged.tracks[1].track, Bcd::from_binary(2).unwrap());
    }

    #[test]
    fn force_toc_drops_qtoc_only_tracks() {
        let drive = Toc::parse_toc(&toc_bytes(&[(1, 0x00, 0)], 40000)).unwrap();

        let observed = Toc {
            disc_type: SessionFormat::CdDaCdRom,
            tracks: vec![track_entry(1, 0), track_entry(2, 20000)],
            lead_out: Lba::new(40000),
            mcn: None,
        };

        let merged = drive.reconcile(&observed, true);
        assert_eq!(merged.tracks.len(), 1);
    }
}
