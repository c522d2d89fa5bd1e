//! Subchannel data interface.
//!
//! The subchannel data (sometimes called subcode or control bytes) is
//! stored alongside each sector on the CD. There are 8 subchannels
//! named P, Q, R, S, T, U, V and W. Each of them contain 12 bytes of
//! data per sector for a total of 96 bytes of subchannel data per
//! sector.
//!
//! Subchannels generally contain "metadata" about the current sector
//! such as timing information, track name or even some low resolution
//! graphics in certain standards. It also contains the table of
//! contents of the disc in the lead-in area (in the Q subchannel).
//!
//! The subchannel data is not protected by the error correction code
//! in CD-ROMs so it's more likely to be corrupted than regular data.
//!
//! For more details see section 22 of ECMA-130.

use bitflags::bitflags;

use crate::bcd::Bcd;
use crate::crc16::crc16_gsm;
use crate::lba::{bcdmsf_to_lba, lba_to_bcdmsf, Lba};
use crate::msf::Msf;
use crate::SessionFormat;

/// Common interface shared by all subchannels
pub trait SubChannel {
    /// Return the raw 12 bytes of subchannel data
    fn raw(&self) -> &[u8; 12];
}

bitflags! {
    /// Q-subchannel control nibble (upper 4 bits of byte 0): audio vs.
    /// data, digital copy permission, pre-emphasis, 4-channel audio.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AdrControl: u8 {
        /// Pre-emphasis is in use (audio only)
        const PRE_EMPHASIS = 0b0001_0000;
        /// Digital copy is permitted
        const DIGITAL_COPY_PERMITTED = 0b0010_0000;
        /// Track contains data (as opposed to audio)
        const DATA = 0b0100_0000;
        /// 4-channel audio
        const FOUR_CHANNEL = 0b1000_0000;
    }
}

/// Extract channel `bit` (0 = P ... 7 = W) from a raw 96-byte subcode
/// block into a packed 12-byte stream.
pub fn extract_channel(src: &[u8; 96], bit: u8) -> [u8; 12] {
    let mut out = [0u8; 12];
    let mask = 1u8 << (7 - bit);

    for (i, byte) in src.iter().enumerate() {
        if byte & mask != 0 {
            out[i / 8] |= 1 << (7 - (i % 8));
        }
    }

    out
}

/// Count the number of differing bits between two 12-byte subchannel
/// buffers (Hamming distance), used by Q synthesis to pick the
/// bit-closest repaired candidate.
pub fn bit_diff(a: &[u8; 12], b: &[u8; 12]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// This struct contains the Subchannel P data of one sector.
pub struct SubChannelP {
    bytes: [u8; 12],
}

impl SubChannelP {
    /// Create a SubChannelP instance from 12 bytes of subchannel data.
    pub fn new(raw: [u8; 12]) -> SubChannelP {
        SubChannelP { bytes: raw }
    }

    /// Return true if all the bits of the channel are set to the same
    /// value as the standard mandates.
    pub fn valid(&self) -> bool {
        if self.bytes[0] != 0 && self.bytes[0] != 0xff {
            return false;
        }

        self.bytes.windows(2).all(|w| w[0] == w[1])
    }
}

impl SubChannel for SubChannelP {
    fn raw(&self) -> &[u8; 12] {
        &self.bytes
    }
}

/// This struct contains the Subchannel Q data of one sector.
#[derive(Clone, Copy)]
pub struct SubChannelQ {
    bytes: [u8; 12],
}

impl SubChannelQ {
    /// Create a SubChannelQ instance from 12 bytes of subchannel data.
    pub fn new(raw: [u8; 12]) -> SubChannelQ {
        SubChannelQ { bytes: raw }
    }

    /// Raw control+adr nibble byte.
    pub fn control(&self) -> AdrControl {
        AdrControl::from_bits_truncate(self.bytes[0] & 0xf0)
    }

    /// Return true if this is a data track. For table of content
    /// sectors this flag applies to the target track.
    pub fn data(&self) -> bool {
        self.control().contains(AdrControl::DATA)
    }

    /// Return true if this is an audio track.
    pub fn audio(&self) -> bool {
        !self.data()
    }

    /// Return true if the "digital copy permitted" flag is set.
    pub fn digital_copy_permitted(&self) -> bool {
        self.control().contains(AdrControl::DIGITAL_COPY_PERMITTED)
    }

    /// Return true if this is an audio track and pre-emphasis is enabled.
    pub fn pre_emphasis(&self) -> bool {
        self.audio() && self.control().contains(AdrControl::PRE_EMPHASIS)
    }

    /// Return true if this is a 4-channel audio track.
    pub fn four_channel_audio(&self) -> bool {
        self.audio() && self.control().contains(AdrControl::FOUR_CHANNEL)
    }

    /// Retrieve the ADR mode of this Q-subchannel (low nibble of byte 0).
    pub fn mode(&self) -> u8 {
        self.bytes[0] & 0xf
    }

    /// Return the 16bit CRC stored at the end of the subchannel data.
    pub fn crc(&self) -> u16 {
        let msb = self.bytes[10] as u16;
        let lsb = self.bytes[11] as u16;

        (msb << 8) | lsb
    }

    /// Validate the CRC-16/GSM checksum over the first 10 bytes.
    pub fn is_valid(&self) -> bool {
        crc16_gsm(&self.bytes[0..10]) == self.crc()
    }

    /// Parse the contents of this subchannel and return it as a
    /// `QData`. Does not validate the CRC; call [`is_valid`](Self::is_valid) first.
    pub fn parse_data(&self) -> QData {
        match self.mode() {
            1 => self.parse_mode1(),
            2 => self.parse_mcn(),
            3 => self.parse_isrc(),
            5 => QData::CdrLeadIn,
            _ => QData::Unsupported,
        }
    }

    fn parse_mode1(&self) -> QData {
        let track = match Bcd::from_bcd(self.bytes[1]) {
            Some(b) => b,
            None => return QData::Unsupported,
        };

        let (min, sec, frac) = match (
            Bcd::from_bcd(self.bytes[3]),
            Bcd::from_bcd(self.bytes[4]),
            Bcd::from_bcd(self.bytes[5]),
        ) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return QData::Unsupported,
        };

        let msf = match Msf::new(min, sec, frac) {
            Some(m) => m,
            None => return QData::Unsupported,
        };

        if self.bytes[6] != 0 {
            return QData::Unsupported;
        }

        let (ap_min, ap_sec, ap_frac) = match (
            Bcd::from_bcd(self.bytes[7]),
            Bcd::from_bcd(self.bytes[8]),
            Bcd::from_bcd(self.bytes[9]),
        ) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return QData::Unsupported,
        };

        let ap_msf = match Msf::new(ap_min, ap_sec, ap_frac) {
            Some(m) => m,
            None => return QData::Unsupported,
        };

        if track.bcd() == 0 {
            // Lead-in: this is a TOC entry.
            let pointer = self.bytes[2];

            match pointer {
                0xa0 => {
                    let format = match ap_sec.bcd() {
                        0x00 => SessionFormat::CdDaCdRom,
                        0x10 => SessionFormat::Cdi,
                        0x20 => SessionFormat::CdXa,
                        _ => return QData::Unsupported,
                    };

                    if ap_frac.bcd() != 0 {
                        return QData::Unsupported;
                    }

                    QData::Mode1TocFirstTrack(ap_min, format, msf)
                }
                0xa1 => {
                    if ap_frac.bcd() != 0 || ap_sec.bcd() != 0 {
                        return QData::Unsupported;
                    }

                    QData::Mode1TocLastTrack(ap_min, msf)
                }
                0xa2 => QData::Mode1TocLeadOut(ap_msf, msf),
                _ => match Bcd::from_bcd(pointer) {
                    Some(ptrack) => QData::Mode1Toc(ptrack, ap_msf, msf),
                    None => QData::Unsupported,
                },
            }
        } else {
            let index = match Bcd::from_bcd(self.bytes[2]) {
                Some(b) => b,
                None => return QData::Unsupported,
            };

            // TNO == 0xAA decodes to binary 100, the lead-out track.
            QData::Mode1(track, index, msf, ap_msf)
        }
    }

    fn parse_mcn(&self) -> QData {
        let mut digits = String::with_capacity(13);

        for &byte in &self.bytes[1..8] {
            digits.push(bcd_nibble_char(byte >> 4));
            digits.push(bcd_nibble_char(byte & 0xf));
        }
        digits.truncate(13);

        let frame = match Bcd::from_bcd(self.bytes[9]) {
            Some(b) => b,
            None => return QData::Unsupported,
        };

        QData::Mcn(digits, frame)
    }

    fn parse_isrc(&self) -> QData {
        // 5 packed 6-bit characters across bytes[1..5), then 7 BCD
        // digits, then the frame of this Q block in byte[9].
        let mut bits: u64 = 0;
        for &b in &self.bytes[1..5] {
            bits = (bits << 8) | b as u64;
        }
        // bits now holds 32 bits; take the top 30 as five 6-bit groups.
        let mut code = String::with_capacity(12);
        for i in 0..5 {
            let shift = 32 - 6 * (i + 1);
            let c = ((bits >> shift) & 0x3f) as u8;
            code.push(isrc_alphabet(c));
        }

        for &byte in &self.bytes[5..9] {
            code.push(bcd_nibble_char(byte >> 4));
            code.push(bcd_nibble_char(byte & 0xf));
        }
        code.truncate(12);

        let frame = match Bcd::from_bcd(self.bytes[9]) {
            Some(b) => b,
            None => return QData::Unsupported,
        };

        QData::Isrc(code, frame)
    }
}

fn bcd_nibble_char(n: u8) -> char {
    match n & 0xf {
        d @ 0..=9 => (b'0' + d) as char,
        _ => '_',
    }
}

/// The 64-entry ISRC alphabet: digits, then A-Z, remaining codes map
/// to `_`.
fn isrc_alphabet(code: u8) -> char {
    match code {
        0..=9 => (b'0' + code) as char,
        10..=35 => (b'A' + (code - 10)) as char,
        _ => '_',
    }
}

impl SubChannel for SubChannelQ {
    fn raw(&self) -> &[u8; 12] {
        &self.bytes
    }
}

/// Shift a mode-1 positional Q block by `delta` frames (sectors),
/// recomputing both the track-relative and absolute MSF. Used to
/// repair a garbled-but-in-range Q from a known-good neighbor.
pub fn synthesize_mode1(track: Bcd, index: Bcd, msf: Msf, ap_msf: Msf, delta: i32) -> Option<SubChannelQ> {
    let new_ap_lba = bcdmsf_to_lba(ap_msf).checked_add(delta)?;
    let new_ap_msf = lba_to_bcdmsf(new_ap_lba)?;

    // Track-relative msf walks the same delta; crossing zero flips
    // INDEX 00/01 and reflects the count around zero (ECMA-130 pregap
    // countdown semantics).
    let rel = msf.sector_index() as i64 + delta as i64;
    let (new_index, new_msf) = if rel >= 0 {
        (index, Msf::from_sector_index(rel as u32)?)
    } else {
        let toggled = if index.bcd() == 0 { Bcd::from_bcd(1)? } else { Bcd::zero() };
        (toggled, Msf::from_sector_index((-rel) as u32)?)
    };

    let mut bytes = [0u8; 12];
    bytes[0] = 0x01; // control left at 0, ADR=1
    bytes[1] = track.bcd();
    bytes[2] = new_index.bcd();
    let (m, s, f) = new_msf.into_bcd();
    bytes[3] = m.bcd();
    bytes[4] = s.bcd();
    bytes[5] = f.bcd();
    bytes[6] = 0;
    let (am, asec, af) = new_ap_msf.into_bcd();
    bytes[7] = am.bcd();
    bytes[8] = asec.bcd();
    bytes[9] = af.bcd();

    let crc = crc16_gsm(&bytes[0..10]);
    bytes[10] = (crc >> 8) as u8;
    bytes[11] = crc as u8;

    Some(SubChannelQ::new(bytes))
}

/// Shift a mode-2/3 (MCN/ISRC) Q block by incrementing the A-frame
/// modulo 75, for Q synthesis over non-positional blocks.
pub fn synthesize_mode23(mut bytes: [u8; 12], delta_frames: i32) -> SubChannelQ {
    let frame = Bcd::from_bcd(bytes[9]).unwrap_or(Bcd::zero()).binary() as i32;
    let new_frame = (frame + delta_frames).rem_euclid(75) as u8;
    bytes[9] = Bcd::from_binary(new_frame).unwrap_or(Bcd::zero()).bcd();

    let crc = crc16_gsm(&bytes[0..10]);
    bytes[10] = (crc >> 8) as u8;
    bytes[11] = crc as u8;

    SubChannelQ::new(bytes)
}

/// Compute the LBA addressed by a positional (mode 1) Q block, if any.
pub fn mode1_lba(data: &QData) -> Option<Lba> {
    match *data {
        QData::Mode1(_, _, _, ap_msf) => Some(bcdmsf_to_lba(ap_msf)),
        QData::Mode1Toc(_, ap_msf, _) => Some(bcdmsf_to_lba(ap_msf)),
        _ => None,
    }
}

/// Possible contents of the Q subchannel data depending on the mode.
///
/// See section 22.3.2 of ECMA-130 for more details.
#[derive(Clone)]
pub enum QData {
    /// Mode 1 data in the user data area and the lead-out area:
    /// track, index, track-relative MSF, absolute MSF.
    Mode1(Bcd, Bcd, Msf, Msf),
    /// Mode 1 Table of content entry (in the lead-in):
    /// track number pointer, absolute MSF of INDEX 00 for that track, MSF of this TOC entry.
    Mode1Toc(Bcd, Msf, Msf),
    /// Mode 1 TOC entry with pointer `0xa0`: first track number, session format, MSF of this entry.
    Mode1TocFirstTrack(Bcd, SessionFormat, Msf),
    /// Mode 1 TOC entry with pointer `0xa1`: last track number, MSF of this entry.
    Mode1TocLastTrack(Bcd, Msf),
    /// Mode 1 TOC entry with pointer `0xa2`: absolute MSF of the lead-out, MSF of this entry.
    Mode1TocLeadOut(Msf, Msf),
    /// Mode 2: Media Catalog Number (13 decimal digits) + A-frame.
    Mcn(String, Bcd),
    /// Mode 3: ISRC code (12 characters) + A-frame.
    Isrc(String, Bcd),
    /// Mode 5: CD-R/CD-RW lead-in, not decoded further.
    CdrLeadIn,
    /// Unsupported or corrupted data.
    Unsupported,
}

/// This struct is used for subchannels where no special handling is implemented.
pub struct SubChannelBasic {
    bytes: [u8; 12],
}

impl SubChannelBasic {
    /// Create a SubChannelBasic instance from 12 bytes of subchannel data.
    pub fn new(raw: [u8; 12]) -> SubChannelBasic {
        SubChannelBasic { bytes: raw }
    }
}

impl SubChannel for SubChannelBasic {
    fn raw(&self) -> &[u8; 12] {
        &self.bytes
    }
}

/// This struct contains the Subchannel R data for one sector.
pub type SubChannelR = SubChannelBasic;
/// This struct contains the Subchannel S data for one sector.
pub type SubChannelS = SubChannelBasic;
/// This struct contains the Subchannel T data for one sector.
pub type SubChannelT = SubChannelBasic;
/// This struct contains the Subchannel U data for one sector.
pub type SubChannelU = SubChannelBasic;
/// This struct contains the Subchannel V data for one sector.
pub type SubChannelV = SubChannelBasic;
/// This struct contains the Subchannel W data for one sector.
pub type SubChannelW = SubChannelBasic;

#[cfg(test)]
mod tests {
    use super::*;

    fn q_mode1(track: u8, index: u8, msf: (u8, u8, u8), ap_msf: (u8, u8, u8)) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0] = 0x41; // control=DATA, adr=1
        bytes[1] = track;
        bytes[2] = index;
        bytes[3] = msf.0;
        bytes[4] = msf.1;
        bytes[5] = msf.2;
        bytes[6] = 0;
        bytes[7] = ap_msf.0;
        bytes[8] = ap_msf.1;
        bytes[9] = ap_msf.2;
        let crc = crc16_gsm(&bytes[0..10]);
        bytes[10] = (crc >> 8) as u8;
        bytes[11] = crc as u8;
        bytes
    }

    #[test]
    fn valid_q_round_trips_crc() {
        let raw = q_mode1(0x01, 0x01, (0x00, 0x02, 0x00), (0x00, 0x02, 0x00));
        let q = SubChannelQ::new(raw);
        assert!(q.is_valid());
        assert_eq!(q.mode(), 1);
        assert!(q.data());
    }

    #[test]
    fn synthesized_q_is_valid_and_shifted() {
        let raw = q_mode1(0x01, 0x01, (0x00, 0x02, 0x00), (0x00, 0x02, 0x00));
        let q = SubChannelQ::new(raw);
        match q.parse_data() {
            QData::Mode1(track, index, msf, ap_msf) => {
                let shifted = synthesize_mode1(track, index, msf, ap_msf, 5).unwrap();
                assert!(shifted.is_valid());
                match shifted.parse_data() {
                    QData::Mode1(_, _, _, new_ap) => {
                        assert_eq!(bcdmsf_to_lba(new_ap), bcdmsf_to_lba(ap_msf).checked_add(5).unwrap());
                    }
                    _ => panic!("expected Mode1"),
                }
            }
            _ => panic!("expected Mode1"),
        }
    }

    #[test]
    fn bit_diff_counts_differences() {
        let a = [0u8; 12];
        let mut b = [0u8; 12];
        b[0] = 0b1010_0000;
        assert_eq!(bit_diff(&a, &b), 2);
    }

    #[test]
    fn extract_channel_picks_right_bit() {
        let mut src = [0u8; 96];
        src[0] = 0b0100_0000; // bit index 1 (Q) set
        let q = extract_channel(&src, 1);
        assert_eq!(q[0] & 0x80, 0x80);
    }
}
