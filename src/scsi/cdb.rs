//! MMC-5/MMC-6 Command Descriptor Block builders.
//!
//! Each CDB is a fixed-size byte array builder, following the
//! `Cdb<const N: usize>` idiom used across the SCSI-over-SG_IO
//! ecosystem: a struct wraps the raw bytes and exposes setter
//! methods that patch individual bit fields.

use crate::lba::Lba;

/// Common interface for a fixed-length CDB.
pub trait Cdb<const N: usize> {
    /// Opcode occupying byte 0 of the CDB.
    const OP_CODE: u8;

    /// Serialize to the wire format.
    fn to_bytes(&self) -> [u8; N];
}

/// TEST UNIT READY (0x00)
#[derive(Debug, Clone, Copy)]
pub struct TestUnitReady([u8; 6]);

impl TestUnitReady {
    pub fn new() -> Self {
        let mut bytes = [0u8; 6];
        bytes[0] = Self::OP_CODE;
        TestUnitReady(bytes)
    }
}

impl Default for TestUnitReady {
    fn default() -> Self {
        Self::new()
    }
}

impl Cdb<6> for TestUnitReady {
    const OP_CODE: u8 = 0x00;
    fn to_bytes(&self) -> [u8; 6] {
        self.0
    }
}

/// INQUIRY (0x12)
#[derive(Debug, Clone, Copy)]
pub struct Inquiry([u8; 6]);

impl Inquiry {
    pub fn new(allocation_length: u8) -> Self {
        let mut bytes = [0u8; 6];
        bytes[0] = Self::OP_CODE;
        bytes[4] = allocation_length;
        Inquiry(bytes)
    }
}

impl Cdb<6> for Inquiry {
    const OP_CODE: u8 = 0x12;
    fn to_bytes(&self) -> [u8; 6] {
        self.0
    }
}

/// SET CD SPEED (0xBB)
#[derive(Debug, Clone, Copy)]
pub struct SetCdSpeed([u8; 12]);

impl SetCdSpeed {
    /// `speed_kb_s` of 0xffff requests maximum speed.
    pub fn new(speed_kb_s: u16) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0] = Self::OP_CODE;
        bytes[2] = (speed_kb_s >> 8) as u8;
        bytes[3] = speed_kb_s as u8;
        SetCdSpeed(bytes)
    }
}

impl Cdb<12> for SetCdSpeed {
    const OP_CODE: u8 = 0xBB;
    fn to_bytes(&self) -> [u8; 12] {
        self.0
    }
}

/// READ TOC/PMA/ATIP (0x43) response data format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TocFormat {
    /// Formatted (binary LBA or MSF) TOC, one descriptor per track.
    Toc = 0b0000,
    /// Raw "FULL TOC" containing every Q subchannel point.
    FullToc = 0b0010,
    /// CD-TEXT information packs.
    CdText = 0b0101,
}

/// READ TOC/PMA/ATIP CDB.
#[derive(Debug, Clone, Copy)]
pub struct ReadToc([u8; 10]);

impl ReadToc {
    pub fn new(format: TocFormat, msf: bool, track_or_session: u8, allocation_len: u16) -> Self {
        let mut bytes = [0u8; 10];
        bytes[0] = Self::OP_CODE;
        bytes[1] = (msf as u8) << 1;
        bytes[2] = format as u8 & 0xf;
        bytes[6] = track_or_session;
        bytes[7] = (allocation_len >> 8) as u8;
        bytes[8] = allocation_len as u8;
        ReadToc(bytes)
    }
}

impl Cdb<10> for ReadToc {
    const OP_CODE: u8 = 0x43;
    fn to_bytes(&self) -> [u8; 10] {
        self.0
    }
}

/// Sector type field of READ CD (MMC-5 table 357).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectorType {
    AllTypes = 0b000,
    CdDa = 0b001,
    Mode1 = 0b010,
    Mode2Formless = 0b011,
    Mode2Form1 = 0b100,
    Mode2Form2 = 0b101,
}

/// Which subchannel bytes READ CD should append after user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubChannelSelection {
    None = 0b000,
    Raw = 0b001,
    QOnly = 0b010,
    RwOnly = 0b100,
}

/// Main channel bit flags selecting which parts of the 2352-byte
/// sector READ CD returns (sync/header/subheader/user data/EDC-ECC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainChannelFlags(u8);

impl MainChannelFlags {
    pub const SYNC: MainChannelFlags = MainChannelFlags(1 << 7);
    pub const HEADER: MainChannelFlags = MainChannelFlags(1 << 5);
    pub const SUB_HEADER: MainChannelFlags = MainChannelFlags(1 << 6);
    pub const USER_DATA: MainChannelFlags = MainChannelFlags(1 << 4);
    pub const EDC_ECC: MainChannelFlags = MainChannelFlags(1 << 3);
    pub const C2_ERROR_FLAGS: MainChannelFlags = MainChannelFlags(1 << 1);

    pub fn all_data() -> MainChannelFlags {
        MainChannelFlags(Self::SYNC.0 | Self::HEADER.0 | Self::SUB_HEADER.0 | Self::USER_DATA.0 | Self::EDC_ECC.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for MainChannelFlags {
    type Output = MainChannelFlags;
    fn bitor(self, rhs: MainChannelFlags) -> MainChannelFlags {
        MainChannelFlags(self.0 | rhs.0)
    }
}

/// READ CD (0xBE), the main sector+subchannel+C2 transport command.
#[derive(Debug, Clone, Copy)]
pub struct ReadCd([u8; 12]);

impl ReadCd {
    pub fn new(sector_type: SectorType, start: Lba, sector_count: u32) -> Self {
        let mut cdb = ReadCd([0u8; 12]);
        cdb.0[0] = Self::OP_CODE;
        cdb.0[1] = (sector_type as u8) << 2;
        cdb.set_start_lba(start);
        cdb.set_transfer_length(sector_count);
        cdb.0[9] = MainChannelFlags::all_data().bits();
        cdb
    }

    pub fn set_start_lba(&mut self, start: Lba) -> &mut Self {
        let v = start.as_i32();
        self.0[2] = (v >> 24) as u8;
        self.0[3] = (v >> 16) as u8;
        self.0[4] = (v >> 8) as u8;
        self.0[5] = v as u8;
        self
    }

    pub fn set_transfer_length(&mut self, sector_count: u32) -> &mut Self {
        self.0[6] = (sector_count >> 16) as u8;
        self.0[7] = (sector_count >> 8) as u8;
        self.0[8] = sector_count as u8;
        self
    }

    pub fn set_main_channel(&mut self, flags: MainChannelFlags) -> &mut Self {
        self.0[9] = flags.bits();
        self
    }

    pub fn set_c2(&mut self, block_error_byte: bool, bitmap: bool) -> &mut Self {
        let bits = match (block_error_byte, bitmap) {
            (_, true) => 0b01,
            (true, false) => 0b10,
            (false, false) => 0b00,
        };
        self.0[9] = (self.0[9] & !0b0000_0110) | (bits << 1);
        self
    }

    pub fn set_sub_channel(&mut self, selection: SubChannelSelection) -> &mut Self {
        self.0[10] = (self.0[10] & !0b0000_0111) | selection as u8;
        self
    }
}

impl Cdb<12> for ReadCd {
    const OP_CODE: u8 = 0xBE;
    fn to_bytes(&self) -> [u8; 12] {
        self.0
    }
}

/// READ CD-DA (vendor opcode 0xD8), used by Plextor drives to read
/// audio sectors including sectors the drive would otherwise refuse
/// (negative LBAs in the lead-in).
#[derive(Debug, Clone, Copy)]
pub struct ReadCdda([u8; 12]);

impl ReadCdda {
    pub fn new(start: Lba, sector_count: u32, sub_code: u8) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0] = Self::OP_CODE;
        let v = start.as_i32();
        bytes[2] = (v >> 24) as u8;
        bytes[3] = (v >> 16) as u8;
        bytes[4] = (v >> 8) as u8;
        bytes[5] = v as u8;
        bytes[6] = (sector_count >> 24) as u8;
        bytes[7] = (sector_count >> 16) as u8;
        bytes[8] = (sector_count >> 8) as u8;
        bytes[9] = sector_count as u8;
        bytes[10] = sub_code;
        ReadCdda(bytes)
    }
}

impl Cdb<12> for ReadCdda {
    const OP_CODE: u8 = 0xD8;
    fn to_bytes(&self) -> [u8; 12] {
        self.0
    }
}

/// Plextor "cache read" vendor opcode (0xF1) used to mine the drive's
/// internal read-ahead cache for already-buffered sectors without
/// issuing a fresh mechanical read.
#[derive(Debug, Clone, Copy)]
pub struct PlextorCacheRead([u8; 12]);

impl PlextorCacheRead {
    pub fn new(start: Lba, sector_count: u16) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0] = Self::OP_CODE;
        bytes[1] = 0xe0;
        let v = start.as_i32();
        bytes[3] = (v >> 16) as u8;
        bytes[4] = (v >> 8) as u8;
        bytes[5] = v as u8;
        bytes[8] = (sector_count >> 8) as u8;
        bytes[9] = sector_count as u8;
        PlextorCacheRead(bytes)
    }
}

impl Cdb<12> for PlextorCacheRead {
    const OP_CODE: u8 = 0xF1;
    fn to_bytes(&self) -> [u8; 12] {
        self.0
    }
}

/// ASUS/LG vendor cache-dump opcode (0xF1, sub-function 0x06), used to
/// pull a raw chunk of the drive's internal read-ahead ring without
/// triggering a fresh mechanical read.
#[derive(Debug, Clone, Copy)]
pub struct AsusCacheRead([u8; 12]);

impl AsusCacheRead {
    pub fn new(byte_offset: u32, size: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0] = Self::OP_CODE;
        bytes[1] = 0x06;
        bytes[2] = (byte_offset >> 24) as u8;
        bytes[3] = (byte_offset >> 16) as u8;
        bytes[4] = (byte_offset >> 8) as u8;
        bytes[5] = byte_offset as u8;
        bytes[6] = (size >> 24) as u8;
        bytes[7] = (size >> 16) as u8;
        bytes[8] = (size >> 8) as u8;
        bytes[9] = size as u8;
        AsusCacheRead(bytes)
    }
}

impl Cdb<12> for AsusCacheRead {
    const OP_CODE: u8 = 0xF1;
    fn to_bytes(&self) -> [u8; 12] {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cd_encodes_lba_and_length() {
        let cdb = ReadCd::new(SectorType::AllTypes, Lba::new(-150), 16);
        let bytes = cdb.to_bytes();
        assert_eq!(bytes[0], 0xBE);
        assert_eq!(i32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), -150);
        assert_eq!(bytes[8], 16);
    }

    #[test]
    fn read_toc_sets_msf_and_format() {
        let cdb = ReadToc::new(TocFormat::FullToc, true, 1, 2048);
        let bytes = cdb.to_bytes();
        assert_eq!(bytes[0], 0x43);
        assert_eq!(bytes[1] & 0x02, 0x02);
        assert_eq!(bytes[2], 0b0010);
    }
}
