//! Raw SCSI/MMC transport used to drive the optical disc reader.
//!
//! [`cdb`] builds command descriptor blocks; [`sgio`] (Linux only)
//! carries them over the kernel `sg` driver. [`Transport`] glues the
//! two together into the handful of operations the dump loop needs:
//! TEST UNIT READY polling, INQUIRY (for [`crate::drive`] profile
//! matching), READ TOC/FULL TOC, READ CD and its vendor variants.

pub mod cdb;
#[cfg(target_os = "linux")]
pub mod sgio;

use std::path::Path;
use std::time::Duration;

use self::cdb::{
    AsusCacheRead, Cdb, ReadCd, ReadCdda, ReadToc, SectorType, SetCdSpeed, SubChannelSelection, TestUnitReady, TocFormat,
};
use crate::error::{CdResult, Error};
use crate::lba::Lba;
pub use cdb::{MainChannelFlags, PlextorCacheRead};

/// Size in bytes of one ASUS/LG vendor cache-ring entry: 0x900 main +
/// 0x74 subcode + C2, per SPEC_FULL §4.7 rule 2.
pub const ASUS_CACHE_ENTRY_SIZE: usize = 0xB00;

const DEFAULT_TIMEOUT_MS: u32 = 10_000;

/// Drive identification string returned by INQUIRY, trimmed of
/// trailing padding.
#[derive(Debug, Clone)]
pub struct DriveIdentity {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

/// High-level SCSI/MMC transport bound to one device.
#[cfg(target_os = "linux")]
pub struct Transport {
    device: sgio::Device,
}

#[cfg(target_os = "linux")]
impl Transport {
    /// Open the device node at `path`.
    pub fn open(path: &Path) -> CdResult<Transport> {
        Ok(Transport { device: sgio::Device::open(path)? })
    }

    fn command(&self, cdb: &[u8], dir: sgio::DxferDirection, buf: &mut [u8]) -> CdResult<usize> {
        self.device.send_command(cdb, dir, buf, DEFAULT_TIMEOUT_MS)
    }

    /// TEST UNIT READY (0x00): returns `Ok(())` if the drive has
    /// media loaded and is ready to transfer, `Err(DriveNotReady)`
    /// (via the SCSI sense data) otherwise.
    pub fn test_unit_ready(&self) -> CdResult<()> {
        let cdb = TestUnitReady::new().to_bytes();
        let mut empty = [];
        self.command(&cdb, sgio::DxferDirection::None, &mut empty)?;
        Ok(())
    }

    /// INQUIRY (0x12), used by [`crate::drive`] to select a drive profile.
    pub fn inquiry(&self) -> CdResult<DriveIdentity> {
        let cdb = cdb::Inquiry::new(96).to_bytes();
        let mut buf = [0u8; 96];
        self.command(&cdb, sgio::DxferDirection::FromDevice, &mut buf)?;

        let field = |range: std::ops::Range<usize>| {
            String::from_utf8_lossy(&buf[range]).trim().to_string()
        };

        Ok(DriveIdentity {
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
        })
    }

    /// SET CD SPEED (0xBB). `None` requests maximum speed.
    pub fn set_cd_speed(&self, speed_kb_s: Option<u16>) -> CdResult<()> {
        let cdb = SetCdSpeed::new(speed_kb_s.unwrap_or(0xffff)).to_bytes();
        let mut empty = [];
        self.command(&cdb, sgio::DxferDirection::None, &mut empty)?;
        Ok(())
    }

    /// READ TOC/PMA/ATIP (0x43) in the requested `format`, returning
    /// the raw response payload for [`crate::toc`] to parse.
    pub fn read_toc_raw(&self, format: TocFormat, msf: bool) -> CdResult<Vec<u8>> {
        let mut header = [0u8; 4];
        let probe = ReadToc::new(format, msf, 1, 4).to_bytes();
        self.command(&probe, sgio::DxferDirection::FromDevice, &mut header)?;

        let len = u16::from_be_bytes([header[0], header[1]]) as usize + 2;
        let mut buf = vec![0u8; len];
        let cdb = ReadToc::new(format, msf, 1, len as u16).to_bytes();
        let n = self.command(&cdb, sgio::DxferDirection::FromDevice, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// READ CD (0xBE): read `sector_count` sectors worth of main
    /// channel + Q subchannel + C2 error bits starting at `start`.
    pub fn read_cd(&self, start: Lba, sector_count: u32) -> CdResult<Vec<u8>> {
        let mut cdb = ReadCd::new(SectorType::AllTypes, start, sector_count);
        cdb.set_sub_channel(SubChannelSelection::Raw);
        cdb.set_c2(false, true);
        let bytes = cdb.to_bytes();

        // 2352 (main) + 294 (C2 bitmap) + 96 (raw subcode) per sector.
        let per_sector = 2352 + 294 + 96;
        let mut buf = vec![0u8; per_sector * sector_count as usize];
        let n = self.command(&bytes, sgio::DxferDirection::FromDevice, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Vendor READ CDDA (0xD8), used by Plextor drives to read
    /// negative-LBA lead-in sectors that READ CD refuses.
    pub fn read_cdda(&self, start: Lba, sector_count: u32) -> CdResult<Vec<u8>> {
        let cdb = ReadCdda::new(start, sector_count, 2).to_bytes();
        let mut buf = vec![0u8; 2352 * sector_count as usize + 96 * sector_count as usize];
        let n = self.command(&cdb, sgio::DxferDirection::FromDevice, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Vendor Plextor cache-read (0xF1), used for ASUS/LG cache
    /// mining: re-read already buffered sectors without a fresh seek.
    pub fn plextor_cache_read(&self, start: Lba, sector_count: u16) -> CdResult<Vec<u8>> {
        let cdb = PlextorCacheRead::new(start, sector_count).to_bytes();
        let mut buf = vec![0u8; 2352 * sector_count as usize];
        let n = self.command(&cdb, sgio::DxferDirection::FromDevice, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// ASUS/LG vendor cache dump (0xF1/0x06): pull `entry_count`
    /// consecutive [`ASUS_CACHE_ENTRY_SIZE`]-byte cache ring entries
    /// starting at `entry_offset`, without a fresh mechanical read.
    pub fn asus_cache_read(&self, entry_offset: u32, entry_count: u32) -> CdResult<Vec<u8>> {
        let byte_offset = entry_offset * ASUS_CACHE_ENTRY_SIZE as u32;
        let size = entry_count * ASUS_CACHE_ENTRY_SIZE as u32;
        let cdb = AsusCacheRead::new(byte_offset, size).to_bytes();
        let mut buf = vec![0u8; size as usize];
        let n = self.command(&cdb, sgio::DxferDirection::FromDevice, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Poll TEST UNIT READY until the drive reports ready or
    /// `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> CdResult<()> {
        let start = std::time::Instant::now();
        loop {
            if self.test_unit_ready().is_ok() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(Error::DriveNotReady);
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct Transport;

#[cfg(not(target_os = "linux"))]
impl Transport {
    pub fn open(_path: &Path) -> CdResult<Transport> {
        Err(Error::Protocol("raw SCSI passthrough is only implemented on Linux".to_string()))
    }
}
