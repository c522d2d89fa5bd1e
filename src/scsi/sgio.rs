//! Linux `SG_IO` transport: send a CDB to a generic SCSI device node
//! (`/dev/sgN` or a block device opened `O_RDONLY`) and collect the
//! status/sense data.

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use libc::{c_int, ioctl};

use crate::error::{CdResult, Error, ScsiStatus};

const SG_IO: u64 = 0x2285;
const SG_DXFER_NONE: i32 = -1;
const SG_DXFER_TO_DEV: i32 = -2;
const SG_DXFER_FROM_DEV: i32 = -3;

/// Direction of the data phase for a CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DxferDirection {
    None,
    ToDevice,
    FromDevice,
}

impl DxferDirection {
    fn as_i32(self) -> i32 {
        match self {
            DxferDirection::None => SG_DXFER_NONE,
            DxferDirection::ToDevice => SG_DXFER_TO_DEV,
            DxferDirection::FromDevice => SG_DXFER_FROM_DEV,
        }
    }
}

#[repr(C, packed)]
struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut u8,
    cmdp: *const u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: c_int,
    usr_ptr: *mut u8,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: c_int,
    duration: u32,
    info: u32,
}

/// A handle to a SCSI/MMC device opened through the Linux `sg` driver.
pub struct Device {
    file: File,
}

impl Device {
    /// Open `path` (typically `/dev/srN` or `/dev/sgN`) for raw SCSI
    /// command passthrough.
    pub fn open(path: &Path) -> CdResult<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Io)?;
        Ok(Device { file })
    }

    /// Send a CDB and transfer `buffer` in the direction given by
    /// `direction`. Returns the number of bytes actually transferred
    /// (`dxfer_len - resid`).
    pub fn send_command(
        &self,
        cdb: &[u8],
        direction: DxferDirection,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> CdResult<usize> {
        let mut sense = [0u8; 32];

        let mut hdr = SgIoHdr {
            interface_id: 'S' as c_int,
            dxfer_direction: direction.as_i32(),
            cmd_len: cdb.len() as u8,
            mx_sb_len: sense.len() as u8,
            iovec_count: 0,
            dxfer_len: buffer.len() as u32,
            dxferp: buffer.as_mut_ptr(),
            cmdp: cdb.as_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: timeout_ms,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        let fd = self.file.as_raw_fd();
        let ret = unsafe { ioctl(fd, SG_IO as _, &mut hdr) };

        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        if hdr.status != 0 || hdr.host_status != 0 || hdr.driver_status != 0 {
            let sense_key = if sense[0] != 0 { sense[2] & 0x0f } else { 0 };
            let asc = if sense.len() > 12 { sense[12] } else { 0 };
            let ascq = if sense.len() > 13 { sense[13] } else { 0 };

            return Err(Error::Scsi(ScsiStatus {
                status_code: hdr.status,
                sense_key,
                asc,
                ascq,
            }));
        }

        let resid = hdr.resid.max(0) as usize;
        Ok(buffer.len().saturating_sub(resid))
    }
}
