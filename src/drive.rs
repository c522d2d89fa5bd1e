//! Drive profile registry.
//!
//! Different optical drives disagree about how to read a CD reliably:
//! some can seek into the negative-LBA lead-in, some cache more
//! sectors internally than others, some need the C2 pointers masked
//! off entirely because their firmware lies about them. This module
//! keeps a small static table, keyed on the INQUIRY vendor/product
//! strings, of the quirks the dump loop needs to know about.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::scsi::DriveIdentity;

/// Which CDB the dump loop should prefer for bulk reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReadMethod {
    /// READ CD (0xBE), the standard MMC command.
    Be = 0,
    /// Vendor READ CDDA (0xD8), used by Plextor drives to read past
    /// the user area into the negative-LBA lead-in.
    D8 = 1,
    /// READ CD with the DAP (digital audio playback) bit set, used
    /// by some drives' built-in jitter correction.
    Bebat = 2,
}

/// Cache-mining behavior some drives expose through a vendor opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CacheQuirk {
    /// No cache-mining support; every sector requires a fresh read.
    None = 0,
    /// ASUS/LG drives: re-issuing the same READ CD request for
    /// sectors still resident in the drive cache returns a second,
    /// independent reading without a mechanical seek.
    AsusCacheMining = 1,
}

/// Byte layout a drive returns a READ CD transfer in: main channel
/// followed by C2 then subcode, or main followed by subcode then C2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SectorOrder {
    /// `{data, c2, subcode}`, the common MMC ordering.
    DataC2Sub = 0,
    /// `{data, subcode, c2}`, used by some drive firmwares.
    DataSubC2 = 1,
}

/// A drive's read quirks, as determined by [`Registry::lookup`].
#[derive(Debug, Clone)]
pub struct DriveProfile {
    pub vendor: &'static str,
    pub product: &'static str,
    pub read_method: ReadMethod,
    pub cache: CacheQuirk,
    /// True if the drive can seek and read sectors in the negative
    /// LBA lead-in (vendor-specific, Plextor-style).
    pub can_read_lead_in: bool,
    /// Maximum number of sectors this profile's firmware will return
    /// in a single READ CD transfer, or 0 for "let the registry's
    /// default stand".
    pub max_read_sectors: u32,
    /// Byte order of a READ CD transfer's main/C2/subcode parts.
    pub sector_order: SectorOrder,
    /// Bytes the drive delays its C2 block by relative to the main
    /// channel data it belongs to; 0 for drives that emit them
    /// aligned.
    pub c2_shift: i32,
    /// LBA the main dump loop should start walking from, relative to
    /// the first track's INDEX 01 (conventionally `-150`, a 2-second
    /// pregap).
    pub pregap_start: i32,
}

const DEFAULT_MAX_READ_SECTORS: u32 = 27;
const DEFAULT_PREGAP_START: i32 = -150;

impl DriveProfile {
    fn generic() -> DriveProfile {
        DriveProfile {
            vendor: "",
            product: "",
            read_method: ReadMethod::Be,
            cache: CacheQuirk::None,
            can_read_lead_in: false,
            max_read_sectors: DEFAULT_MAX_READ_SECTORS,
            sector_order: SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: DEFAULT_PREGAP_START,
        }
    }
}

/// `(vendor, product)` prefix match plus the profile it selects.
struct Entry {
    vendor: &'static str,
    product: &'static str,
    profile: DriveProfile,
}

static TABLE: &[Entry] = &[
    Entry {
        vendor: "PLEXTOR",
        product: "",
        profile: DriveProfile {
            vendor: "PLEXTOR",
            product: "",
            read_method: ReadMethod::D8,
            cache: CacheQuirk::None,
            can_read_lead_in: true,
            max_read_sectors: DEFAULT_MAX_READ_SECTORS,
            sector_order: SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: DEFAULT_PREGAP_START,
        },
    },
    Entry {
        vendor: "ASUS",
        product: "",
        profile: DriveProfile {
            vendor: "ASUS",
            product: "",
            read_method: ReadMethod::Be,
            cache: CacheQuirk::AsusCacheMining,
            can_read_lead_in: false,
            max_read_sectors: DEFAULT_MAX_READ_SECTORS,
            sector_order: SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: DEFAULT_PREGAP_START,
        },
    },
    Entry {
        vendor: "HL-DT-ST",
        product: "",
        profile: DriveProfile {
            vendor: "HL-DT-ST",
            product: "",
            read_method: ReadMethod::Be,
            cache: CacheQuirk::AsusCacheMining,
            can_read_lead_in: false,
            max_read_sectors: DEFAULT_MAX_READ_SECTORS,
            sector_order: SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: DEFAULT_PREGAP_START,
        },
    },
];

/// Static registry of known drive quirks.
pub struct Registry;

impl Registry {
    /// Match a drive's INQUIRY string against the table, falling
    /// back to the vendor-alias table and finally to a conservative
    /// generic profile (plain READ CD, no cache mining, no lead-in
    /// access) if nothing matches.
    pub fn lookup(id: &DriveIdentity) -> DriveProfile {
        let vendor = id.vendor.trim().to_uppercase();
        let product = id.product.trim().to_uppercase();

        for entry in TABLE {
            if vendor.starts_with(entry.vendor) && (entry.product.is_empty() || product.starts_with(entry.product)) {
                let mut profile = entry.profile.clone();
                profile.vendor = entry.vendor;
                return profile;
            }
        }

        DriveProfile::generic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(vendor: &str, product: &str) -> DriveIdentity {
        DriveIdentity { vendor: vendor.to_string(), product: product.to_string(), revision: "1.00".to_string() }
    }

    #[test]
    fn plextor_gets_d8_and_lead_in() {
        let profile = Registry::lookup(&id("PLEXTOR", "DVDR   PX-760A"));
        assert_eq!(profile.read_method, ReadMethod::D8);
        assert!(profile.can_read_lead_in);
    }

    #[test]
    fn unknown_vendor_gets_generic_profile() {
        let profile = Registry::lookup(&id("ACME", "SUPER DRIVE"));
        assert_eq!(profile.read_method, ReadMethod::Be);
        assert_eq!(profile.cache, CacheQuirk::None);
        assert!(!profile.can_read_lead_in);
    }

    #[test]
    fn lg_alias_gets_cache_mining() {
        let profile = Registry::lookup(&id("HL-DT-ST", "BD-RE  WH16NS40"));
        assert_eq!(profile.cache, CacheQuirk::AsusCacheMining);
    }
}
