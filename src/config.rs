//! Optional TOML configuration sidecar.
//!
//! `discforge.toml`, loaded with the `toml` crate, can override the
//! [`DriveProfile`](crate::drive::DriveProfile) the registry would
//! otherwise auto-detect and can set default values for the CLI's
//! dump/split options. CLI flags always take precedence over anything
//! set here; a missing sidecar is not an error, since it's optional.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::drive::{CacheQuirk, DriveProfile, ReadMethod, SectorOrder};
use crate::error::{CdResult, Error};
use crate::ranges::{string_to_ranges, Range};

/// Drive-profile overrides, one field per [`DriveProfile`] member the
/// registry's auto-detection can get wrong for an unusual drive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriveOverride {
    pub read_method: Option<String>,
    pub cache: Option<String>,
    pub can_read_lead_in: Option<bool>,
    pub max_read_sectors: Option<u32>,
    pub sector_order: Option<String>,
    pub c2_shift: Option<i32>,
    pub pregap_start: Option<i32>,
}

impl DriveOverride {
    /// Apply this override on top of `profile`, field by field —
    /// fields left unset in the sidecar keep the registry's guess.
    pub fn apply(&self, profile: &mut DriveProfile) -> CdResult<()> {
        if let Some(method) = &self.read_method {
            profile.read_method = parse_read_method(method)?;
        }
        if let Some(cache) = &self.cache {
            profile.cache = parse_cache_quirk(cache)?;
        }
        if let Some(v) = self.can_read_lead_in {
            profile.can_read_lead_in = v;
        }
        if let Some(v) = self.max_read_sectors {
            profile.max_read_sectors = v;
        }
        if let Some(order) = &self.sector_order {
            profile.sector_order = parse_sector_order(order)?;
        }
        if let Some(v) = self.c2_shift {
            profile.c2_shift = v;
        }
        if let Some(v) = self.pregap_start {
            profile.pregap_start = v;
        }
        Ok(())
    }
}

/// Parse a `drive.read_method` string, shared with the CLI's
/// `--drive-read-method` flag so both paths accept the same spellings.
pub fn parse_read_method(s: &str) -> CdResult<ReadMethod> {
    match s.to_ascii_uppercase().as_str() {
        "BE" => Ok(ReadMethod::Be),
        "D8" => Ok(ReadMethod::D8),
        "BEBAT" | "BE_CDDA" => Ok(ReadMethod::Bebat),
        other => Err(Error::Protocol(format!("unknown drive.read_method in configuration: {other}"))),
    }
}

/// Parse a `drive.cache` string, shared with the CLI's `--drive-cache` flag.
pub fn parse_cache_quirk(s: &str) -> CdResult<CacheQuirk> {
    match s.to_ascii_uppercase().as_str() {
        "NONE" => Ok(CacheQuirk::None),
        "ASUS" | "ASUS_CACHE_MINING" => Ok(CacheQuirk::AsusCacheMining),
        other => Err(Error::Protocol(format!("unknown drive.cache in configuration: {other}"))),
    }
}

/// Parse a `drive.sector_order` string, shared with the CLI's
/// `--drive-sector-order` flag.
pub fn parse_sector_order(s: &str) -> CdResult<SectorOrder> {
    match s.to_ascii_uppercase().as_str() {
        "DATA_C2_SUB" | "DATA_C2_SUBCODE" => Ok(SectorOrder::DataC2Sub),
        "DATA_SUB_C2" | "DATA_SUBCODE_C2" => Ok(SectorOrder::DataSubC2),
        other => Err(Error::Protocol(format!("unknown drive.sector_order in configuration: {other}"))),
    }
}

/// Default option values a sidecar can set. Each mirrors a CLI flag
/// and the binary only consults a field here when the user didn't
/// pass the matching flag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub speed: Option<u16>,
    pub retries: Option<u32>,
    pub refine_subchannel: Option<bool>,
    pub force_split: Option<bool>,
    pub unsupported: Option<bool>,
    pub skip: Option<String>,
    pub skip_fill: Option<u8>,
}

impl Defaults {
    /// Parse the `skip` field's colon-separated `first-last` ranges.
    pub fn skip_ranges(&self) -> CdResult<Vec<Range>> {
        match &self.skip {
            Some(s) => string_to_ranges(s),
            None => Ok(Vec::new()),
        }
    }
}

/// Top-level shape of `discforge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub drive: DriveOverride,
    pub defaults: Defaults,
}

impl Config {
    /// Load and parse `path`. Returns `Config::default()` if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> CdResult<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let text = fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&text).map_err(|e| Error::Format { path: path.to_path_buf(), desc: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_profile() -> DriveProfile {
        DriveProfile {
            vendor: "",
            product: "",
            read_method: ReadMethod::Be,
            cache: CacheQuirk::None,
            can_read_lead_in: false,
            max_read_sectors: 27,
            sector_order: crate::drive::SectorOrder::DataC2Sub,
            c2_shift: 0,
            pregap_start: -150,
        }
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("discforge.toml")).unwrap();
        assert!(config.drive.read_method.is_none());
        assert!(config.defaults.skip.is_none());
    }

    #[test]
    fn parses_drive_and_defaults_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("discforge.toml");
        fs::write(
            &path,
            r#"
            [drive]
            read_method = "d8"
            can_read_lead_in = true
            sector_order = "data_sub_c2"
            c2_shift = 294
            pregap_start = -182

            [defaults]
            speed = 8
            skip = "0-10:2000-2010"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();

        let mut profile = test_profile();
        config.drive.apply(&mut profile).unwrap();
        assert_eq!(profile.read_method, ReadMethod::D8);
        assert!(profile.can_read_lead_in);
        assert_eq!(profile.sector_order, SectorOrder::DataSubC2);
        assert_eq!(profile.c2_shift, 294);
        assert_eq!(profile.pregap_start, -182);

        assert_eq!(config.defaults.speed, Some(8));
        assert_eq!(config.defaults.skip_ranges().unwrap(), vec![(0, 10), (2000, 2010)]);
    }

    #[test]
    fn rejects_unknown_sector_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("discforge.toml");
        fs::write(&path, "[drive]\nsector_order = \"bogus\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        let mut profile = test_profile();
        assert!(config.drive.apply(&mut profile).is_err());
    }

    #[test]
    fn rejects_unknown_read_method() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("discforge.toml");
        fs::write(&path, "[drive]\nread_method = \"bogus\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        let mut profile = test_profile();
        assert!(config.drive.apply(&mut profile).is_err());
    }
}
