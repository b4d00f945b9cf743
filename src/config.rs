//! Configuration for the two container engines
//!
//! [`GTiffConfig`] is built once (from the environment, a lookup function or
//! JSON) and handed to a dataset at open time. [`PcidskCreateOptions`] parses
//! the PCIDSK creation option string.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{RasterError, Result};
use crate::types::Interleaving;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default number of strile locations kept per layer
pub const DEFAULT_STRILE_CACHE_SIZE: usize = 1024;

/// Default PCIDSK tile edge
pub const DEFAULT_TILE_SIZE: usize = 127;

/// Whether striles may be accessed through a memory-mapped style direct path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VirtualMemIo {
    #[default]
    No,
    Yes,
    IfEnoughRam,
}

/// Flavor of GeoKeys written for projected systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeoKeysFlavor {
    #[default]
    Standard,
    EsriPe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeoTiffVersion {
    #[default]
    Auto,
    V1_0,
    V1_1,
}

/// Runtime switches for the GeoTIFF engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GTiffConfig {
    /// `GTIFF_DIRECT_IO`
    pub direct_io: bool,
    /// `GTIFF_VIRTUAL_MEM_IO`
    pub virtual_mem_io: VirtualMemIo,
    /// `GTIFF_IGNORE_READ_ERRORS`
    pub ignore_read_errors: bool,
    /// `GDAL_TIFF_INTERNAL_MASK_TO_8BIT`
    pub internal_mask_to_8bit: bool,
    /// `GEOTIFF_KEYS_FLAVOR`
    pub geotiff_keys_flavor: GeoKeysFlavor,
    /// `GEOTIFF_VERSION`
    pub geotiff_version: GeoTiffVersion,
    /// `GTIFF_STRILE_CACHE_SIZE`
    pub strile_cache_size: usize,
    /// `GTIFF_NUM_THREADS`; 0 compresses on the calling thread
    pub num_threads: usize,
}

impl Default for GTiffConfig {
    fn default() -> Self {
        Self {
            direct_io: false,
            virtual_mem_io: VirtualMemIo::No,
            ignore_read_errors: false,
            internal_mask_to_8bit: true,
            geotiff_keys_flavor: GeoKeysFlavor::Standard,
            geotiff_version: GeoTiffVersion::Auto,
            strile_cache_size: DEFAULT_STRILE_CACHE_SIZE,
            num_threads: 0,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "NO" | "FALSE" | "OFF" | "0"
    )
}

fn bad_value(key: &str, value: &str) -> RasterError {
    RasterError::Configuration(format!("invalid value '{}' for {}", value, key))
}

impl GTiffConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("GTIFF_DIRECT_IO") {
            config.direct_io = parse_bool(&v);
        }
        if let Some(v) = lookup("GTIFF_VIRTUAL_MEM_IO") {
            config.virtual_mem_io = match v.trim().to_ascii_uppercase().as_str() {
                "IF_ENOUGH_RAM" => VirtualMemIo::IfEnoughRam,
                other if parse_bool(other) => VirtualMemIo::Yes,
                _ => VirtualMemIo::No,
            };
        }
        if let Some(v) = lookup("GTIFF_IGNORE_READ_ERRORS") {
            config.ignore_read_errors = parse_bool(&v);
        }
        if let Some(v) = lookup("GDAL_TIFF_INTERNAL_MASK_TO_8BIT") {
            config.internal_mask_to_8bit = parse_bool(&v);
        }
        if let Some(v) = lookup("GEOTIFF_KEYS_FLAVOR") {
            config.geotiff_keys_flavor = match v.trim().to_ascii_uppercase().as_str() {
                "STANDARD" => GeoKeysFlavor::Standard,
                "ESRI_PE" => GeoKeysFlavor::EsriPe,
                _ => return Err(bad_value("GEOTIFF_KEYS_FLAVOR", &v)),
            };
        }
        if let Some(v) = lookup("GEOTIFF_VERSION") {
            config.geotiff_version = match v.trim().to_ascii_uppercase().as_str() {
                "AUTO" => GeoTiffVersion::Auto,
                "1.0" => GeoTiffVersion::V1_0,
                "1.1" => GeoTiffVersion::V1_1,
                _ => return Err(bad_value("GEOTIFF_VERSION", &v)),
            };
        }
        if let Some(v) = lookup("GTIFF_STRILE_CACHE_SIZE") {
            config.strile_cache_size = v
                .trim()
                .parse()
                .map_err(|_| bad_value("GTIFF_STRILE_CACHE_SIZE", &v))?;
        }
        if let Some(v) = lookup("GTIFF_NUM_THREADS") {
            config.num_threads = if v.trim().eq_ignore_ascii_case("ALL_CPUS") {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            } else {
                v.trim()
                    .parse()
                    .map_err(|_| bad_value("GTIFF_NUM_THREADS", &v))?
            };
        }

        Ok(config)
    }

    /// Load from a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether uncompressed striles may be read row by row straight from the file
    pub fn uses_direct_path(&self) -> bool {
        self.direct_io || self.virtual_mem_io != VirtualMemIo::No
    }
}

/// Parsed PCIDSK creation option string, e.g. `"TILED256 RLE"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcidskCreateOptions {
    pub interleaving: Interleaving,
    pub tile_size: usize,
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
    /// Zero-fill the image data area at creation (cleared by `NOZERO`)
    pub zero_fill: bool,
    /// Create external channel files for FILE interleaving (cleared by `FILENOCREATE`)
    pub create_external_files: bool,
}

impl Default for PcidskCreateOptions {
    fn default() -> Self {
        Self {
            interleaving: Interleaving::Band,
            tile_size: DEFAULT_TILE_SIZE,
            compression: CompressionMethod::None,
            level: CompressionLevel::default(),
            zero_fill: true,
            create_external_files: true,
        }
    }
}

impl PcidskCreateOptions {
    pub fn tiled(tile_size: usize, compression: CompressionMethod) -> Self {
        Self {
            interleaving: Interleaving::Tiled,
            tile_size,
            compression,
            level: if compression == CompressionMethod::Jpeg {
                CompressionLevel::new(CompressionLevel::DEFAULT_JPEG_QUALITY)
            } else {
                CompressionLevel::default()
            },
            ..Self::default()
        }
    }

    fn parse_compression(token: &str) -> Option<(CompressionMethod, CompressionLevel)> {
        match token {
            "NONE" => Some((CompressionMethod::None, CompressionLevel::default())),
            "RLE" => Some((CompressionMethod::Rle, CompressionLevel::default())),
            _ => {
                let quality = token.strip_prefix("JPEG")?;
                if quality.is_empty() {
                    return Some((
                        CompressionMethod::Jpeg,
                        CompressionLevel::new(CompressionLevel::DEFAULT_JPEG_QUALITY),
                    ));
                }
                let quality: u8 = quality.parse().ok()?;
                Some((CompressionMethod::Jpeg, CompressionLevel::new(quality)))
            }
        }
    }
}

impl FromStr for PcidskCreateOptions {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        let mut options = Self::default();
        let mut saw_tiled = false;

        let upper = s.to_ascii_uppercase();
        let tokens = upper
            .split(|c: char| c == ',' || c == '=' || c.is_whitespace())
            .filter(|t| !t.is_empty());

        for token in tokens {
            if let Some(interleaving) = Interleaving::parse(token) {
                options.interleaving = interleaving;
                saw_tiled = interleaving == Interleaving::Tiled;
            } else if let Some(size) = token.strip_prefix("TILED") {
                let size: usize = size
                    .parse()
                    .map_err(|_| RasterError::Configuration(format!("bad tile size in '{}'", token)))?;
                options.interleaving = Interleaving::Tiled;
                options.tile_size = size;
                saw_tiled = true;
            } else if saw_tiled && token.bytes().all(|b| b.is_ascii_digit()) {
                options.tile_size = token
                    .parse()
                    .map_err(|_| RasterError::Configuration(format!("bad tile size '{}'", token)))?;
            } else if let Some((method, level)) = Self::parse_compression(token) {
                options.compression = method;
                options.level = level;
            } else if token == "NOZERO" {
                options.zero_fill = false;
            } else if token == "FILENOCREATE" {
                options.create_external_files = false;
            } else if token == "TILEV1" {
                // Only one tile directory layout is written
            } else {
                return Err(RasterError::Configuration(format!(
                    "unsupported PCIDSK creation option '{}'",
                    token
                )));
            }
        }

        if options.interleaving == Interleaving::Tiled {
            if options.tile_size == 0 {
                return Err(RasterError::InvalidDimensions(
                    "tile size must be positive".to_string(),
                ));
            }
        } else if options.compression != CompressionMethod::None {
            return Err(RasterError::Configuration(format!(
                "compression requires TILED interleaving, got {}",
                options.interleaving.as_str()
            )));
        }

        Ok(options)
    }
}

impl fmt::Display for PcidskCreateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interleaving == Interleaving::Tiled {
            write!(f, "TILED{}", self.tile_size)?;
            match self.compression {
                CompressionMethod::Jpeg => write!(f, " JPEG{}", self.level.value())?,
                CompressionMethod::Rle => write!(f, " RLE")?,
                _ => write!(f, " NONE")?,
            }
        } else {
            write!(f, "{}", self.interleaving.as_str())?;
        }
        if !self.zero_fill {
            write!(f, " NOZERO")?;
        }
        if !self.create_external_files {
            write!(f, " FILENOCREATE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GTiffConfig::default();
        assert!(config.internal_mask_to_8bit);
        assert_eq!(config.strile_cache_size, DEFAULT_STRILE_CACHE_SIZE);
        assert!(!config.uses_direct_path());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("GTIFF_DIRECT_IO", "YES"),
            ("GTIFF_VIRTUAL_MEM_IO", "IF_ENOUGH_RAM"),
            ("GTIFF_IGNORE_READ_ERRORS", "ON"),
            ("GDAL_TIFF_INTERNAL_MASK_TO_8BIT", "NO"),
            ("GEOTIFF_KEYS_FLAVOR", "ESRI_PE"),
            ("GEOTIFF_VERSION", "1.1"),
            ("GTIFF_STRILE_CACHE_SIZE", "16"),
            ("GTIFF_NUM_THREADS", "2"),
        ]
        .into_iter()
        .collect();

        let config = GTiffConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(config.direct_io);
        assert_eq!(config.virtual_mem_io, VirtualMemIo::IfEnoughRam);
        assert!(config.ignore_read_errors);
        assert!(!config.internal_mask_to_8bit);
        assert_eq!(config.geotiff_keys_flavor, GeoKeysFlavor::EsriPe);
        assert_eq!(config.geotiff_version, GeoTiffVersion::V1_1);
        assert_eq!(config.strile_cache_size, 16);
        assert_eq!(config.num_threads, 2);
    }

    #[test]
    fn test_invalid_lookup_values() {
        let err = GTiffConfig::from_lookup(|k| {
            (k == "GEOTIFF_VERSION").then(|| "2.0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RasterError::Configuration(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let config = GTiffConfig {
            ignore_read_errors: true,
            num_threads: 4,
            ..GTiffConfig::default()
        };
        let json = config.to_json().unwrap();
        assert_eq!(GTiffConfig::from_json(&json).unwrap(), config);

        let partial = GTiffConfig::from_json(r#"{"direct_io": true}"#).unwrap();
        assert!(partial.direct_io);
        assert_eq!(partial.strile_cache_size, DEFAULT_STRILE_CACHE_SIZE);
    }

    #[test]
    fn test_create_options_tiled() {
        let options: PcidskCreateOptions = "TILED128 RLE".parse().unwrap();
        assert_eq!(options.interleaving, Interleaving::Tiled);
        assert_eq!(options.tile_size, 128);
        assert_eq!(options.compression, CompressionMethod::Rle);

        let options: PcidskCreateOptions = "TILED,256,JPEG90".parse().unwrap();
        assert_eq!(options.tile_size, 256);
        assert_eq!(options.compression, CompressionMethod::Jpeg);
        assert_eq!(options.level.value(), 90);

        let options: PcidskCreateOptions = "TILED=64".parse().unwrap();
        assert_eq!(options.tile_size, 64);

        let options: PcidskCreateOptions = "tiled".parse().unwrap();
        assert_eq!(options.tile_size, DEFAULT_TILE_SIZE);
        assert_eq!(options.compression, CompressionMethod::None);
        assert_eq!(options.to_string(), "TILED127 NONE");
    }

    #[test]
    fn test_create_options_flags() {
        let options: PcidskCreateOptions = "FILE FILENOCREATE".parse().unwrap();
        assert_eq!(options.interleaving, Interleaving::File);
        assert!(!options.create_external_files);

        let options: PcidskCreateOptions = "PIXEL,NOZERO".parse().unwrap();
        assert!(!options.zero_fill);
        assert_eq!(options.to_string(), "PIXEL NOZERO");

        let options: PcidskCreateOptions = "".parse().unwrap();
        assert_eq!(options, PcidskCreateOptions::default());
    }

    #[test]
    fn test_create_options_errors() {
        assert!("TILED QUADTREE".parse::<PcidskCreateOptions>().is_err());
        assert!("TILEV2".parse::<PcidskCreateOptions>().is_err());
        assert!("BAND RLE".parse::<PcidskCreateOptions>().is_err());
        assert!("TILED0".parse::<PcidskCreateOptions>().is_err());
    }
}
