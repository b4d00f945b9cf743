//! Core data types for raster block storage

use crate::error::{RasterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel data types supported by the two containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 0,
    /// Signed 8-bit integer
    I8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Signed 16-bit integer
    I16 = 3,
    /// Unsigned 32-bit integer
    U32 = 4,
    /// Signed 32-bit integer
    I32 = 5,
    /// 32-bit floating point
    F32 = 6,
    /// 64-bit floating point
    F64 = 7,
    /// Complex, unsigned 16-bit components
    C16U = 8,
    /// Complex, signed 16-bit components
    C16S = 9,
    /// Complex, 32-bit float components
    C32R = 10,
}

impl DataType {
    /// Size in bytes of one pixel of this type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::C16U | DataType::C16S => 4,
            DataType::F64 | DataType::C32R => 8,
        }
    }

    /// Size of the unit that byte swapping operates on
    pub fn word_size(&self) -> usize {
        match self {
            DataType::C16U | DataType::C16S => 2,
            DataType::C32R => 4,
            other => other.size_in_bytes(),
        }
    }

    /// PCIDSK channel type code, if the type can live in a PCIDSK file
    pub fn pcidsk_code(&self) -> Option<&'static str> {
        match self {
            DataType::U8 => Some("8U"),
            DataType::I16 => Some("16S"),
            DataType::U16 => Some("16U"),
            DataType::F32 => Some("32R"),
            DataType::C16U => Some("C16U"),
            DataType::C16S => Some("C16S"),
            DataType::C32R => Some("C32R"),
            _ => None,
        }
    }

    pub fn from_pcidsk_code(code: &str) -> Result<Self> {
        match code.trim() {
            "8U" => Ok(DataType::U8),
            "16S" => Ok(DataType::I16),
            "16U" => Ok(DataType::U16),
            "32R" => Ok(DataType::F32),
            "C16U" => Ok(DataType::C16U),
            "C16S" => Ok(DataType::C16S),
            "C32R" => Ok(DataType::C32R),
            other => Err(RasterError::corrupt(format!(
                "unknown PCIDSK channel type '{}'",
                other
            ))),
        }
    }

    /// TIFF `(BitsPerSample, SampleFormat)` for this type
    pub fn tiff_sample(&self) -> Result<(u16, u16)> {
        match self {
            DataType::U8 => Ok((8, 1)),
            DataType::I8 => Ok((8, 2)),
            DataType::U16 => Ok((16, 1)),
            DataType::I16 => Ok((16, 2)),
            DataType::U32 => Ok((32, 1)),
            DataType::I32 => Ok((32, 2)),
            DataType::F32 => Ok((32, 3)),
            DataType::F64 => Ok((64, 3)),
            complex => Err(RasterError::Configuration(format!(
                "{} cannot be stored in a TIFF strile",
                complex
            ))),
        }
    }

    pub fn from_tiff_sample(bits_per_sample: u16, sample_format: u16) -> Result<Self> {
        match (bits_per_sample, sample_format) {
            (8, 1) => Ok(DataType::U8),
            (8, 2) => Ok(DataType::I8),
            (16, 1) => Ok(DataType::U16),
            (16, 2) => Ok(DataType::I16),
            (32, 1) => Ok(DataType::U32),
            (32, 2) => Ok(DataType::I32),
            (32, 3) => Ok(DataType::F32),
            (64, 3) => Ok(DataType::F64),
            (bits, format) => Err(RasterError::CodecUnavailable(format!(
                "{}-bit samples with SampleFormat={}",
                bits, format
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How PCIDSK image data is organised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interleaving {
    /// All channels of one pixel stored together
    Pixel,
    /// One contiguous plane per channel
    Band,
    /// One external raw file per channel
    File,
    /// Compressed tiles in block-map virtual files
    Tiled,
}

impl Interleaving {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interleaving::Pixel => "PIXEL",
            Interleaving::Band => "BAND",
            Interleaving::File => "FILE",
            Interleaving::Tiled => "TILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "PIXEL" => Some(Interleaving::Pixel),
            "BAND" => Some(Interleaving::Band),
            "FILE" => Some(Interleaving::File),
            "TILED" => Some(Interleaving::Tiled),
            _ => None,
        }
    }
}

/// Whether an opened container may be modified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    Update,
}

impl AccessMode {
    pub fn is_update(&self) -> bool {
        matches!(self, AccessMode::Update)
    }
}

/// How a byte stream is opened by an I/O manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing stream, read only
    Read,
    /// Existing stream, read and write
    Update,
    /// New or truncated stream, read and write
    Create,
}

impl OpenMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl From<AccessMode> for OpenMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::ReadOnly => OpenMode::Read,
            AccessMode::Update => OpenMode::Update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::I16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::C16S.size_in_bytes(), 4);
        assert_eq!(DataType::C32R.size_in_bytes(), 8);
        assert_eq!(DataType::C32R.word_size(), 4);
    }

    #[test]
    fn test_pcidsk_codes() {
        for dt in [
            DataType::U8,
            DataType::I16,
            DataType::U16,
            DataType::F32,
            DataType::C16U,
            DataType::C16S,
            DataType::C32R,
        ] {
            let code = dt.pcidsk_code().unwrap();
            assert_eq!(DataType::from_pcidsk_code(code).unwrap(), dt);
        }
        assert!(DataType::F64.pcidsk_code().is_none());
        assert!(DataType::from_pcidsk_code("64R").unwrap_err().is_corruption());
    }

    #[test]
    fn test_tiff_samples() {
        assert_eq!(DataType::F32.tiff_sample().unwrap(), (32, 3));
        assert_eq!(DataType::from_tiff_sample(16, 2).unwrap(), DataType::I16);
        assert!(DataType::C16S.tiff_sample().is_err());
        assert!(DataType::from_tiff_sample(12, 1).is_err());
    }

    #[test]
    fn test_interleaving_names() {
        assert_eq!(Interleaving::parse("TILED"), Some(Interleaving::Tiled));
        assert_eq!(Interleaving::parse("PIXEL   "), Some(Interleaving::Pixel));
        assert_eq!(Interleaving::parse("LINE"), None);
        assert_eq!(Interleaving::Band.as_str(), "BAND");
    }
}
