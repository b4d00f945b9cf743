//! Compression and decompression of tiles and striles

use crate::error::{RasterError, Result};
use crate::types::DataType;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Compression methods understood by the block engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// PCIDSK run-length encoding over pixel groups
    Rle = 1,
    /// Baseline JPEG (8-bit only)
    Jpeg = 2,
    /// Deflate/ZIP compression
    Deflate = 3,
    /// Zstandard compression
    Zstd = 4,
}

impl CompressionMethod {
    /// Parse the PCIDSK tile-layer compression name (`NONE`, `RLE`, `JPEG75`)
    pub fn from_pcidsk_name(name: &str) -> Result<(Self, CompressionLevel)> {
        let name = name.trim();
        if name.is_empty() || name == "NONE" {
            return Ok((CompressionMethod::None, CompressionLevel::default()));
        }
        if name == "RLE" {
            return Ok((CompressionMethod::Rle, CompressionLevel::default()));
        }
        if let Some(quality) = name.strip_prefix("JPEG") {
            let quality = if quality.is_empty() {
                CompressionLevel::DEFAULT_JPEG_QUALITY
            } else {
                quality.parse::<u8>().map_err(|_| {
                    RasterError::corrupt(format!("bad JPEG quality in '{}'", name))
                })?
            };
            return Ok((CompressionMethod::Jpeg, CompressionLevel::new(quality)));
        }
        Err(RasterError::CodecUnavailable(format!(
            "tile compression '{}'",
            name
        )))
    }

    /// PCIDSK tile-layer compression name
    pub fn pcidsk_name(&self, level: CompressionLevel) -> Result<String> {
        match self {
            CompressionMethod::None => Ok("NONE".to_string()),
            CompressionMethod::Rle => Ok("RLE".to_string()),
            CompressionMethod::Jpeg => Ok(format!("JPEG{}", level.value())),
            other => Err(RasterError::Configuration(format!(
                "{:?} is not a PCIDSK tile compression",
                other
            ))),
        }
    }

    /// TIFF `Compression` tag value
    pub fn tiff_code(&self) -> Result<u16> {
        match self {
            CompressionMethod::None => Ok(1),
            CompressionMethod::Jpeg => Ok(7),
            CompressionMethod::Deflate => Ok(8),
            CompressionMethod::Zstd => Ok(50000),
            CompressionMethod::Rle => Err(RasterError::Configuration(
                "PCIDSK RLE cannot be used in TIFF".to_string(),
            )),
        }
    }

    pub fn from_tiff_code(code: u16) -> Result<Self> {
        match code {
            1 => Ok(CompressionMethod::None),
            7 => Ok(CompressionMethod::Jpeg),
            8 | 32946 => Ok(CompressionMethod::Deflate),
            50000 => Ok(CompressionMethod::Zstd),
            other => Err(RasterError::CodecUnavailable(format!(
                "TIFF compression {}",
                other
            ))),
        }
    }
}

/// Compression level or quality (0-100; deflate clamps to 9, zstd to 22)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub const DEFAULT_JPEG_QUALITY: u8 = 75;

    pub fn new(level: u8) -> Self {
        Self(level.min(100))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Shape of the block being (de)compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub width: usize,
    pub height: usize,
    /// Pixel type; for pixel-interleaved striles the pixel group is
    /// `data_type.size_in_bytes() * samples`
    pub data_type: DataType,
    pub samples: usize,
    pub level: CompressionLevel,
}

impl CodecParams {
    pub fn new(width: usize, height: usize, data_type: DataType) -> Self {
        Self {
            width,
            height,
            data_type,
            samples: 1,
            level: CompressionLevel::default(),
        }
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn pixel_group_size(&self) -> usize {
        self.data_type.size_in_bytes() * self.samples
    }

    /// Size of the fully decoded block
    pub fn decoded_size(&self) -> usize {
        self.width * self.height * self.pixel_group_size()
    }
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress one full block
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>>;

    /// Decompress one block; output is at most `params.decoded_size()` bytes
    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _params: &CodecParams) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// Deflate (zlib-wrapped, as TIFF stores it)
#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        let level = params.level.value().min(9) as u32;
        let mut encoder = ZlibEncoder::new(data, FlateCompression::new(level));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| RasterError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        let limit = params.decoded_size() as u64;
        let mut decoder = ZlibDecoder::new(data).take(limit + 1);
        let mut decompressed = Vec::with_capacity(limit as usize);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| RasterError::corrupt(format!("deflate stream: {}", e)))?;
        if decompressed.len() as u64 > limit {
            return Err(RasterError::corrupt("deflate stream larger than block"));
        }
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        zstd::encode_all(data, params.level.value().min(22) as i32)
            .map_err(|e| RasterError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        let decompressed = zstd::decode_all(data)
            .map_err(|e| RasterError::corrupt(format!("zstd frame: {}", e)))?;
        if decompressed.len() > params.decoded_size() {
            return Err(RasterError::corrupt("zstd frame larger than block"));
        }
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// PCIDSK run-length encoding.
///
/// The stream is a sequence of `(count, payload)` records over pixel groups.
/// `count > 127` repeats one group `count - 128` times; `count <= 127` is
/// followed by `count` literal groups.
#[derive(Debug, Default)]
pub struct RleCompressor;

impl RleCompressor {
    const MAX_RUN: usize = 127;
    const MIN_REPEAT: usize = 3;

    fn groups_equal(data: &[u8], a: usize, b: usize, group: usize) -> bool {
        data[a..a + group] == data[b..b + group]
    }

    /// Length of the run of identical groups starting at `start`, capped
    fn run_length(data: &[u8], start: usize, group: usize) -> usize {
        let mut count = 1;
        while count < Self::MAX_RUN
            && start + (count + 1) * group <= data.len()
            && Self::groups_equal(data, start, start + count * group, group)
        {
            count += 1;
        }
        count
    }

    fn compress_internal(data: &[u8], group: usize) -> Result<Vec<u8>> {
        if group == 0 || data.len() % group != 0 {
            return Err(RasterError::Compression(format!(
                "RLE input of {} bytes is not a whole number of {}-byte pixels",
                data.len(),
                group
            )));
        }

        let mut compressed = Vec::with_capacity(data.len() / 2);
        let mut offset = 0;

        while offset < data.len() {
            let run = Self::run_length(data, offset, group);
            if run >= Self::MIN_REPEAT {
                compressed.push((run + 128) as u8);
                compressed.extend_from_slice(&data[offset..offset + group]);
                offset += run * group;
                continue;
            }

            // Literal run up to the next repeat worth encoding
            let mut count = 1;
            while count < Self::MAX_RUN && offset + count * group < data.len() {
                if Self::run_length(data, offset + count * group, group) >= Self::MIN_REPEAT {
                    break;
                }
                count += 1;
            }
            compressed.push(count as u8);
            compressed.extend_from_slice(&data[offset..offset + count * group]);
            offset += count * group;
        }

        Ok(compressed)
    }

    fn decompress_internal(data: &[u8], group: usize, expected: usize) -> Result<Vec<u8>> {
        let mut decompressed = Vec::with_capacity(expected);
        let mut src = 0;

        while src < data.len() && decompressed.len() < expected {
            let count = data[src] as usize;
            src += 1;

            if count > 127 {
                let repeat = count - 128;
                if decompressed.len() + repeat * group > expected || src + group > data.len() {
                    return Err(RasterError::corrupt(
                        "RLE compressed tile corrupt, overrun avoided",
                    ));
                }
                for _ in 0..repeat {
                    decompressed.extend_from_slice(&data[src..src + group]);
                }
                src += group;
            } else {
                let bytes = count * group;
                if decompressed.len() + bytes > expected || src + bytes > data.len() {
                    return Err(RasterError::corrupt(
                        "RLE compressed tile corrupt, overrun avoided",
                    ));
                }
                decompressed.extend_from_slice(&data[src..src + bytes]);
                src += bytes;
            }
        }

        if src != data.len() || decompressed.len() != expected {
            return Err(RasterError::corrupt(format!(
                "RLE compressed tile corrupt, result incomplete ({} of {} bytes)",
                decompressed.len(),
                expected
            )));
        }

        Ok(decompressed)
    }
}

impl Compressor for RleCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        Self::compress_internal(data, params.pixel_group_size())
    }

    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        Self::decompress_internal(data, params.pixel_group_size(), params.decoded_size())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Rle
    }
}

/// Baseline JPEG for 8-bit single-sample blocks
#[cfg(feature = "jpeg")]
#[derive(Debug, Default)]
pub struct JpegCompressor;

#[cfg(feature = "jpeg")]
impl JpegCompressor {
    fn color_type(params: &CodecParams) -> Result<jpeg_encoder::ColorType> {
        if params.data_type != DataType::U8 {
            return Err(RasterError::Compression(format!(
                "JPEG requires 8-bit data, got {}",
                params.data_type
            )));
        }
        match params.samples {
            1 => Ok(jpeg_encoder::ColorType::Luma),
            3 => Ok(jpeg_encoder::ColorType::Rgb),
            n => Err(RasterError::Compression(format!(
                "JPEG cannot encode {} samples per pixel",
                n
            ))),
        }
    }
}

#[cfg(feature = "jpeg")]
impl Compressor for JpegCompressor {
    fn compress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        let color_type = Self::color_type(params)?;
        let (width, height) = (
            u16::try_from(params.width),
            u16::try_from(params.height),
        );
        let (Ok(width), Ok(height)) = (width, height) else {
            return Err(RasterError::Compression(
                "JPEG block larger than 65535 pixels".to_string(),
            ));
        };

        let mut buffer = Vec::new();
        let encoder = jpeg_encoder::Encoder::new(&mut buffer, params.level.value().clamp(1, 100));
        encoder
            .encode(data, width, height, color_type)
            .map_err(|e: jpeg_encoder::EncodingError| RasterError::Compression(e.to_string()))?;
        Ok(buffer)
    }

    fn decompress(&self, data: &[u8], params: &CodecParams) -> Result<Vec<u8>> {
        Self::color_type(params)?;
        let mut decoder = jpeg_decoder::Decoder::new(data);
        let pixels = decoder
            .decode()
            .map_err(|e| RasterError::corrupt(format!("JPEG stream: {}", e)))?;
        if pixels.len() > params.decoded_size() {
            return Err(RasterError::corrupt("JPEG image larger than block"));
        }
        Ok(pixels)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Jpeg
    }
}

/// Get the built-in compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Result<Arc<dyn Compressor>> {
    match method {
        CompressionMethod::None => Ok(Arc::new(NoneCompressor)),
        CompressionMethod::Rle => Ok(Arc::new(RleCompressor)),
        CompressionMethod::Deflate => Ok(Arc::new(DeflateCompressor)),
        CompressionMethod::Zstd => Ok(Arc::new(ZstdCompressor)),
        #[cfg(feature = "jpeg")]
        CompressionMethod::Jpeg => Ok(Arc::new(JpegCompressor)),
        #[cfg(not(feature = "jpeg"))]
        CompressionMethod::Jpeg => Err(RasterError::CodecUnavailable(
            "JPEG support not compiled in; register an external codec".to_string(),
        )),
    }
}

/// Codec lookup with caller-registered overrides (e.g. an external JPEG codec)
#[derive(Default)]
pub struct CodecRegistry {
    overrides: RwLock<HashMap<CompressionMethod, Arc<dyn Compressor>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec, replacing the built-in one for its method
    pub fn register(&self, codec: Arc<dyn Compressor>) {
        self.overrides.write().insert(codec.method(), codec);
    }

    pub fn get(&self, method: CompressionMethod) -> Result<Arc<dyn Compressor>> {
        if let Some(codec) = self.overrides.read().get(&method) {
            return Ok(Arc::clone(codec));
        }
        get_compressor(method)
    }
}
