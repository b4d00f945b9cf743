//! Image file directories: parsing, defaults and serialization

use crate::error::{RasterError, Result};
use crate::io::SharedFile;
use crate::layout::RasterLayout;
use crate::types::DataType;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub const TAG_NEW_SUBFILE_TYPE: u16 = 254;
pub const TAG_IMAGE_WIDTH: u16 = 256;
pub const TAG_IMAGE_LENGTH: u16 = 257;
pub const TAG_BITS_PER_SAMPLE: u16 = 258;
pub const TAG_COMPRESSION: u16 = 259;
pub const TAG_PHOTOMETRIC: u16 = 262;
pub const TAG_STRIP_OFFSETS: u16 = 273;
pub const TAG_SAMPLES_PER_PIXEL: u16 = 277;
pub const TAG_ROWS_PER_STRIP: u16 = 278;
pub const TAG_STRIP_BYTE_COUNTS: u16 = 279;
pub const TAG_PLANAR_CONFIG: u16 = 284;
pub const TAG_PREDICTOR: u16 = 317;
pub const TAG_TILE_WIDTH: u16 = 322;
pub const TAG_TILE_LENGTH: u16 = 323;
pub const TAG_TILE_OFFSETS: u16 = 324;
pub const TAG_TILE_BYTE_COUNTS: u16 = 325;
pub const TAG_EXTRA_SAMPLES: u16 = 338;
pub const TAG_SAMPLE_FORMAT: u16 = 339;

/// NewSubfileType bits
pub const FILETYPE_REDUCEDIMAGE: u32 = 0x1;
pub const FILETYPE_MASK: u32 = 0x4;

pub const PHOTOMETRIC_MINISBLACK: u16 = 1;
pub const PHOTOMETRIC_RGB: u16 = 2;
pub const PHOTOMETRIC_MASK: u16 = 4;

pub const PLANAR_CONTIG: u16 = 1;
pub const PLANAR_SEPARATE: u16 = 2;

const TYPE_BYTE: u16 = 1;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

const ENTRY_SIZE: usize = 12;
const MAX_ENTRIES: usize = 4096;

/// Byte order of a TIFF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], value: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(buf, value),
            Endian::Big => BigEndian::write_u16(buf, value),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], value: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, value),
            Endian::Big => BigEndian::write_u32(buf, value),
        }
    }
}

/// Size of one value of a classic TIFF field type
pub fn field_type_size(field_type: u16) -> Result<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Ok(1),
        3 | 8 => Ok(2),
        4 | 9 | 11 => Ok(4),
        5 | 10 | 12 => Ok(8),
        other => Err(RasterError::corrupt(format!("unknown TIFF field type {}", other))),
    }
}

/// A tag this layer does not interpret, kept verbatim in file byte order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u32,
    pub data: Vec<u8>,
}

/// Offsets or byte counts of every strile in a directory.
///
/// `values` stays `None` until the whole array is needed; single values are
/// read from `location` in the meantime.
#[derive(Debug, Clone)]
pub struct StrileArray {
    pub field_type: u16,
    pub count: usize,
    pub location: u64,
    pub values: Option<Vec<u64>>,
    pub dirty: bool,
}

impl StrileArray {
    fn empty(count: usize) -> Self {
        Self {
            field_type: TYPE_LONG,
            count,
            location: 0,
            values: Some(vec![0; count]),
            dirty: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.values.is_some()
    }

    pub fn value_size(&self) -> usize {
        if self.field_type == TYPE_SHORT {
            2
        } else {
            4
        }
    }

    /// Decode one value from its on-disk bytes
    pub fn decode(&self, endian: Endian, raw: &[u8]) -> u64 {
        if self.field_type == TYPE_SHORT {
            endian.read_u16(raw) as u64
        } else {
            endian.read_u32(raw) as u64
        }
    }

    /// Encode every value in the array's field type
    pub fn encode(&self, endian: Endian) -> Result<Vec<u8>> {
        let size = self.value_size();
        let mut raw = vec![0u8; self.count * size];
        let values = self
            .values
            .as_deref()
            .ok_or_else(|| RasterError::corrupt("strile array not loaded"))?;
        for (chunk, &value) in raw.chunks_exact_mut(size).zip(values) {
            if size == 2 {
                let value = u16::try_from(value).map_err(|_| {
                    RasterError::ResourceLimit(format!("strile value {} exceeds SHORT", value))
                })?;
                endian.write_u16(chunk, value);
            } else {
                let value = u32::try_from(value).map_err(|_| {
                    RasterError::ResourceLimit(format!(
                        "strile value {} exceeds the 4 GiB classic TIFF limit",
                        value
                    ))
                })?;
                endian.write_u32(chunk, value);
            }
        }
        Ok(raw)
    }
}

/// One IFD with the fields the block engine needs
#[derive(Debug, Clone)]
pub struct Directory {
    pub offset: u64,
    pub next_offset: u64,
    pub entry_count: usize,
    pub subfile_type: u32,
    pub width: u32,
    pub height: u32,
    pub bits_per_sample: u16,
    pub samples_per_pixel: u16,
    pub sample_format: u16,
    pub compression: u16,
    pub photometric: u16,
    pub planar_config: u16,
    pub rows_per_strip: u32,
    pub tile_width: Option<u32>,
    pub tile_height: Option<u32>,
    pub offsets: StrileArray,
    pub byte_counts: StrileArray,
    pub extra: Vec<RawEntry>,
}

/// Shape of a directory to be written
#[derive(Debug, Clone, Copy)]
pub struct DirectorySpec {
    pub subfile_type: u32,
    pub width: u32,
    pub height: u32,
    pub data_type: DataType,
    pub samples_per_pixel: u16,
    pub compression: u16,
    pub photometric: u16,
    pub planar_config: u16,
    /// `Some((w, h))` for tiles, `None` for strips of `block_height` rows
    pub tile_size: Option<(u32, u32)>,
    pub block_height: u32,
}

struct RawField {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Inline value bytes, or the position of an external payload
    value: [u8; 4],
    size: usize,
}

impl Directory {
    /// Empty directory with all striles unwritten
    pub fn new(spec: DirectorySpec) -> Result<Self> {
        let (bits_per_sample, sample_format) = spec.data_type.tiff_sample()?;
        let mut dir = Self {
            offset: 0,
            next_offset: 0,
            entry_count: 0,
            subfile_type: spec.subfile_type,
            width: spec.width,
            height: spec.height,
            bits_per_sample,
            samples_per_pixel: spec.samples_per_pixel,
            sample_format,
            compression: spec.compression,
            photometric: spec.photometric,
            planar_config: spec.planar_config,
            rows_per_strip: spec.block_height.min(spec.height),
            tile_width: spec.tile_size.map(|(w, _)| w),
            tile_height: spec.tile_size.map(|(_, h)| h),
            offsets: StrileArray::empty(0),
            byte_counts: StrileArray::empty(0),
            extra: Vec::new(),
        };
        let count = dir.strile_count()?;
        dir.offsets = StrileArray::empty(count);
        dir.byte_counts = StrileArray::empty(count);
        Ok(dir)
    }

    pub fn is_tiled(&self) -> bool {
        self.tile_width.is_some()
    }

    pub fn is_planar_separate(&self) -> bool {
        self.planar_config == PLANAR_SEPARATE && self.samples_per_pixel > 1
    }

    pub fn is_reduced_image(&self) -> bool {
        self.subfile_type & FILETYPE_REDUCEDIMAGE != 0
    }

    pub fn is_mask(&self) -> bool {
        self.subfile_type & FILETYPE_MASK != 0 && self.photometric == PHOTOMETRIC_MASK
    }

    pub fn data_type(&self) -> Result<DataType> {
        DataType::from_tiff_sample(self.bits_per_sample, self.sample_format)
    }

    pub fn block_size(&self) -> (u32, u32) {
        match (self.tile_width, self.tile_height) {
            (Some(w), Some(h)) => (w, h),
            _ => (self.width, self.rows_per_strip),
        }
    }

    /// Block grid of one band
    pub fn layout(&self) -> Result<RasterLayout> {
        let (bw, bh) = self.block_size();
        RasterLayout::new(
            self.width as usize,
            self.height as usize,
            bw as usize,
            bh as usize,
            self.data_type()?,
        )
    }

    /// Number of striles: blocks per band, times bands when planes are separate
    pub fn strile_count(&self) -> Result<usize> {
        let per_plane = self.layout()?.block_count();
        Ok(if self.is_planar_separate() {
            per_plane * self.samples_per_pixel as usize
        } else {
            per_plane
        })
    }

    /// Rows actually encoded in a strile; the last strip may be short
    pub fn strile_rows(&self, block: usize) -> Result<usize> {
        let layout = self.layout()?;
        if self.is_tiled() {
            return Ok(layout.block_height);
        }
        let ((_, _), (y0, y1)) = layout.block_data_range(block % layout.block_count());
        Ok(y1 - y0)
    }

    /// Read the IFD at `offset`
    pub fn parse(file: &SharedFile, endian: Endian, offset: u64, file_len: u64) -> Result<Self> {
        if offset < 8 || offset + 2 > file_len {
            return Err(RasterError::corrupt(format!(
                "directory offset {} outside file of {} bytes",
                offset, file_len
            )));
        }
        let mut count_raw = [0u8; 2];
        file.read_at(&mut count_raw, offset)?;
        let entry_count = endian.read_u16(&count_raw) as usize;
        if entry_count == 0 || entry_count > MAX_ENTRIES {
            return Err(RasterError::corrupt(format!(
                "directory at {} has {} entries",
                offset, entry_count
            )));
        }
        let mut raw = vec![0u8; entry_count * ENTRY_SIZE + 4];
        file.read_at(&mut raw, offset + 2)?;

        let mut dir = Self {
            offset,
            next_offset: endian.read_u32(&raw[entry_count * ENTRY_SIZE..]) as u64,
            entry_count,
            subfile_type: 0,
            width: 0,
            height: 0,
            bits_per_sample: 1,
            samples_per_pixel: 1,
            sample_format: 1,
            compression: 1,
            photometric: PHOTOMETRIC_MINISBLACK,
            planar_config: PLANAR_CONTIG,
            rows_per_strip: u32::MAX,
            tile_width: None,
            tile_height: None,
            offsets: StrileArray::empty(0),
            byte_counts: StrileArray::empty(0),
            extra: Vec::new(),
        };
        let mut offsets = None;
        let mut byte_counts = None;

        for (i, entry) in raw[..entry_count * ENTRY_SIZE].chunks_exact(ENTRY_SIZE).enumerate() {
            let field = RawField {
                tag: endian.read_u16(&entry[0..2]),
                field_type: endian.read_u16(&entry[2..4]),
                count: endian.read_u32(&entry[4..8]),
                value: [entry[8], entry[9], entry[10], entry[11]],
                size: 0,
            };
            let size = field_type_size(field.field_type)? as u64 * field.count as u64;
            let field = RawField {
                size: size as usize,
                ..field
            };
            let inline_pos = offset + 2 + (i * ENTRY_SIZE) as u64 + 8;
            let location = if size <= 4 {
                inline_pos
            } else {
                let external = endian.read_u32(&field.value) as u64;
                if external + size > file_len {
                    return Err(RasterError::corrupt(format!(
                        "tag {} payload at {}+{} beyond end of file",
                        field.tag, external, size
                    )));
                }
                external
            };

            match field.tag {
                TAG_NEW_SUBFILE_TYPE => dir.subfile_type = read_scalar(file, endian, &field, location)? as u32,
                TAG_IMAGE_WIDTH => dir.width = read_scalar(file, endian, &field, location)? as u32,
                TAG_IMAGE_LENGTH => dir.height = read_scalar(file, endian, &field, location)? as u32,
                TAG_BITS_PER_SAMPLE => {
                    dir.bits_per_sample = read_scalar(file, endian, &field, location)? as u16
                }
                TAG_COMPRESSION => dir.compression = read_scalar(file, endian, &field, location)? as u16,
                TAG_PHOTOMETRIC => dir.photometric = read_scalar(file, endian, &field, location)? as u16,
                TAG_SAMPLES_PER_PIXEL => {
                    dir.samples_per_pixel = read_scalar(file, endian, &field, location)? as u16
                }
                TAG_ROWS_PER_STRIP => {
                    dir.rows_per_strip = read_scalar(file, endian, &field, location)? as u32
                }
                TAG_PLANAR_CONFIG => dir.planar_config = read_scalar(file, endian, &field, location)? as u16,
                TAG_TILE_WIDTH => dir.tile_width = Some(read_scalar(file, endian, &field, location)? as u32),
                TAG_TILE_LENGTH => dir.tile_height = Some(read_scalar(file, endian, &field, location)? as u32),
                TAG_SAMPLE_FORMAT => dir.sample_format = read_scalar(file, endian, &field, location)? as u16,
                TAG_STRIP_OFFSETS | TAG_TILE_OFFSETS => offsets = Some(strile_array(&field, location)?),
                TAG_STRIP_BYTE_COUNTS | TAG_TILE_BYTE_COUNTS => {
                    byte_counts = Some(strile_array(&field, location)?)
                }
                tag => {
                    if tag == TAG_PREDICTOR {
                        let predictor = read_scalar(file, endian, &field, location)?;
                        if predictor != 1 {
                            return Err(RasterError::CodecUnavailable(format!(
                                "predictor {} is not supported",
                                predictor
                            )));
                        }
                    }
                    let mut data = vec![0u8; field.size];
                    if field.size <= 4 {
                        data.copy_from_slice(&field.value[..field.size]);
                    } else {
                        file.read_at(&mut data, location)?;
                    }
                    dir.extra.push(RawEntry {
                        tag,
                        field_type: field.field_type,
                        count: field.count,
                        data,
                    });
                }
            }
        }

        if dir.width == 0 || dir.height == 0 {
            return Err(RasterError::corrupt(format!(
                "directory at {} has no image size",
                offset
            )));
        }
        if dir.tile_width.is_some() != dir.tile_height.is_some() {
            return Err(RasterError::corrupt("tile width and length must appear together"));
        }
        if dir.samples_per_pixel == 0 {
            return Err(RasterError::corrupt("SamplesPerPixel is zero"));
        }
        dir.rows_per_strip = dir.rows_per_strip.clamp(1, dir.height);

        let expected = dir.strile_count()?;
        let (Some(offsets), Some(byte_counts)) = (offsets, byte_counts) else {
            return Err(RasterError::corrupt(format!(
                "directory at {} lacks strile offsets or byte counts",
                offset
            )));
        };
        if offsets.count != expected || byte_counts.count != expected {
            return Err(RasterError::corrupt(format!(
                "strile arrays hold {}/{} values, image needs {}",
                offsets.count, byte_counts.count, expected
            )));
        }
        dir.offsets = offsets;
        dir.byte_counts = byte_counts;
        Ok(dir)
    }

    /// Serialize this directory for writing at `position`.
    ///
    /// Tags are sorted, payloads larger than four bytes follow the entry
    /// table on word boundaries, and the strile array locations are updated
    /// to where they will land.
    pub fn encode(&mut self, endian: Endian, position: u64) -> Result<Vec<u8>> {
        let tiled = self.is_tiled();
        let spp = self.samples_per_pixel as usize;
        let mut fields: Vec<(u16, u16, u32, Vec<u8>)> = Vec::new();

        let short = |values: &[u16]| {
            let mut raw = vec![0u8; values.len() * 2];
            for (chunk, v) in raw.chunks_exact_mut(2).zip(values) {
                endian.write_u16(chunk, *v);
            }
            raw
        };
        let long = |value: u32| {
            let mut raw = vec![0u8; 4];
            endian.write_u32(&mut raw, value);
            raw
        };

        if self.subfile_type != 0 {
            fields.push((TAG_NEW_SUBFILE_TYPE, TYPE_LONG, 1, long(self.subfile_type)));
        }
        fields.push((TAG_IMAGE_WIDTH, TYPE_LONG, 1, long(self.width)));
        fields.push((TAG_IMAGE_LENGTH, TYPE_LONG, 1, long(self.height)));
        fields.push((
            TAG_BITS_PER_SAMPLE,
            TYPE_SHORT,
            spp as u32,
            short(&vec![self.bits_per_sample; spp]),
        ));
        fields.push((TAG_COMPRESSION, TYPE_SHORT, 1, short(&[self.compression])));
        fields.push((TAG_PHOTOMETRIC, TYPE_SHORT, 1, short(&[self.photometric])));
        fields.push((TAG_SAMPLES_PER_PIXEL, TYPE_SHORT, 1, short(&[self.samples_per_pixel])));
        fields.push((TAG_PLANAR_CONFIG, TYPE_SHORT, 1, short(&[self.planar_config])));
        fields.push((
            TAG_SAMPLE_FORMAT,
            TYPE_SHORT,
            spp as u32,
            short(&vec![self.sample_format; spp]),
        ));
        if let (Some(w), Some(h)) = (self.tile_width, self.tile_height) {
            fields.push((TAG_TILE_WIDTH, TYPE_LONG, 1, long(w)));
            fields.push((TAG_TILE_LENGTH, TYPE_LONG, 1, long(h)));
        } else {
            fields.push((TAG_ROWS_PER_STRIP, TYPE_LONG, 1, long(self.rows_per_strip)));
        }
        let (offsets_tag, counts_tag) = if tiled {
            (TAG_TILE_OFFSETS, TAG_TILE_BYTE_COUNTS)
        } else {
            (TAG_STRIP_OFFSETS, TAG_STRIP_BYTE_COUNTS)
        };
        self.offsets.field_type = TYPE_LONG;
        self.byte_counts.field_type = TYPE_LONG;
        fields.push((offsets_tag, TYPE_LONG, self.offsets.count as u32, self.offsets.encode(endian)?));
        fields.push((counts_tag, TYPE_LONG, self.byte_counts.count as u32, self.byte_counts.encode(endian)?));
        for entry in &self.extra {
            fields.push((entry.tag, entry.field_type, entry.count, entry.data.clone()));
        }
        fields.sort_by_key(|(tag, ..)| *tag);

        let n = fields.len();
        let table_size = 2 + n * ENTRY_SIZE + 4;
        let mut out = vec![0u8; table_size];
        endian.write_u16(&mut out[0..2], n as u16);
        for (i, (tag, field_type, count, data)) in fields.iter().enumerate() {
            let at = 2 + i * ENTRY_SIZE;
            endian.write_u16(&mut out[at..at + 2], *tag);
            endian.write_u16(&mut out[at + 2..at + 4], *field_type);
            endian.write_u32(&mut out[at + 4..at + 8], *count);
            let location = if data.len() <= 4 {
                out[at + 8..at + 8 + data.len()].copy_from_slice(data);
                position + at as u64 + 8
            } else {
                if out.len() % 2 == 1 {
                    out.push(0);
                }
                let external = position + out.len() as u64;
                let external_u32 = u32::try_from(external).map_err(|_| {
                    RasterError::ResourceLimit("directory beyond the 4 GiB classic TIFF limit".into())
                })?;
                endian.write_u32(&mut out[at + 8..at + 12], external_u32);
                out.extend_from_slice(data);
                external
            };
            if *tag == offsets_tag {
                self.offsets.location = location;
            } else if *tag == counts_tag {
                self.byte_counts.location = location;
            }
        }
        let next = u32::try_from(self.next_offset).map_err(|_| {
            RasterError::ResourceLimit("next directory beyond the 4 GiB classic TIFF limit".into())
        })?;
        endian.write_u32(&mut out[2 + n * ENTRY_SIZE..table_size], next);

        self.offset = position;
        self.entry_count = n;
        self.offsets.dirty = false;
        self.byte_counts.dirty = false;
        Ok(out)
    }
}

fn strile_array(field: &RawField, location: u64) -> Result<StrileArray> {
    if field.field_type != TYPE_SHORT && field.field_type != TYPE_LONG {
        return Err(RasterError::corrupt(format!(
            "strile array tag {} has field type {}",
            field.tag, field.field_type
        )));
    }
    Ok(StrileArray {
        field_type: field.field_type,
        count: field.count as usize,
        location,
        values: None,
        dirty: false,
    })
}

/// First value of a BYTE, SHORT or LONG field
fn read_scalar(file: &SharedFile, endian: Endian, field: &RawField, location: u64) -> Result<u64> {
    if field.count == 0 {
        return Err(RasterError::corrupt(format!("tag {} has no value", field.tag)));
    }
    let mut raw = [0u8; 4];
    let size = field_type_size(field.field_type)?;
    if field.size <= 4 {
        raw[..size].copy_from_slice(&field.value[..size]);
    } else {
        file.read_at(&mut raw[..size], location)?;
    }
    match field.field_type {
        TYPE_BYTE => Ok(raw[0] as u64),
        TYPE_SHORT => Ok(endian.read_u16(&raw) as u64),
        TYPE_LONG => Ok(endian.read_u32(&raw) as u64),
        other => Err(RasterError::corrupt(format!(
            "tag {} has non-integer field type {}",
            field.tag, other
        ))),
    }
}
