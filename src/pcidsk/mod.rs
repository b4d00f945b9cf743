//! PCIDSK (`.pix`) container
//!
//! File layout, in 512-byte blocks: the file header, one 1024-byte image
//! header per channel, the segment pointer table, the PIXEL/BAND image data
//! area, then segments. Tiled channels live in block-map virtual files.
//!
//! All mutable allocator state of one file sits behind a single mutex held for
//! a whole logical operation, so block-chain growth and tile directory updates
//! are serialized per file.

pub mod blockmap;
pub mod buffer;
pub mod interleaved;
pub mod segment;
pub mod tiled;
pub mod virtualfile;

use crate::compression::{CodecRegistry, CompressionMethod};
use crate::config::PcidskCreateOptions;
use crate::error::{RasterError, Result, WorstError};
use crate::io::{HandleRegistry, SharedFile};
use crate::layout::{BlockWindow, RasterLayout};
use crate::types::{AccessMode, DataType, Interleaving, OpenMode};
use blockmap::{BlockMapStats, SysBlockMap};
use buffer::FieldBuffer;
use interleaved::{ChannelGeometry, InterleavedChannel};
use parking_lot::Mutex;
use segment::{
    pcidsk_timestamp, table_len, SegmentDirectory, SegmentKind, BLOCK_SIZE, DEFAULT_POINTER_BLOCKS,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tiled::{TileDirectory, TileLayerHeader, TiledChannel};
use virtualfile::{BlockContext, SysVirtualFile};

pub const PCIDSK_MAGIC: &[u8; 8] = b"PCIDSK  ";

const FILE_HEADER_SIZE: usize = 512;
const IMAGE_HEADER_SIZE: usize = 1024;
const TILED_FILENAME_PREFIX: &str = "/SIS=";
const ZERO_CHUNK: usize = 64 * 1024;

/// Channel types in the order of the header's per-type counts
const COUNTED_TYPES: [DataType; 7] = [
    DataType::U8,
    DataType::I16,
    DataType::U16,
    DataType::F32,
    DataType::C16U,
    DataType::C16S,
    DataType::C32R,
];

/// Block-level access to one band
pub trait Channel: Send + Sync {
    fn layout(&self) -> RasterLayout;

    fn interleaving(&self) -> Interleaving;

    /// Read a block (or a window of it) in host byte order
    fn read_block(&self, block: usize, out: &mut [u8], window: Option<BlockWindow>) -> Result<()>;

    /// Write a whole block given in host byte order
    fn write_block(&self, block: usize, data: &[u8]) -> Result<()>;

    fn synchronize(&self) -> Result<()>;
}

/// Allocator and directory state of one open file
pub(crate) struct FileState {
    segments: SegmentDirectory,
    block_map: Option<SysBlockMap>,
    virtual_files: HashMap<usize, SysVirtualFile>,
    tile_dirs: HashMap<usize, TileDirectory>,
    /// Compressed tile bytes; only touched while the state lock is held
    scratch: Vec<u8>,
}

/// Borrowed pieces needed to operate on one tile layer
pub(crate) struct TileParts<'a> {
    pub vf: &'a mut SysVirtualFile,
    pub dir: &'a mut TileDirectory,
    pub ctx: BlockContext<'a>,
    pub scratch: &'a mut Vec<u8>,
}

impl FileState {
    pub(crate) fn tile_parts(&mut self, layer: usize) -> Result<TileParts<'_>> {
        let map = self
            .block_map
            .as_mut()
            .ok_or_else(|| RasterError::corrupt("tiled channel without a block map segment"))?;
        let vf = match self.virtual_files.entry(layer) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(SysVirtualFile::open(map, layer)?),
        };
        let mut ctx = BlockContext {
            map,
            segments: &mut self.segments,
        };
        let dir = match self.tile_dirs.entry(layer) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(TileDirectory::load(vf, &mut ctx)?),
        };
        Ok(TileParts {
            vf,
            dir,
            ctx,
            scratch: &mut self.scratch,
        })
    }

    /// New tile layer with an empty directory
    fn create_tile_layer(&mut self, header: TileLayerHeader) -> Result<usize> {
        if self.block_map.is_none() {
            self.block_map = Some(SysBlockMap::create(&mut self.segments)?);
        }
        let map = self
            .block_map
            .as_mut()
            .ok_or_else(|| RasterError::corrupt("block map missing"))?;
        let layer = map.create_virtual_file();
        let mut vf = SysVirtualFile::open(map, layer)?;
        let mut ctx = BlockContext {
            map,
            segments: &mut self.segments,
        };
        let dir = TileDirectory::create(&mut vf, &mut ctx, header)?;
        self.virtual_files.insert(layer, vf);
        self.tile_dirs.insert(layer, dir);
        Ok(layer)
    }

    fn flush_layer(&mut self, layer: usize, worst: &mut WorstError) {
        let (Some(map), Some(vf)) = (self.block_map.as_mut(), self.virtual_files.get_mut(&layer))
        else {
            return;
        };
        let mut ctx = BlockContext {
            map,
            segments: &mut self.segments,
        };
        if let Some(dir) = self.tile_dirs.get_mut(&layer) {
            worst.record(dir.flush(vf, &mut ctx));
        }
        worst.record(vf.synchronize(&mut ctx));
    }

    fn flush_allocator(&mut self, worst: &mut WorstError) {
        if let Some(map) = self.block_map.as_mut() {
            worst.record(map.synchronize(&mut self.segments));
        }
        worst.record(self.segments.synchronize());
    }

    pub(crate) fn synchronize_layer(&mut self, layer: usize) -> Result<()> {
        let mut worst = WorstError::default();
        self.flush_layer(layer, &mut worst);
        self.flush_allocator(&mut worst);
        worst.into_result()
    }

    fn synchronize(&mut self) -> Result<()> {
        let mut worst = WorstError::default();
        let mut layers: Vec<usize> = self.virtual_files.keys().copied().collect();
        layers.sort_unstable();
        for layer in layers {
            self.flush_layer(layer, &mut worst);
        }
        self.flush_allocator(&mut worst);
        worst.into_result()
    }
}

/// State shared between a file and its channels
pub(crate) struct PcidskShared {
    pub name: String,
    pub file: Arc<SharedFile>,
    pub writable: bool,
    pub state: Mutex<FileState>,
    pub codecs: Arc<CodecRegistry>,
}

enum ChannelSlot {
    Tiled(TiledChannel),
    Interleaved(InterleavedChannel),
}

impl ChannelSlot {
    fn as_channel(&self) -> &dyn Channel {
        match self {
            ChannelSlot::Tiled(c) => c,
            ChannelSlot::Interleaved(c) => c,
        }
    }
}

/// Parsed 512-byte file header
#[derive(Debug, Clone, Copy)]
struct FileHeader {
    eof_block: u64,
    image_data_start: u64,
    image_header_start: u64,
    interleaving: Interleaving,
    channel_count: usize,
    width: usize,
    height: usize,
    pointer_start: u64,
    pointer_blocks: u64,
}

impl FileHeader {
    fn parse(raw: &FieldBuffer) -> Result<Self> {
        if &raw.as_bytes()[..6] != b"PCIDSK" {
            return Err(RasterError::corrupt("not a PCIDSK file (bad magic)"));
        }
        let interleaving_name = raw.get_str(360, 8)?;
        let interleaving = Interleaving::parse(&interleaving_name).ok_or_else(|| {
            RasterError::corrupt(format!("unknown interleaving '{}'", interleaving_name))
        })?;
        let header = Self {
            eof_block: raw.get_u64(16, 16)?,
            image_data_start: raw.get_u64(304, 16)?,
            image_header_start: raw.get_u64(336, 16)?,
            interleaving,
            channel_count: raw.get_u64(376, 8)? as usize,
            width: raw.get_u64(384, 8)? as usize,
            height: raw.get_u64(392, 8)? as usize,
            pointer_start: raw.get_u64(440, 16)?,
            pointer_blocks: raw.get_u64(456, 8)?,
        };
        if header.image_header_start == 0
            || header.pointer_start == 0
            || header.pointer_start + header.pointer_blocks - 1 > header.eof_block
        {
            return Err(RasterError::corrupt("PCIDSK header block pointers are invalid"));
        }
        Ok(header)
    }

    fn encode(&self, image_data_blocks: u64, channel_types: &[DataType]) -> Result<FieldBuffer> {
        let now = pcidsk_timestamp();
        let mut raw = FieldBuffer::new(FILE_HEADER_SIZE);
        raw.put_bytes(0, PCIDSK_MAGIC)?;
        raw.put_str(8, 8, "100")?;
        raw.put_int(16, 16, self.eof_block as i64)?;
        raw.put_str(128, 16, &now)?;
        raw.put_str(144, 16, &now)?;
        raw.put_int(304, 16, self.image_data_start as i64)?;
        raw.put_int(320, 16, image_data_blocks as i64)?;
        raw.put_int(336, 16, self.image_header_start as i64)?;
        raw.put_str(360, 8, self.interleaving.as_str())?;
        raw.put_int(376, 8, self.channel_count as i64)?;
        raw.put_int(384, 8, self.width as i64)?;
        raw.put_int(392, 8, self.height as i64)?;
        raw.put_int(440, 16, self.pointer_start as i64)?;
        raw.put_int(456, 8, self.pointer_blocks as i64)?;
        for (i, counted) in COUNTED_TYPES.iter().enumerate() {
            let n = channel_types.iter().filter(|t| *t == counted).count();
            raw.put_int(464 + i * 4, 4, n as i64)?;
        }
        Ok(raw)
    }
}

/// Parsed 1024-byte image (channel) header
#[derive(Debug, Clone)]
struct ImageHeader {
    filename: String,
    data_type: DataType,
    geometry: ChannelGeometry,
}

impl ImageHeader {
    fn parse(raw: &FieldBuffer) -> Result<Self> {
        let byte_order = raw.as_bytes()[201];
        Ok(Self {
            filename: raw.get_str(64, 64)?,
            data_type: DataType::from_pcidsk_code(&raw.get_str(160, 8)?)?,
            geometry: ChannelGeometry {
                start_byte: raw.get_u64(168, 16)?,
                pixel_stride: raw.get_u64(184, 8)? as usize,
                line_stride: raw.get_u64(192, 8)? as usize,
                big_endian: byte_order != b'S',
            },
        })
    }

    fn encode(&self, description: &str) -> Result<FieldBuffer> {
        let code = self.data_type.pcidsk_code().ok_or_else(|| {
            RasterError::Configuration(format!("{} is not a PCIDSK channel type", self.data_type))
        })?;
        let now = pcidsk_timestamp();
        let mut raw = FieldBuffer::new(IMAGE_HEADER_SIZE);
        raw.put_str(0, 64, description)?;
        raw.put_str(64, 64, &self.filename)?;
        raw.put_str(128, 16, &now)?;
        raw.put_str(144, 16, &now)?;
        raw.put_str(160, 8, code)?;
        raw.put_int(168, 16, self.geometry.start_byte as i64)?;
        raw.put_int(184, 8, self.geometry.pixel_stride as i64)?;
        raw.put_int(192, 8, self.geometry.line_stride as i64)?;
        raw.put_bytes(201, if self.geometry.big_endian { b"N" } else { b"S" })?;
        Ok(raw)
    }
}

fn external_channel_name(name: &str, channel: usize) -> String {
    format!("{}.{}", name, channel + 1)
}

/// Write `len` zero bytes at `offset`, or just the last one when not zero filling
fn reserve(file: &SharedFile, offset: u64, len: u64, zero_fill: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    if !zero_fill {
        return file.write_at(&[0u8], offset + len - 1);
    }
    let chunk = vec![0u8; ZERO_CHUNK];
    let mut written = 0u64;
    while written < len {
        let n = (len - written).min(ZERO_CHUNK as u64) as usize;
        file.write_at(&chunk[..n], offset + written)?;
        written += n as u64;
    }
    Ok(())
}

/// An open PCIDSK file
pub struct PcidskFile {
    shared: Arc<PcidskShared>,
    header: FileHeader,
    channels: Vec<ChannelSlot>,
    closed: bool,
}

impl PcidskFile {
    /// Create a new file with one channel per entry of `channel_types`
    pub fn create(
        registry: &HandleRegistry,
        name: &str,
        width: usize,
        height: usize,
        channel_types: &[DataType],
        options: &PcidskCreateOptions,
    ) -> Result<Self> {
        Self::create_with_codecs(
            registry,
            name,
            width,
            height,
            channel_types,
            options,
            Arc::new(CodecRegistry::new()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_with_codecs(
        registry: &HandleRegistry,
        name: &str,
        width: usize,
        height: usize,
        channel_types: &[DataType],
        options: &PcidskCreateOptions,
        codecs: Arc<CodecRegistry>,
    ) -> Result<Self> {
        if width == 0 || height == 0 || channel_types.is_empty() {
            return Err(RasterError::InvalidDimensions(format!(
                "cannot create a {}x{} file with {} channels",
                width,
                height,
                channel_types.len()
            )));
        }
        for data_type in channel_types {
            if data_type.pcidsk_code().is_none() {
                return Err(RasterError::Configuration(format!(
                    "{} is not a PCIDSK channel type",
                    data_type
                )));
            }
            if options.compression == CompressionMethod::Jpeg && *data_type != DataType::U8 {
                return Err(RasterError::Configuration(format!(
                    "JPEG tiles require 8U channels, got {}",
                    data_type
                )));
            }
        }

        let interleaving = options.interleaving;
        let channel_count = channel_types.len();
        let sizes: Vec<usize> = channel_types.iter().map(|t| t.size_in_bytes()).collect();
        let group: usize = sizes.iter().sum();

        let image_header_start = 2;
        let pointer_start = image_header_start + 2 * channel_count as u64;
        let image_data_start = pointer_start + DEFAULT_POINTER_BLOCKS;
        let image_bytes = match interleaving {
            Interleaving::Pixel | Interleaving::Band => (width * height * group) as u64,
            Interleaving::File | Interleaving::Tiled => 0,
        };
        let image_blocks = image_bytes.div_ceil(BLOCK_SIZE);
        let header = FileHeader {
            eof_block: image_data_start + image_blocks - 1,
            image_data_start,
            image_header_start,
            interleaving,
            channel_count,
            width,
            height,
            pointer_start,
            pointer_blocks: DEFAULT_POINTER_BLOCKS,
        };

        let file = registry.open(name, OpenMode::Create)?;
        file.write_at(header.encode(image_blocks, channel_types)?.as_bytes(), 0)?;
        file.write_at(
            &vec![b' '; channel_count * IMAGE_HEADER_SIZE],
            (image_header_start - 1) * BLOCK_SIZE,
        )?;
        let image_offset = (image_data_start - 1) * BLOCK_SIZE;
        reserve(&file, image_offset, image_blocks * BLOCK_SIZE, options.zero_fill)?;

        let mut state = FileState {
            segments: SegmentDirectory::create(
                Arc::clone(&file),
                (pointer_start - 1) * BLOCK_SIZE,
                DEFAULT_POINTER_BLOCKS,
                header.eof_block,
            )?,
            block_map: None,
            virtual_files: HashMap::new(),
            tile_dirs: HashMap::new(),
            scratch: Vec::new(),
        };

        let mut prefix = 0usize;
        for (channel, data_type) in channel_types.iter().enumerate() {
            let pixel_size = sizes[channel];
            let image_header = match interleaving {
                Interleaving::Pixel => ImageHeader {
                    filename: String::new(),
                    data_type: *data_type,
                    geometry: ChannelGeometry {
                        start_byte: image_offset + prefix as u64,
                        pixel_stride: group,
                        line_stride: width * group,
                        big_endian: true,
                    },
                },
                Interleaving::Band => ImageHeader {
                    filename: String::new(),
                    data_type: *data_type,
                    geometry: ChannelGeometry {
                        start_byte: image_offset + (prefix * width * height) as u64,
                        pixel_stride: pixel_size,
                        line_stride: width * pixel_size,
                        big_endian: true,
                    },
                },
                Interleaving::File => {
                    let filename = external_channel_name(name, channel);
                    if options.create_external_files {
                        let external = registry.open(&filename, OpenMode::Create)?;
                        reserve(
                            &external,
                            0,
                            (width * height * pixel_size) as u64,
                            options.zero_fill,
                        )?;
                        external.flush()?;
                    }
                    ImageHeader {
                        filename,
                        data_type: *data_type,
                        geometry: ChannelGeometry {
                            start_byte: 0,
                            pixel_stride: pixel_size,
                            line_stride: width * pixel_size,
                            big_endian: true,
                        },
                    }
                }
                Interleaving::Tiled => {
                    let layer = state.create_tile_layer(TileLayerHeader {
                        width,
                        height,
                        block_width: options.tile_size,
                        block_height: options.tile_size,
                        data_type: *data_type,
                        compression: options.compression,
                        level: options.level,
                    })?;
                    ImageHeader {
                        filename: format!("{}{}", TILED_FILENAME_PREFIX, layer),
                        data_type: *data_type,
                        geometry: ChannelGeometry {
                            start_byte: 0,
                            pixel_stride: 0,
                            line_stride: 0,
                            big_endian: true,
                        },
                    }
                }
            };
            prefix += pixel_size;

            let raw = image_header.encode(&format!("Channel {}", channel + 1))?;
            file.write_at(
                raw.as_bytes(),
                (image_header_start - 1) * BLOCK_SIZE + (channel * IMAGE_HEADER_SIZE) as u64,
            )?;
        }

        state.synchronize()?;
        let eof_block = state.segments.eof_block();
        drop(state);

        let mut eof = FieldBuffer::new(16);
        eof.put_int(0, 16, eof_block as i64)?;
        file.write_at(eof.as_bytes(), 16)?;
        file.flush()?;

        tracing::debug!(
            file = name,
            width,
            height,
            channels = channel_count,
            options = %options,
            "created PCIDSK file"
        );
        Self::from_handle(registry, name, file, AccessMode::Update, codecs)
    }

    pub fn open(registry: &HandleRegistry, name: &str, mode: AccessMode) -> Result<Self> {
        Self::open_with_codecs(registry, name, mode, Arc::new(CodecRegistry::new()))
    }

    pub fn open_with_codecs(
        registry: &HandleRegistry,
        name: &str,
        mode: AccessMode,
        codecs: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let file = registry.open(name, mode.into())?;
        Self::from_handle(registry, name, file, mode, codecs)
    }

    fn from_handle(
        registry: &HandleRegistry,
        name: &str,
        file: Arc<SharedFile>,
        mode: AccessMode,
        codecs: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let mut raw = vec![0u8; FILE_HEADER_SIZE];
        file.read_at(&mut raw, 0)?;
        let header = FileHeader::parse(&FieldBuffer::from_bytes(raw))?;

        let segments = SegmentDirectory::load(
            Arc::clone(&file),
            (header.pointer_start - 1) * BLOCK_SIZE,
            header.pointer_blocks,
            header.eof_block,
        )?;
        let block_map = match segments.find_kind(SegmentKind::BlockMapDir).first() {
            Some(&id) => Some(SysBlockMap::load(&segments, id)?),
            None => None,
        };

        let image_header_offset = (header.image_header_start - 1) * BLOCK_SIZE;
        let headers_len = table_len(
            &file,
            "image headers",
            image_header_offset,
            header.channel_count as u64,
            IMAGE_HEADER_SIZE as u64,
        )?;
        let mut raw = vec![0u8; headers_len];
        file.read_at(&mut raw, image_header_offset)?;
        let image_headers = raw
            .chunks_exact(IMAGE_HEADER_SIZE)
            .map(|chunk| ImageHeader::parse(&FieldBuffer::from_bytes(chunk.to_vec())))
            .collect::<Result<Vec<_>>>()?;

        let shared = Arc::new(PcidskShared {
            name: name.to_string(),
            file: Arc::clone(&file),
            writable: mode.is_update(),
            state: Mutex::new(FileState {
                segments,
                block_map,
                virtual_files: HashMap::new(),
                tile_dirs: HashMap::new(),
                scratch: Vec::new(),
            }),
            codecs,
        });

        let mut channels = Vec::with_capacity(image_headers.len());
        for image_header in image_headers {
            let slot = if let Some(layer) = image_header.filename.strip_prefix(TILED_FILENAME_PREFIX)
            {
                let layer: usize = layer.trim().parse().map_err(|_| {
                    RasterError::corrupt(format!("bad tiled channel reference '{}'", image_header.filename))
                })?;
                let tile_header = {
                    let mut state = shared.state.lock();
                    let tile_header = *state.tile_parts(layer)?.dir.header();
                    tile_header
                };
                if tile_header.data_type != image_header.data_type {
                    return Err(RasterError::corrupt(format!(
                        "tile layer {} holds {}, channel header says {}",
                        layer, tile_header.data_type, image_header.data_type
                    )));
                }
                ChannelSlot::Tiled(TiledChannel::new(Arc::clone(&shared), layer, &tile_header)?)
            } else {
                let channel_file = if image_header.filename.is_empty() {
                    Arc::clone(&file)
                } else {
                    registry.open(&image_header.filename, mode.into())?
                };
                ChannelSlot::Interleaved(InterleavedChannel::new(
                    channel_file,
                    header.interleaving,
                    header.width,
                    header.height,
                    image_header.data_type,
                    image_header.geometry,
                )?)
            };
            channels.push(slot);
        }

        tracing::debug!(
            file = name,
            interleaving = header.interleaving.as_str(),
            channels = channels.len(),
            "opened PCIDSK file"
        );
        Ok(Self {
            shared,
            header,
            channels,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn width(&self) -> usize {
        self.header.width
    }

    pub fn height(&self) -> usize {
        self.header.height
    }

    pub fn interleaving(&self) -> Interleaving {
        self.header.interleaving
    }

    pub fn is_writable(&self) -> bool {
        self.shared.writable
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel by 0-based index
    pub fn channel(&self, index: usize) -> Result<&dyn Channel> {
        self.channels
            .get(index)
            .map(ChannelSlot::as_channel)
            .ok_or_else(|| RasterError::NotFound(format!("channel {}", index)))
    }

    pub fn tiled_channel(&self, index: usize) -> Result<&TiledChannel> {
        match self.channels.get(index) {
            Some(ChannelSlot::Tiled(channel)) => Ok(channel),
            Some(_) => Err(RasterError::Configuration(format!(
                "channel {} is not tiled",
                index
            ))),
            None => Err(RasterError::NotFound(format!("channel {}", index))),
        }
    }

    /// Allocator counters; fully loads the block map
    pub fn block_map_stats(&self) -> Result<Option<BlockMapStats>> {
        let mut state = self.shared.state.lock();
        let FileState {
            segments,
            block_map,
            ..
        } = &mut *state;
        match block_map {
            Some(map) => Ok(Some(map.stats(segments)?)),
            None => Ok(None),
        }
    }

    /// Walk the free list, failing on cycles or owned blocks; returns its length
    pub fn check_free_list(&self) -> Result<usize> {
        let mut state = self.shared.state.lock();
        let FileState {
            segments,
            block_map,
            ..
        } = &mut *state;
        match block_map {
            Some(map) => map.check_free_list(segments),
            None => Ok(0),
        }
    }

    /// Flush directories, cached blocks, the block map and the header.
    ///
    /// Every step runs even if an earlier one failed; the most severe error
    /// is returned.
    pub fn synchronize(&self) -> Result<()> {
        if !self.shared.writable {
            return Ok(());
        }
        let mut worst = WorstError::default();

        let eof_block = {
            let mut state = self.shared.state.lock();
            worst.record(state.synchronize());
            state.segments.eof_block()
        };

        for slot in &self.channels {
            if let ChannelSlot::Interleaved(channel) = slot {
                worst.record(channel.synchronize());
            }
        }

        let mut fields = FieldBuffer::new(16);
        if worst.record(fields.put_int(0, 16, eof_block as i64)).is_some() {
            worst.record(self.shared.file.write_at(fields.as_bytes(), 16));
        }
        let mut stamp = FieldBuffer::new(16);
        if worst.record(stamp.put_str(0, 16, &pcidsk_timestamp())).is_some() {
            worst.record(self.shared.file.write_at(stamp.as_bytes(), 144));
        }
        worst.record(self.shared.file.flush());

        worst.into_result()
    }

    /// Synchronize and release the file, reporting the worst flush error
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.synchronize()
    }
}

impl Drop for PcidskFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.synchronize() {
            tracing::warn!(file = %self.shared.name, error = %err, "failed to synchronize PCIDSK file on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IOManager, MemoryIOManager};

    fn registry() -> (Arc<MemoryIOManager>, HandleRegistry) {
        let manager = Arc::new(MemoryIOManager::new());
        let registry = HandleRegistry::new(Arc::clone(&manager) as Arc<dyn IOManager>);
        (manager, registry)
    }

    #[test]
    fn test_band_interleaved_round_trip() {
        let (_, registry) = registry();
        let options: PcidskCreateOptions = "BAND".parse().unwrap();
        let file = PcidskFile::create(
            &registry,
            "band.pix",
            10,
            4,
            &[DataType::U8, DataType::I16],
            &options,
        )
        .unwrap();
        assert_eq!(file.channel_count(), 2);

        let line: Vec<u8> = (0..10).collect();
        file.channel(0).unwrap().write_block(3, &line).unwrap();
        let words: Vec<u8> = (0..10i16).flat_map(|v| (-v).to_ne_bytes()).collect();
        file.channel(1).unwrap().write_block(0, &words).unwrap();
        file.close().unwrap();

        let file = PcidskFile::open(&registry, "band.pix", AccessMode::ReadOnly).unwrap();
        assert_eq!(file.interleaving(), Interleaving::Band);
        let mut out = vec![0u8; 10];
        file.channel(0).unwrap().read_block(3, &mut out, None).unwrap();
        assert_eq!(out, line);
        let mut out = vec![0u8; 20];
        file.channel(1).unwrap().read_block(0, &mut out, None).unwrap();
        assert_eq!(out, words);

        assert!(matches!(
            file.channel(0).unwrap().write_block(0, &line),
            Err(RasterError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_file_interleaved_uses_external_files() {
        let (manager, registry) = registry();
        let options: PcidskCreateOptions = "FILE".parse().unwrap();
        let file = PcidskFile::create(&registry, "ext.pix", 4, 4, &[DataType::U8], &options).unwrap();
        assert!(manager.exists("ext.pix.1"));
        file.channel(0).unwrap().write_block(2, &[9, 8, 7, 6]).unwrap();
        file.close().unwrap();

        let contents = manager.contents("ext.pix.1").unwrap();
        assert_eq!(&contents[8..12], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_file_no_create_requires_existing_files() {
        let (_, registry) = registry();
        let options: PcidskCreateOptions = "FILE FILENOCREATE".parse().unwrap();
        let err = PcidskFile::create(&registry, "nf.pix", 4, 4, &[DataType::U8], &options)
            .err()
            .unwrap();
        assert!(matches!(err, RasterError::NotFound(_)));
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let (_, registry) = registry();
        let file = registry.open("junk.pix", OpenMode::Create).unwrap();
        file.write_at(&[b'x'; 1024], 0).unwrap();
        drop(file);
        let err = PcidskFile::open(&registry, "junk.pix", AccessMode::ReadOnly)
            .err()
            .unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_oversized_header_counts_fail_cleanly() {
        let (manager, registry) = registry();
        let options: PcidskCreateOptions = "BAND".parse().unwrap();
        for name in ["channels.pix", "pointers.pix"] {
            PcidskFile::create(&registry, name, 8, 8, &[DataType::U8], &options)
                .unwrap()
                .close()
                .unwrap();
        }
        assert!(manager.contents("channels.pix").unwrap().len() < 1 << 20);

        let file = registry.open("channels.pix", OpenMode::Update).unwrap();
        file.write_at(b"99999999", 376).unwrap();
        drop(file);
        let err = PcidskFile::open(&registry, "channels.pix", AccessMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RasterError::ResourceLimit(_)));

        // A matching end-of-file pointer gets past the header check
        let file = registry.open("pointers.pix", OpenMode::Update).unwrap();
        file.write_at(b"9999999999999999", 16).unwrap();
        file.write_at(b"99999999", 456).unwrap();
        drop(file);
        let err = PcidskFile::open(&registry, "pointers.pix", AccessMode::ReadOnly)
            .err()
            .unwrap();
        assert!(matches!(err, RasterError::ResourceLimit(_)));
    }

    #[test]
    fn test_tiled_channels_share_one_block_map() {
        let (_, registry) = registry();
        let options = PcidskCreateOptions::tiled(64, CompressionMethod::None);
        let file = PcidskFile::create(
            &registry,
            "multi.pix",
            128,
            128,
            &[DataType::U8, DataType::U8, DataType::F32],
            &options,
        )
        .unwrap();

        for channel in 0..3 {
            let layout = file.channel(channel).unwrap().layout();
            let block = vec![channel as u8 + 1; layout.block_size_bytes()];
            for tile in 0..layout.block_count() {
                file.channel(channel).unwrap().write_block(tile, &block).unwrap();
            }
        }

        let stats = file.block_map_stats().unwrap().unwrap();
        assert_eq!(stats.layer_count, 3);
        assert_eq!(stats.free_blocks, file.check_free_list().unwrap());
        assert_eq!(stats.owned_blocks + stats.free_blocks, stats.block_count);
        file.close().unwrap();

        let file = PcidskFile::open(&registry, "multi.pix", AccessMode::ReadOnly).unwrap();
        let layout = file.channel(2).unwrap().layout();
        assert_eq!(layout.data_type, DataType::F32);
        let mut out = vec![0u8; layout.block_size_bytes()];
        file.channel(2).unwrap().read_block(3, &mut out, None).unwrap();
        assert!(out.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_unsupported_channel_type() {
        let (_, registry) = registry();
        let err = PcidskFile::create(
            &registry,
            "f64.pix",
            4,
            4,
            &[DataType::F64],
            &PcidskCreateOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RasterError::Configuration(_)));
    }
}
