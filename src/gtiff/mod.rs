//! GeoTIFF strile engine
//!
//! A dataset owns one TIFF file and an arena of layers (main image,
//! overviews, masks, extra pages). Block availability is answered from a
//! per-layer LRU of strile locations, falling back to single-value reads of
//! the strile arrays when the dataset is read-only. Writes go through the
//! TIFF layer, optionally after compression on a worker pool.

pub mod arena;
pub mod cache;
pub mod queue;

use crate::compression::{CodecParams, CodecRegistry, CompressionLevel, CompressionMethod};
use crate::config::GTiffConfig;
use crate::error::{ErrorKind, RasterError, Result, WorstError};
use crate::io::HandleRegistry;
use crate::layout::RasterLayout;
use crate::tiff::ifd::{
    DirectorySpec, FILETYPE_MASK, FILETYPE_REDUCEDIMAGE, PHOTOMETRIC_MASK, PHOTOMETRIC_MINISBLACK,
    PHOTOMETRIC_RGB, PLANAR_CONTIG, PLANAR_SEPARATE, TAG_EXTRA_SAMPLES,
};
use crate::tiff::{Directory, Endian, RawEntry, StrileLocation, TiffFile};
use crate::types::{AccessMode, DataType, OpenMode};
use crate::utils::file_order_to_native;
use arena::{BlockBuffer, LayerArena, LayerId, LayerKind, LayerNode};
use parking_lot::Mutex;
use queue::{CompressionQueue, PendingWrite};
use std::collections::HashSet;
use std::sync::Arc;

/// Hard cap on overviews discovered in one file
pub const MAX_OVERVIEWS: usize = 128;

pub const SUBDATASET_PREFIX: &str = "GTIFF_DIR:";

const STRUCTURAL_METADATA_KEY: &str = "GDAL_STRUCTURAL_METADATA_SIZE=";
const EDITION_KEY: &str = "KNOWN_INCOMPATIBLE_EDITION=";
const STRUCTURAL_METADATA_SCAN: usize = 4096;
/// Ghost area offset in a classic TIFF
const GHOST_OFFSET: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanarConfig {
    /// All bands of a pixel stored together
    #[default]
    Contig,
    /// One strile plane per band
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GTiffCreateOptions {
    pub tiled: bool,
    /// Tile width; strips always span the full width
    pub block_width: usize,
    /// Tile height, or rows per strip
    pub block_height: usize,
    pub planar: PlanarConfig,
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
    /// Write the structural metadata ghost area after the header
    pub structural_metadata: bool,
}

impl Default for GTiffCreateOptions {
    fn default() -> Self {
        Self {
            tiled: false,
            block_width: 256,
            block_height: 256,
            planar: PlanarConfig::Contig,
            compression: CompressionMethod::None,
            level: CompressionLevel::default(),
            structural_metadata: false,
        }
    }
}

impl GTiffCreateOptions {
    pub fn tiled(block_width: usize, block_height: usize) -> Self {
        Self {
            tiled: true,
            block_width,
            block_height,
            ..Self::default()
        }
    }

    pub fn strips(rows_per_strip: usize) -> Self {
        Self {
            block_height: rows_per_strip,
            ..Self::default()
        }
    }
}

fn structural_metadata() -> Vec<u8> {
    let body = format!(
        "LAYOUT=IFDS_BEFORE_DATA\nBLOCK_ORDER=ROW_MAJOR\n{}NO\n ",
        EDITION_KEY
    );
    format!("{}{:06} bytes\n{}", STRUCTURAL_METADATA_KEY, body.len(), body).into_bytes()
}

/// File offset of the edition marker value, if the file has a ghost area
fn find_edition_marker(prefix: &[u8]) -> Option<(u64, bool)> {
    let ghost = prefix.get(GHOST_OFFSET as usize..)?;
    if !ghost.starts_with(STRUCTURAL_METADATA_KEY.as_bytes()) {
        return None;
    }
    let key = EDITION_KEY.as_bytes();
    let pos = ghost.windows(key.len()).position(|w| w == key)?;
    let value = &ghost[pos + key.len()..];
    Some((
        GHOST_OFFSET + (pos + key.len()) as u64,
        value.starts_with(b"YES"),
    ))
}

/// Split `GTIFF_DIR:<n>:<file>` into a 1-based page number and a file name
pub fn parse_subdataset_name(name: &str) -> Result<Option<(usize, &str)>> {
    let Some(rest) = name.strip_prefix(SUBDATASET_PREFIX) else {
        return Ok(None);
    };
    let bad = || {
        RasterError::Configuration(format!(
            "expected {}<index>:<file>, got '{}'",
            SUBDATASET_PREFIX, name
        ))
    };
    let (index, file) = rest.split_once(':').ok_or_else(bad)?;
    let index: usize = index.parse().map_err(|_| bad())?;
    if index == 0 || file.is_empty() {
        return Err(bad());
    }
    Ok(Some((index, file)))
}

struct DatasetState {
    tiff: TiffFile,
    arena: LayerArena,
    queue: Option<CompressionQueue>,
    config: GTiffConfig,
    codecs: Arc<CodecRegistry>,
    writable: bool,
    level: CompressionLevel,
    scanned: bool,
    last_directory: u64,
    /// 1-based position of the opened image in the directory chain
    main_index: usize,
    /// 1-based position of `last_directory`
    directory_count: usize,
    edition_marker: Option<u64>,
    edition_broken: bool,
    scratch: Vec<u8>,
}

/// Geometry of one strile's decoded bytes
struct StrileShape {
    layout: RasterLayout,
    samples: usize,
    rows: usize,
    method: CompressionMethod,
}

impl StrileShape {
    fn group(&self) -> usize {
        self.layout.data_type.size_in_bytes() * self.samples
    }

    fn full_bytes(&self) -> usize {
        self.layout.block_width * self.layout.block_height * self.group()
    }

    fn valid_bytes(&self) -> usize {
        self.layout.block_width * self.rows * self.group()
    }

    fn params(&self, level: CompressionLevel) -> CodecParams {
        CodecParams::new(self.layout.block_width, self.rows, self.layout.data_type)
            .with_samples(self.samples)
            .with_level(level)
    }
}

impl DatasetState {
    fn node(&self, layer: LayerId) -> Result<&LayerNode> {
        self.arena
            .get(layer)
            .ok_or_else(|| RasterError::NotFound(format!("layer {}", layer.0)))
    }

    fn node_mut(&mut self, layer: LayerId) -> Result<&mut LayerNode> {
        self.arena
            .get_mut(layer)
            .ok_or_else(|| RasterError::NotFound(format!("layer {}", layer.0)))
    }

    fn shape(&self, layer: LayerId, strile: usize) -> Result<StrileShape> {
        let dir = &self.node(layer)?.dir;
        let layout = dir.layout()?;
        let samples = if dir.is_planar_separate() {
            1
        } else {
            dir.samples_per_pixel as usize
        };
        Ok(StrileShape {
            layout,
            samples,
            rows: dir.strile_rows(strile)?,
            method: CompressionMethod::from_tiff_code(dir.compression)?,
        })
    }

    fn file_is_big_endian(&self) -> bool {
        self.tiff.endian() == Endian::Big
    }

    fn store_encoded(&mut self, layer: LayerId, strile: usize, data: &[u8]) -> Result<()> {
        let node = self
            .arena
            .get_mut(layer)
            .ok_or_else(|| RasterError::NotFound(format!("layer {}", layer.0)))?;
        let relocated = self.tiff.write_strile(&mut node.dir, strile, data)?;
        node.cache.invalidate(strile);
        if relocated {
            tracing::debug!(layer = layer.0, strile, "strile relocated to end of file");
            self.edition_broken = true;
        }
        Ok(())
    }

    fn store_pending(&mut self, ready: Vec<PendingWrite>) -> Result<()> {
        let mut worst = WorstError::default();
        for pending in ready {
            if let Some(data) = worst.record(pending.job.wait()) {
                worst.record(self.store_encoded(pending.layer, pending.strile, &data));
            }
        }
        worst.into_result()
    }

    /// Write any queued result for this strile, and everything queued before it
    fn wait_completion_for_block(&mut self, layer: LayerId, strile: usize) -> Result<()> {
        let ready = match self.queue.as_mut() {
            Some(queue) => queue.take_through(layer, strile),
            None => return Ok(()),
        };
        self.store_pending(ready)
    }

    fn wait_completion(&mut self) -> Result<()> {
        let ready = match self.queue.as_mut() {
            Some(queue) => queue.take_all(),
            None => return Ok(()),
        };
        self.store_pending(ready)
    }

    fn strile_location(&mut self, layer: LayerId, strile: usize) -> Result<StrileLocation> {
        self.wait_completion_for_block(layer, strile)?;
        let writable = self.writable;
        let node = self
            .arena
            .get_mut(layer)
            .ok_or_else(|| RasterError::NotFound(format!("layer {}", layer.0)))?;
        if let Some(location) = node.cache.get(strile) {
            return Ok(location);
        }
        if writable {
            self.tiff.load_striles(&mut node.dir)?;
        }
        let location = self.tiff.strile_location(&node.dir, strile)?;
        node.cache.insert(strile, location);
        Ok(location)
    }

    /// Decoded strile in host order, padded to a full block; `None` for a hole
    fn read_strile(&mut self, layer: LayerId, strile: usize) -> Result<Option<Vec<u8>>> {
        let location = self.strile_location(layer, strile)?;
        if location.byte_count == 0 {
            return Ok(None);
        }
        let shape = self.shape(layer, strile)?;
        let (full, valid) = (shape.full_bytes(), shape.valid_bytes());

        let mut block = if shape.method == CompressionMethod::None {
            if (location.byte_count as usize) < valid {
                return Err(RasterError::corrupt(format!(
                    "uncompressed strile {} holds {} bytes, expected {}",
                    strile, location.byte_count, valid
                )));
            }
            let mut block = vec![0u8; full];
            if self.config.uses_direct_path() {
                self.tiff.file().read_at(&mut block[..valid], location.offset)?;
            } else {
                self.tiff.read_strile(location, &mut self.scratch)?;
                block[..valid].copy_from_slice(&self.scratch[..valid]);
            }
            block
        } else {
            let codec = self.codecs.get(shape.method)?;
            self.tiff.read_strile(location, &mut self.scratch)?;
            let mut decoded = codec.decompress(&self.scratch, &shape.params(self.level))?;
            if decoded.len() != valid {
                return Err(RasterError::corrupt(format!(
                    "strile {} decoded to {} bytes, expected {}",
                    strile,
                    decoded.len(),
                    valid
                )));
            }
            decoded.resize(full, 0);
            decoded
        };
        file_order_to_native(&mut block, shape.layout.data_type, self.file_is_big_endian());
        Ok(Some(block))
    }

    /// Encode and store a full block given in host order
    fn write_strile(&mut self, layer: LayerId, strile: usize, mut block: Vec<u8>) -> Result<()> {
        let shape = self.shape(layer, strile)?;
        block.truncate(shape.valid_bytes());
        file_order_to_native(&mut block, shape.layout.data_type, self.file_is_big_endian());

        if shape.method == CompressionMethod::None {
            return self.store_encoded(layer, strile, &block);
        }
        let codec = self.codecs.get(shape.method)?;
        let params = shape.params(self.level);
        match self.queue.as_mut() {
            Some(queue) => {
                queue.submit(layer, strile, codec, block, params);
                Ok(())
            }
            None => {
                let encoded = codec.compress(&block, &params)?;
                self.store_encoded(layer, strile, &encoded)
            }
        }
    }

    fn flush_block_buf(&mut self, layer: LayerId) -> Result<()> {
        let node = self.node_mut(layer)?;
        let Some(buf) = node.block_buf.as_mut() else {
            return Ok(());
        };
        if !buf.dirty {
            return Ok(());
        }
        buf.dirty = false;
        let (block, data) = (buf.block, buf.data.clone());
        self.write_strile(layer, block, data)
    }

    /// Make `block` the buffered contiguous strile of `layer`
    fn load_block_buf(&mut self, layer: LayerId, block: usize) -> Result<&mut BlockBuffer> {
        let loaded = self
            .node(layer)?
            .block_buf
            .as_ref()
            .is_some_and(|buf| buf.block == block);
        if !loaded {
            self.flush_block_buf(layer)?;
            let data = match self.read_strile(layer, block)? {
                Some(data) => data,
                None => vec![0u8; self.shape(layer, block)?.full_bytes()],
            };
            self.node_mut(layer)?.block_buf = Some(BlockBuffer {
                block,
                data,
                dirty: false,
            });
        }
        self.node_mut(layer)?
            .block_buf
            .as_mut()
            .ok_or_else(|| RasterError::corrupt("block buffer missing"))
    }

    fn flush_all(&mut self) -> Result<()> {
        let mut worst = WorstError::default();
        if self.writable {
            for id in self.arena.ids() {
                worst.record(self.flush_block_buf(id));
            }
            worst.record(self.wait_completion());
            for id in self.arena.ids() {
                if let Some(node) = self.arena.get_mut(id) {
                    worst.record(self.tiff.flush_striles(&mut node.dir));
                }
            }
            if self.edition_broken {
                if let Some(marker) = self.edition_marker {
                    worst.record(self.tiff.patch(marker, b"YES\n"));
                }
            }
            worst.record(self.tiff.flush());
        }
        worst.into_result()
    }

    fn append_directory(&mut self, mut dir: Directory, kind: LayerKind) -> Result<LayerId> {
        self.tiff.write_directory(&mut dir, Some(self.last_directory))?;
        self.last_directory = dir.offset;
        self.directory_count += 1;
        let cache_size = self.config.strile_cache_size;
        Ok(self.arena.insert(LayerNode::new(dir, kind, cache_size)))
    }

    /// Walk the directory chain once, building overview, mask and page links
    fn scan_directories(&mut self, file_name: &str) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        self.scanned = true;

        let main = &self.node(LayerId::MAIN)?.dir;
        let (main_size, main_spp, main_type) = (
            (main.width, main.height),
            main.samples_per_pixel,
            main.data_type()?,
        );
        let (main_offset, mut offset) = (main.offset, main.next_offset);
        let mut seen = HashSet::from([main_offset]);
        let mut masks = Vec::new();
        let mut index = self.main_index;
        let mut overview_cap_hit = false;
        self.last_directory = main_offset;
        self.directory_count = index;

        while offset != 0 {
            if !seen.insert(offset) {
                tracing::warn!(file = file_name, offset, "directory chain loops, stopping scan");
                break;
            }
            let dir = self.tiff.read_directory(offset)?;
            index += 1;
            self.last_directory = offset;
            self.directory_count = index;
            offset = dir.next_offset;
            let cache_size = self.config.strile_cache_size;

            if dir.is_mask() {
                let id = self
                    .arena
                    .insert(LayerNode::new(dir, LayerKind::Mask, cache_size));
                masks.push(id);
            } else if dir.is_reduced_image() {
                let matches_base = dir.samples_per_pixel == main_spp
                    && dir.data_type().ok() == Some(main_type)
                    && dir.width <= main_size.0
                    && dir.height <= main_size.1;
                if !matches_base {
                    tracing::debug!(file = file_name, "skipping incompatible reduced image");
                    continue;
                }
                let level = self.node(LayerId::MAIN)?.overviews.len();
                if level >= MAX_OVERVIEWS {
                    if !overview_cap_hit {
                        tracing::warn!(
                            file = file_name,
                            max = MAX_OVERVIEWS,
                            "too many overviews, ignoring the rest"
                        );
                        overview_cap_hit = true;
                    }
                    continue;
                }
                let id = self.arena.insert(LayerNode::new(
                    dir,
                    LayerKind::Overview { level },
                    cache_size,
                ));
                self.arena.attach_overview(LayerId::MAIN, id);
            } else {
                let name = format!("{}{}:{}", SUBDATASET_PREFIX, index, file_name);
                self.arena
                    .insert(LayerNode::new(dir, LayerKind::Subdataset { index, name }, cache_size));
            }
        }

        // Masks pair with the main image or an overview of the same size
        for mask in masks {
            let size = {
                let dir = &self.node(mask)?.dir;
                (dir.width, dir.height)
            };
            let mut candidates = vec![LayerId::MAIN];
            candidates.extend(self.node(LayerId::MAIN)?.overviews.iter().copied());
            let imagery = candidates.into_iter().find(|&id| {
                self.arena.get(id).is_some_and(|node| {
                    node.mask.is_none() && (node.dir.width, node.dir.height) == size
                })
            });
            match imagery {
                Some(imagery) => self.arena.attach_mask(imagery, mask),
                None => tracing::debug!(file = file_name, layer = mask.0, "mask matches no image"),
            }
        }

        tracing::debug!(
            file = file_name,
            layers = self.arena.len(),
            "scanned directories"
        );
        Ok(())
    }
}

/// An open GeoTIFF file
pub struct GTiffDataset {
    name: String,
    writable: bool,
    state: Mutex<DatasetState>,
    closed: bool,
}

impl GTiffDataset {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        registry: &HandleRegistry,
        name: &str,
        width: usize,
        height: usize,
        bands: usize,
        data_type: DataType,
        options: GTiffCreateOptions,
        config: GTiffConfig,
    ) -> Result<Self> {
        if width == 0 || height == 0 || bands == 0 {
            return Err(RasterError::InvalidDimensions(format!(
                "cannot create a {}x{} GeoTIFF with {} bands",
                width, height, bands
            )));
        }
        let (width32, height32) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(RasterError::ResourceLimit(format!(
                    "{}x{} exceeds classic TIFF dimensions",
                    width, height
                )))
            }
        };
        let samples_per_pixel = u16::try_from(bands)
            .map_err(|_| RasterError::ResourceLimit(format!("{} bands", bands)))?;
        if options.tiled
            && (options.block_width == 0
                || options.block_height == 0
                || options.block_width % 16 != 0
                || options.block_height % 16 != 0)
        {
            return Err(RasterError::Configuration(format!(
                "tile size {}x{} must be a non-zero multiple of 16",
                options.block_width, options.block_height
            )));
        }
        if !options.tiled && options.block_height == 0 {
            return Err(RasterError::Configuration("rows per strip must be non-zero".into()));
        }
        if options.compression == CompressionMethod::Jpeg && data_type != DataType::U8 {
            return Err(RasterError::Configuration(format!(
                "JPEG striles require 8-bit samples, got {}",
                data_type
            )));
        }
        let compression = options.compression.tiff_code()?;

        let file = registry.open(name, OpenMode::Create)?;
        let ghost = options.structural_metadata.then(structural_metadata);
        let edition_marker = ghost.as_deref().and_then(|g| {
            let mut prefix = vec![0u8; GHOST_OFFSET as usize];
            prefix.extend_from_slice(g);
            find_edition_marker(&prefix).map(|(offset, _)| offset)
        });
        let mut tiff = TiffFile::create(file, ghost.as_deref())?;

        let photometric = if bands >= 3 && data_type == DataType::U8 {
            PHOTOMETRIC_RGB
        } else {
            PHOTOMETRIC_MINISBLACK
        };
        let mut dir = Directory::new(DirectorySpec {
            subfile_type: 0,
            width: width32,
            height: height32,
            data_type,
            samples_per_pixel,
            compression,
            photometric,
            planar_config: match options.planar {
                PlanarConfig::Contig => PLANAR_CONTIG,
                PlanarConfig::Separate => PLANAR_SEPARATE,
            },
            tile_size: options
                .tiled
                .then_some((options.block_width as u32, options.block_height as u32)),
            block_height: options.block_height as u32,
        })?;
        let color_samples = if photometric == PHOTOMETRIC_RGB { 3 } else { 1 };
        if bands > color_samples {
            let extra = bands - color_samples;
            dir.extra.push(RawEntry {
                tag: TAG_EXTRA_SAMPLES,
                field_type: 3,
                count: extra as u32,
                data: vec![0u8; extra * 2],
            });
        }
        tiff.write_directory(&mut dir, None)?;
        let last_directory = dir.offset;

        let mut arena = LayerArena::default();
        arena.insert(LayerNode::new(dir, LayerKind::Main, config.strile_cache_size));
        let queue = Self::make_queue(&config, options.compression, true)?;

        tracing::debug!(
            file = name,
            width,
            height,
            bands,
            tiled = options.tiled,
            "created GeoTIFF"
        );
        Ok(Self {
            name: name.to_string(),
            writable: true,
            state: Mutex::new(DatasetState {
                tiff,
                arena,
                queue,
                config,
                codecs: Arc::new(CodecRegistry::new()),
                writable: true,
                level: options.level,
                scanned: true,
                last_directory,
                main_index: 1,
                directory_count: 1,
                edition_marker,
                edition_broken: false,
                scratch: Vec::new(),
            }),
            closed: false,
        })
    }

    /// Open a file, or one page of it with `GTIFF_DIR:<n>:<file>`
    pub fn open(
        registry: &HandleRegistry,
        name: &str,
        mode: AccessMode,
        config: GTiffConfig,
    ) -> Result<Self> {
        let (page, path) = match parse_subdataset_name(name)? {
            Some((page, path)) => (page, path),
            None => (1, name),
        };
        let file = registry.open(path, mode.into())?;
        let tiff = TiffFile::open(file)?;

        let (edition_marker, known_incompatible) =
            match find_edition_marker(&tiff.read_prefix(STRUCTURAL_METADATA_SCAN)?) {
                Some((offset, broken)) => (Some(offset), broken),
                None => (None, false),
            };
        if known_incompatible {
            tracing::warn!(
                file = path,
                "file layout optimizations were invalidated by earlier edits"
            );
        }

        let mut offset = tiff.first_directory_offset();
        let mut seen = HashSet::new();
        for _ in 1..page {
            if offset == 0 || !seen.insert(offset) {
                return Err(RasterError::NotFound(format!("page {} of {}", page, path)));
            }
            offset = tiff.read_directory(offset)?.next_offset;
        }
        if offset == 0 {
            return Err(RasterError::NotFound(format!("page {} of {}", page, path)));
        }
        let dir = tiff.read_directory(offset)?;
        dir.data_type()?;
        let method = CompressionMethod::from_tiff_code(dir.compression)?;

        let mut arena = LayerArena::default();
        arena.insert(LayerNode::new(dir, LayerKind::Main, config.strile_cache_size));
        let queue = Self::make_queue(&config, method, mode.is_update())?;

        tracing::debug!(file = path, page, ?mode, "opened GeoTIFF");
        Ok(Self {
            name: path.to_string(),
            writable: mode.is_update(),
            state: Mutex::new(DatasetState {
                tiff,
                arena,
                queue,
                config,
                codecs: Arc::new(CodecRegistry::new()),
                writable: mode.is_update(),
                level: CompressionLevel::default(),
                scanned: false,
                last_directory: offset,
                main_index: page,
                directory_count: page,
                edition_marker,
                edition_broken: known_incompatible,
                scratch: Vec::new(),
            }),
            closed: false,
        })
    }

    fn make_queue(
        config: &GTiffConfig,
        method: CompressionMethod,
        writable: bool,
    ) -> Result<Option<CompressionQueue>> {
        if writable && config.num_threads > 0 && method != CompressionMethod::None {
            Ok(Some(CompressionQueue::new(config.num_threads)?))
        } else {
            Ok(None)
        }
    }

    /// Use `codecs` for every strile codec lookup
    pub fn with_codecs(self, codecs: Arc<CodecRegistry>) -> Self {
        self.state.lock().codecs = codecs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn config(&self) -> GTiffConfig {
        self.state.lock().config.clone()
    }

    /// Block grid of one band of a layer
    pub fn layout(&self, layer: LayerId) -> Result<RasterLayout> {
        self.state.lock().node(layer)?.dir.layout()
    }

    pub fn band_count(&self) -> usize {
        self.state
            .lock()
            .node(LayerId::MAIN)
            .map(|node| node.dir.samples_per_pixel as usize)
            .unwrap_or(0)
    }

    pub fn layer_kind(&self, layer: LayerId) -> Result<LayerKind> {
        Ok(self.state.lock().node(layer)?.kind.clone())
    }

    pub fn strile_cache_counters(&self, layer: LayerId) -> Result<(u64, u64)> {
        Ok(self.state.lock().node(layer)?.cache.counters())
    }

    /// Location of a main-image strile, `None` when it was never written
    pub fn is_block_available(&self, block: usize) -> Result<Option<StrileLocation>> {
        self.is_strile_available(LayerId::MAIN, block)
    }

    pub fn is_strile_available(&self, layer: LayerId, strile: usize) -> Result<Option<StrileLocation>> {
        let location = self.strile_location(layer, strile)?;
        Ok((location.byte_count > 0).then_some(location))
    }

    pub fn strile_location(&self, layer: LayerId, strile: usize) -> Result<StrileLocation> {
        self.state.lock().strile_location(layer, strile)
    }

    fn strile_index(dir: &Directory, layout: &RasterLayout, band: usize, block: usize) -> Result<usize> {
        if band >= dir.samples_per_pixel as usize {
            return Err(RasterError::OutOfBounds(format!(
                "band {} of {}",
                band, dir.samples_per_pixel
            )));
        }
        layout.check_block(block)?;
        Ok(if dir.is_planar_separate() {
            band * layout.block_count() + block
        } else {
            block
        })
    }

    /// Read one band of one block, padded to the full block size
    pub fn read_block(&self, layer: LayerId, band: usize, block: usize, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.node(layer)?;
        let layout = node.dir.layout()?;
        let strile = Self::strile_index(&node.dir, &layout, band, block)?;
        let spp = node.dir.samples_per_pixel as usize;
        let contig = spp > 1 && !node.dir.is_planar_separate();
        let is_mask = node.kind == LayerKind::Mask;
        if out.len() != layout.block_size_bytes() {
            return Err(RasterError::InvalidDimensions(format!(
                "block buffer holds {} bytes, expected {}",
                out.len(),
                layout.block_size_bytes()
            )));
        }

        let result = if contig {
            state.load_block_buf(layer, strile).map(|buf| {
                let ps = layout.data_type.size_in_bytes();
                for (i, pixel) in out.chunks_exact_mut(ps).enumerate() {
                    let src = (i * spp + band) * ps;
                    pixel.copy_from_slice(&buf.data[src..src + ps]);
                }
            })
        } else {
            state.read_strile(layer, strile).map(|data| match data {
                Some(data) => out.copy_from_slice(&data),
                None => out.fill(0),
            })
        };

        match result {
            Ok(()) => {}
            Err(err) if state.config.ignore_read_errors && err.kind() != ErrorKind::Usage => {
                tracing::warn!(
                    file = %self.name,
                    layer = layer.0,
                    block,
                    error = %err,
                    "ignoring read error, returning an empty block"
                );
                out.fill(0);
            }
            Err(err) => return Err(err),
        }

        if is_mask && state.config.internal_mask_to_8bit {
            for value in out.iter_mut() {
                if *value != 0 {
                    *value = 255;
                }
            }
        }
        Ok(())
    }

    /// Write one band of one full block
    pub fn write_block(&self, layer: LayerId, band: usize, block: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RasterError::ReadOnly(self.name.clone()));
        }
        let mut state = self.state.lock();
        let node = state.node(layer)?;
        let layout = node.dir.layout()?;
        let strile = Self::strile_index(&node.dir, &layout, band, block)?;
        let spp = node.dir.samples_per_pixel as usize;
        let contig = spp > 1 && !node.dir.is_planar_separate();
        let is_mask = node.kind == LayerKind::Mask;
        if data.len() != layout.block_size_bytes() {
            return Err(RasterError::InvalidDimensions(format!(
                "block buffer holds {} bytes, expected {}",
                data.len(),
                layout.block_size_bytes()
            )));
        }

        let mut block_data = data.to_vec();
        if is_mask {
            for value in block_data.iter_mut() {
                *value = u8::from(*value != 0);
            }
        }

        if contig {
            let buf = state.load_block_buf(layer, strile)?;
            let ps = layout.data_type.size_in_bytes();
            for (i, pixel) in block_data.chunks_exact(ps).enumerate() {
                let dst = (i * spp + band) * ps;
                buf.data[dst..dst + ps].copy_from_slice(pixel);
            }
            buf.dirty = true;
            Ok(())
        } else {
            state.write_strile(layer, strile, block_data)
        }
    }

    /// Discover overviews, masks and extra pages (idempotent)
    pub fn scan_directories(&self) -> Result<()> {
        self.state.lock().scan_directories(&self.name)
    }

    pub fn overview_count(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        Ok(state.node(LayerId::MAIN)?.overviews.len())
    }

    pub fn overview(&self, level: usize) -> Result<LayerId> {
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        state
            .node(LayerId::MAIN)?
            .overviews
            .get(level)
            .copied()
            .ok_or_else(|| RasterError::NotFound(format!("overview {}", level)))
    }

    /// Mask layer of an image layer, if any
    pub fn mask_layer(&self, layer: LayerId) -> Result<Option<LayerId>> {
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        Ok(state.node(layer)?.mask)
    }

    /// `GTIFF_DIR:<n>:<file>` names, listed only when the file has several pages.
    /// `n` is the raw directory index, so every name opens the page it lists.
    pub fn subdatasets(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        let mut names: Vec<String> = state
            .arena
            .ids()
            .into_iter()
            .filter_map(|id| match &state.arena.get(id)?.kind {
                LayerKind::Subdataset { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            names.insert(
                0,
                format!("{}{}:{}", SUBDATASET_PREFIX, state.main_index, self.name),
            );
        }
        Ok(names)
    }

    /// Append another full-resolution page shaped like the main image and
    /// return its subdataset name
    pub fn create_page(&self, width: usize, height: usize) -> Result<String> {
        if !self.writable {
            return Err(RasterError::ReadOnly(self.name.clone()));
        }
        let (width, height) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(RasterError::InvalidDimensions(format!(
                    "page size {}x{}",
                    width, height
                )))
            }
        };
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        let base = &state.node(LayerId::MAIN)?.dir;
        let mut dir = Directory::new(DirectorySpec {
            subfile_type: 0,
            width,
            height,
            data_type: base.data_type()?,
            samples_per_pixel: base.samples_per_pixel,
            compression: base.compression,
            photometric: base.photometric,
            planar_config: base.planar_config,
            tile_size: base.tile_width.zip(base.tile_height),
            block_height: base.block_size().1,
        })?;
        dir.extra = base
            .extra
            .iter()
            .filter(|entry| entry.tag == TAG_EXTRA_SAMPLES)
            .cloned()
            .collect();
        let index = state.directory_count + 1;
        let name = format!("{}{}:{}", SUBDATASET_PREFIX, index, self.name);
        state.append_directory(
            dir,
            LayerKind::Subdataset {
                index,
                name: name.clone(),
            },
        )?;
        tracing::debug!(file = %self.name, index, width, height, "created page");
        Ok(name)
    }

    /// Append a reduced-resolution copy of the main image's structure
    pub fn create_overview(&self, factor: usize) -> Result<LayerId> {
        if !self.writable {
            return Err(RasterError::ReadOnly(self.name.clone()));
        }
        if factor < 2 {
            return Err(RasterError::Configuration(format!(
                "overview factor {} must be at least 2",
                factor
            )));
        }
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        let main = state.node(LayerId::MAIN)?;
        let level = main.overviews.len();
        if level >= MAX_OVERVIEWS {
            return Err(RasterError::ResourceLimit(format!(
                "already {} overviews",
                MAX_OVERVIEWS
            )));
        }
        let base = &main.dir;
        let mut dir = Directory::new(DirectorySpec {
            subfile_type: FILETYPE_REDUCEDIMAGE,
            width: base.width.div_ceil(factor as u32),
            height: base.height.div_ceil(factor as u32),
            data_type: base.data_type()?,
            samples_per_pixel: base.samples_per_pixel,
            compression: base.compression,
            photometric: base.photometric,
            planar_config: base.planar_config,
            tile_size: base.tile_width.zip(base.tile_height),
            block_height: base.block_size().1,
        })?;
        dir.extra = base
            .extra
            .iter()
            .filter(|entry| entry.tag == TAG_EXTRA_SAMPLES)
            .cloned()
            .collect();
        let id = state.append_directory(dir, LayerKind::Overview { level })?;
        state.arena.attach_overview(LayerId::MAIN, id);
        tracing::debug!(file = %self.name, level, factor, "created overview");
        Ok(id)
    }

    /// Append an internal 8-bit mask for an image layer
    pub fn create_mask(&self, imagery: LayerId) -> Result<LayerId> {
        if !self.writable {
            return Err(RasterError::ReadOnly(self.name.clone()));
        }
        let mut state = self.state.lock();
        state.scan_directories(&self.name)?;
        let node = state.node(imagery)?;
        if node.mask.is_some() {
            return Err(RasterError::Configuration(format!(
                "layer {} already has a mask",
                imagery.0
            )));
        }
        let base = &node.dir;
        let compression = match CompressionMethod::from_tiff_code(base.compression)? {
            CompressionMethod::Jpeg => CompressionMethod::Deflate.tiff_code()?,
            _ => base.compression,
        };
        let mut subfile_type = FILETYPE_MASK;
        if matches!(node.kind, LayerKind::Overview { .. }) {
            subfile_type |= FILETYPE_REDUCEDIMAGE;
        }
        let dir = Directory::new(DirectorySpec {
            subfile_type,
            width: base.width,
            height: base.height,
            data_type: DataType::U8,
            samples_per_pixel: 1,
            compression,
            photometric: PHOTOMETRIC_MASK,
            planar_config: PLANAR_CONTIG,
            tile_size: base.tile_width.zip(base.tile_height),
            block_height: base.block_size().1,
        })?;
        let id = state.append_directory(dir, LayerKind::Mask)?;
        state.arena.attach_mask(imagery, id);
        tracing::debug!(file = %self.name, imagery = imagery.0, "created mask");
        Ok(id)
    }

    /// Write buffered blocks, queued striles and strile arrays
    pub fn flush_cache(&self) -> Result<()> {
        self.state.lock().flush_all()
    }

    /// Flush everything and release the file, reporting the worst error
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let mut state = self.state.lock();
        let result = state.flush_all();
        state.arena.teardown();
        result
    }
}

impl Drop for GTiffDataset {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut state = self.state.lock();
        if let Err(err) = state.flush_all() {
            tracing::warn!(file = %self.name, error = %err, "failed to flush GeoTIFF on drop");
        }
        state.arena.teardown();
    }
}
