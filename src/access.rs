//! Raster access - async window-level API over either container

use crate::config::GTiffConfig;
use crate::error::{RasterError, Result};
use crate::gtiff::arena::LayerId;
use crate::gtiff::{GTiffDataset, SUBDATASET_PREFIX};
use crate::io::{HandleRegistry, StorageBackend};
use crate::layout::RasterLayout;
use crate::pcidsk::{PcidskFile, PCIDSK_MAGIC};
use crate::types::{AccessMode, DataType, OpenMode};
use crate::utils::{copy_rect, format_bytes};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use std::sync::Arc;

/// Run a blocking container call on the tokio blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RasterError::Task(e.to_string()))?
}

/// Block-level access to one raster container
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Short container name, e.g. `PCIDSK`
    fn format(&self) -> &'static str;

    fn band_count(&self) -> usize;

    fn band_layout(&self, band: usize) -> Result<RasterLayout>;

    fn is_writable(&self) -> bool;

    /// One full block of one band, holes read as zeros
    async fn read_block(&self, band: usize, block: usize) -> Result<Bytes>;

    async fn write_block(&self, band: usize, block: usize, data: Bytes) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

pub struct PcidskSource {
    file: Arc<PcidskFile>,
}

impl PcidskSource {
    pub fn new(file: PcidskFile) -> Self {
        Self {
            file: Arc::new(file),
        }
    }
}

#[async_trait]
impl BlockSource for PcidskSource {
    fn format(&self) -> &'static str {
        "PCIDSK"
    }

    fn band_count(&self) -> usize {
        self.file.channel_count()
    }

    fn band_layout(&self, band: usize) -> Result<RasterLayout> {
        Ok(self.file.channel(band)?.layout())
    }

    fn is_writable(&self) -> bool {
        self.file.is_writable()
    }

    async fn read_block(&self, band: usize, block: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        blocking(move || {
            let channel = file.channel(band)?;
            let mut out = vec![0u8; channel.layout().block_size_bytes()];
            channel.read_block(block, &mut out, None)?;
            Ok(Bytes::from(out))
        })
        .await
    }

    async fn write_block(&self, band: usize, block: usize, data: Bytes) -> Result<()> {
        let file = Arc::clone(&self.file);
        blocking(move || file.channel(band)?.write_block(block, &data)).await
    }

    async fn flush(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        blocking(move || file.synchronize()).await
    }
}

pub struct GTiffSource {
    dataset: Arc<GTiffDataset>,
}

impl GTiffSource {
    pub fn new(dataset: GTiffDataset) -> Self {
        Self {
            dataset: Arc::new(dataset),
        }
    }
}

#[async_trait]
impl BlockSource for GTiffSource {
    fn format(&self) -> &'static str {
        "GTiff"
    }

    fn band_count(&self) -> usize {
        self.dataset.band_count()
    }

    fn band_layout(&self, band: usize) -> Result<RasterLayout> {
        if band >= self.dataset.band_count() {
            return Err(RasterError::NotFound(format!("band {}", band)));
        }
        self.dataset.layout(LayerId::MAIN)
    }

    fn is_writable(&self) -> bool {
        self.dataset.is_writable()
    }

    async fn read_block(&self, band: usize, block: usize) -> Result<Bytes> {
        let dataset = Arc::clone(&self.dataset);
        blocking(move || {
            let mut out = vec![0u8; dataset.layout(LayerId::MAIN)?.block_size_bytes()];
            dataset.read_block(LayerId::MAIN, band, block, &mut out)?;
            Ok(Bytes::from(out))
        })
        .await
    }

    async fn write_block(&self, band: usize, block: usize, data: Bytes) -> Result<()> {
        let dataset = Arc::clone(&self.dataset);
        blocking(move || dataset.write_block(LayerId::MAIN, band, block, &data)).await
    }

    async fn flush(&self) -> Result<()> {
        let dataset = Arc::clone(&self.dataset);
        blocking(move || dataset.flush_cache()).await
    }
}

/// Which container a stream holds, judged from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Pcidsk,
    GTiff,
}

impl ContainerFormat {
    pub fn sniff(prefix: &[u8]) -> Option<Self> {
        if prefix.starts_with(PCIDSK_MAGIC) {
            return Some(Self::Pcidsk);
        }
        match prefix.get(..4)? {
            b"II*\0" | b"MM\0*" | b"II+\0" | b"MM\0+" => Some(Self::GTiff),
            _ => None,
        }
    }
}

fn sniff_file(registry: &HandleRegistry, name: &str) -> Result<ContainerFormat> {
    if name.starts_with(SUBDATASET_PREFIX) {
        return Ok(ContainerFormat::GTiff);
    }
    let file = registry.open(name, OpenMode::Read)?;
    let len = file.len()?.min(PCIDSK_MAGIC.len() as u64) as usize;
    let mut prefix = vec![0u8; len];
    file.read_at(&mut prefix, 0)?;
    ContainerFormat::sniff(&prefix)
        .ok_or_else(|| RasterError::corrupt(format!("{}: not a PCIDSK or TIFF file", name)))
}

/// Async window reads and writes over a [`BlockSource`]
pub struct RasterAccess {
    name: String,
    source: Arc<dyn BlockSource>,
}

impl RasterAccess {
    /// Open a local file (plain path or `file://` URL), detecting its format
    pub async fn open(url: impl Into<String>, mode: AccessMode) -> Result<Self> {
        let url = url.into();
        if StorageBackend::from_url(&url)? != StorageBackend::FileSystem {
            return Err(RasterError::Configuration(format!(
                "{}: only local files can be opened by URL",
                url
            )));
        }
        let path = url.strip_prefix("file://").unwrap_or(&url).to_string();
        let config = GTiffConfig::from_env()?;
        Self::open_in(Arc::new(HandleRegistry::local()), path, mode, config).await
    }

    /// Open `name` through an existing registry
    pub async fn open_in(
        registry: Arc<HandleRegistry>,
        name: impl Into<String>,
        mode: AccessMode,
        config: GTiffConfig,
    ) -> Result<Self> {
        let name = name.into();
        let opened = name.clone();
        let source: Arc<dyn BlockSource> = blocking(move || {
            let source: Arc<dyn BlockSource> = match sniff_file(&registry, &opened)? {
                ContainerFormat::Pcidsk => {
                    Arc::new(PcidskSource::new(PcidskFile::open(&registry, &opened, mode)?))
                }
                ContainerFormat::GTiff => Arc::new(GTiffSource::new(GTiffDataset::open(
                    &registry, &opened, mode, config,
                )?)),
            };
            Ok(source)
        })
        .await?;
        tracing::debug!(file = %name, format = source.format(), "opened raster");
        Ok(Self { name, source })
    }

    pub fn from_source(name: impl Into<String>, source: Arc<dyn BlockSource>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    pub fn band_count(&self) -> usize {
        self.source.band_count()
    }

    pub fn layout(&self, band: usize) -> Result<RasterLayout> {
        self.source.band_layout(band)
    }

    /// Read a pixel window of one band as a packed row-major buffer
    pub async fn read_window(
        &self,
        band: usize,
        x_off: usize,
        y_off: usize,
        width: usize,
        height: usize,
    ) -> Result<Bytes> {
        let layout = self.layout(band)?;
        let blocks = layout.blocks_in_window(x_off, y_off, width, height)?;
        let window = Window {
            x_off,
            y_off,
            width,
            height,
        };

        // Read all covering blocks concurrently
        let futures = blocks.iter().map(|&block| {
            let source = Arc::clone(&self.source);
            async move { source.read_block(band, block).await }
        });
        let data = try_join_all(futures).await?;

        let ps = layout.data_type.size_in_bytes();
        let mut out = vec![0u8; width * height * ps];
        for (&block, block_data) in blocks.iter().zip(&data) {
            let part = window.intersect(&layout, block);
            copy_rect(
                block_data,
                layout.block_width * ps,
                part.block_x * ps,
                part.block_y,
                &mut out,
                width * ps,
                part.window_x * ps,
                part.window_y,
                part.width * ps,
                part.height,
            );
        }
        Ok(Bytes::from(out))
    }

    /// Write a packed pixel window into one band.
    ///
    /// Blocks only partly covered by the window are read first so their other
    /// pixels survive.
    pub async fn write_window(
        &self,
        band: usize,
        x_off: usize,
        y_off: usize,
        width: usize,
        height: usize,
        data: &[u8],
    ) -> Result<()> {
        if !self.source.is_writable() {
            return Err(RasterError::ReadOnly(self.name.clone()));
        }
        let layout = self.layout(band)?;
        let blocks = layout.blocks_in_window(x_off, y_off, width, height)?;
        let ps = layout.data_type.size_in_bytes();
        if data.len() != width * height * ps {
            return Err(RasterError::InvalidDimensions(format!(
                "window data holds {} bytes, expected {}",
                data.len(),
                width * height * ps
            )));
        }
        let window = Window {
            x_off,
            y_off,
            width,
            height,
        };

        let futures = blocks.iter().map(|&block| {
            let source = Arc::clone(&self.source);
            let part = window.intersect(&layout, block);
            let covered = part.covers(&layout, block);
            async move {
                let existing = if covered {
                    None
                } else {
                    Some(source.read_block(band, block).await?)
                };
                Ok::<_, RasterError>((block, part, existing))
            }
        });
        let parts = try_join_all(futures).await?;

        let writes = parts.into_iter().map(|(block, part, existing)| {
            let mut buf = match existing {
                Some(bytes) => bytes.to_vec(),
                None => vec![0u8; layout.block_size_bytes()],
            };
            copy_rect(
                data,
                width * ps,
                part.window_x * ps,
                part.window_y,
                &mut buf,
                layout.block_width * ps,
                part.block_x * ps,
                part.block_y,
                part.width * ps,
                part.height,
            );
            let source = Arc::clone(&self.source);
            async move { source.write_block(band, block, Bytes::from(buf)).await }
        });
        try_join_all(writes).await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.source.flush().await
    }

    pub fn stats(&self) -> Result<RasterStats> {
        let layout = self.layout(0)?;
        let bands = self.band_count();
        Ok(RasterStats {
            format: self.source.format(),
            width: layout.width,
            height: layout.height,
            bands,
            block_width: layout.block_width,
            block_height: layout.block_height,
            blocks_per_band: layout.block_count(),
            data_type: layout.data_type,
            uncompressed_size: (0..bands)
                .map(|band| self.layout(band).map(|l| l.total_size_bytes()))
                .sum::<Result<usize>>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    x_off: usize,
    y_off: usize,
    width: usize,
    height: usize,
}

/// Overlap of a window with one block, in both coordinate frames
#[derive(Debug, Clone, Copy)]
struct BlockPart {
    block_x: usize,
    block_y: usize,
    window_x: usize,
    window_y: usize,
    width: usize,
    height: usize,
}

impl Window {
    fn intersect(&self, layout: &RasterLayout, block: usize) -> BlockPart {
        let ((bx0, bx1), (by0, by1)) = layout.block_data_range(block);
        let x0 = self.x_off.max(bx0);
        let x1 = (self.x_off + self.width).min(bx1);
        let y0 = self.y_off.max(by0);
        let y1 = (self.y_off + self.height).min(by1);
        BlockPart {
            block_x: x0 - bx0,
            block_y: y0 - by0,
            window_x: x0 - self.x_off,
            window_y: y0 - self.y_off,
            width: x1 - x0,
            height: y1 - y0,
        }
    }
}

impl BlockPart {
    /// True when the part spans every valid pixel of the block
    fn covers(&self, layout: &RasterLayout, block: usize) -> bool {
        let ((bx0, bx1), (by0, by1)) = layout.block_data_range(block);
        self.block_x == 0
            && self.block_y == 0
            && self.width == bx1 - bx0
            && self.height == by1 - by0
    }
}

/// Raster statistics
#[derive(Debug, Clone)]
pub struct RasterStats {
    pub format: &'static str,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub blocks_per_band: usize,
    pub data_type: DataType,
    pub uncompressed_size: usize,
}

impl RasterStats {
    pub fn summary(&self) -> String {
        format!(
            "{} raster: {}x{}, {} bands of {}, {}x{} blocks ({} per band), {} uncompressed",
            self.format,
            self.width,
            self.height,
            self.bands,
            self.data_type,
            self.block_width,
            self.block_height,
            self.blocks_per_band,
            format_bytes(self.uncompressed_size),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PcidskCreateOptions;
    use crate::gtiff::GTiffCreateOptions;
    use crate::io::{IOManager, MemoryIOManager};

    fn memory_registry() -> Arc<HandleRegistry> {
        let manager: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        Arc::new(HandleRegistry::new(manager))
    }

    #[test]
    fn test_sniff() {
        assert_eq!(
            ContainerFormat::sniff(b"PCIDSK  "),
            Some(ContainerFormat::Pcidsk)
        );
        assert_eq!(ContainerFormat::sniff(b"II*\0\x08\0\0\0"), Some(ContainerFormat::GTiff));
        assert_eq!(ContainerFormat::sniff(b"MM\0*"), Some(ContainerFormat::GTiff));
        assert_eq!(ContainerFormat::sniff(b"GIF8"), None);
        assert_eq!(ContainerFormat::sniff(b"II"), None);
    }

    #[tokio::test]
    async fn test_window_spanning_blocks() {
        let registry = memory_registry();
        let options: PcidskCreateOptions = "TILED16".parse().unwrap();
        PcidskFile::create(&registry, "w.pix", 40, 40, &[DataType::U8], &options)
            .unwrap()
            .close()
            .unwrap();

        let access = RasterAccess::open_in(
            Arc::clone(&registry),
            "w.pix",
            AccessMode::Update,
            GTiffConfig::default(),
        )
        .await
        .unwrap();
        let data: Vec<u8> = (0..20 * 20).map(|i| (i % 200) as u8 + 1).collect();
        access.write_window(0, 10, 10, 20, 20, &data).await.unwrap();

        let back = access.read_window(0, 10, 10, 20, 20).await.unwrap();
        assert_eq!(&back[..], &data[..]);
        // Pixels outside the window stay empty
        let border = access.read_window(0, 0, 0, 40, 10).await.unwrap();
        assert!(border.iter().all(|&v| v == 0));

        let stats = access.stats().unwrap();
        assert_eq!(stats.format, "PCIDSK");
        assert_eq!(stats.blocks_per_band, 9);
        assert!(stats.summary().contains("40x40"));
    }

    #[tokio::test]
    async fn test_read_only_window_write() {
        let registry = memory_registry();
        GTiffDataset::create(
            &registry,
            "ro.tif",
            32,
            32,
            1,
            DataType::U16,
            GTiffCreateOptions::tiled(16, 16),
            GTiffConfig::default(),
        )
        .unwrap()
        .close()
        .unwrap();

        let access = RasterAccess::open_in(
            Arc::clone(&registry),
            "ro.tif",
            AccessMode::ReadOnly,
            GTiffConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(access.source().format(), "GTiff");
        let result = access.write_window(0, 0, 0, 1, 1, &[0, 0]).await;
        assert!(matches!(result, Err(RasterError::ReadOnly(_))));
        assert!(access.read_window(0, 30, 30, 4, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_source() {
        let registry = memory_registry();
        let dataset = GTiffDataset::create(
            &registry,
            "src.tif",
            20,
            20,
            2,
            DataType::U8,
            GTiffCreateOptions::strips(8),
            GTiffConfig::default(),
        )
        .unwrap();
        let access = RasterAccess::from_source("src.tif", Arc::new(GTiffSource::new(dataset)));
        assert_eq!(access.name(), "src.tif");
        assert_eq!(access.band_count(), 2);

        let data = vec![5u8; 20 * 20];
        access.write_window(1, 0, 0, 20, 20, &data).await.unwrap();
        access.flush().await.unwrap();
        let back = access.read_window(1, 0, 0, 20, 20).await.unwrap();
        assert_eq!(&back[..], &data[..]);
        let other = access.read_window(0, 0, 0, 20, 20).await.unwrap();
        assert!(other.iter().all(|&v| v == 0));
        assert!(access.layout(2).is_err());
    }
}
