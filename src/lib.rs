//! rasterblock - random-access block storage for tiled raster imagery
//!
//! A pure Rust implementation of two raster containers:
//!
//! - **PCIDSK**: bands stored pixel/band/file interleaved, or as tiled
//!   layers inside virtual files carved out of one shared block allocator.
//! - **GeoTIFF**: classic TIFF striles (strips or tiles) with lazy strile
//!   arrays, a location cache, overviews, internal masks and optional
//!   background compression.
//!
//! Both containers read and write through the [`IOManager`] trait, so the
//! engines work the same over local files and in-memory streams.
//!
//! # Example
//!
//! ```rust,ignore
//! use rasterblock::{AccessMode, RasterAccess};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let raster = RasterAccess::open("file:///data/scene.pix", AccessMode::ReadOnly).await?;
//! let pixels = raster.read_window(0, 0, 0, 512, 512).await?;
//! println!("{}", raster.stats()?.summary());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod compression;
pub mod config;
pub mod error;
pub mod gtiff;
pub mod io;
pub mod layout;
pub mod pcidsk;
pub mod tiff;
pub mod types;
pub mod utils;

// Re-exports
pub use access::{BlockSource, ContainerFormat, RasterAccess, RasterStats};
pub use compression::{CodecParams, CodecRegistry, CompressionLevel, CompressionMethod, Compressor};
pub use config::{GTiffConfig, PcidskCreateOptions};
pub use error::{ErrorKind, RasterError, Result};
pub use gtiff::arena::{LayerId, LayerKind};
pub use gtiff::{GTiffCreateOptions, GTiffDataset, PlanarConfig};
pub use io::{HandleRegistry, IOHandle, IOManager, MemoryIOManager, StorageBackend};
pub use layout::{BlockWindow, RasterLayout};
pub use pcidsk::{Channel, PcidskFile};
pub use tiff::StrileLocation;
pub use types::{AccessMode, DataType, Interleaving, OpenMode};

/// Version of the rasterblock implementation
pub const RASTERBLOCK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!RASTERBLOCK_VERSION.is_empty());
    }
}
