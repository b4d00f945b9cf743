//! Raster block layout - how one band is divided into tiles or strips

use crate::error::{RasterError, Result};
use crate::types::DataType;
use serde::{Deserialize, Serialize};

/// A rectangle of pixels inside one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub x_off: usize,
    pub y_off: usize,
    pub width: usize,
    pub height: usize,
}

impl BlockWindow {
    pub fn new(x_off: usize, y_off: usize, width: usize, height: usize) -> Self {
        Self {
            x_off,
            y_off,
            width,
            height,
        }
    }

    /// The whole block
    pub fn full(block_width: usize, block_height: usize) -> Self {
        Self::new(0, 0, block_width, block_height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn is_full(&self, block_width: usize, block_height: usize) -> bool {
        self.x_off == 0
            && self.y_off == 0
            && self.width == block_width
            && self.height == block_height
    }
}

/// Layout of one raster band: image size, block size and pixel type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterLayout {
    pub width: usize,
    pub height: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub data_type: DataType,
}

impl RasterLayout {
    pub fn new(
        width: usize,
        height: usize,
        block_width: usize,
        block_height: usize,
        data_type: DataType,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidDimensions(format!(
                "raster size {}x{} must be non-empty",
                width, height
            )));
        }
        if block_width == 0 || block_height == 0 {
            return Err(RasterError::InvalidDimensions(format!(
                "block size {}x{} must be non-empty",
                block_width, block_height
            )));
        }

        Ok(Self {
            width,
            height,
            block_width,
            block_height,
            data_type,
        })
    }

    pub fn blocks_per_row(&self) -> usize {
        self.width.div_ceil(self.block_width)
    }

    pub fn blocks_per_column(&self) -> usize {
        self.height.div_ceil(self.block_height)
    }

    pub fn block_count(&self) -> usize {
        self.blocks_per_row() * self.blocks_per_column()
    }

    /// Convert block coordinates to a row-major block index
    pub fn block_index(&self, block_x: usize, block_y: usize) -> Result<usize> {
        if block_x >= self.blocks_per_row() || block_y >= self.blocks_per_column() {
            return Err(RasterError::OutOfBounds(format!(
                "block ({}, {}) outside {}x{} block grid",
                block_x,
                block_y,
                self.blocks_per_row(),
                self.blocks_per_column()
            )));
        }
        Ok(block_y * self.blocks_per_row() + block_x)
    }

    /// Convert a block index to `(block_x, block_y)`
    pub fn block_coords(&self, index: usize) -> (usize, usize) {
        let per_row = self.blocks_per_row();
        (index % per_row, index / per_row)
    }

    pub fn check_block(&self, index: usize) -> Result<()> {
        if index >= self.block_count() {
            return Err(RasterError::OutOfBounds(format!(
                "block {} out of range (block count {})",
                index,
                self.block_count()
            )));
        }
        Ok(())
    }

    /// Pixel range covered by a block, trimmed at the raster edge
    pub fn block_data_range(&self, index: usize) -> ((usize, usize), (usize, usize)) {
        let (bx, by) = self.block_coords(index);
        let x0 = bx * self.block_width;
        let y0 = by * self.block_height;
        let x1 = (x0 + self.block_width).min(self.width);
        let y1 = (y0 + self.block_height).min(self.height);
        ((x0, x1), (y0, y1))
    }

    /// Bytes in one full (padded) block
    pub fn block_size_bytes(&self) -> usize {
        self.block_width * self.block_height * self.data_type.size_in_bytes()
    }

    /// Total band size in bytes (uncompressed, unpadded)
    pub fn total_size_bytes(&self) -> usize {
        self.width * self.height * self.data_type.size_in_bytes()
    }

    pub fn check_window(&self, x_off: usize, y_off: usize, width: usize, height: usize) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidDimensions(
                "window must be non-empty".to_string(),
            ));
        }
        if x_off + width > self.width || y_off + height > self.height {
            return Err(RasterError::OutOfBounds(format!(
                "window {}x{}+{}+{} outside {}x{} raster",
                width, height, x_off, y_off, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Check a window against the block size and the caller's buffer length
    pub fn check_block_window(&self, window: &BlockWindow, buffer_len: usize) -> Result<()> {
        if window.width == 0
            || window.height == 0
            || window.x_off + window.width > self.block_width
            || window.y_off + window.height > self.block_height
        {
            return Err(RasterError::OutOfBounds(format!(
                "window {}x{}+{}+{} outside {}x{} block",
                window.width,
                window.height,
                window.x_off,
                window.y_off,
                self.block_width,
                self.block_height
            )));
        }
        let expected = window.pixel_count() * self.data_type.size_in_bytes();
        if buffer_len != expected {
            return Err(RasterError::InvalidDimensions(format!(
                "buffer holds {} bytes, window needs {}",
                buffer_len, expected
            )));
        }
        Ok(())
    }

    /// Block indices intersecting a pixel window, in row-major order
    pub fn blocks_in_window(
        &self,
        x_off: usize,
        y_off: usize,
        width: usize,
        height: usize,
    ) -> Result<Vec<usize>> {
        self.check_window(x_off, y_off, width, height)?;

        let bx0 = x_off / self.block_width;
        let bx1 = (x_off + width - 1) / self.block_width;
        let by0 = y_off / self.block_height;
        let by1 = (y_off + height - 1) / self.block_height;

        let mut indices = Vec::with_capacity((bx1 - bx0 + 1) * (by1 - by0 + 1));
        for by in by0..=by1 {
            for bx in bx0..=bx1 {
                indices.push(by * self.blocks_per_row() + bx);
            }
        }
        Ok(indices)
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        format!(
            "{}x{} {} raster, {}x{} blocks ({} total), {:.2} MB uncompressed",
            self.width,
            self.height,
            self.data_type,
            self.block_width,
            self.block_height,
            self.block_count(),
            self.total_size_bytes() as f64 / (1024.0 * 1024.0)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_layout() -> RasterLayout {
        RasterLayout::new(1000, 800, 128, 128, DataType::U16).unwrap()
    }

    #[test]
    fn test_block_count() {
        let layout = create_test_layout();
        assert_eq!(layout.blocks_per_row(), 8); // ceil(1000/128)
        assert_eq!(layout.blocks_per_column(), 7); // ceil(800/128)
        assert_eq!(layout.block_count(), 56);
        assert_eq!(layout.block_size_bytes(), 128 * 128 * 2);
    }

    #[test]
    fn test_block_index_conversion() {
        let layout = create_test_layout();
        let index = layout.block_index(5, 3).unwrap();
        assert_eq!(index, 29);
        assert_eq!(layout.block_coords(index), (5, 3));
        assert!(layout.block_index(8, 0).is_err());
    }

    #[test]
    fn test_block_data_range() {
        let layout = create_test_layout();
        assert_eq!(layout.block_data_range(0), ((0, 128), (0, 128)));

        // Last block should be trimmed
        let last = layout.block_count() - 1;
        assert_eq!(layout.block_data_range(last), ((896, 1000), (768, 800)));
    }

    #[test]
    fn test_blocks_in_window() {
        let layout = create_test_layout();
        assert_eq!(layout.blocks_in_window(0, 0, 10, 10).unwrap(), vec![0]);
        assert_eq!(
            layout.blocks_in_window(120, 120, 16, 16).unwrap(),
            vec![0, 1, 8, 9]
        );
        assert!(layout.blocks_in_window(990, 0, 20, 1).is_err());
        assert!(layout.blocks_in_window(0, 0, 0, 1).is_err());
    }

    #[test]
    fn test_window_helpers() {
        let window = BlockWindow::full(64, 32);
        assert!(window.is_full(64, 32));
        assert_eq!(window.pixel_count(), 2048);
        assert!(!BlockWindow::new(1, 0, 63, 32).is_full(64, 32));

        let layout = RasterLayout::new(100, 100, 64, 32, DataType::U16).unwrap();
        assert!(layout
            .check_block_window(&BlockWindow::new(0, 0, 64, 32), 64 * 32 * 2)
            .is_ok());
        assert!(layout
            .check_block_window(&BlockWindow::new(1, 0, 64, 32), 64 * 32 * 2)
            .is_err());
        assert!(layout
            .check_block_window(&BlockWindow::new(0, 0, 8, 8), 64)
            .is_err());
    }

    #[test]
    fn test_invalid_layout() {
        assert!(RasterLayout::new(0, 10, 8, 8, DataType::U8).is_err());
        assert!(RasterLayout::new(10, 10, 0, 8, DataType::U8).is_err());
    }
}
