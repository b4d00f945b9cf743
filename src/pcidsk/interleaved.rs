//! Fixed-stride channels: PIXEL, BAND and FILE interleaving
//!
//! These need no allocator. Every scanline lives at
//! `start_byte + line * line_stride` and pixels are `pixel_stride` apart.
//! A block is one scanline.

use super::Channel;
use crate::error::{RasterError, Result};
use crate::io::SharedFile;
use crate::layout::{BlockWindow, RasterLayout};
use crate::types::{DataType, Interleaving};
use crate::utils::file_order_to_native;
use std::sync::Arc;

/// Where a channel's pixels sit in its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    pub start_byte: u64,
    pub pixel_stride: usize,
    pub line_stride: usize,
    pub big_endian: bool,
}

pub struct InterleavedChannel {
    file: Arc<SharedFile>,
    interleaving: Interleaving,
    layout: RasterLayout,
    geometry: ChannelGeometry,
}

impl InterleavedChannel {
    pub fn new(
        file: Arc<SharedFile>,
        interleaving: Interleaving,
        width: usize,
        height: usize,
        data_type: DataType,
        geometry: ChannelGeometry,
    ) -> Result<Self> {
        let layout = RasterLayout::new(width, height, width, 1, data_type)?;
        let pixel_size = data_type.size_in_bytes();
        if geometry.pixel_stride < pixel_size
            || geometry.line_stride < (width - 1) * geometry.pixel_stride + pixel_size
        {
            return Err(RasterError::corrupt(format!(
                "channel strides {}/{} too small for {}-pixel lines of {}",
                geometry.pixel_stride, geometry.line_stride, width, data_type
            )));
        }
        Ok(Self {
            file,
            interleaving,
            layout,
            geometry,
        })
    }

    pub fn geometry(&self) -> &ChannelGeometry {
        &self.geometry
    }

    /// File that holds the pixels (the container itself unless FILE interleaved)
    pub fn file_name(&self) -> &str {
        self.file.name()
    }

    fn pixel_offset(&self, line: usize, x: usize) -> u64 {
        self.geometry.start_byte
            + (line * self.geometry.line_stride) as u64
            + (x * self.geometry.pixel_stride) as u64
    }

    fn span(&self, pixels: usize) -> usize {
        (pixels - 1) * self.geometry.pixel_stride + self.layout.data_type.size_in_bytes()
    }
}

impl Channel for InterleavedChannel {
    fn layout(&self) -> RasterLayout {
        self.layout
    }

    fn interleaving(&self) -> Interleaving {
        self.interleaving
    }

    fn read_block(&self, block: usize, out: &mut [u8], window: Option<BlockWindow>) -> Result<()> {
        self.layout.check_block(block)?;
        let window = window.unwrap_or_else(|| BlockWindow::full(self.layout.width, 1));
        self.layout.check_block_window(&window, out.len())?;

        let pixel_size = self.layout.data_type.size_in_bytes();
        let offset = self.pixel_offset(block, window.x_off);

        if self.geometry.pixel_stride == pixel_size {
            self.file.read_at(out, offset)?;
        } else {
            let mut raw = vec![0u8; self.span(window.width)];
            self.file.read_at(&mut raw, offset)?;
            for (i, pixel) in out.chunks_exact_mut(pixel_size).enumerate() {
                let src = i * self.geometry.pixel_stride;
                pixel.copy_from_slice(&raw[src..src + pixel_size]);
            }
        }

        file_order_to_native(out, self.layout.data_type, self.geometry.big_endian);
        Ok(())
    }

    fn write_block(&self, block: usize, data: &[u8]) -> Result<()> {
        if !self.file.is_writable() {
            return Err(RasterError::ReadOnly(self.file.name().to_string()));
        }
        self.layout.check_block(block)?;
        let line_bytes = self.layout.block_size_bytes();
        if data.len() != line_bytes {
            return Err(RasterError::InvalidDimensions(format!(
                "scanline buffer holds {} bytes, expected {}",
                data.len(),
                line_bytes
            )));
        }

        let mut raw = data.to_vec();
        file_order_to_native(&mut raw, self.layout.data_type, self.geometry.big_endian);

        let pixel_size = self.layout.data_type.size_in_bytes();
        let offset = self.pixel_offset(block, 0);
        if self.geometry.pixel_stride == pixel_size {
            return self.file.write_at(&raw, offset);
        }

        // Neighbouring channels share the span; hold the handle across read and write
        let mut io = self.file.lock();
        let mut span = vec![0u8; self.span(self.layout.width)];
        io.read_at(&mut span, offset)?;
        for (i, pixel) in raw.chunks_exact(pixel_size).enumerate() {
            let dst = i * self.geometry.pixel_stride;
            span[dst..dst + pixel_size].copy_from_slice(pixel);
        }
        io.write_at(&span, offset)
    }

    fn synchronize(&self) -> Result<()> {
        if self.file.is_writable() {
            self.file.flush()?;
        }
        Ok(())
    }
}
