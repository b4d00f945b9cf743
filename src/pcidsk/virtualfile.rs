//! `SysVirtualFile`: a growable byte stream over a block-map chain
//!
//! Byte offsets are resolved to `(segment, block_in_segment)` lazily. While
//! every resolved block follows its predecessor in the same segment the file
//! is "regular" and resolution is arithmetic; the per-block arrays are only
//! built on the first discontinuity.

use super::blockmap::{SysBlockMap, BLOCK_PAGE_SIZE, ENTRY_LOAD_BATCH};
use super::segment::SegmentDirectory;
use crate::error::{RasterError, Result};

const PAGE: u64 = BLOCK_PAGE_SIZE as u64;

/// The allocator state a virtual file needs for one operation
pub struct BlockContext<'a> {
    pub map: &'a mut SysBlockMap,
    pub segments: &'a mut SegmentDirectory,
}

struct CachedBlock {
    index: usize,
    data: Vec<u8>,
    dirty: bool,
}

pub struct SysVirtualFile {
    layer: usize,
    length: u64,

    regular: bool,
    base_segment: u32,
    base_index: u64,
    xblock_segment: Vec<u32>,
    xblock_index: Vec<u64>,
    resolved: usize,

    /// Next chain block to resolve, `-1` once the chain is exhausted
    next_to_load: i64,
    /// Tail of the resolved chain, `-1` for an empty chain
    last_block: i64,

    cache: Option<CachedBlock>,
}

impl SysVirtualFile {
    pub fn open(map: &SysBlockMap, layer: usize) -> Result<Self> {
        Ok(Self {
            layer,
            length: map.virtual_file_size(layer)?,
            regular: true,
            base_segment: 0,
            base_index: 0,
            xblock_segment: Vec::new(),
            xblock_index: Vec::new(),
            resolved: 0,
            next_to_load: map.layer_first_block(layer)?,
            last_block: -1,
            cache: None,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Logical length in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_regular(&self) -> bool {
        self.regular
    }

    /// Blocks resolved so far
    pub fn resolved_blocks(&self) -> usize {
        self.resolved
    }

    fn push_block(&mut self, segment: u32, index: u64) {
        if self.resolved == 0 {
            self.base_segment = segment;
            self.base_index = index;
        } else if self.regular {
            if segment == self.base_segment && index == self.base_index + self.resolved as u64 {
                self.resolved += 1;
                return;
            }
            self.xblock_segment = vec![self.base_segment; self.resolved];
            self.xblock_index = (0..self.resolved as u64)
                .map(|n| self.base_index + n)
                .collect();
            self.regular = false;
            tracing::debug!(
                layer = self.layer,
                block = self.resolved,
                "virtual file chain is not contiguous"
            );
        }

        if !self.regular {
            self.xblock_segment.push(segment);
            self.xblock_index.push(index);
        }
        self.resolved += 1;
    }

    /// Resolve the chain up to block `target`, or to its end for `None`
    pub fn load_entries_to(&mut self, ctx: &mut BlockContext<'_>, target: Option<usize>) -> Result<()> {
        while self.next_to_load != -1 && target.map_or(true, |t| self.resolved <= t) {
            let batch = ctx
                .map
                .next_entries(ctx.segments, self.next_to_load, ENTRY_LOAD_BATCH)?;
            let Some(last) = batch.last().copied() else {
                return Err(RasterError::corrupt("empty block chain batch"));
            };
            for link in &batch {
                self.push_block(link.segment, link.block_in_segment);
            }
            if self.resolved > ctx.map.block_count() {
                return Err(RasterError::corrupt(format!(
                    "chain of layer {} is longer than the block map",
                    self.layer
                )));
            }
            self.last_block = last.block;
            self.next_to_load = last.next;
        }
        Ok(())
    }

    /// Segment of resolved block `n`
    pub fn block_segment(&self, n: usize) -> Option<u32> {
        if n >= self.resolved {
            return None;
        }
        if self.regular {
            Some(self.base_segment)
        } else {
            Some(self.xblock_segment[n])
        }
    }

    /// Block index within its segment of resolved block `n`
    pub fn block_index_in_segment(&self, n: usize) -> Option<u64> {
        if n >= self.resolved {
            return None;
        }
        if self.regular {
            Some(self.base_index + n as u64)
        } else {
            Some(self.xblock_index[n])
        }
    }

    fn location(&self, n: usize) -> Result<(usize, u64)> {
        match (self.block_segment(n), self.block_index_in_segment(n)) {
            (Some(segment), Some(index)) => Ok((segment as usize, index * PAGE)),
            _ => Err(RasterError::corrupt(format!(
                "block {} of layer {} is not allocated",
                n, self.layer
            ))),
        }
    }

    /// Make sure blocks `0..=n` exist, growing the chain as needed
    fn ensure_block(&mut self, ctx: &mut BlockContext<'_>, n: usize) -> Result<()> {
        self.load_entries_to(ctx, Some(n))?;
        if n < self.resolved {
            return Ok(());
        }
        self.load_entries_to(ctx, None)?;
        while self.resolved <= n {
            let (segment, index) =
                ctx.map
                    .grow_virtual_file(ctx.segments, self.layer, &mut self.last_block)?;
            self.push_block(segment, index);
        }
        Ok(())
    }

    fn flush_cache(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        let Some(cache) = self.cache.as_ref().filter(|c| c.dirty) else {
            return Ok(());
        };
        let (segment, offset) = self.location(cache.index)?;
        ctx.segments.write(segment, offset, &cache.data)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.dirty = false;
        }
        Ok(())
    }

    /// Bring block `n` into the single-block cache
    fn load_block(&mut self, ctx: &mut BlockContext<'_>, n: usize, for_write: bool) -> Result<()> {
        if self.cache.as_ref().is_some_and(|c| c.index == n) {
            return Ok(());
        }
        self.flush_cache(ctx)?;

        let mut data = vec![0u8; BLOCK_PAGE_SIZE];
        if for_write {
            self.ensure_block(ctx, n)?;
        } else {
            self.load_entries_to(ctx, Some(n))?;
        }
        // Blocks wholly past the logical end hold nothing worth reading
        if (n as u64) * PAGE < self.length {
            let (segment, offset) = self.location(n)?;
            ctx.segments.read(segment, offset, &mut data)?;
        }
        self.cache = Some(CachedBlock {
            index: n,
            data,
            dirty: false,
        });
        Ok(())
    }

    /// Visit maximal runs of physically contiguous blocks in `[first, first + count)`
    fn for_each_run<F>(&self, first: usize, count: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, u64, std::ops::Range<usize>) -> Result<()>,
    {
        let end = first + count;
        let mut i = first;
        while i < end {
            let (segment, offset) = self.location(i)?;
            let mut j = i + 1;
            // Same segment, then consecutive block indexes
            while j < end
                && self.block_segment(j) == Some(segment as u32)
                && self.block_index_in_segment(j) == self.block_index_in_segment(j - 1).map(|x| x + 1)
            {
                j += 1;
            }
            f(segment, offset, i..j)?;
            i = j;
        }
        Ok(())
    }

    /// Read whole blocks `[first, first + count)` bypassing the cache
    pub fn load_blocks(
        &mut self,
        ctx: &mut BlockContext<'_>,
        first: usize,
        count: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.flush_cache(ctx)?;
        self.load_entries_to(ctx, Some(first + count - 1))?;
        let segments = &*ctx.segments;
        self.for_each_run(first, count, |segment, offset, run| {
            let start = (run.start - first) * BLOCK_PAGE_SIZE;
            let end = (run.end - first) * BLOCK_PAGE_SIZE;
            segments.read(segment, offset, &mut buf[start..end])
        })
    }

    /// Write whole blocks `[first, first + count)` bypassing the cache
    pub fn write_blocks(
        &mut self,
        ctx: &mut BlockContext<'_>,
        first: usize,
        count: usize,
        data: &[u8],
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.ensure_block(ctx, first + count - 1)?;
        if self
            .cache
            .as_ref()
            .is_some_and(|c| c.index >= first && c.index < first + count)
        {
            self.cache = None;
        }
        let segments = &mut *ctx.segments;
        self.for_each_run(first, count, |segment, offset, run| {
            let start = (run.start - first) * BLOCK_PAGE_SIZE;
            let end = (run.end - first) * BLOCK_PAGE_SIZE;
            segments.write(segment, offset, &data[start..end])
        })
    }

    pub fn read(&mut self, ctx: &mut BlockContext<'_>, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.length {
            return Err(RasterError::corrupt(format!(
                "read of {} bytes at {} past end of layer {} ({} bytes)",
                buf.len(),
                offset,
                self.layer,
                self.length
            )));
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = (pos / PAGE) as usize;
            let in_block = (pos % PAGE) as usize;
            let remaining = buf.len() - done;

            if in_block == 0 && remaining >= 2 * BLOCK_PAGE_SIZE {
                let count = remaining / BLOCK_PAGE_SIZE;
                let bytes = count * BLOCK_PAGE_SIZE;
                self.load_blocks(ctx, block, count, &mut buf[done..done + bytes])?;
                done += bytes;
                continue;
            }

            self.load_block(ctx, block, false)?;
            let n = remaining.min(BLOCK_PAGE_SIZE - in_block);
            if let Some(cache) = &self.cache {
                buf[done..done + n].copy_from_slice(&cache.data[in_block..in_block + n]);
            }
            done += n;
        }
        Ok(())
    }

    pub fn write(&mut self, ctx: &mut BlockContext<'_>, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let block = (pos / PAGE) as usize;
            let in_block = (pos % PAGE) as usize;
            let remaining = data.len() - done;

            if in_block == 0 && remaining >= 2 * BLOCK_PAGE_SIZE {
                let count = remaining / BLOCK_PAGE_SIZE;
                let bytes = count * BLOCK_PAGE_SIZE;
                self.write_blocks(ctx, block, count, &data[done..done + bytes])?;
                done += bytes;
                continue;
            }

            self.load_block(ctx, block, true)?;
            let n = remaining.min(BLOCK_PAGE_SIZE - in_block);
            if let Some(cache) = self.cache.as_mut() {
                cache.data[in_block..in_block + n].copy_from_slice(&data[done..done + n]);
                cache.dirty = true;
            }
            done += n;
        }

        let end = offset + data.len() as u64;
        if end > self.length {
            self.length = end;
            ctx.map.set_virtual_file_size(self.layer, end)?;
        }
        Ok(())
    }

    /// Flush the cached block; the length already lives in the block map
    pub fn synchronize(&mut self, ctx: &mut BlockContext<'_>) -> Result<()> {
        self.flush_cache(ctx)
    }
}
