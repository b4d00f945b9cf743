//! `SysBlockMap`: the free-list allocator behind tiled layers
//!
//! The `SysBMDir` segment holds a 512-byte header, one 28-byte entry per
//! 8 KiB block and one 24-byte entry per layer (virtual file). Blocks are
//! carved out of `SysBData` segments sixteen at a time and threaded onto a
//! single free list; `grow_virtual_file` moves the free head onto a layer's
//! chain. Blocks are never returned to the free list.

use super::buffer::FieldBuffer;
use super::segment::{SegmentDirectory, SegmentKind, SEG_SYS};
use crate::error::{RasterError, Result};
use std::collections::HashSet;

/// Size of one allocator block
pub const BLOCK_PAGE_SIZE: usize = 8192;

/// Blocks added to the free list per allocation
pub const ALLOCATION_BATCH: usize = 16;

/// Chain entries fetched per read when the map is not fully loaded
pub const ENTRY_LOAD_BATCH: usize = 200;

const MAGIC: &[u8] = b"VERSION";
const HEADER_SIZE: usize = 512;
const ENTRY_SIZE: usize = 28;
const LAYER_SIZE: usize = 24;

/// Largest block id representable in the 8-character fields
const MAX_BLOCKS: usize = 99_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockEntry {
    segment: u32,
    block_in_segment: u64,
    owner: i64,
    next: i64,
}

impl BlockEntry {
    fn parse(raw: &FieldBuffer, at: usize) -> Result<Self> {
        Ok(Self {
            segment: u32::try_from(raw.get_int(at, 4)?)
                .map_err(|_| RasterError::corrupt("bad block map segment number"))?,
            block_in_segment: raw.get_u64(at + 4, 8)?,
            owner: raw.get_int(at + 12, 8)?,
            next: raw.get_int(at + 20, 8)?,
        })
    }

    fn encode(&self, raw: &mut FieldBuffer, at: usize) -> Result<()> {
        raw.put_int(at, 4, self.segment as i64)?;
        raw.put_int(at + 4, 8, self.block_in_segment as i64)?;
        raw.put_int(at + 12, 8, self.owner)?;
        raw.put_int(at + 20, 8, self.next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Active,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayerEntry {
    state: LayerState,
    first_block: i64,
    length: u64,
}

impl LayerEntry {
    fn parse(raw: &FieldBuffer, at: usize) -> Result<Self> {
        let state = match raw.get_int(at, 4)? {
            1 => LayerState::Active,
            2 => LayerState::Dead,
            other => {
                return Err(RasterError::corrupt(format!("bad layer type {}", other)));
            }
        };
        Ok(Self {
            state,
            first_block: raw.get_int(at + 4, 8)?,
            length: raw.get_u64(at + 12, 12)?,
        })
    }

    fn encode(&self, raw: &mut FieldBuffer, at: usize) -> Result<()> {
        let state = match self.state {
            LayerState::Active => 1,
            LayerState::Dead => 2,
        };
        raw.put_int(at, 4, state)?;
        raw.put_int(at + 4, 8, self.first_block)?;
        raw.put_int(at + 12, 12, self.length as i64)
    }
}

/// One resolved link of a layer's block chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub block: i64,
    pub segment: u32,
    pub block_in_segment: u64,
    pub next: i64,
}

/// Allocation counters for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapStats {
    pub block_count: usize,
    pub free_blocks: usize,
    pub owned_blocks: usize,
    pub layer_count: usize,
}

#[derive(Debug)]
pub struct SysBlockMap {
    segment: usize,
    block_count: usize,
    first_free: i64,
    layers: Vec<LayerEntry>,
    /// Present once the full entry array has been read
    entries: Option<Vec<BlockEntry>>,
    /// Window of entries read on demand while not fully loaded
    window: Option<(usize, Vec<BlockEntry>)>,
    growing_segment: Option<usize>,
    dirty: bool,
}

impl SysBlockMap {
    /// Create an empty block map segment
    pub fn create(segments: &mut SegmentDirectory) -> Result<Self> {
        let segment = segments.create_segment("SysBMDir", SEG_SYS, HEADER_SIZE as u64)?;
        let mut map = Self {
            segment,
            block_count: 0,
            first_free: -1,
            layers: Vec::new(),
            entries: Some(Vec::new()),
            window: None,
            growing_segment: None,
            dirty: true,
        };
        map.synchronize(segments)?;
        Ok(map)
    }

    /// Partial load: header and layer table only
    pub fn load(segments: &SegmentDirectory, segment: usize) -> Result<Self> {
        let mut raw = vec![0u8; HEADER_SIZE];
        segments.read(segment, 0, &mut raw)?;
        let header = FieldBuffer::from_bytes(raw);

        if &header.as_bytes()[..MAGIC.len()] != MAGIC {
            return Err(RasterError::corrupt("block map segment has bad magic"));
        }
        let version = header.get_int(7, 3)?;
        if version != 1 {
            return Err(RasterError::UnsupportedVersion(format!(
                "block map version {}",
                version
            )));
        }

        let block_count = header.get_u64(10, 8)? as usize;
        let layer_count = header.get_u64(18, 8)? as usize;
        let first_free = header.get_int(26, 8)?;

        let layer_offset = HEADER_SIZE + block_count * ENTRY_SIZE;
        Self::check_extent(segments, segment, layer_offset + layer_count * LAYER_SIZE)?;

        let mut raw = vec![0u8; layer_count * LAYER_SIZE];
        segments.read(segment, layer_offset as u64, &mut raw)?;
        let raw = FieldBuffer::from_bytes(raw);
        let layers = (0..layer_count)
            .map(|i| LayerEntry::parse(&raw, i * LAYER_SIZE))
            .collect::<Result<Vec<_>>>()?;

        if first_free >= block_count as i64 || first_free < -1 {
            return Err(RasterError::corrupt(format!(
                "free list head {} outside {} blocks",
                first_free, block_count
            )));
        }

        Ok(Self {
            segment,
            block_count,
            first_free,
            layers,
            entries: None,
            window: None,
            growing_segment: None,
            dirty: false,
        })
    }

    /// Fail before a read that the segment is too short to satisfy
    fn check_extent(segments: &SegmentDirectory, segment: usize, needed: usize) -> Result<()> {
        let available = segments.get(segment)?.data_size();
        if needed as u64 > available {
            return Err(RasterError::ResourceLimit(format!(
                "block map needs {} bytes but segment {} holds {}",
                needed, segment, available
            )));
        }
        Ok(())
    }

    fn read_entries(
        &self,
        segments: &SegmentDirectory,
        first: usize,
        count: usize,
    ) -> Result<Vec<BlockEntry>> {
        let mut raw = vec![0u8; count * ENTRY_SIZE];
        segments.read(
            self.segment,
            (HEADER_SIZE + first * ENTRY_SIZE) as u64,
            &mut raw,
        )?;
        let raw = FieldBuffer::from_bytes(raw);
        (0..count)
            .map(|i| BlockEntry::parse(&raw, i * ENTRY_SIZE))
            .collect()
    }

    /// Read the whole entry array
    pub fn full_load(&mut self, segments: &SegmentDirectory) -> Result<()> {
        if self.entries.is_some() {
            return Ok(());
        }
        Self::check_extent(
            segments,
            self.segment,
            HEADER_SIZE + self.block_count * ENTRY_SIZE,
        )?;
        let entries = self.read_entries(segments, 0, self.block_count)?;
        self.entries = Some(entries);
        self.window = None;
        Ok(())
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.entries.is_some()
    }

    fn entry(&mut self, segments: &SegmentDirectory, block: i64) -> Result<BlockEntry> {
        if block < 0 || block as usize >= self.block_count {
            return Err(RasterError::corrupt(format!(
                "block chain references block {} of {}",
                block, self.block_count
            )));
        }
        let block = block as usize;
        if let Some(entries) = &self.entries {
            return Ok(entries[block]);
        }

        if let Some((start, window)) = &self.window {
            if block >= *start && block < start + window.len() {
                return Ok(window[block - start]);
            }
        }
        let count = ENTRY_LOAD_BATCH.min(self.block_count - block);
        let window = self.read_entries(segments, block, count)?;
        let entry = window[0];
        self.window = Some((block, window));
        Ok(entry)
    }

    /// Walk up to `max` links of a chain starting at block `start`
    pub fn next_entries(
        &mut self,
        segments: &SegmentDirectory,
        start: i64,
        max: usize,
    ) -> Result<Vec<ChainEntry>> {
        let mut chain = Vec::with_capacity(max.min(ENTRY_LOAD_BATCH));
        let mut block = start;
        while block != -1 && chain.len() < max {
            let entry = self.entry(segments, block)?;
            chain.push(ChainEntry {
                block,
                segment: entry.segment,
                block_in_segment: entry.block_in_segment,
                next: entry.next,
            });
            block = entry.next;
        }
        Ok(chain)
    }

    fn growable_segment(&mut self, segments: &mut SegmentDirectory) -> Result<usize> {
        if let Some(id) = self.growing_segment {
            if segments.is_at_eof(id)? {
                return Ok(id);
            }
        }
        for id in segments.find_kind(SegmentKind::BlockData) {
            if segments.is_at_eof(id)? {
                self.growing_segment = Some(id);
                return Ok(id);
            }
        }
        let id = segments.create_segment("SysBData", SEG_SYS, 0)?;
        self.growing_segment = Some(id);
        Ok(id)
    }

    /// Add sixteen free blocks in front of the free list
    pub fn allocate_blocks(&mut self, segments: &mut SegmentDirectory) -> Result<()> {
        self.full_load(segments)?;
        if self.block_count + ALLOCATION_BATCH > MAX_BLOCKS {
            return Err(RasterError::ResourceLimit(format!(
                "block map already holds {} blocks",
                self.block_count
            )));
        }

        let segment = self.growable_segment(segments)?;
        let base = segments.get(segment)?.data_size() / BLOCK_PAGE_SIZE as u64;
        segments.extend(segment, (ALLOCATION_BATCH * BLOCK_PAGE_SIZE) as u64)?;

        let first_new = self.block_count as i64;
        let old_free = self.first_free;
        let entries = self.entries.get_or_insert_with(Vec::new);
        for i in 0..ALLOCATION_BATCH {
            let next = if i + 1 < ALLOCATION_BATCH {
                first_new + i as i64 + 1
            } else {
                old_free
            };
            entries.push(BlockEntry {
                segment: segment as u32,
                block_in_segment: base + i as u64,
                owner: -1,
                next,
            });
        }
        self.block_count += ALLOCATION_BATCH;
        self.first_free = first_new;
        self.dirty = true;

        tracing::debug!(
            segment,
            first_block = first_new,
            block_count = self.block_count,
            "allocated block batch"
        );
        Ok(())
    }

    /// Move the free head onto the end of `layer`'s chain.
    ///
    /// `last_block` is the caller's current chain tail (`-1` for an empty
    /// chain) and is updated to the new tail. Returns the new block's
    /// `(segment, block_in_segment)`.
    pub fn grow_virtual_file(
        &mut self,
        segments: &mut SegmentDirectory,
        layer: usize,
        last_block: &mut i64,
    ) -> Result<(u32, u64)> {
        self.check_layer(layer)?;
        self.full_load(segments)?;
        if self.first_free == -1 {
            self.allocate_blocks(segments)?;
        }

        let block = self.first_free;
        let entries = self
            .entries
            .as_mut()
            .ok_or_else(|| RasterError::corrupt("block map entries not loaded"))?;
        let entry = entries
            .get_mut(block as usize)
            .ok_or_else(|| RasterError::corrupt(format!("free list head {} out of range", block)))?;
        if entry.owner != -1 {
            return Err(RasterError::corrupt(format!(
                "free list block {} is owned by layer {}",
                block, entry.owner
            )));
        }
        entry.owner = layer as i64;
        let next_free = entry.next;
        entry.next = -1;
        let location = (entry.segment, entry.block_in_segment);

        if *last_block == -1 {
            self.layers[layer].first_block = block;
        } else {
            let tail = entries.get_mut(*last_block as usize).ok_or_else(|| {
                RasterError::corrupt(format!("chain tail {} out of range", last_block))
            })?;
            tail.next = block;
        }

        self.first_free = next_free;
        *last_block = block;
        self.dirty = true;
        Ok(location)
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        match self.layers.get(layer) {
            Some(entry) if entry.state == LayerState::Active => Ok(()),
            Some(_) => Err(RasterError::NotFound(format!("layer {} is deleted", layer))),
            None => Err(RasterError::NotFound(format!("layer {}", layer))),
        }
    }

    /// Register a new empty layer and return its index
    pub fn create_virtual_file(&mut self) -> usize {
        self.layers.push(LayerEntry {
            state: LayerState::Active,
            first_block: -1,
            length: 0,
        });
        self.dirty = true;
        self.layers.len() - 1
    }

    /// Mark a layer dead; its blocks stay owned
    pub fn delete_virtual_file(&mut self, layer: usize) -> Result<()> {
        self.check_layer(layer)?;
        self.layers[layer].state = LayerState::Dead;
        self.dirty = true;
        Ok(())
    }

    pub fn layer_first_block(&self, layer: usize) -> Result<i64> {
        self.check_layer(layer)?;
        Ok(self.layers[layer].first_block)
    }

    pub fn virtual_file_size(&self, layer: usize) -> Result<u64> {
        self.check_layer(layer)?;
        Ok(self.layers[layer].length)
    }

    pub fn set_virtual_file_size(&mut self, layer: usize, length: u64) -> Result<()> {
        self.check_layer(layer)?;
        if self.layers[layer].length != length {
            self.layers[layer].length = length;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn first_free_block(&self) -> i64 {
        self.first_free
    }

    pub fn stats(&mut self, segments: &SegmentDirectory) -> Result<BlockMapStats> {
        self.full_load(segments)?;
        let entries = self.entries.as_deref().unwrap_or_default();
        let free_blocks = entries.iter().filter(|e| e.owner == -1).count();
        Ok(BlockMapStats {
            block_count: self.block_count,
            free_blocks,
            owned_blocks: self.block_count - free_blocks,
            layer_count: self.layers.len(),
        })
    }

    /// Verify the free list is acyclic, ends in `-1` and holds only free blocks
    pub fn check_free_list(&mut self, segments: &SegmentDirectory) -> Result<usize> {
        self.full_load(segments)?;
        let entries = self.entries.as_deref().unwrap_or_default();
        let mut seen = HashSet::new();
        let mut block = self.first_free;
        while block != -1 {
            let entry = entries.get(block as usize).ok_or_else(|| {
                RasterError::corrupt(format!("free list reaches invalid block {}", block))
            })?;
            if !seen.insert(block) {
                return Err(RasterError::corrupt(format!(
                    "free list loops at block {}",
                    block
                )));
            }
            if entry.owner != -1 {
                return Err(RasterError::corrupt(format!(
                    "free list block {} is owned by layer {}",
                    block, entry.owner
                )));
            }
            block = entry.next;
        }
        Ok(seen.len())
    }

    fn encode_header(&self) -> Result<FieldBuffer> {
        let mut header = FieldBuffer::new(HEADER_SIZE);
        header.put_str(0, 10, "VERSION  1")?;
        header.put_int(10, 8, self.block_count as i64)?;
        header.put_int(18, 8, self.layers.len() as i64)?;
        header.put_int(26, 8, self.first_free)?;
        Ok(header)
    }

    fn encode_layers(&self) -> Result<FieldBuffer> {
        let mut raw = FieldBuffer::new(self.layers.len() * LAYER_SIZE);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.encode(&mut raw, i * LAYER_SIZE)?;
        }
        Ok(raw)
    }

    /// Write the map back when it changed.
    ///
    /// A fully loaded map is written whole; otherwise only the header and the
    /// layer table are rewritten.
    pub fn synchronize(&mut self, segments: &mut SegmentDirectory) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let layer_offset = HEADER_SIZE + self.block_count * ENTRY_SIZE;
        let needed = (layer_offset + self.layers.len() * LAYER_SIZE) as u64;
        let available = segments.get(self.segment)?.data_size();
        if needed > available {
            segments.extend(self.segment, needed - available)?;
        }

        let header = self.encode_header()?;
        let layers = self.encode_layers()?;
        match &self.entries {
            Some(entries) => {
                let mut raw = header.into_inner();
                let mut body = FieldBuffer::new(entries.len() * ENTRY_SIZE);
                for (i, entry) in entries.iter().enumerate() {
                    entry.encode(&mut body, i * ENTRY_SIZE)?;
                }
                raw.extend_from_slice(body.as_bytes());
                raw.extend_from_slice(layers.as_bytes());
                segments.write(self.segment, 0, &raw)?;
            }
            None => {
                segments.write(self.segment, 0, header.as_bytes())?;
                segments.write(self.segment, layer_offset as u64, layers.as_bytes())?;
            }
        }

        self.dirty = false;
        Ok(())
    }
}
