//! Segment pointer table and segment data I/O
//!
//! Segments are the unit of file growth. Each one is a 1024-byte header
//! followed by its data area; a segment that does not end at end-of-file is
//! copied there before it is extended.

use super::buffer::FieldBuffer;
use crate::error::{RasterError, Result};
use crate::io::SharedFile;
use std::cell::OnceCell;
use std::sync::Arc;

/// PCIDSK addressing unit
pub const BLOCK_SIZE: u64 = 512;

pub const SEGMENT_HEADER_SIZE: u64 = 1024;

/// Size of one segment pointer record
pub const POINTER_SIZE: usize = 32;

/// Default size of the segment pointer table, in 512-byte blocks
pub const DEFAULT_POINTER_BLOCKS: u64 = 64;

pub const SEG_GEO: u16 = 150;
pub const SEG_LUT: u16 = 170;
pub const SEG_PCT: u16 = 171;
pub const SEG_BIN: u16 = 180;
pub const SEG_ARR: u16 = 181;
pub const SEG_SYS: u16 = 182;

const COPY_CHUNK: usize = 64 * 1024;

/// Pointer slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFlag {
    Active,
    Deleted,
    Linked,
    Free,
}

impl SegmentFlag {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'A' => Ok(SegmentFlag::Active),
            b'D' => Ok(SegmentFlag::Deleted),
            b'L' => Ok(SegmentFlag::Linked),
            b' ' | 0 => Ok(SegmentFlag::Free),
            other => Err(RasterError::corrupt(format!(
                "bad segment flag {:?}",
                other as char
            ))),
        }
    }

    fn as_byte(&self) -> u8 {
        match self {
            SegmentFlag::Active => b'A',
            SegmentFlag::Deleted => b'D',
            SegmentFlag::Linked => b'L',
            SegmentFlag::Free => b' ',
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SegmentFlag::Active | SegmentFlag::Linked)
    }
}

/// What a segment holds, resolved from its type code and name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    BlockMapDir,
    BlockData,
    System,
    Georef,
    Lut,
    Pct,
    Binary,
    Array,
    Other,
}

/// `(type, name prefix) -> kind`; first match wins, empty prefix matches all
const KIND_REGISTRY: &[(u16, &str, SegmentKind)] = &[
    (SEG_SYS, "SysBMDir", SegmentKind::BlockMapDir),
    (SEG_SYS, "SysBData", SegmentKind::BlockData),
    (SEG_SYS, "", SegmentKind::System),
    (SEG_GEO, "", SegmentKind::Georef),
    (SEG_LUT, "", SegmentKind::Lut),
    (SEG_PCT, "", SegmentKind::Pct),
    (SEG_BIN, "", SegmentKind::Binary),
    (SEG_ARR, "", SegmentKind::Array),
];

fn resolve_kind(seg_type: u16, name: &str) -> SegmentKind {
    KIND_REGISTRY
        .iter()
        .find(|(t, prefix, _)| *t == seg_type && name.starts_with(prefix))
        .map(|(_, _, kind)| *kind)
        .unwrap_or(SegmentKind::Other)
}

/// One segment pointer record
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub flag: SegmentFlag,
    pub seg_type: u16,
    pub name: String,
    /// 1-based, in 512-byte blocks
    pub start_block: u64,
    /// Includes the two header blocks
    pub block_count: u64,
    kind: OnceCell<SegmentKind>,
}

impl SegmentInfo {
    fn free() -> Self {
        Self {
            flag: SegmentFlag::Free,
            seg_type: 0,
            name: String::new(),
            start_block: 0,
            block_count: 0,
            kind: OnceCell::new(),
        }
    }

    fn parse(raw: &FieldBuffer) -> Result<Self> {
        let flag = SegmentFlag::from_byte(raw.as_bytes()[0])?;
        if flag == SegmentFlag::Free {
            return Ok(Self::free());
        }
        let seg_type = raw.get_int(1, 3)?;
        Ok(Self {
            flag,
            seg_type: u16::try_from(seg_type)
                .map_err(|_| RasterError::corrupt(format!("bad segment type {}", seg_type)))?,
            name: raw.get_str(4, 8)?,
            start_block: raw.get_u64(12, 11)?,
            block_count: raw.get_u64(23, 9)?,
            kind: OnceCell::new(),
        })
    }

    fn encode(&self) -> Result<FieldBuffer> {
        let mut raw = FieldBuffer::new(POINTER_SIZE);
        if self.flag == SegmentFlag::Free {
            return Ok(raw);
        }
        raw.put_bytes(0, &[self.flag.as_byte()])?;
        raw.put_int(1, 3, self.seg_type as i64)?;
        raw.put_str(4, 8, &self.name)?;
        raw.put_int(12, 11, self.start_block as i64)?;
        raw.put_int(23, 9, self.block_count as i64)?;
        Ok(raw)
    }

    /// Kind resolved through the registry on first use
    pub fn kind(&self) -> SegmentKind {
        *self
            .kind
            .get_or_init(|| resolve_kind(self.seg_type, &self.name))
    }

    pub fn header_offset(&self) -> u64 {
        (self.start_block - 1) * BLOCK_SIZE
    }

    pub fn data_offset(&self) -> u64 {
        self.header_offset() + SEGMENT_HEADER_SIZE
    }

    pub fn data_size(&self) -> u64 {
        (self.block_count * BLOCK_SIZE).saturating_sub(SEGMENT_HEADER_SIZE)
    }

    /// Last 1-based block occupied by the segment
    pub fn end_block(&self) -> u64 {
        self.start_block + self.block_count - 1
    }
}

/// Current time in the PCIDSK `HH:MM DDMONYYYY` form
pub(crate) fn pcidsk_timestamp() -> String {
    chrono::Local::now()
        .format("%H:%M %d%b%Y")
        .to_string()
        .to_uppercase()
}

/// In-memory copy of the segment pointer table plus the file's block count
#[derive(Debug)]
pub struct SegmentDirectory {
    file: Arc<SharedFile>,
    pointer_offset: u64,
    segments: Vec<SegmentInfo>,
    eof_block: u64,
    dirty: bool,
}

/// Byte length of a `count * unit` table at `offset`, refused when the file
/// cannot hold it
pub fn table_len(file: &SharedFile, what: &str, offset: u64, count: u64, unit: u64) -> Result<usize> {
    let file_len = file.len()?;
    let len = count
        .checked_mul(unit)
        .filter(|&len| offset.checked_add(len).is_some_and(|end| end <= file_len))
        .ok_or_else(|| {
            RasterError::ResourceLimit(format!(
                "{} of {} x {} bytes at {} exceeds file size {}",
                what, count, unit, offset, file_len
            ))
        })?;
    usize::try_from(len).map_err(|_| RasterError::ResourceLimit(format!("{} of {} bytes", what, len)))
}

impl SegmentDirectory {
    /// Write an empty pointer table for a new file
    pub fn create(
        file: Arc<SharedFile>,
        pointer_offset: u64,
        pointer_blocks: u64,
        eof_block: u64,
    ) -> Result<Self> {
        let slots = (pointer_blocks * BLOCK_SIZE) as usize / POINTER_SIZE;
        let directory = Self {
            file,
            pointer_offset,
            segments: vec![SegmentInfo::free(); slots],
            eof_block,
            dirty: false,
        };
        directory
            .file
            .write_at(&vec![b' '; slots * POINTER_SIZE], pointer_offset)?;
        Ok(directory)
    }

    pub fn load(
        file: Arc<SharedFile>,
        pointer_offset: u64,
        pointer_blocks: u64,
        eof_block: u64,
    ) -> Result<Self> {
        let size = table_len(&file, "segment pointer table", pointer_offset, pointer_blocks, BLOCK_SIZE)?;
        let mut raw = vec![0u8; size];
        file.read_at(&mut raw, pointer_offset)?;

        let mut segments = Vec::with_capacity(size / POINTER_SIZE);
        for (slot, record) in raw.chunks_exact(POINTER_SIZE).enumerate() {
            let info = SegmentInfo::parse(&FieldBuffer::from_bytes(record.to_vec()))?;
            if info.flag != SegmentFlag::Free
                && (info.start_block == 0
                    || info.block_count < 2
                    || info.end_block() > eof_block)
            {
                return Err(RasterError::corrupt(format!(
                    "segment {} spans blocks {}+{} beyond file end {}",
                    slot + 1,
                    info.start_block,
                    info.block_count,
                    eof_block
                )));
            }
            segments.push(info);
        }

        Ok(Self {
            file,
            pointer_offset,
            segments,
            eof_block,
            dirty: false,
        })
    }

    pub fn file(&self) -> &Arc<SharedFile> {
        &self.file
    }

    /// File size in 512-byte blocks
    pub fn eof_block(&self) -> u64 {
        self.eof_block
    }

    pub fn capacity(&self) -> usize {
        self.segments.len()
    }

    /// Segment by 1-based id
    pub fn get(&self, id: usize) -> Result<&SegmentInfo> {
        id.checked_sub(1)
            .and_then(|slot| self.segments.get(slot))
            .filter(|info| info.flag.is_live())
            .ok_or_else(|| RasterError::NotFound(format!("segment {}", id)))
    }

    fn get_mut(&mut self, id: usize) -> Result<&mut SegmentInfo> {
        id.checked_sub(1)
            .and_then(|slot| self.segments.get_mut(slot))
            .filter(|info| info.flag.is_live())
            .ok_or_else(|| RasterError::NotFound(format!("segment {}", id)))
    }

    /// Live segment ids of the given kind, in table order
    pub fn find_kind(&self, kind: SegmentKind) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, info)| info.flag.is_live() && info.kind() == kind)
            .map(|(slot, _)| slot + 1)
            .collect()
    }

    pub fn is_at_eof(&self, id: usize) -> Result<bool> {
        Ok(self.get(id)?.end_block() == self.eof_block)
    }

    fn check_writable(&self) -> Result<()> {
        if !self.file.is_writable() {
            return Err(RasterError::ReadOnly(self.file.name().to_string()));
        }
        Ok(())
    }

    /// Create a segment with room for `data_bytes`, returning its id.
    ///
    /// A deleted segment of exactly the required size is reused; otherwise the
    /// segment is placed at end-of-file in the first free pointer slot.
    pub fn create_segment(&mut self, name: &str, seg_type: u16, data_bytes: u64) -> Result<usize> {
        self.check_writable()?;
        let blocks = 2 + data_bytes.div_ceil(BLOCK_SIZE);

        let reuse = self
            .segments
            .iter()
            .position(|info| info.flag == SegmentFlag::Deleted && info.block_count == blocks);

        let slot = match reuse {
            Some(slot) => {
                let info = &mut self.segments[slot];
                info.flag = SegmentFlag::Active;
                info.seg_type = seg_type;
                info.name = name.to_string();
                info.kind = OnceCell::new();
                slot
            }
            None => {
                let slot = self
                    .segments
                    .iter()
                    .position(|info| info.flag == SegmentFlag::Free)
                    .ok_or_else(|| {
                        RasterError::ResourceLimit(format!(
                            "segment pointer table full ({} segments)",
                            self.segments.len()
                        ))
                    })?;
                let start_block = self.eof_block + 1;
                self.file.write_at(
                    &vec![0u8; (blocks * BLOCK_SIZE) as usize],
                    (start_block - 1) * BLOCK_SIZE,
                )?;
                self.eof_block += blocks;
                self.segments[slot] = SegmentInfo {
                    flag: SegmentFlag::Active,
                    seg_type,
                    name: name.to_string(),
                    start_block,
                    block_count: blocks,
                    kind: OnceCell::new(),
                };
                slot
            }
        };

        self.write_segment_header(slot + 1)?;
        self.dirty = true;
        tracing::debug!(
            segment = slot + 1,
            name,
            seg_type,
            blocks,
            reused = reuse.is_some(),
            "created segment"
        );
        Ok(slot + 1)
    }

    fn write_segment_header(&self, id: usize) -> Result<()> {
        let info = self.get(id)?;
        let now = pcidsk_timestamp();
        let mut header = FieldBuffer::new(SEGMENT_HEADER_SIZE as usize);
        header.put_str(0, 64, &format!("{} segment", info.name))?;
        header.put_str(64, 16, &now)?;
        header.put_str(80, 16, &now)?;
        self.file.write_at(header.as_bytes(), info.header_offset())
    }

    /// Flag a segment deleted; its blocks stay in place for exact-size reuse
    pub fn delete_segment(&mut self, id: usize) -> Result<()> {
        self.check_writable()?;
        let info = self.get_mut(id)?;
        info.flag = SegmentFlag::Deleted;
        self.dirty = true;
        Ok(())
    }

    pub fn read(&self, id: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let info = self.get(id)?;
        if offset + buf.len() as u64 > info.data_size() {
            return Err(RasterError::corrupt(format!(
                "read of {} bytes at {} beyond segment {} data ({} bytes)",
                buf.len(),
                offset,
                id,
                info.data_size()
            )));
        }
        self.file.read_at(buf, info.data_offset() + offset)
    }

    pub fn write(&mut self, id: usize, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let info = self.get(id)?;
        if offset + data.len() as u64 > info.data_size() {
            return Err(RasterError::OutOfBounds(format!(
                "write of {} bytes at {} beyond segment {} data ({} bytes)",
                data.len(),
                offset,
                id,
                info.data_size()
            )));
        }
        self.file.write_at(data, info.data_offset() + offset)
    }

    /// Copy a segment to end-of-file and repoint it there
    pub fn move_to_eof(&mut self, id: usize) -> Result<()> {
        self.check_writable()?;
        if self.is_at_eof(id)? {
            return Ok(());
        }

        let info = self.get(id)?.clone();
        let new_start = self.eof_block + 1;
        let total = info.block_count * BLOCK_SIZE;

        let mut io = self.file.lock();
        let mut chunk = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        while copied < total {
            let n = (total - copied).min(COPY_CHUNK as u64) as usize;
            io.read_at(&mut chunk[..n], info.header_offset() + copied)?;
            io.write_at(&chunk[..n], (new_start - 1) * BLOCK_SIZE + copied)?;
            copied += n as u64;
        }
        drop(io);

        self.eof_block += info.block_count;
        self.get_mut(id)?.start_block = new_start;
        self.dirty = true;
        tracing::debug!(
            segment = id,
            from = info.start_block,
            to = new_start,
            "moved segment to end of file"
        );
        Ok(())
    }

    /// Grow a segment's data area by at least `extra_bytes`, zero filled
    pub fn extend(&mut self, id: usize, extra_bytes: u64) -> Result<()> {
        self.check_writable()?;
        self.move_to_eof(id)?;

        let blocks = extra_bytes.div_ceil(BLOCK_SIZE);
        let old_end = self.get(id)?.end_block();
        self.file
            .write_at(&vec![0u8; (blocks * BLOCK_SIZE) as usize], old_end * BLOCK_SIZE)?;

        self.get_mut(id)?.block_count += blocks;
        self.eof_block += blocks;
        self.dirty = true;
        Ok(())
    }

    /// Persist the pointer table when it changed; returns whether it did
    pub fn synchronize(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let mut raw = Vec::with_capacity(self.segments.len() * POINTER_SIZE);
        for info in &self.segments {
            raw.extend_from_slice(info.encode()?.as_bytes());
        }
        self.file.write_at(&raw, self.pointer_offset)?;
        self.dirty = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{HandleRegistry, MemoryIOManager};
    use crate::types::OpenMode;

    fn new_directory(pointer_blocks: u64) -> SegmentDirectory {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("seg.pix", OpenMode::Create).unwrap();
        // Block 1 stands in for the file header, pointer table follows it
        file.write_at(&[b' '; 512], 0).unwrap();
        SegmentDirectory::create(file, BLOCK_SIZE, pointer_blocks, 1 + pointer_blocks).unwrap()
    }

    #[test]
    fn test_create_and_reload() {
        let mut dir = new_directory(2);
        let id = dir.create_segment("SysBMDir", SEG_SYS, 600).unwrap();
        assert_eq!(id, 1);
        let info = dir.get(id).unwrap();
        assert_eq!(info.start_block, 4);
        assert_eq!(info.block_count, 4);
        assert_eq!(info.kind(), SegmentKind::BlockMapDir);
        assert!(dir.is_at_eof(id).unwrap());

        dir.write(id, 10, b"hello").unwrap();
        assert!(dir.synchronize().unwrap());
        assert!(!dir.synchronize().unwrap());

        let reloaded =
            SegmentDirectory::load(Arc::clone(dir.file()), BLOCK_SIZE, 2, dir.eof_block()).unwrap();
        let info = reloaded.get(id).unwrap();
        assert_eq!(info.name, "SysBMDir");
        assert_eq!(info.seg_type, SEG_SYS);
        let mut buf = [0u8; 5];
        reloaded.read(id, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_oversized_pointer_table_is_refused() {
        let dir = new_directory(2);
        let file = Arc::clone(dir.file());
        let err = SegmentDirectory::load(Arc::clone(&file), BLOCK_SIZE, 99_999_999, u64::MAX)
            .err()
            .unwrap();
        assert!(matches!(err, RasterError::ResourceLimit(_)));
        assert!(table_len(&file, "table", 0, u64::MAX, BLOCK_SIZE).is_err());
        assert_eq!(table_len(&file, "table", BLOCK_SIZE, 2, BLOCK_SIZE).unwrap(), 1024);
    }

    #[test]
    fn test_kind_registry() {
        assert_eq!(resolve_kind(SEG_SYS, "SysBData"), SegmentKind::BlockData);
        assert_eq!(resolve_kind(SEG_SYS, "SysGeo"), SegmentKind::System);
        assert_eq!(resolve_kind(SEG_LUT, "Stretch"), SegmentKind::Lut);
        assert_eq!(resolve_kind(999, "x"), SegmentKind::Other);
    }

    #[test]
    fn test_extend_moves_to_eof() {
        let mut dir = new_directory(2);
        let a = dir.create_segment("SysBData", SEG_SYS, 512).unwrap();
        let b = dir.create_segment("Other", SEG_BIN, 512).unwrap();
        dir.write(a, 0, b"payload").unwrap();
        assert!(!dir.is_at_eof(a).unwrap());

        let old_start = dir.get(a).unwrap().start_block;
        dir.extend(a, 1000).unwrap();
        let info = dir.get(a).unwrap();
        assert!(info.start_block > old_start);
        assert_eq!(info.data_size(), 512 + 1024);
        assert!(dir.is_at_eof(a).unwrap());
        assert!(!dir.is_at_eof(b).unwrap());

        let mut buf = [0u8; 7];
        dir.read(a, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert_eq!(dir.find_kind(SegmentKind::BlockData), vec![a]);
    }

    #[test]
    fn test_deleted_segment_reused_on_exact_size() {
        let mut dir = new_directory(2);
        let a = dir.create_segment("Binary", SEG_BIN, 1024).unwrap();
        let start = dir.get(a).unwrap().start_block;
        dir.delete_segment(a).unwrap();
        assert!(dir.get(a).is_err());

        // Different size: placed at end of file
        let b = dir.create_segment("Binary", SEG_BIN, 2048).unwrap();
        assert_ne!(dir.get(b).unwrap().start_block, start);

        // Exact size: reuses the deleted slot and its blocks
        let c = dir.create_segment("Binary", SEG_BIN, 1024).unwrap();
        assert_eq!(c, a);
        assert_eq!(dir.get(c).unwrap().start_block, start);
    }

    #[test]
    fn test_pointer_table_full() {
        let mut dir = new_directory(1);
        for i in 0..dir.capacity() {
            dir.create_segment(&format!("S{}", i), SEG_BIN, 0).unwrap();
        }
        let err = dir.create_segment("Overflow", SEG_BIN, 0).unwrap_err();
        assert!(matches!(err, RasterError::ResourceLimit(_)));
    }

    #[test]
    fn test_segment_beyond_eof_is_corrupt() {
        let mut dir = new_directory(1);
        dir.create_segment("Binary", SEG_BIN, 512).unwrap();
        dir.synchronize().unwrap();
        let err = SegmentDirectory::load(Arc::clone(dir.file()), BLOCK_SIZE, 1, 3).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_read_only_rejects_create() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("ro.pix", OpenMode::Create).unwrap();
        file.write_at(&[b' '; 1024], 0).unwrap();
        drop(file);
        let ro = registry.open("ro.pix", OpenMode::Read).unwrap();
        let mut dir = SegmentDirectory::load(ro, BLOCK_SIZE, 1, 2).unwrap();
        assert!(matches!(
            dir.create_segment("X", SEG_BIN, 0),
            Err(RasterError::ReadOnly(_))
        ));
    }
}
