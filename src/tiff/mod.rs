//! Minimal classic TIFF layer
//!
//! Reads either byte order and writes in the file's own order (new files are
//! little-endian). Directories are appended at end-of-file and linked by
//! patching the previous `next` field. Strile arrays are read lazily and
//! patched in place.

pub mod ifd;

use crate::error::{RasterError, Result};
use crate::io::SharedFile;
pub use ifd::{Directory, DirectorySpec, Endian, RawEntry, StrileArray};
use std::sync::Arc;

const CLASSIC_MAGIC: u16 = 42;
const BIG_TIFF_MAGIC: u16 = 43;
const HEADER_SIZE: u64 = 8;

/// Where a strile's bytes are, `byte_count == 0` meaning unwritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrileLocation {
    pub offset: u64,
    pub byte_count: u64,
}

#[derive(Debug)]
pub struct TiffFile {
    file: Arc<SharedFile>,
    endian: Endian,
    first_directory: u64,
    eof: u64,
}

impl TiffFile {
    /// Write a little-endian header, optionally followed by a ghost area at offset 8
    pub fn create(file: Arc<SharedFile>, ghost: Option<&[u8]>) -> Result<Self> {
        let mut header = vec![b'I', b'I', 0, 0, 0, 0, 0, 0];
        Endian::Little.write_u16(&mut header[2..4], CLASSIC_MAGIC);
        if let Some(ghost) = ghost {
            header.extend_from_slice(ghost);
        }
        file.write_at(&header, 0)?;
        Ok(Self {
            file,
            endian: Endian::Little,
            first_directory: 0,
            eof: header.len() as u64,
        })
    }

    pub fn open(file: Arc<SharedFile>) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_at(&mut header, 0)?;
        let endian = match &header[0..2] {
            b"II" => Endian::Little,
            b"MM" => Endian::Big,
            _ => return Err(RasterError::corrupt("not a TIFF file (bad byte order mark)")),
        };
        match endian.read_u16(&header[2..4]) {
            CLASSIC_MAGIC => {}
            BIG_TIFF_MAGIC => {
                return Err(RasterError::UnsupportedVersion(format!(
                    "{} is BigTIFF",
                    file.name()
                )))
            }
            other => {
                return Err(RasterError::corrupt(format!("bad TIFF magic {}", other)));
            }
        }
        let eof = file.len()?;
        Ok(Self {
            first_directory: endian.read_u32(&header[4..8]) as u64,
            file,
            endian,
            eof,
        })
    }

    pub fn file(&self) -> &Arc<SharedFile> {
        &self.file
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn first_directory_offset(&self) -> u64 {
        self.first_directory
    }

    pub fn eof(&self) -> u64 {
        self.eof
    }

    pub fn read_directory(&self, offset: u64) -> Result<Directory> {
        Directory::parse(&self.file, self.endian, offset, self.eof)
    }

    /// Leading bytes of the file, clipped to its length
    pub fn read_prefix(&self, len: usize) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; len.min(self.eof as usize)];
        self.file.read_at(&mut raw, 0)?;
        Ok(raw)
    }

    pub fn patch(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.write_at(bytes, offset)
    }

    /// One array value; a deferred array costs one small read
    pub fn strile_value(&self, array: &StrileArray, index: usize) -> Result<u64> {
        if index >= array.count {
            return Err(RasterError::OutOfBounds(format!(
                "strile {} of {}",
                index, array.count
            )));
        }
        if let Some(values) = &array.values {
            return Ok(values[index]);
        }
        let size = array.value_size();
        let mut raw = [0u8; 4];
        self.file
            .read_at(&mut raw[..size], array.location + (index * size) as u64)?;
        Ok(array.decode(self.endian, &raw[..size]))
    }

    /// Materialize both strile arrays of a directory
    pub fn load_striles(&self, dir: &mut Directory) -> Result<()> {
        for array in [&mut dir.offsets, &mut dir.byte_counts] {
            if array.is_loaded() {
                continue;
            }
            let size = array.value_size();
            let mut raw = vec![0u8; array.count * size];
            self.file.read_at(&mut raw, array.location)?;
            let values: Vec<u64> = raw
                .chunks_exact(size)
                .map(|chunk| array.decode(self.endian, chunk))
                .collect();
            array.values = Some(values);
        }
        Ok(())
    }

    /// Offset and byte count of a strile, validated against end-of-file
    pub fn strile_location(&self, dir: &Directory, index: usize) -> Result<StrileLocation> {
        let byte_count = self.strile_value(&dir.byte_counts, index)?;
        let offset = if byte_count == 0 {
            0
        } else {
            self.strile_value(&dir.offsets, index)?
        };
        if byte_count > 0 && (offset < HEADER_SIZE || offset + byte_count > self.eof) {
            return Err(RasterError::corrupt(format!(
                "strile {} at {}+{} beyond end of file ({})",
                index, offset, byte_count, self.eof
            )));
        }
        Ok(StrileLocation { offset, byte_count })
    }

    pub fn read_strile(&self, location: StrileLocation, buf: &mut Vec<u8>) -> Result<()> {
        buf.resize(location.byte_count as usize, 0);
        self.file.read_at(buf, location.offset)
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let position = self.eof + (self.eof % 2);
        self.file.write_at(data, position)?;
        self.eof = position + data.len() as u64;
        Ok(position)
    }

    /// Store encoded strile bytes, in place when they fit, else at end-of-file.
    ///
    /// Returns `true` when an already written strile had to move.
    pub fn write_strile(&mut self, dir: &mut Directory, index: usize, data: &[u8]) -> Result<bool> {
        self.load_striles(dir)?;
        let current = self.strile_location(dir, index)?;
        let (position, relocated) = if current.byte_count > 0 && data.len() as u64 <= current.byte_count {
            self.file.write_at(data, current.offset)?;
            (current.offset, false)
        } else {
            (self.append(data)?, current.byte_count > 0)
        };

        for (array, value) in [
            (&mut dir.offsets, position),
            (&mut dir.byte_counts, data.len() as u64),
        ] {
            if let Some(values) = array.values.as_mut() {
                values[index] = value;
                array.dirty = true;
            }
        }
        Ok(relocated)
    }

    /// Write modified strile arrays back over their on-disk copies
    pub fn flush_striles(&self, dir: &mut Directory) -> Result<()> {
        for array in [&mut dir.offsets, &mut dir.byte_counts] {
            if !array.dirty {
                continue;
            }
            let raw = array.encode(self.endian)?;
            self.file.write_at(&raw, array.location)?;
            array.dirty = false;
        }
        Ok(())
    }

    /// Append a directory and link it after `previous` (or from the header)
    pub fn write_directory(&mut self, dir: &mut Directory, previous: Option<u64>) -> Result<()> {
        self.load_striles(dir)?;
        let position = self.eof + (self.eof % 2);
        let raw = dir.encode(self.endian, position)?;
        self.file.write_at(&raw, position)?;
        self.eof = position + raw.len() as u64;

        let link = u32::try_from(position).map_err(|_| {
            RasterError::ResourceLimit("directory beyond the 4 GiB classic TIFF limit".into())
        })?;
        let mut field = [0u8; 4];
        self.endian.write_u32(&mut field, link);
        match previous {
            Some(prev) => {
                let mut count = [0u8; 2];
                self.file.read_at(&mut count, prev)?;
                let entries = self.endian.read_u16(&count) as u64;
                self.file.write_at(&field, prev + 2 + entries * 12)?;
            }
            None => {
                self.file.write_at(&field, 4)?;
                self.first_directory = position;
            }
        }
        tracing::debug!(file = self.file.name(), offset = position, "wrote TIFF directory");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::ifd::*;
    use super::*;
    use crate::io::{HandleRegistry, MemoryIOManager};
    use crate::types::{DataType, OpenMode};

    fn strip_spec() -> DirectorySpec {
        DirectorySpec {
            subfile_type: 0,
            width: 64,
            height: 40,
            data_type: DataType::U8,
            samples_per_pixel: 1,
            compression: 1,
            photometric: PHOTOMETRIC_MINISBLACK,
            planar_config: PLANAR_CONTIG,
            tile_size: None,
            block_height: 16,
        }
    }

    #[test]
    fn test_directory_chain_round_trip() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("chain.tif", OpenMode::Create).unwrap();
        let mut tiff = TiffFile::create(Arc::clone(&file), None).unwrap();

        let mut main = Directory::new(strip_spec()).unwrap();
        tiff.write_directory(&mut main, None).unwrap();
        let mut overview = Directory::new(DirectorySpec {
            subfile_type: FILETYPE_REDUCEDIMAGE,
            width: 32,
            height: 20,
            ..strip_spec()
        })
        .unwrap();
        tiff.write_directory(&mut overview, Some(main.offset)).unwrap();

        let strip = vec![5u8; 64 * 16];
        assert!(!tiff.write_strile(&mut main, 1, &strip).unwrap());
        tiff.flush_striles(&mut main).unwrap();
        drop(tiff);

        let tiff = TiffFile::open(file).unwrap();
        let first = tiff.read_directory(tiff.first_directory_offset()).unwrap();
        assert_eq!((first.width, first.height), (64, 40));
        assert!(!first.offsets.is_loaded());
        assert_eq!(first.strile_count().unwrap(), 3);
        let location = tiff.strile_location(&first, 1).unwrap();
        assert_eq!(location.byte_count, 64 * 16);
        assert_eq!(tiff.strile_location(&first, 0).unwrap().byte_count, 0);

        let mut buf = Vec::new();
        tiff.read_strile(location, &mut buf).unwrap();
        assert_eq!(buf, strip);

        let second = tiff.read_directory(first.next_offset).unwrap();
        assert!(second.is_reduced_image());
        assert_eq!(second.next_offset, 0);
    }

    #[test]
    fn test_rewrite_reports_relocation() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("move.tif", OpenMode::Create).unwrap();
        let mut tiff = TiffFile::create(file, None).unwrap();
        let mut dir = Directory::new(strip_spec()).unwrap();
        tiff.write_directory(&mut dir, None).unwrap();

        assert!(!tiff.write_strile(&mut dir, 0, &[1u8; 100]).unwrap());
        let first = tiff.strile_location(&dir, 0).unwrap();
        assert!(!tiff.write_strile(&mut dir, 0, &[2u8; 60]).unwrap());
        assert_eq!(tiff.strile_location(&dir, 0).unwrap().offset, first.offset);
        assert!(tiff.write_strile(&mut dir, 0, &[3u8; 200]).unwrap());
        assert_ne!(tiff.strile_location(&dir, 0).unwrap().offset, first.offset);
    }

    #[test]
    fn test_header_checks() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("big.tif", OpenMode::Create).unwrap();
        file.write_at(&[b'I', b'I', 43, 0, 8, 0, 0, 0], 0).unwrap();
        assert!(matches!(
            TiffFile::open(Arc::clone(&file)),
            Err(RasterError::UnsupportedVersion(_))
        ));
        file.write_at(&[b'X', b'X'], 0).unwrap();
        assert!(TiffFile::open(file).unwrap_err().is_corruption());
    }

    #[test]
    fn test_big_endian_directory() {
        let registry = HandleRegistry::new(Arc::new(MemoryIOManager::new()));
        let file = registry.open("mm.tif", OpenMode::Create).unwrap();
        // Header, then a 5-entry IFD at 8 and one 4-byte strip at 80
        let mut raw = vec![b'M', b'M', 0, 42, 0, 0, 0, 8];
        raw.extend_from_slice(&[0, 5]);
        for (tag, ty, value) in [
            (256u16, 3u16, 2u32 << 16),
            (257, 3, 2 << 16),
            (273, 4, 80),
            (278, 3, 2 << 16),
            (279, 4, 4),
        ] {
            raw.extend_from_slice(&tag.to_be_bytes());
            raw.extend_from_slice(&ty.to_be_bytes());
            raw.extend_from_slice(&1u32.to_be_bytes());
            raw.extend_from_slice(&value.to_be_bytes());
        }
        raw.extend_from_slice(&[0, 0, 0, 0]);
        raw.resize(80, 0);
        raw.extend_from_slice(&[1, 2, 3, 4]);
        file.write_at(&raw, 0).unwrap();

        let tiff = TiffFile::open(file).unwrap();
        assert_eq!(tiff.endian(), Endian::Big);
        let dir = tiff.read_directory(8).unwrap();
        assert_eq!((dir.width, dir.height, dir.rows_per_strip), (2, 2, 2));
        assert_eq!(
            tiff.strile_location(&dir, 0).unwrap(),
            StrileLocation {
                offset: 80,
                byte_count: 4
            }
        );
    }
}
