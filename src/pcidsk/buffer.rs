//! Fixed-width ASCII field buffer used by every PCIDSK header structure

use crate::error::{RasterError, Result};

/// A byte buffer addressed as space-padded ASCII fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBuffer {
    data: Vec<u8>,
}

impl FieldBuffer {
    /// A buffer of `size` spaces
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![b' '; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn field(&self, offset: usize, size: usize) -> Result<&[u8]> {
        self.data.get(offset..offset + size).ok_or_else(|| {
            RasterError::corrupt(format!(
                "field {}+{} outside {}-byte buffer",
                offset,
                size,
                self.data.len()
            ))
        })
    }

    fn field_mut(&mut self, offset: usize, size: usize) -> Result<&mut [u8]> {
        let len = self.data.len();
        self.data.get_mut(offset..offset + size).ok_or_else(|| {
            RasterError::Configuration(format!(
                "field {}+{} outside {}-byte buffer",
                offset, size, len
            ))
        })
    }

    /// Field text with trailing spaces and NULs removed
    pub fn get_str(&self, offset: usize, size: usize) -> Result<String> {
        let raw = self.field(offset, size)?;
        let text = String::from_utf8_lossy(raw);
        Ok(text.trim_end_matches([' ', '\0']).to_string())
    }

    /// Integer field; a blank field reads as zero
    pub fn get_int(&self, offset: usize, size: usize) -> Result<i64> {
        let text = self.get_str(offset, size)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(0);
        }
        text.parse().map_err(|_| {
            RasterError::corrupt(format!("bad integer field '{}' at offset {}", text, offset))
        })
    }

    /// Integer field that must not be negative
    pub fn get_u64(&self, offset: usize, size: usize) -> Result<u64> {
        let value = self.get_int(offset, size)?;
        u64::try_from(value).map_err(|_| {
            RasterError::corrupt(format!("negative value {} at offset {}", value, offset))
        })
    }

    /// Left-aligned, space-padded, truncated to the field width
    pub fn put_str(&mut self, offset: usize, size: usize, value: &str) -> Result<()> {
        let field = self.field_mut(offset, size)?;
        field.fill(b' ');
        let bytes = value.as_bytes();
        let n = bytes.len().min(size);
        field[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Right-aligned integer; a value wider than the field is a resource limit
    pub fn put_int(&mut self, offset: usize, size: usize, value: i64) -> Result<()> {
        let text = format!("{:>width$}", value, width = size);
        if text.len() > size {
            return Err(RasterError::ResourceLimit(format!(
                "value {} does not fit a {}-character field",
                value, size
            )));
        }
        self.field_mut(offset, size)?.copy_from_slice(text.as_bytes());
        Ok(())
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.field_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}
