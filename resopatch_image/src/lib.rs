pub mod pe;

pub mod scanner {
    pub use resopatch_scanner::*;
}

use std::{
    ops::{Range, RangeFrom},
    path::Path,
};

use crc::Crc;
use scanner::{Pattern, Xref};

/// Leading bytes excluded from the identifying checksum. The PE header lives here and
/// carries fields (timestamps, checksum, flags) that differ harmlessly between copies.
pub const CHECKSUM_SKIP: usize = 0x1000;

const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC-32 of `data[CHECKSUM_SKIP..]`. Buffers no longer than the header checksum to the
/// CRC of the empty slice.
pub fn checksum(data: &[u8]) -> u32 {
    CRC.checksum(data.get(CHECKSUM_SKIP..).unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryAccessError {
    OutOfBounds { offset: usize, len: usize, size: usize },
}
impl std::error::Error for MemoryAccessError {}
impl std::fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "access of {len:#x} bytes at {offset:#x} is outside image of {size:#x} bytes"
            ),
        }
    }
}

/// Little-endian value written into a fixed field of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Scalar {
    U8(u8),
    U16(u16),
    U32(u32),
}
impl Scalar {
    /// Size of the encoded value in bytes
    pub fn width(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) => 4,
        }
    }
    pub fn value(self) -> u32 {
        match self {
            Self::U8(v) => v as u32,
            Self::U16(v) => v as u32,
            Self::U32(v) => v,
        }
    }
}
impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v:#04x}u8"),
            Self::U16(v) => write!(f, "{v:#06x}u16"),
            Self::U32(v) => write!(f, "{v:#010x}u32"),
        }
    }
}

/// Read access to an image by file offset
pub trait MemoryTrait {
    /// Return slice of u8 at `range`
    fn range(&self, range: Range<usize>) -> Result<&[u8], MemoryAccessError>;
    /// Return slice of u8 from start of `range` to end of image
    fn range_from(&self, range: RangeFrom<usize>) -> Result<&[u8], MemoryAccessError>;

    /// Return u8 at `offset`
    fn u8(&self, offset: usize) -> Result<u8, MemoryAccessError> {
        Ok(self.range(offset..offset + 1)?[0])
    }
    /// Return u16 at `offset`
    fn u16_le(&self, offset: usize) -> Result<u16, MemoryAccessError> {
        let mut buf = [0; 2];
        buf.copy_from_slice(self.range(offset..offset + 2)?);
        Ok(u16::from_le_bytes(buf))
    }
    /// Return u32 at `offset`
    fn u32_le(&self, offset: usize) -> Result<u32, MemoryAccessError> {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.range(offset..offset + 4)?);
        Ok(u32::from_le_bytes(buf))
    }
    /// Return offset targeted by the rel32 displacement at `offset`
    fn rel32(&self, offset: usize) -> Result<Option<usize>, MemoryAccessError> {
        Ok(scanner::rel32_target(offset, self.range(offset..offset + 4)?))
    }
}

/// Write access to an image by file offset. Every write is bounds checked.
pub trait MemoryMutTrait: MemoryTrait {
    fn range_mut(&mut self, range: Range<usize>) -> Result<&mut [u8], MemoryAccessError>;

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), MemoryAccessError> {
        self.range_mut(offset..offset + bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }
    fn write_scalar(&mut self, offset: usize, value: Scalar) -> Result<(), MemoryAccessError> {
        match value {
            Scalar::U8(v) => self.write_bytes(offset, &[v]),
            Scalar::U16(v) => self.write_bytes(offset, &v.to_le_bytes()),
            Scalar::U32(v) => self.write_bytes(offset, &v.to_le_bytes()),
        }
    }
    fn fill(&mut self, range: Range<usize>, byte: u8) -> Result<(), MemoryAccessError> {
        self.range_mut(range)?.fill(byte);
        Ok(())
    }
}

/// Whole executable file, owned and mutated in place by a single patch run.
#[derive(Clone, PartialEq, Eq)]
pub struct ExeImage {
    data: Vec<u8>,
}

impl std::fmt::Debug for ExeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExeImage")
            .field("len", &self.data.len())
            .field("checksum", &format_args!("{:#010x}", self.checksum()))
            .finish()
    }
}

impl From<Vec<u8>> for ExeImage {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl ExeImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
    pub fn read<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), len = data.len(), "read image");
        Ok(Self::new(data))
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
    pub fn checksum(&self) -> u32 {
        checksum(&self.data)
    }
    /// Scan the whole file. Reported addresses are `base_address + file offset`.
    pub fn scan(&self, patterns: &[&Pattern], base_address: usize) -> Vec<Vec<usize>> {
        scanner::scan_pattern(patterns, base_address, &self.data)
    }
    pub fn scan_xref(&self, xrefs: &[&Xref], base_address: usize) -> Vec<Vec<usize>> {
        scanner::scan_xref(xrefs, base_address, &self.data)
    }
    /// File offset ranges of zero-filled runs at least `min_len` long
    pub fn zero_runs(&self, min_len: usize) -> Vec<Range<usize>> {
        scanner::find_zero_runs(&self.data, 0, min_len)
    }

    fn check(&self, range: &Range<usize>) -> Result<(), MemoryAccessError> {
        if range.start <= range.end && range.end <= self.data.len() {
            Ok(())
        } else {
            Err(MemoryAccessError::OutOfBounds {
                offset: range.start,
                len: range.end.saturating_sub(range.start),
                size: self.data.len(),
            })
        }
    }
}

impl MemoryTrait for ExeImage {
    fn range(&self, range: Range<usize>) -> Result<&[u8], MemoryAccessError> {
        self.check(&range)?;
        Ok(&self.data[range])
    }
    fn range_from(&self, range: RangeFrom<usize>) -> Result<&[u8], MemoryAccessError> {
        self.check(&(range.start..self.data.len()))?;
        Ok(&self.data[range])
    }
}

impl MemoryMutTrait for ExeImage {
    fn range_mut(&mut self, range: Range<usize>) -> Result<&mut [u8], MemoryAccessError> {
        self.check(&range)?;
        Ok(&mut self.data[range])
    }
}
