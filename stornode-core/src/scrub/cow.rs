//! On-disk format of a device-mapper persistent snapshot COW store.
//!
//! ```text
//! chunk 0                 header (magic, valid, version, chunk size)
//! chunk 1                 metadata store 0: exceptionsPerChunk records
//! chunk 2 ..= N+1         data chunks referenced by store 0
//! chunk N+2               metadata store 1
//! ...
//! ```
//!
//! All integers are little-endian.

use serde::Serialize;

/// `"SnAp"` read as a little-endian u32.
pub const SNAP_MAGIC: u32 = 0x7041_6e53;
pub const SNAP_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;
pub const EXCEPTION_SIZE: usize = 16;
const SECTOR_SIZE: u64 = 512;
/// Largest chunk size LVM will create a snapshot with (512 KiB).
pub const MAX_CHUNK_SECTORS: u32 = 1024;

/// Header at the start of a COW store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowHeader {
    pub magic: u32,
    pub valid: u32,
    pub version: u32,
    pub chunk_size_sectors: u32,
}

impl CowHeader {
    pub fn new(chunk_size_sectors: u32) -> Self {
        Self { magic: SNAP_MAGIC, valid: 1, version: SNAP_VERSION, chunk_size_sectors }
    }

    /// Parse the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: le_u32(&buf[0..4]),
            valid: le_u32(&buf[4..8]),
            version: le_u32(&buf[8..12]),
            chunk_size_sectors: le_u32(&buf[12..16]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.valid.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.chunk_size_sectors.to_le_bytes());
        out
    }

    /// Check the header against a store of `device_size` bytes; returns the
    /// layout on success.
    ///
    /// The chunk size must be a power of two no larger than
    /// [`MAX_CHUNK_SECTORS`], and the header chunk must fit on the device.
    pub fn validate(&self, device_size: u64) -> Result<CowLayout, String> {
        if self.magic != SNAP_MAGIC {
            return Err(format!("bad magic {:#010x}, expected {:#010x}", self.magic, SNAP_MAGIC));
        }
        if self.version != SNAP_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        let sectors = self.chunk_size_sectors;
        if sectors == 0 {
            return Err("chunk size is zero".to_string());
        }
        if !sectors.is_power_of_two() || sectors > MAX_CHUNK_SECTORS {
            return Err(format!("invalid chunk size of {} sectors", sectors));
        }
        let chunk_size = sectors as u64 * SECTOR_SIZE;
        if chunk_size > device_size {
            return Err(format!(
                "chunk size {} exceeds device size {}",
                chunk_size, device_size
            ));
        }
        Ok(CowLayout::new(chunk_size))
    }
}

/// One origin-chunk to COW-chunk mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Exception {
    pub old_chunk: u64,
    pub new_chunk: u64,
}

impl Exception {
    pub fn parse(buf: &[u8]) -> Self {
        Self { old_chunk: le_u64(&buf[0..8]), new_chunk: le_u64(&buf[8..16]) }
    }

    pub fn to_bytes(&self) -> [u8; EXCEPTION_SIZE] {
        let mut out = [0u8; EXCEPTION_SIZE];
        out[0..8].copy_from_slice(&self.old_chunk.to_le_bytes());
        out[8..16].copy_from_slice(&self.new_chunk.to_le_bytes());
        out
    }

    /// A zero `new_chunk` marks the end of the populated exceptions.
    pub fn is_terminator(&self) -> bool {
        self.new_chunk == 0
    }
}

/// Parse the records of one metadata store.
///
/// Returns the populated exceptions and whether a terminator was seen.
pub fn parse_store(buf: &[u8]) -> (Vec<Exception>, bool) {
    let mut exceptions = Vec::new();
    for record in buf.chunks_exact(EXCEPTION_SIZE) {
        let exception = Exception::parse(record);
        if exception.is_terminator() {
            return (exceptions, true);
        }
        exceptions.push(exception);
    }
    (exceptions, false)
}

/// Offsets inside a COW store with a given chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CowLayout {
    pub chunk_size: u64,
}

impl CowLayout {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    pub fn exceptions_per_store(&self) -> u64 {
        self.chunk_size / EXCEPTION_SIZE as u64
    }

    /// Byte offset of metadata store `index`, or `None` past `u64::MAX`.
    pub fn store_offset(&self, index: u64) -> Option<u64> {
        index
            .checked_mul(self.exceptions_per_store() + 1)
            .and_then(|chunks| chunks.checked_add(1))
            .and_then(|chunks| chunks.checked_mul(self.chunk_size))
    }

    /// Byte offset of COW chunk `chunk`, or `None` past `u64::MAX`.
    pub fn chunk_offset(&self, chunk: u64) -> Option<u64> {
        chunk.checked_mul(self.chunk_size)
    }

    /// Whether the chunk starting at `offset` lies entirely within `size`.
    pub fn chunk_fits(&self, offset: u64, size: u64) -> bool {
        offset.checked_add(self.chunk_size).map_or(false, |end| end <= size)
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[..8]);
    u64::from_le_bytes(bytes)
}
