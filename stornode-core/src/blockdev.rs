//! Raw block device I/O.
//!
//! Helpers shared by scrubbing and the copy jobs: opening devices with
//! optional `O_DIRECT`, sector-aligned buffers, throughput throttling and a
//! cancellable whole-device copy. All functions here block; async callers run
//! them through `tokio::task::spawn_blocking`.

use crate::error::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Alignment required for `O_DIRECT` buffers, offsets and lengths.
pub const SECTOR_SIZE: usize = 512;
const BUFFER_ALIGN: usize = 4096;

/// Heap buffer whose usable region starts on a page boundary.
pub struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        let raw = vec![0u8; len + BUFFER_ALIGN];
        let offset = raw.as_ptr().align_offset(BUFFER_ALIGN);
        Self { raw, offset, len }
    }

    pub fn filled(len: usize, byte: u8) -> Self {
        let mut buf = Self::zeroed(len);
        buf.as_mut_slice().fill(byte);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

/// Open a device for reading, or reading and writing.
pub fn open_device(path: &Path, write: bool, direct_io: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(write);
    if direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path).map_err(|e| StorageError::io(path, e))
}

/// Size of a block device or regular file in bytes.
pub fn device_size(file: &mut File, path: &Path) -> Result<u64> {
    let size = file.seek(SeekFrom::End(0)).map_err(|e| StorageError::io(path, e))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| StorageError::io(path, e))?;
    Ok(size)
}

pub fn read_at(file: &File, path: &Path, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset).map_err(|e| StorageError::io(path, e))
}

pub fn write_at(file: &File, path: &Path, buf: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(buf, offset).map_err(|e| StorageError::io(path, e))
}

/// Caps throughput by sleeping whenever progress runs ahead of the allowed rate.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: Option<u64>,
    started: Instant,
    done: u64,
}

impl Throttle {
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        Self { bytes_per_sec: bytes_per_sec.filter(|r| *r > 0), started: Instant::now(), done: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Account for `bytes` just transferred, sleeping if over budget.
    pub fn consume(&mut self, bytes: u64) {
        self.done += bytes;
        if let Some(delay) = self.pending_delay(self.started.elapsed()) {
            std::thread::sleep(delay);
        }
    }

    /// How far ahead of the allowed rate `done` bytes are after `elapsed`.
    fn pending_delay(&self, elapsed: Duration) -> Option<Duration> {
        let rate = self.bytes_per_sec?;
        let allowed = Duration::from_secs_f64(self.done as f64 / rate as f64);
        allowed.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Copy `len` bytes from the start of `src` to the start of `dst` in blocks
/// of `block_size`, stopping early with `Cancelled` if `cancel` fires.
pub fn copy_device(
    src: &Path,
    dst: &Path,
    len: u64,
    block_size: usize,
    cancel: &CancellationToken,
    throttle: &mut Throttle,
) -> Result<u64> {
    let input = open_device(src, false, false)?;
    let output = open_device(dst, true, false)?;
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    while offset < len {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled { resource: dst.display().to_string() });
        }
        let n = block_size.min((len - offset) as usize);
        read_at(&input, src, &mut buf[..n], offset)?;
        write_at(&output, dst, &buf[..n], offset)?;
        offset += n as u64;
        throttle.consume(n as u64);
    }

    output.sync_all().map_err(|e| StorageError::io(dst, e))?;
    Ok(offset)
}
