//! Secure erasure of volumes and snapshot COW stores.
//!
//! Removing a logical volume does not erase its extents, so tenant data has to
//! be overwritten before LVM hands the space to someone else:
//!
//! - [`Scrubber::scrub_volume`] overwrites a whole device, used when deleting
//!   plain volumes.
//! - [`Scrubber::scrub_cow`] walks the exception table of a snapshot's COW
//!   store and overwrites the header, every metadata store and every data
//!   chunk holding copied-out origin data.
//!
//! Both block; callers run them on the blocking pool.

use crate::blockdev::{self, AlignedBuf, Throttle, SECTOR_SIZE};
use crate::config::ScrubConfig;
use crate::error::{Result, StorageError};
use crate::observability::metrics;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub mod cow;

pub use cow::{CowHeader, CowLayout, Exception};

/// Whether a COW walk overwrites what it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubMode {
    Scrub,
    /// Walk the store without writing, for inspection.
    Display,
}

/// Result of a COW walk.
#[derive(Debug, Clone, Serialize)]
pub struct CowScrubReport {
    pub device: PathBuf,
    pub layout: CowLayout,
    pub metadata_stores: u64,
    pub exceptions: Vec<Exception>,
    pub bytes_written: u64,
}

impl CowScrubReport {
    pub fn exception_count(&self) -> u64 {
        self.exceptions.len() as u64
    }
}

/// Overwrites devices according to a [`ScrubConfig`].
#[derive(Debug, Clone)]
pub struct Scrubber {
    config: ScrubConfig,
}

impl Scrubber {
    pub fn new(config: ScrubConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScrubConfig {
        &self.config
    }

    /// Overwrite every byte of `device` with `fill`.
    #[instrument(skip(self), fields(device = %device.display()))]
    pub fn scrub_volume(&self, device: &Path, fill: u8) -> Result<u64> {
        let mut file = blockdev::open_device(device, true, self.config.direct_io)?;
        let size = blockdev::device_size(&mut file, device)?;
        if self.config.direct_io && size % SECTOR_SIZE as u64 != 0 {
            return Err(StorageError::Scrub {
                device: device.to_path_buf(),
                reason: format!("size {} is not sector aligned", size),
            });
        }

        info!(size, fill, throttle = ?self.config.throttle_bytes_per_sec, "Scrubbing volume");
        let buf = AlignedBuf::filled(self.config.chunk_size, fill);
        let mut throttle = Throttle::new(self.config.throttle_bytes_per_sec);
        let mut offset = 0u64;
        while offset < size {
            let n = (size - offset).min(buf.len() as u64) as usize;
            blockdev::write_at(&file, device, &buf.as_slice()[..n], offset)?;
            offset += n as u64;
            throttle.consume(n as u64);
        }
        file.sync_all().map_err(|e| StorageError::io(device, e))?;

        metrics::record_scrub("volume", offset, 0);
        info!(bytes = offset, "Volume scrubbed");
        Ok(offset)
    }

    /// Walk the COW store on `device`, overwriting it with zeros unless
    /// `mode` is [`ScrubMode::Display`].
    ///
    /// The header chunk and every metadata store are zeroed after being read;
    /// each populated exception's data chunk is zeroed as it is found. The
    /// walk ends at the first record whose new chunk is zero, since stores are
    /// filled densely from index 0.
    #[instrument(skip(self), fields(device = %device.display()))]
    pub fn scrub_cow(&self, device: &Path, mode: ScrubMode) -> Result<CowScrubReport> {
        let scrub = mode == ScrubMode::Scrub;
        let mut file = blockdev::open_device(device, scrub, self.config.direct_io)?;
        let size = blockdev::device_size(&mut file, device)?;
        let fail = |reason: String| StorageError::Scrub { device: device.to_path_buf(), reason };

        let mut sector = AlignedBuf::zeroed(SECTOR_SIZE);
        if size < SECTOR_SIZE as u64 {
            return Err(fail(format!("device too small for a COW header ({} bytes)", size)));
        }
        blockdev::read_at(&file, device, sector.as_mut_slice(), 0)?;
        let header = CowHeader::parse(sector.as_slice())
            .ok_or_else(|| fail("short header".to_string()))?;
        // Bounds the chunk size before anything is allocated or written.
        let layout = header.validate(size).map_err(fail)?;
        let chunk_size = layout.chunk_size as usize;
        debug!(chunk_size, valid = header.valid, "Read COW header");

        let zeros = AlignedBuf::zeroed(chunk_size);
        let mut bytes_written = 0u64;
        if scrub {
            // The whole header chunk, padding included.
            blockdev::write_at(&file, device, zeros.as_slice(), 0)?;
            bytes_written += chunk_size as u64;
        }

        let mut store = AlignedBuf::zeroed(chunk_size);
        let mut exceptions = Vec::new();
        let mut metadata_stores = 0u64;
        loop {
            let offset = match layout.store_offset(metadata_stores) {
                Some(offset) if layout.chunk_fits(offset, size) => offset,
                _ => break,
            };
            blockdev::read_at(&file, device, store.as_mut_slice(), offset)?;
            if scrub {
                blockdev::write_at(&file, device, zeros.as_slice(), offset)?;
                bytes_written += layout.chunk_size;
            }
            metadata_stores += 1;

            let (found, terminated) = cow::parse_store(store.as_slice());
            for exception in found {
                let data_offset = match layout.chunk_offset(exception.new_chunk) {
                    Some(offset) if layout.chunk_fits(offset, size) => offset,
                    _ => {
                        return Err(fail(format!(
                            "exception {:?} points past the end of the device",
                            exception
                        )))
                    }
                };
                if scrub {
                    blockdev::write_at(&file, device, zeros.as_slice(), data_offset)?;
                    bytes_written += layout.chunk_size;
                }
                exceptions.push(exception);
            }
            if terminated {
                break;
            }
        }

        if scrub {
            file.sync_all().map_err(|e| StorageError::io(device, e))?;
            metrics::record_scrub("cow", bytes_written, exceptions.len() as u64);
        }
        info!(
            exceptions = exceptions.len(),
            metadata_stores,
            bytes_written,
            mode = ?mode,
            "COW walk complete"
        );

        Ok(CowScrubReport {
            device: device.to_path_buf(),
            layout,
            metadata_stores,
            exceptions,
            bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const MARKER: u8 = 0xa5;
    const CHUNK_SECTORS: u32 = 1; // 512-byte chunks, 32 exceptions per store

    fn scrubber() -> Scrubber {
        Scrubber::new(ScrubConfig {
            direct_io: false,
            chunk_size: 4096,
            throttle_bytes_per_sec: None,
        })
    }

    /// Build a COW image: header, then `stores` metadata stores each mapping
    /// `per_store[i]` exceptions onto the data chunks that follow it. Every
    /// byte not holding a header or record is the marker.
    fn cow_image(per_store: &[u64]) -> (Vec<u8>, Vec<u64>) {
        let layout = CowLayout::new(CHUNK_SECTORS as u64 * 512);
        let chunk = layout.chunk_size as usize;
        let epc = layout.exceptions_per_store();
        let total_chunks = 1 + per_store.len() as u64 * (epc + 1);
        let mut image = vec![MARKER; total_chunks as usize * chunk];
        image[..16].copy_from_slice(&CowHeader::new(CHUNK_SECTORS).to_bytes());

        let mut data_chunks = Vec::new();
        let mut old_chunk = 100;
        for (i, count) in per_store.iter().enumerate() {
            let store_offset = layout.store_offset(i as u64).unwrap() as usize;
            let first_data = store_offset / chunk + 1;
            for j in 0..*count as usize {
                let new_chunk = (first_data + j) as u64;
                let record = Exception { old_chunk, new_chunk }.to_bytes();
                image[store_offset + j * 16..store_offset + (j + 1) * 16].copy_from_slice(&record);
                data_chunks.push(new_chunk);
                old_chunk += 1;
            }
            if (*count) < epc {
                let end = store_offset + *count as usize * 16;
                image[end..end + 16].fill(0);
            }
        }
        (image, data_chunks)
    }

    fn write_device(dir: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("cow");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_scrub_cow_removes_every_marker() {
        let dir = TempDir::new().unwrap();
        // Store 0 completely full, store 1 partially populated.
        let (image, data_chunks) = cow_image(&[32, 5]);
        let device = write_device(&dir, &image);

        let report = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap();
        assert_eq!(report.exception_count(), 37);
        assert_eq!(report.metadata_stores, 2);
        assert_eq!(
            report.exceptions.iter().map(|e| e.new_chunk).collect::<Vec<_>>(),
            data_chunks
        );

        // Only the unreferenced tail of the last area may keep its marker.
        let after = std::fs::read(&device).unwrap();
        let layout = CowLayout::new(512);
        let referenced_end = (layout.store_offset(1).unwrap() + 6 * 512) as usize;
        assert!(after[..referenced_end].iter().all(|b| *b == 0), "marker left behind");
    }

    #[test]
    fn test_scrub_cow_covers_every_populated_chunk() {
        let dir = TempDir::new().unwrap();
        let (image, _) = cow_image(&[32, 32, 32]);
        // Add one more, empty, metadata store so the walk finds its terminator.
        let mut image = image;
        image.extend(std::iter::repeat(0u8).take(512));
        let device = write_device(&dir, &image);

        let report = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap();
        assert_eq!(report.exception_count(), 96);
        assert_eq!(report.metadata_stores, 4);
        assert!(std::fs::read(&device).unwrap().iter().all(|b| *b != MARKER));
    }

    #[test]
    fn test_display_mode_does_not_write() {
        let dir = TempDir::new().unwrap();
        let (image, _) = cow_image(&[3]);
        let device = write_device(&dir, &image);

        let report = scrubber().scrub_cow(&device, ScrubMode::Display).unwrap();
        assert_eq!(report.exception_count(), 3);
        assert_eq!(report.bytes_written, 0);
        assert_eq!(std::fs::read(&device).unwrap(), image);
    }

    #[test]
    fn test_scrub_cow_rejects_bad_header() {
        let dir = TempDir::new().unwrap();
        let device = write_device(&dir, &vec![MARKER; 4096]);
        let err = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap_err();
        assert!(matches!(err, StorageError::Scrub { .. }));
        // Nothing was overwritten.
        assert!(std::fs::read(&device).unwrap().iter().all(|b| *b == MARKER));
    }

    #[test]
    fn test_scrub_cow_rejects_out_of_range_exception() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![0u8; 4 * 512];
        image[..16].copy_from_slice(&CowHeader::new(1).to_bytes());
        image[512..528].copy_from_slice(&Exception { old_chunk: 1, new_chunk: 99 }.to_bytes());
        let device = write_device(&dir, &image);

        let err = scrubber().scrub_cow(&device, ScrubMode::Display).unwrap_err();
        assert!(matches!(err, StorageError::Scrub { .. }));
    }

    #[test]
    fn test_scrub_cow_rejects_chunk_larger_than_device() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![MARKER; 2048];
        // 64 MiB chunks on a 2 KiB store.
        image[..16].copy_from_slice(&CowHeader::new(128 * 1024).to_bytes());
        let device = write_device(&dir, &image);

        let err = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap_err();
        assert!(matches!(err, StorageError::Scrub { .. }), "{:?}", err);
        let after = std::fs::read(&device).unwrap();
        assert_eq!(after.len(), 2048);
        assert_eq!(after, image);
    }

    #[test]
    fn test_scrub_cow_rejects_oversized_chunk() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![MARKER; 4096];
        image[..16].copy_from_slice(&CowHeader::new(u32::MAX).to_bytes());
        let device = write_device(&dir, &image);

        let err = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap_err();
        assert!(matches!(err, StorageError::Scrub { .. }), "{:?}", err);
        assert_eq!(std::fs::read(&device).unwrap(), image);
    }

    #[test]
    fn test_scrub_cow_rejects_overflowing_exception() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![0u8; 4 * 512];
        image[..16].copy_from_slice(&CowHeader::new(1).to_bytes());
        let record = Exception { old_chunk: 1, new_chunk: u64::MAX / 2 }.to_bytes();
        image[512..528].copy_from_slice(&record);
        let device = write_device(&dir, &image);

        let err = scrubber().scrub_cow(&device, ScrubMode::Scrub).unwrap_err();
        assert!(matches!(err, StorageError::Scrub { .. }), "{:?}", err);
    }

    #[test]
    fn test_scrub_volume_fills_device() {
        let dir = TempDir::new().unwrap();
        // Not a multiple of the scrub chunk size.
        let device = write_device(&dir, &vec![MARKER; 4096 * 3 + 512]);

        let written = scrubber().scrub_volume(&device, 0x00).unwrap();
        assert_eq!(written, 4096 * 3 + 512);
        assert!(std::fs::read(&device).unwrap().iter().all(|b| *b == 0));

        scrubber().scrub_volume(&device, 0xff).unwrap();
        assert!(std::fs::read(&device).unwrap().iter().all(|b| *b == 0xff));
    }
}
