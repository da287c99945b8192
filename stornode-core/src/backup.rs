//! Backup store collaborator.
//!
//! Backups are read from a snapshot and written back into a fresh restore
//! target. Where the bytes live is up to the store; [`DirectoryBackupStore`]
//! keeps one image file per backup under a local or mounted directory.

use crate::blockdev::{self, Throttle};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Save the contents of `device` as `backup_id` of `volume_id`. Returns
    /// the number of bytes stored.
    async fn save(
        &self,
        volume_id: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64>;

    /// Write backup `backup_id` of `source_volume_id` onto `device`.
    async fn restore(
        &self,
        source_volume_id: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64>;
}

/// Stores each backup as `<root>/<volume_id>/<backup_id>.img`.
#[derive(Debug, Clone)]
pub struct DirectoryBackupStore {
    root: PathBuf,
    block_size: usize,
}

impl DirectoryBackupStore {
    pub fn new(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self { root: root.into(), block_size }
    }

    pub fn image_path(&self, volume_id: &str, backup_id: &str) -> PathBuf {
        self.root.join(volume_id).join(format!("{}.img", backup_id))
    }
}

#[async_trait]
impl BackupStore for DirectoryBackupStore {
    #[instrument(skip(self, device, cancel), fields(device = %device.display()))]
    async fn save(
        &self,
        volume_id: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let image = self.image_path(volume_id, backup_id);
        let device = device.to_path_buf();
        let block_size = self.block_size;

        let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut src = blockdev::open_device(&device, false, false)?;
            let len = blockdev::device_size(&mut src, &device)?;
            if let Some(parent) = image.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
            let dst = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&image)
                .map_err(|e| StorageError::io(&image, e))?;
            dst.set_len(len).map_err(|e| StorageError::io(&image, e))?;
            drop(dst);
            let mut throttle = Throttle::unlimited();
            blockdev::copy_device(&device, &image, len, block_size, &cancel, &mut throttle)
        })
        .await
        .map_err(StorageError::internal)??;

        info!(bytes, "Backup saved");
        Ok(bytes)
    }

    #[instrument(skip(self, device, cancel), fields(device = %device.display()))]
    async fn restore(
        &self,
        source_volume_id: &str,
        backup_id: &str,
        device: &Path,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let image = self.image_path(source_volume_id, backup_id);
        if !image.exists() {
            return Err(StorageError::NotFound {
                kind: "Backup",
                id: format!("{}/{}", source_volume_id, backup_id),
            });
        }
        let device = device.to_path_buf();
        let block_size = self.block_size;

        let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut src = blockdev::open_device(&image, false, false)?;
            let len = blockdev::device_size(&mut src, &image)?;
            let mut dst = blockdev::open_device(&device, false, false)?;
            let capacity = blockdev::device_size(&mut dst, &device)?;
            if capacity < len {
                return Err(StorageError::ServiceUnavailable {
                    reason: format!(
                        "backup is {} bytes but {} holds only {}",
                        len,
                        device.display(),
                        capacity
                    ),
                });
            }
            let mut throttle = Throttle::unlimited();
            blockdev::copy_device(&image, &device, len, block_size, &cancel, &mut throttle)
        })
        .await
        .map_err(StorageError::internal)??;

        info!(bytes, "Backup restored");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_restore() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryBackupStore::new(dir.path().join("backups"), 1024);
        let source = dir.path().join("snap");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let saved = store.save("v1", "b1", &source, CancellationToken::new()).await.unwrap();
        assert_eq!(saved, 5000);
        assert_eq!(std::fs::read(store.image_path("v1", "b1")).unwrap(), data);

        let target = dir.path().join("r1");
        std::fs::write(&target, vec![0xffu8; 8192]).unwrap();
        store.restore("v1", "b1", &target, CancellationToken::new()).await.unwrap();
        let restored = std::fs::read(&target).unwrap();
        assert_eq!(&restored[..5000], &data[..]);
        assert!(restored[5000..].iter().all(|b| *b == 0xff));
    }

    #[tokio::test]
    async fn test_restore_missing_backup() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryBackupStore::new(dir.path(), 1024);
        let target = dir.path().join("r1");
        std::fs::write(&target, vec![0u8; 512]).unwrap();
        let err = store.restore("v1", "nope", &target, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_restore_into_small_volume() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryBackupStore::new(dir.path().join("backups"), 1024);
        let source = dir.path().join("snap");
        std::fs::write(&source, vec![1u8; 4096]).unwrap();
        store.save("v1", "b1", &source, CancellationToken::new()).await.unwrap();

        let target = dir.path().join("r1");
        std::fs::write(&target, vec![0u8; 1024]).unwrap();
        let err = store.restore("v1", "b1", &target, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::ServiceUnavailable { .. }));
    }
}
