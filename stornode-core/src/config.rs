//! Configuration management.

use crate::error::{Result, StorageError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for the storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LVM volume group owning every volume on this node.
    pub volume_group: String,
    /// Root of the resource lock files.
    pub run_dir: PathBuf,
    /// Directory holding `<vg>/<lv>` device nodes.
    pub device_prefix: PathBuf,
    pub max_concurrent_jobs: usize,
    pub log_level: String,
    pub metrics_port: Option<u16>,
    /// Base URL of the control plane status API. Status reports are only
    /// logged when unset.
    pub control_plane_url: Option<String>,
    /// Block size used when copying whole devices (restore, clone, image import).
    pub copy_block_size: usize,
    pub qemu_img: String,
    pub scrub: ScrubConfig,
    pub iscsi: IscsiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volume_group: "stornode-volume".to_string(),
            run_dir: paths::run_dir(),
            device_prefix: PathBuf::from("/dev"),
            max_concurrent_jobs: 4,
            log_level: "info".to_string(),
            metrics_port: None,
            control_plane_url: None,
            copy_block_size: 4 * 1024 * 1024, // 4 MiB
            qemu_img: "qemu-img".to_string(),
            scrub: ScrubConfig::default(),
            iscsi: IscsiConfig::default(),
        }
    }
}

/// Settings for secure erasure of volumes and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    /// Open devices with `O_DIRECT` so writes bypass the page cache.
    pub direct_io: bool,
    /// Size of each write during a whole-device scrub. Must be a multiple of 512.
    pub chunk_size: usize,
    /// Upper bound on scrub throughput; unlimited when unset.
    pub throttle_bytes_per_sec: Option<u64>,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self { direct_io: true, chunk_size: 4 * 1024 * 1024, throttle_bytes_per_sec: None }
    }
}

/// Settings for the outbound iSCSI initiator used by clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiConfig {
    pub iscsiadm: String,
    /// Where udev publishes `ip-<addr>:<port>-iscsi-<iqn>-lun-<n>` links.
    pub by_path_dir: PathBuf,
    pub login_timeout_secs: u64,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            iscsiadm: "iscsiadm".to_string(),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            login_timeout_secs: 30,
        }
    }
}

impl IscsiConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(paths::config_path())
    }

    /// Load configuration from disk. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StorageError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            StorageError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            StorageError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content).map_err(|e| StorageError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume_group.is_empty() {
            return Err(StorageError::InvalidConfig {
                reason: "volume_group must not be empty".to_string(),
            });
        }
        if self.max_concurrent_jobs == 0 {
            return Err(StorageError::InvalidConfig {
                reason: "max_concurrent_jobs must be at least 1".to_string(),
            });
        }
        if self.scrub.chunk_size == 0 || self.scrub.chunk_size % 512 != 0 {
            return Err(StorageError::InvalidConfig {
                reason: format!(
                    "scrub.chunk_size must be a non-zero multiple of 512, got {}",
                    self.scrub.chunk_size
                ),
            });
        }
        if self.copy_block_size == 0 {
            return Err(StorageError::InvalidConfig {
                reason: "copy_block_size must not be zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.volume_group, "stornode-volume");
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.scrub.direct_io);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"volume_group": "vg0", "scrub": {"direct_io": false}}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.volume_group, "vg0");
        assert!(!config.scrub.direct_io);
        assert_eq!(config.scrub.chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.metrics_port = Some(9100);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.metrics_port, Some(9100));
    }

    #[test]
    fn test_validate_rejects_unaligned_chunk() {
        let mut config = Config::default();
        config.scrub.chunk_size = 1000;
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig { .. })));
    }
}
