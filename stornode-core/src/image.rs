//! Image repository collaborator and format conversion.

use crate::error::{Result, StorageError};
use crate::exec::CommandRunner;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Disk formats that can be imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Vmdk,
    Vdi,
    Vhd,
}

impl DiskFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "qcow2" => Some(Self::Qcow2),
            "vmdk" => Some(Self::Vmdk),
            "vdi" => Some(Self::Vdi),
            // qemu-img calls it vpc.
            "vhd" | "vpc" => Some(Self::Vhd),
            _ => None,
        }
    }

    /// Name understood by `qemu-img -f`.
    pub fn qemu_name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
            Self::Vhd => "vpc",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qemu_name())
    }
}

/// Image metadata as published by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    /// Size of the image file in bytes.
    pub size: u64,
    pub disk_format: String,
    pub status: String,
}

impl ImageInfo {
    /// Check that the image can be imported into a volume of `volume_size`
    /// bytes and return its format.
    pub fn validate_for(&self, volume_size: u64) -> Result<DiskFormat> {
        let invalid =
            |reason: String| StorageError::InvalidImage { image_id: self.id.clone(), reason };
        if self.status != "active" {
            return Err(invalid(format!("image status is '{}', not 'active'", self.status)));
        }
        let format = DiskFormat::parse(&self.disk_format)
            .ok_or_else(|| invalid(format!("unsupported disk format '{}'", self.disk_format)))?;
        if self.size > volume_size {
            return Err(invalid(format!(
                "image is {} bytes, larger than the {} byte volume",
                self.size, volume_size
            )));
        }
        Ok(format)
    }
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn describe(&self, image_id: &str) -> Result<ImageInfo>;

    /// Download the image file onto `dest`, which already exists. Returns the
    /// number of bytes written.
    async fn fetch(&self, image_id: &str, dest: &Path, cancel: CancellationToken) -> Result<u64>;
}

/// Image service reached over HTTP: `GET {base}/images/{id}` for metadata and
/// `GET {base}/images/{id}/file` for content.
#[derive(Debug, Clone)]
pub struct HttpImageRepository {
    client: Client,
    base_url: String,
}

impl HttpImageRepository {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::InvalidConfig {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await.map_err(|e| {
            StorageError::ServiceUnavailable { reason: format!("image service unreachable: {}", e) }
        })?;
        match response.status() {
            s if s.is_success() => Ok(response),
            reqwest::StatusCode::NOT_FOUND => {
                Err(StorageError::NotFound { kind: "Image", id: url.to_string() })
            }
            s => Err(StorageError::ServiceUnavailable {
                reason: format!("image service returned {} for {}", s, url),
            }),
        }
    }
}

#[async_trait]
impl ImageRepository for HttpImageRepository {
    async fn describe(&self, image_id: &str) -> Result<ImageInfo> {
        let url = format!("{}/images/{}", self.base_url, image_id);
        self.get(&url).await?.json().await.map_err(|e| StorageError::InvalidImage {
            image_id: image_id.to_string(),
            reason: format!("unreadable metadata: {}", e),
        })
    }

    #[instrument(skip(self, dest, cancel), fields(dest = %dest.display()))]
    async fn fetch(&self, image_id: &str, dest: &Path, cancel: CancellationToken) -> Result<u64> {
        let url = format!("{}/images/{}/file", self.base_url, image_id);
        let mut response = self.get(&url).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(dest)
            .await
            .map_err(|e| StorageError::io(dest, e))?;

        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StorageError::Cancelled { resource: dest.display().to_string() });
                }
                chunk = response.chunk() => chunk.map_err(|e| StorageError::ServiceUnavailable {
                    reason: format!("image download interrupted: {}", e),
                })?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await.map_err(|e| StorageError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(|e| StorageError::io(dest, e))?;
        info!(bytes = written, "Image downloaded");
        Ok(written)
    }
}

/// Convert `src` in `format` into a raw stream written onto the existing
/// device `dst`.
#[instrument(skip(runner), fields(src = %src.display(), dst = %dst.display()))]
pub async fn convert_to_raw(
    runner: &dyn CommandRunner,
    qemu_img: &str,
    format: DiskFormat,
    src: &Path,
    dst: &Path,
) -> Result<()> {
    let src = src.display().to_string();
    let dst = dst.display().to_string();
    // -n: the target device already exists.
    runner
        .run(qemu_img, &["convert", "-n", "-f", format.qemu_name(), "-O", "raw", &src, &dst])
        .await?;
    info!(format = %format, "Image converted to raw");
    Ok(())
}
