//! LVM volume group access.
//!
//! Thin wrapper over `lvs`, `vgs`, `lvcreate`, `lvchange` and `lvremove`. Every
//! logical volume carries exactly one tag: its encoded [`VolumeRole`].

use crate::error::{Result, StorageError};
use crate::exec::CommandRunner;
use crate::paths;
use crate::tag::VolumeRole;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

const LVS_COLUMNS: &str = "lv_name,lv_size,origin,lv_tags,lv_kernel_major,lv_kernel_minor";

/// A logical volume as reported by LVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub id: String,
    pub size: u64,
    pub path: PathBuf,
    /// Id of the volume this one snapshots, if any.
    pub origin: Option<String>,
    /// Raw tag as stored by LVM.
    pub tag: String,
    pub role: VolumeRole,
    /// `major:minor`, only known while the volume is active.
    pub device_number: Option<String>,
}

impl LogicalVolume {
    pub fn is_snapshot(&self) -> bool {
        self.origin.is_some()
    }
}

/// Size and free space of the volume group, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub size: u64,
    pub free: u64,
}

/// Logical volumes of one LVM volume group.
#[derive(Clone)]
pub struct VolumeGroup {
    name: String,
    device_prefix: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl VolumeGroup {
    pub fn new(
        name: impl Into<String>,
        device_prefix: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self { name: name.into(), device_prefix: device_prefix.into(), runner }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Device node of a volume.
    pub fn device_path(&self, id: &str) -> PathBuf {
        paths::lv_device(&self.device_prefix, &self.name, id)
    }

    /// Device-mapper name of a volume.
    pub fn dm_name(&self, id: &str) -> String {
        paths::dm_name(&self.name, id)
    }

    /// Node under `<prefix>/mapper` for a raw device-mapper name.
    pub fn mapper_path(&self, dm_name: &str) -> PathBuf {
        self.device_prefix.join("mapper").join(dm_name)
    }

    fn lv_ref(&self, id: &str) -> String {
        format!("{}/{}", self.name, id)
    }

    /// List all logical volumes in the group.
    #[instrument(skip(self), fields(vg = %self.name))]
    pub async fn list(&self) -> Result<Vec<LogicalVolume>> {
        let out = self
            .runner
            .run(
                "lvs",
                &[
                    "--noheadings",
                    "--units",
                    "b",
                    "--nosuffix",
                    "--separator",
                    ":",
                    "-o",
                    LVS_COLUMNS,
                    &self.name,
                ],
            )
            .await?;
        out.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| self.parse_lvs_line(line))
            .collect()
    }

    /// Look up one logical volume.
    pub async fn get(&self, id: &str) -> Result<LogicalVolume> {
        self.list()
            .await?
            .into_iter()
            .find(|lv| lv.id == id)
            .ok_or_else(|| StorageError::volume_not_found(id))
    }

    /// The live snapshot of `origin`, if one exists.
    pub async fn snapshot_of(&self, origin: &str) -> Result<Option<LogicalVolume>> {
        Ok(self.list().await?.into_iter().find(|lv| lv.origin.as_deref() == Some(origin)))
    }

    /// Size and free space of the group.
    pub async fn capacity(&self) -> Result<Capacity> {
        let out = self
            .runner
            .run(
                "vgs",
                &[
                    "--noheadings",
                    "--units",
                    "b",
                    "--nosuffix",
                    "--separator",
                    ":",
                    "-o",
                    "vg_size,vg_free",
                    &self.name,
                ],
            )
            .await?;
        let line = out.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
        let mut fields = line.split(':');
        let mut next = |field: &str| -> Result<u64> {
            fields.next().and_then(|v| v.trim().parse().ok()).ok_or_else(|| {
                StorageError::Internal(format!("Unparseable {} in vgs output: '{}'", field, line))
            })
        };
        Ok(Capacity { size: next("vg_size")?, free: next("vg_free")? })
    }

    /// Allocate a new volume tagged with `role`.
    #[instrument(skip(self), fields(vg = %self.name))]
    pub async fn create(&self, id: &str, size: u64, role: &VolumeRole) -> Result<LogicalVolume> {
        self.ensure_free(size).await?;
        let size_arg = format!("{}b", size);
        let tag = role.encode();
        self.runner
            .run("lvcreate", &["-L", &size_arg, "-n", id, "--addtag", &tag, &self.name])
            .await
            .map_err(map_capacity_error)?;
        info!(volume_id = %id, size, tag = %tag, "Created logical volume");
        self.get(id).await
    }

    /// Allocate a copy-on-write snapshot of `origin` tagged with `role`.
    #[instrument(skip(self), fields(vg = %self.name))]
    pub async fn create_snapshot(
        &self,
        origin: &str,
        id: &str,
        size: u64,
        role: &VolumeRole,
    ) -> Result<LogicalVolume> {
        self.ensure_free(size).await?;
        let size_arg = format!("{}b", size);
        let tag = role.encode();
        let origin_ref = self.lv_ref(origin);
        self.runner
            .run("lvcreate", &["-L", &size_arg, "-s", "-n", id, "--addtag", &tag, &origin_ref])
            .await
            .map_err(map_capacity_error)?;
        info!(origin = %origin, snapshot_id = %id, tag = %tag, "Created snapshot");
        self.get(id).await
    }

    /// Replace the role tag of a volume.
    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    pub async fn set_role(&self, volume: &LogicalVolume, role: &VolumeRole) -> Result<()> {
        let new_tag = role.encode();
        let lv = self.lv_ref(&volume.id);
        if volume.tag.is_empty() {
            self.runner.run("lvchange", &["--addtag", &new_tag, &lv]).await?;
        } else {
            self.runner
                .run("lvchange", &["--deltag", &volume.tag, "--addtag", &new_tag, &lv])
                .await?;
        }
        info!(from = %volume.tag, to = %new_tag, "Rewrote volume tag");
        Ok(())
    }

    /// Remove a volume from LVM. Its data must already be scrubbed.
    #[instrument(skip(self), fields(vg = %self.name))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let lv = self.lv_ref(id);
        self.runner.run("lvremove", &["-f", &lv]).await?;
        info!(volume_id = %id, "Removed logical volume");
        Ok(())
    }

    async fn ensure_free(&self, size: u64) -> Result<()> {
        let capacity = self.capacity().await?;
        if capacity.free < size {
            return Err(StorageError::ServiceUnavailable {
                reason: format!(
                    "volume group {} has {} bytes free, {} requested",
                    self.name, capacity.free, size
                ),
            });
        }
        Ok(())
    }

    fn parse_lvs_line(&self, line: &str) -> Result<LogicalVolume> {
        let fields: Vec<&str> = line.split(':').map(str::trim).collect();
        if fields.len() < 6 {
            return Err(StorageError::Internal(format!("Unparseable lvs output: '{}'", line)));
        }
        let id = fields[0].to_string();
        let size = fields[1]
            .parse()
            .map_err(|_| StorageError::Internal(format!("Bad lv_size in '{}'", line)))?;
        let origin = Some(fields[2]).filter(|o| !o.is_empty()).map(str::to_string);
        // Volumes are expected to carry a single tag; any extras are ignored.
        let tag = fields[3].split(',').next().unwrap_or_default().to_string();
        let device_number = match (fields[4].parse::<i64>(), fields[5].parse::<i64>()) {
            (Ok(major), Ok(minor)) if major >= 0 && minor >= 0 => {
                Some(format!("{}:{}", major, minor))
            }
            _ => None,
        };
        Ok(LogicalVolume {
            path: self.device_path(&id),
            role: VolumeRole::decode(&tag),
            id,
            size,
            origin,
            tag,
            device_number,
        })
    }
}

fn map_capacity_error(err: StorageError) -> StorageError {
    match err {
        StorageError::Process { ref stderr, .. } if stderr.contains("Insufficient free") => {
            StorageError::ServiceUnavailable { reason: stderr.clone() }
        }
        other => other,
    }
}
