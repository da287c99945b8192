//! Device-mapper handling for snapshot removal.
//!
//! While a snapshot exists, LVM stacks four mappings:
//!
//! ```text
//! <vg>-<origin>        snapshot-origin -> <vg>-<origin>-real
//! <vg>-<origin>-real   linear onto the origin's extents
//! <vg>-<snap>          snapshot        -> <vg>-<origin>-real + <vg>-<snap>-cow
//! <vg>-<snap>-cow      linear onto the COW extents
//! ```
//!
//! Before the COW extents can be scrubbed the snapshot is "unwrapped": the
//! origin is pointed straight at its real table and the intermediate nodes are
//! removed, leaving `<vg>-<snap>-cow` as a plain linear device. This is
//! destructive and cannot be re-entered, so it requires the snapshot's lock.

use crate::error::{Result, StorageError};
use crate::lock::LockGuard;
use crate::lvm::VolumeGroup;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// Where a snapshot is in the unwrap transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwrapState {
    /// Still a live snapshot.
    Wrapped,
    /// Mid-transformation; a failure here leaves the mappings half rewritten.
    Unwrapping,
    /// Origin runs on its real table; the COW is a plain linear device.
    Unwrapped { cow_device: PathBuf },
}

/// A snapshot's device-mapper stack.
pub struct SnapshotDevice<'a> {
    vg: &'a VolumeGroup,
    origin_id: String,
    snapshot_id: String,
    state: UnwrapState,
}

impl<'a> SnapshotDevice<'a> {
    pub fn new(vg: &'a VolumeGroup, origin_id: &str, snapshot_id: &str) -> Self {
        Self {
            vg,
            origin_id: origin_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            state: UnwrapState::Wrapped,
        }
    }

    pub fn state(&self) -> &UnwrapState {
        &self.state
    }

    /// Unwrap the snapshot and return the path of its bare COW device.
    ///
    /// `_guard` must be the snapshot's resource lock; holding it is what makes
    /// the transformation safe.
    #[instrument(
        skip(self, _guard),
        fields(origin = %self.origin_id, snapshot = %self.snapshot_id)
    )]
    pub async fn unwrap(&mut self, _guard: &LockGuard) -> Result<PathBuf> {
        match &self.state {
            UnwrapState::Wrapped => {}
            UnwrapState::Unwrapped { cow_device } => return Ok(cow_device.clone()),
            UnwrapState::Unwrapping => {
                return Err(StorageError::Internal(format!(
                    "snapshot {} is already being unwrapped",
                    self.snapshot_id
                )));
            }
        }
        self.state = UnwrapState::Unwrapping;

        let runner = self.vg.runner();
        let origin = self.vg.dm_name(&self.origin_id);
        let origin_real = format!("{}-real", origin);
        let snapshot = self.vg.dm_name(&self.snapshot_id);
        let cow = format!("{}-cow", snapshot);

        runner.run("dmsetup", &["suspend", &origin]).await?;
        let table = runner.run("dmsetup", &["table", &origin_real]).await;
        let table = match table {
            Ok(table) => table,
            Err(e) => {
                // Leave the origin usable even though the unwrap failed.
                if let Err(resume) = runner.run("dmsetup", &["resume", &origin]).await {
                    warn!(error = %resume, "Failed to resume origin after failed unwrap");
                }
                return Err(e);
            }
        };
        runner.run("dmsetup", &["load", &origin, "--table", table.trim()]).await?;
        runner.run("dmsetup", &["resume", &origin]).await?;
        runner.run("dmsetup", &["remove", &snapshot]).await?;
        runner.run("dmsetup", &["remove", &origin_real]).await?;

        let cow_device = self.vg.mapper_path(&cow);
        info!(cow = %cow_device.display(), "Snapshot unwrapped");
        self.state = UnwrapState::Unwrapped { cow_device: cow_device.clone() };
        Ok(cow_device)
    }
}
