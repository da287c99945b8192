//! Snapshot-based operations: plain snapshots, backups and clones.

use super::{
    first_error, request_uri, Inner, Snapshot, SnapshotPurpose, SnapshotRequest, VolumeManager,
};
use crate::error::{Result, StorageError};
use crate::jobs::JobContext;
use crate::lock::{Claim, ClaimInfo};
use crate::lvm::LogicalVolume;
use crate::observability::metrics;
use crate::status::{ResourceKind, StatusUpdate, VolumeStatus};
use crate::tag::VolumeRole;
use crate::transport::ExportTarget;
use tracing::{info, instrument, warn};

impl VolumeManager {
    /// Take a snapshot of `volume_id`.
    ///
    /// A volume has at most one snapshot. Repeating the request for the
    /// snapshot that already exists returns it; asking for any other
    /// snapshot while one exists is a conflict.
    #[instrument(skip(self, request), fields(volume_id = %volume_id, snapshot_id = %request.id))]
    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        request: SnapshotRequest,
    ) -> Result<Snapshot> {
        let inner = &self.inner;
        let timestamp = match request.purpose {
            SnapshotPurpose::Backup { timestamp } => Some(timestamp.to_string()),
            SnapshotPurpose::Clone => None,
        };
        let mut params = vec![("origin", volume_id)];
        if let Some(ts) = &timestamp {
            params.push(("timestamp", ts.as_str()));
        }
        let uri = request_uri("PUT", &request.id, &params);

        let claim_info = ClaimInfo::new(uri.clone()).interruptible(false);
        let guard = match inner.claim(&request.id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.snapshot(&request.id).await,
        };
        inner.snapshot_locked(volume_id, &request.id, &request.role(), &uri).await?;
        guard.release()?;
        self.snapshot(&request.id).await
    }

    /// Snapshot `volume_id` and stream the snapshot into the backup store in
    /// the background. The snapshot is scrubbed and removed afterwards, and
    /// the backup is reported `AVAILABLE` or `ERROR`.
    #[instrument(skip(self), fields(volume_id = %volume_id, backup_id = %backup_id))]
    pub async fn backup(
        &self,
        volume_id: &str,
        backup_id: &str,
        timestamp: i64,
    ) -> Result<Snapshot> {
        let inner = &self.inner;
        let store = inner.backup_store()?;
        let ts = timestamp.to_string();
        let uri = request_uri("POST", volume_id, &[("backup_id", backup_id), ("timestamp", &ts)]);

        let claim_info = ClaimInfo::new(uri.clone()).interruptible(false);
        let guard = match inner.claim(backup_id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.snapshot(backup_id).await,
        };
        let role = VolumeRole::BackupSnapshot { timestamp, backup_id: backup_id.to_string() };
        let snap = inner.snapshot_locked(volume_id, backup_id, &role, &uri).await?;
        let accepted = Snapshot {
            id: snap.id.clone(),
            origin: volume_id.to_string(),
            timestamp: Some(timestamp),
            size: snap.size,
            status: VolumeStatus::Building,
        };

        let work_inner = self.inner.clone();
        let ok_inner = self.inner.clone();
        let err_inner = self.inner.clone();
        let origin = volume_id.to_string();
        let (ok_id, err_id) = (backup_id.to_string(), backup_id.to_string());
        let ok_origin = origin.clone();

        inner
            .jobs
            .run(
                inner.job("backup", backup_id),
                guard,
                move |ctx: JobContext| async move {
                    let saved = store
                        .save(&origin, &snap.id, &snap.path, ctx.cancel_token().clone())
                        .await;
                    let cleanup = work_inner.destroy(&snap, ctx.guard()).await;
                    first_error(saved, cleanup, "backup snapshot")
                },
                move |bytes| async move {
                    ok_inner
                        .report(
                            ResourceKind::Backups,
                            &ok_id,
                            StatusUpdate::new(VolumeStatus::Available)
                                .field("volume_id", ok_origin)
                                .field("size", bytes),
                        )
                        .await;
                },
                move |e| async move {
                    err_inner
                        .report(
                            ResourceKind::Backups,
                            &err_id,
                            StatusUpdate::new(VolumeStatus::Error).field("error", e.to_string()),
                        )
                        .await;
                },
            )
            .await?;

        Ok(accepted)
    }

    /// Copy `volume_id` onto the volume another node exports as `target`.
    ///
    /// A `clone.<cloneId>` snapshot provides the point-in-time image; it is
    /// scrubbed and removed once the copy ends, successfully or not. The
    /// clone is reported `ACTIVE` or `ERROR` under `clone_id`.
    #[instrument(skip(self, target), fields(volume_id = %volume_id, clone_id = %clone_id))]
    pub async fn clone_volume(
        &self,
        volume_id: &str,
        clone_id: &str,
        target: ExportTarget,
    ) -> Result<Snapshot> {
        let inner = &self.inner;
        let (port, lun) = (target.port.to_string(), target.lun.to_string());
        let uri = request_uri(
            "POST",
            volume_id,
            &[
                ("clone_id", clone_id),
                ("iqn", &target.iqn),
                ("ip", &target.ip),
                ("port", &port),
                ("lun", &lun),
            ],
        );

        let claim_info = ClaimInfo::new(uri.clone()).interruptible(false);
        let guard = match inner.claim(clone_id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return self.snapshot(clone_id).await,
        };
        let role = VolumeRole::CloneSnapshot { clone_id: clone_id.to_string() };
        let snap = inner.snapshot_locked(volume_id, clone_id, &role, &uri).await?;
        let accepted = Snapshot {
            id: snap.id.clone(),
            origin: volume_id.to_string(),
            timestamp: None,
            size: snap.size,
            status: VolumeStatus::Cloning,
        };

        let work_inner = self.inner.clone();
        let ok_inner = self.inner.clone();
        let err_inner = self.inner.clone();
        let (ok_id, err_id) = (clone_id.to_string(), clone_id.to_string());

        inner
            .jobs
            .run(
                inner.job("clone", clone_id),
                guard,
                move |ctx: JobContext| async move {
                    let copied = work_inner.copy_to_target(&snap, &target, &ctx).await;
                    let cleanup = work_inner.destroy(&snap, ctx.guard()).await;
                    first_error(copied, cleanup, "clone snapshot")
                },
                move |bytes| async move {
                    metrics::record_volume_created("clone");
                    ok_inner
                        .report(
                            ResourceKind::Volumes,
                            &ok_id,
                            StatusUpdate::new(VolumeStatus::Active).field("copied_bytes", bytes),
                        )
                        .await;
                },
                move |e| async move {
                    err_inner
                        .report(
                            ResourceKind::Volumes,
                            &err_id,
                            StatusUpdate::new(VolumeStatus::Error).field("error", e.to_string()),
                        )
                        .await;
                },
            )
            .await?;

        Ok(accepted)
    }
}

impl Inner {
    /// Create snapshot `id` of `origin_id` tagged `role`. The caller holds the
    /// snapshot's lock; the origin's lock is held here for the allocation.
    async fn snapshot_locked(
        &self,
        origin_id: &str,
        id: &str,
        role: &VolumeRole,
        uri: &str,
    ) -> Result<LogicalVolume> {
        let origin = self.vg.get(origin_id).await?;
        if origin.is_snapshot() {
            return Err(StorageError::ServiceUnavailable {
                reason: format!("{} is itself a snapshot", origin_id),
            });
        }
        // The origin must be idle: never interrupt a restore or import on it.
        let origin_path = self.resource_path(origin_id);
        if let Some(owner) = self.locks.probe(&origin_path)? {
            return Err(StorageError::ResourceBusy {
                resource: origin_path.display().to_string(),
                owner_uri: owner.uri,
            });
        }
        let claim_info = ClaimInfo::new(uri).interruptible(false);
        let _origin_guard = match self.claim(origin_id, claim_info)? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(record) => {
                return Err(StorageError::ResourceBusy {
                    resource: origin_path.display().to_string(),
                    owner_uri: record.uri,
                });
            }
        };

        if let Some(existing) = self.vg.snapshot_of(origin_id).await? {
            if existing.id == id && existing.role == *role {
                info!("Snapshot already exists");
                return Ok(existing);
            }
            return Err(StorageError::AlreadyExists { kind: "Snapshot", id: existing.id });
        }
        if self.find(id).await?.is_some() {
            return Err(StorageError::AlreadyExists { kind: "Volume", id: id.to_string() });
        }

        self.vg.create_snapshot(origin_id, id, origin.size, role).await
    }

    /// Attach `target`, copy the snapshot onto it and detach again.
    async fn copy_to_target(
        &self,
        snap: &LogicalVolume,
        target: &ExportTarget,
        ctx: &JobContext,
    ) -> Result<u64> {
        let device = self.transport.connect(target).await?;
        let copied = self.copy(&snap.path, &device, snap.size, ctx.cancel_token()).await;
        if let Err(e) = self.transport.disconnect(target).await {
            warn!(iqn = %target.iqn, error = %e, "Failed to detach clone target");
        }
        let bytes = copied?;
        info!(bytes, device = %device.display(), "Clone copied");
        Ok(bytes)
    }
}
