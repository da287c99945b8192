use super::{request_uri, VolumeManager};
use crate::error::{Result, StorageError};
use crate::jobs::JobContext;
use crate::lock::{Claim, ClaimInfo};
use crate::lvm::LogicalVolume;
use crate::observability::metrics;
use crate::status::{ResourceKind, StatusUpdate, VolumeStatus};
use tracing::{info, instrument};

impl VolumeManager {
    /// Scrub and remove a volume or snapshot.
    ///
    /// Deleting interrupts a restore or image import still running on the
    /// volume. A volume that is exported, or that still has a snapshot, cannot
    /// be deleted. Returns the status right after the request was accepted:
    /// `DELETED` when the delete ran inline, `DELETING` while it runs.
    #[instrument(skip(self), fields(volume_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<VolumeStatus> {
        let inner = &self.inner;
        let uri = request_uri("DELETE", id, &[]);
        let lv = inner.vg.get(id).await?;

        // Checked again under the lock: a snapshot may be taken in between.
        self.check_deletable(&lv).await?;
        let guard = match inner.claim(id, ClaimInfo::new(uri).interruptible(false))? {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => return Ok(VolumeStatus::Deleting),
        };
        if let Err(e) = self.check_deletable(&lv).await {
            guard.release()?;
            return Err(e);
        }
        let lv = inner.mark_for_erase(lv).await?;
        info!(origin = ?lv.origin, "Volume marked for erase");

        let work_inner = self.inner.clone();
        let ok_inner = self.inner.clone();
        let err_inner = self.inner.clone();
        let (ok_id, err_id) = (id.to_string(), id.to_string());

        inner
            .jobs
            .run(
                inner.job("delete", id),
                guard,
                move |ctx: JobContext| async move { work_inner.destroy(&lv, ctx.guard()).await },
                move |()| async move {
                    metrics::record_volume_deleted();
                    let update = StatusUpdate::new(VolumeStatus::Deleted);
                    ok_inner.report(ResourceKind::Volumes, &ok_id, update).await;
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

        self.current_status(id).await
    }

    /// Refuse to delete an exported volume or one that still has a snapshot.
    async fn check_deletable(&self, lv: &LogicalVolume) -> Result<()> {
        let export = self.export_path(&lv.id);
        if let Some(owner) = self.inner.locks.probe(&export)? {
            return Err(StorageError::ResourceBusy {
                resource: export.display().to_string(),
                owner_uri: owner.uri,
            });
        }
        if !lv.is_snapshot() {
            if let Some(snapshot) = self.inner.vg.snapshot_of(&lv.id).await? {
                return Err(StorageError::ServiceUnavailable {
                    reason: format!("{} still has snapshot {}", lv.id, snapshot.id),
                });
            }
        }
        Ok(())
    }
}
