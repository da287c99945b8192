//! State reconciliation for the storage node.
//!
//! On startup, brings lock records and volume tags back in line after the
//! previous process crashed or was killed mid-operation.

use crate::error::{Result, StorageError};
use crate::status::{self, ResourceKind, StatusUpdate, VolumeStatus};
use crate::tag::VolumeRole;
use crate::volume::VolumeManager;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Reconciles node state on startup.
pub struct StateReconciler {
    manager: VolumeManager,
}

impl StateReconciler {
    pub fn new(manager: VolumeManager) -> Self {
        Self { manager }
    }

    /// Reconcile lock records and volume tags.
    ///
    /// 1. Clears every lock record whose owner is gone
    /// 2. Resumes deletes that were interrupted (`zero` tag, no live owner)
    /// 3. Reports any other orphaned in-flight volume as `ERROR`
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        info!("Reconciling node state...");
        let mut report = ReconcileReport::default();

        report.cleared_locks = self.clear_orphaned_locks()?;

        for volume in self.manager.list().await? {
            if volume.owner.is_some() {
                report.in_flight += 1;
                continue;
            }
            if !volume.role.is_in_flight() {
                report.active += 1;
                continue;
            }

            report.orphaned += 1;
            if volume.role == VolumeRole::PendingErase {
                info!(volume_id = %volume.id, "Resuming interrupted delete");
                match self.manager.delete(&volume.id).await {
                    Ok(_) => report.resumed += 1,
                    Err(e) => warn!(volume_id = %volume.id, error = %e, "Failed to resume delete"),
                }
                continue;
            }

            warn!(
                volume_id = %volume.id,
                tag = %volume.tag,
                "Volume was left mid-operation by a dead owner"
            );
            status::report_or_warn(
                self.manager.reporter(),
                ResourceKind::Volumes,
                &volume.id,
                StatusUpdate::new(VolumeStatus::Error)
                    .field("error", format!("{} interrupted", volume.role.as_str())),
            )
            .await;
        }

        info!(
            "Reconciliation complete: {} active, {} in flight, {} orphaned ({} deletes resumed), {} locks cleared",
            report.active, report.in_flight, report.orphaned, report.resumed, report.cleared_locks
        );
        Ok(report)
    }

    /// Truncate lock records under `<run_dir>/volumes/*/` left by dead owners.
    fn clear_orphaned_locks(&self) -> Result<usize> {
        let root = self.manager.config().run_dir.join("volumes");
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(&root, e)),
        };

        let mut cleared = 0;
        for entry in entries {
            let dir: PathBuf = entry.map_err(|e| StorageError::io(&root, e))?.path();
            for name in ["resource", "export"] {
                let path = dir.join(name);
                if self.manager.locks().clear_orphaned(&path)? {
                    debug!(resource = %path.display(), "Cleared orphaned lock");
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}

/// Report of reconciliation actions taken.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Volumes at rest
    pub active: usize,
    /// Volumes whose owner is still alive
    pub in_flight: usize,
    /// Volumes left mid-operation by a dead owner
    pub orphaned: usize,
    /// Interrupted deletes submitted again
    pub resumed: usize,
    /// Lock records cleared
    pub cleared_locks: usize,
}
