//! Volume engine.
//!
//! Orchestrates the life of every logical volume on the node:
//!
//! ```text
//! NEW ──► ACTIVE ─────────────────────────► DELETING ──► gone
//!  │        ▲                                   │
//!  ├─► BUILDING (restore)  ──┤                  │
//!  ├─► CLONING  (clone)    ──┤                  ▼
//!  └─► IMAGING  (import)   ──┘      ERROR (orphaned or failed)
//! ```
//!
//! The only durable state is the role tag on each volume plus the resource
//! lock records; status is always derived from the two, so the engine needs no
//! database of its own and picks up where it left off after a restart.

use crate::backup::BackupStore;
use crate::blockdev::{self, Throttle};
use crate::config::Config;
use crate::dm::SnapshotDevice;
use crate::error::{Result, StorageError};
use crate::exec::CommandRunner;
use crate::image::ImageRepository;
use crate::jobs::{Job, JobRunner};
use crate::lock::{Claim, ClaimInfo, LockGuard, LockManager, LockRecord};
use crate::lvm::{LogicalVolume, VolumeGroup};
use crate::paths;
use crate::scrub::{ScrubMode, Scrubber};
use crate::status::{
    self, HttpReporter, LogReporter, ResourceKind, StatusReporter, StatusUpdate, VolumeStatus,
};
use crate::tag::VolumeRole;
use crate::transport::{BlockTransport, IscsiTransport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod create;
mod delete;
mod snapshot;

/// A logical volume together with its derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub id: String,
    pub size: u64,
    pub path: PathBuf,
    pub origin: Option<String>,
    pub device_number: Option<String>,
    pub role: VolumeRole,
    pub tag: String,
    pub status: VolumeStatus,
    /// Live owner of the volume's resource lock, if any.
    pub owner: Option<LockRecord>,
}

/// A volume viewed as a snapshot of its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub origin: String,
    /// Set for backup snapshots.
    pub timestamp: Option<i64>,
    pub size: u64,
    pub status: VolumeStatus,
}

impl Snapshot {
    /// `None` when `volume` has no origin.
    pub fn from_volume(volume: &Volume) -> Option<Self> {
        let origin = volume.origin.clone()?;
        let timestamp = match &volume.role {
            VolumeRole::BackupSnapshot { timestamp, .. } => Some(*timestamp),
            _ => None,
        };
        Some(Self {
            id: volume.id.clone(),
            origin,
            timestamp,
            size: volume.size,
            status: volume.status,
        })
    }
}

/// Why a snapshot is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum SnapshotPurpose {
    Backup { timestamp: i64 },
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub id: String,
    #[serde(flatten)]
    pub purpose: SnapshotPurpose,
}

impl SnapshotRequest {
    pub fn for_backup(id: impl Into<String>, timestamp: i64) -> Self {
        Self { id: id.into(), purpose: SnapshotPurpose::Backup { timestamp } }
    }

    pub fn for_clone(id: impl Into<String>) -> Self {
        Self { id: id.into(), purpose: SnapshotPurpose::Clone }
    }

    fn role(&self) -> VolumeRole {
        match self.purpose {
            SnapshotPurpose::Backup { timestamp } => {
                VolumeRole::BackupSnapshot { timestamp, backup_id: self.id.clone() }
            }
            SnapshotPurpose::Clone => VolumeRole::CloneSnapshot { clone_id: self.id.clone() },
        }
    }
}

/// Status reported for a volume with `role`, given whether its resource lock
/// has a live owner.
///
/// A role that only makes sense while a job runs, seen without a live owner,
/// means the job died: the volume is in `ERROR` until deleted.
pub fn derive_status(role: &VolumeRole, owner_alive: bool) -> VolumeStatus {
    match (role, owner_alive) {
        (VolumeRole::Plain, _) => VolumeStatus::Active,
        (VolumeRole::BackupSnapshot { .. }, true) => VolumeStatus::Building,
        (VolumeRole::BackupSnapshot { .. }, false) => VolumeStatus::Active,
        (VolumeRole::PendingErase, true) => VolumeStatus::Deleting,
        (VolumeRole::RestoreTarget { .. }, true) => VolumeStatus::Building,
        (VolumeRole::CloneSnapshot { .. }, true) => VolumeStatus::Cloning,
        (VolumeRole::ConvertScratch { .. }, true) => VolumeStatus::Imaging,
        (_, false) => VolumeStatus::Error,
    }
}

/// Canonical `<METHOD> /volumes/<id>?k=v&...` form of a request, with keys
/// sorted so that identical retries produce identical lock uris.
pub fn request_uri(method: &str, id: &str, params: &[(&str, &str)]) -> String {
    let mut params = params.to_vec();
    params.sort();
    let mut uri = format!("{} /volumes/{}", method, id);
    for (i, (key, value)) in params.iter().enumerate() {
        uri.push(if i == 0 { '?' } else { '&' });
        uri.push_str(key);
        uri.push('=');
        uri.push_str(value);
    }
    uri
}

pub(crate) struct Inner {
    config: Config,
    vg: VolumeGroup,
    locks: LockManager,
    jobs: JobRunner,
    scrubber: Scrubber,
    reporter: Arc<dyn StatusReporter>,
    backups: Option<Arc<dyn BackupStore>>,
    images: Option<Arc<dyn ImageRepository>>,
    transport: Arc<dyn BlockTransport>,
    synchronous: bool,
}

/// Entry point for every volume operation on the node.
#[derive(Clone)]
pub struct VolumeManager {
    inner: Arc<Inner>,
}

/// Assembles a [`VolumeManager`] and its collaborators.
pub struct VolumeManagerBuilder {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    locks: Option<LockManager>,
    reporter: Option<Arc<dyn StatusReporter>>,
    backups: Option<Arc<dyn BackupStore>>,
    images: Option<Arc<dyn ImageRepository>>,
    transport: Option<Arc<dyn BlockTransport>>,
    synchronous: bool,
}

impl VolumeManagerBuilder {
    pub fn lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn backup_store(mut self, backups: Arc<dyn BackupStore>) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn image_repository(mut self, images: Arc<dyn ImageRepository>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BlockTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Run every job inline, so operations return only after their job and
    /// its status report have completed.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn build(self) -> Result<VolumeManager> {
        self.config.validate()?;
        let control_plane = &self.config.control_plane_url;
        let reporter: Arc<dyn StatusReporter> = match (self.reporter, control_plane) {
            (Some(reporter), _) => reporter,
            (None, Some(url)) => Arc::new(HttpReporter::new(url.clone())?),
            (None, None) => Arc::new(LogReporter),
        };
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(IscsiTransport::new(self.runner.clone(), self.config.iscsi.clone()))
                as Arc<dyn BlockTransport>
        });
        let vg = VolumeGroup::new(
            self.config.volume_group.clone(),
            self.config.device_prefix.clone(),
            self.runner,
        );

        Ok(VolumeManager {
            inner: Arc::new(Inner {
                jobs: JobRunner::new(self.config.max_concurrent_jobs),
                scrubber: Scrubber::new(self.config.scrub.clone()),
                locks: self.locks.unwrap_or_default(),
                vg,
                reporter,
                backups: self.backups,
                images: self.images,
                transport,
                synchronous: self.synchronous,
                config: self.config,
            }),
        })
    }
}

impl VolumeManager {
    pub fn builder(config: Config, runner: Arc<dyn CommandRunner>) -> VolumeManagerBuilder {
        VolumeManagerBuilder {
            config,
            runner,
            locks: None,
            reporter: None,
            backups: None,
            images: None,
            transport: None,
            synchronous: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn volume_group(&self) -> &VolumeGroup {
        &self.inner.vg
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.inner.jobs
    }

    pub(crate) fn reporter(&self) -> &dyn StatusReporter {
        self.inner.reporter.as_ref()
    }

    /// Lock file guarding mutations of volume `id`.
    pub fn resource_path(&self, id: &str) -> PathBuf {
        self.inner.resource_path(id)
    }

    /// Lock file held by the export layer while `id` is exported.
    pub fn export_path(&self, id: &str) -> PathBuf {
        paths::volume_export(&self.inner.config.run_dir, id)
    }

    pub async fn get(&self, id: &str) -> Result<Volume> {
        let lv = self.inner.vg.get(id).await?;
        self.inner.describe(lv)
    }

    pub async fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self.inner.vg.list().await?;
        volumes.into_iter().map(|lv| self.inner.describe(lv)).collect()
    }

    /// Look up a volume that must be a snapshot.
    pub async fn snapshot(&self, id: &str) -> Result<Snapshot> {
        let volume = self.get(id).await?;
        Snapshot::from_volume(&volume)
            .ok_or_else(|| StorageError::NotFound { kind: "Snapshot", id: id.to_string() })
    }

    /// Status of `id`, with a missing volume counting as deleted.
    pub async fn current_status(&self, id: &str) -> Result<VolumeStatus> {
        match self.get(id).await {
            Ok(volume) => Ok(volume.status),
            Err(e) if e.is_not_found() => Ok(VolumeStatus::Deleted),
            Err(e) => Err(e),
        }
    }

    /// Stop accepting jobs and wait for the running ones.
    pub async fn shutdown(&self) {
        self.inner.jobs.shutdown().await;
    }
}

impl Inner {
    fn resource_path(&self, id: &str) -> PathBuf {
        paths::volume_resource(&self.config.run_dir, id)
    }

    fn claim(&self, id: &str, info: ClaimInfo) -> Result<Claim> {
        self.locks.claim(self.resource_path(id), info)
    }

    /// Claim for a request creating `id`. Creations only ever interrupt each
    /// other through delete, so a live creation with a different payload is a
    /// conflict even when it is interruptible.
    fn claim_for_create(&self, id: &str, info: ClaimInfo) -> Result<Claim> {
        let path = self.resource_path(id);
        if let Some(owner) = self.locks.probe(&path)? {
            if owner.uri != info.uri {
                return Err(StorageError::ResourceBusy {
                    resource: path.display().to_string(),
                    owner_uri: owner.uri,
                });
            }
        }
        self.locks.claim(path, info)
    }

    fn describe(&self, lv: LogicalVolume) -> Result<Volume> {
        let owner = self.locks.probe(self.resource_path(&lv.id))?;
        let status = derive_status(&lv.role, owner.is_some());
        Ok(Volume {
            id: lv.id,
            size: lv.size,
            path: lv.path,
            origin: lv.origin,
            device_number: lv.device_number,
            role: lv.role,
            tag: lv.tag,
            status,
            owner,
        })
    }

    async fn find(&self, id: &str) -> Result<Option<LogicalVolume>> {
        match self.vg.get(id).await {
            Ok(lv) => Ok(Some(lv)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn job(&self, kind: &'static str, id: &str) -> Job {
        Job::new(kind, id).synchronous(self.synchronous)
    }

    fn backup_store(&self) -> Result<Arc<dyn BackupStore>> {
        self.backups.clone().ok_or_else(|| StorageError::ServiceUnavailable {
            reason: "no backup store configured".to_string(),
        })
    }

    fn image_repository(&self) -> Result<Arc<dyn ImageRepository>> {
        self.images.clone().ok_or_else(|| StorageError::ServiceUnavailable {
            reason: "no image repository configured".to_string(),
        })
    }

    async fn report(&self, kind: ResourceKind, id: &str, update: StatusUpdate) {
        status::report_or_warn(self.reporter.as_ref(), kind, id, update).await;
    }

    /// Retag `lv` as pending erase, so a crash from here on resumes as a
    /// delete.
    async fn mark_for_erase(&self, mut lv: LogicalVolume) -> Result<LogicalVolume> {
        if lv.role != VolumeRole::PendingErase {
            self.vg.set_role(&lv, &VolumeRole::PendingErase).await?;
            lv.role = VolumeRole::PendingErase;
            lv.tag = lv.role.encode();
        }
        Ok(lv)
    }

    /// Scrub and remove `lv`. `guard` must hold its resource lock.
    ///
    /// Snapshots are unwrapped and only their COW store is scrubbed; anything
    /// else is overwritten end to end.
    async fn destroy(&self, lv: &LogicalVolume, guard: &LockGuard) -> Result<()> {
        let lv = self.mark_for_erase(lv.clone()).await?;
        let scrubber = self.scrubber.clone();
        match &lv.origin {
            Some(origin) => {
                let mut device = SnapshotDevice::new(&self.vg, origin, &lv.id);
                let cow = device.unwrap(guard).await?;
                let report = tokio::task::spawn_blocking(move || {
                    scrubber.scrub_cow(&cow, ScrubMode::Scrub)
                })
                .await
                .map_err(StorageError::internal)??;
                info!(
                    volume_id = %lv.id,
                    exceptions = report.exception_count(),
                    "Snapshot COW scrubbed"
                );
            }
            None => {
                let path = lv.path.clone();
                tokio::task::spawn_blocking(move || scrubber.scrub_volume(&path, 0x00))
                    .await
                    .map_err(StorageError::internal)??;
            }
        }
        self.vg.remove(&lv.id).await
    }

    /// Block copy of `len` bytes between two devices on the blocking pool.
    async fn copy(
        &self,
        src: &Path,
        dst: &Path,
        len: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        let block_size = self.config.copy_block_size;
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            blockdev::copy_device(&src, &dst, len, block_size, &cancel, &mut Throttle::unlimited())
        })
        .await
        .map_err(StorageError::internal)?
    }
}

/// Keep `primary`'s error, logging a cleanup failure that would otherwise
/// hide it.
fn first_error<T>(primary: Result<T>, cleanup: Result<()>, what: &str) -> Result<T> {
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!(error = %cleanup, "{} cleanup failed after error", what);
            Err(e)
        }
    }
}
