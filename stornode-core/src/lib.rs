//! Stornode Core Library
//!
//! Node-local volume engine for a block storage service: resource ownership
//! locks, background jobs, LVM role tags and secure scrubbing of volumes and
//! snapshot COW stores.

pub mod backup;
pub mod blockdev;
pub mod config;
pub mod dm;
pub mod error;
pub mod exec;
pub mod image;
pub mod jobs;
pub mod lock;
pub mod lvm;
pub mod observability;
pub mod paths;
pub mod reconcile;
pub mod scrub;
pub mod status;
pub mod tag;
pub mod transport;
pub mod volume;

// Re-export commonly used items
pub use backup::{BackupStore, DirectoryBackupStore};
pub use config::Config;
pub use error::{Result, StorageError};
pub use exec::{CommandRunner, SystemRunner};
pub use image::{DiskFormat, HttpImageRepository, ImageInfo, ImageRepository};
pub use jobs::{Job, JobRunner};
pub use lock::{Claim, ClaimInfo, LockGuard, LockManager, LockRecord};
pub use observability::init as init_observability;
pub use reconcile::{ReconcileReport, StateReconciler};
pub use scrub::{ScrubMode, Scrubber};
pub use status::{
    HttpReporter, LogReporter, ResourceKind, StatusReporter, StatusUpdate, VolumeStatus,
};
pub use tag::VolumeRole;
pub use transport::{BlockTransport, ExportTarget, IscsiTransport};
pub use volume::{
    Snapshot, SnapshotPurpose, SnapshotRequest, Volume, VolumeManager, VolumeManagerBuilder,
};
