//! Volume role tags.
//!
//! LVM gives every logical volume a single free-text tag field. It is the only
//! durable record of which operation a volume takes part in, so the node can
//! recover after a restart without any local database.
//!
//! # Grammar
//!
//! | Tag                              | Role                    |
//! |----------------------------------|-------------------------|
//! | `volume`                         | plain volume            |
//! | `zero`                           | pending secure erase    |
//! | `backup.<ts>.<backupId>`         | snapshot read by backup |
//! | `restore.<sourceId>.<backupId>`  | restore target          |
//! | `clone.<cloneId>`                | snapshot read by clone  |
//! | `convert.<imageId>`              | image import scratch    |
//!
//! Decoding is total: anything unrecognised decodes to [`VolumeRole::Plain`].

use serde::{Deserialize, Serialize};
use std::fmt;

const PLAIN: &str = "volume";
const ZERO: &str = "zero";
const BACKUP: &str = "backup";
const RESTORE: &str = "restore";
const CLONE: &str = "clone";
const CONVERT: &str = "convert";

/// Lifecycle role of a volume, persisted as its LVM tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum VolumeRole {
    /// Independent volume with no operation in flight.
    #[default]
    Plain,
    /// Waiting to be scrubbed and removed.
    PendingErase,
    /// Snapshot being read by a backup job.
    BackupSnapshot { timestamp: i64, backup_id: String },
    /// Volume being populated from a backup.
    RestoreTarget { source_volume_id: String, backup_id: String },
    /// Snapshot being copied to a clone destination.
    CloneSnapshot { clone_id: String },
    /// Scratch volume used while importing an image.
    ConvertScratch { image_id: String },
}

impl VolumeRole {
    /// Encode to the LVM tag string.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Plain => PLAIN.to_string(),
            Self::PendingErase => ZERO.to_string(),
            Self::BackupSnapshot { timestamp, backup_id } => {
                format!("{}.{}.{}", BACKUP, timestamp, backup_id)
            }
            Self::RestoreTarget { source_volume_id, backup_id } => {
                format!("{}.{}.{}", RESTORE, source_volume_id, backup_id)
            }
            Self::CloneSnapshot { clone_id } => format!("{}.{}", CLONE, clone_id),
            Self::ConvertScratch { image_id } => format!("{}.{}", CONVERT, image_id),
        }
    }

    /// Decode an LVM tag string. Unknown or malformed tags decode to `Plain`.
    #[must_use]
    pub fn decode(tag: &str) -> Self {
        match tag.split_once('.') {
            None if tag == ZERO => Self::PendingErase,
            None => Self::Plain,
            Some((BACKUP, rest)) => match rest.split_once('.') {
                Some((ts, backup_id)) if !backup_id.is_empty() => match ts.parse() {
                    Ok(timestamp) => {
                        Self::BackupSnapshot { timestamp, backup_id: backup_id.to_string() }
                    }
                    Err(_) => Self::Plain,
                },
                _ => Self::Plain,
            },
            Some((RESTORE, rest)) => match rest.split_once('.') {
                Some((source, backup_id)) if !source.is_empty() && !backup_id.is_empty() => {
                    Self::RestoreTarget {
                        source_volume_id: source.to_string(),
                        backup_id: backup_id.to_string(),
                    }
                }
                _ => Self::Plain,
            },
            Some((CLONE, clone_id)) if !clone_id.is_empty() => {
                Self::CloneSnapshot { clone_id: clone_id.to_string() }
            }
            Some((CONVERT, image_id)) if !image_id.is_empty() => {
                Self::ConvertScratch { image_id: image_id.to_string() }
            }
            Some(_) => Self::Plain,
        }
    }

    /// Whether the role only makes sense while some job is running on the volume.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Self::Plain | Self::BackupSnapshot { .. })
    }

    /// Short name for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => PLAIN,
            Self::PendingErase => ZERO,
            Self::BackupSnapshot { .. } => BACKUP,
            Self::RestoreTarget { .. } => RESTORE,
            Self::CloneSnapshot { .. } => CLONE,
            Self::ConvertScratch { .. } => CONVERT,
        }
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
