//! Centralized path configuration for the storage node.
//!
//! Lock files, configuration and device paths should all be derived here so
//! that request handlers and background jobs agree on where things live.

use std::path::{Path, PathBuf};

/// Get the runtime directory holding resource lock files.
///
/// Resolution order:
/// 1. `STORNODE_RUN_DIR` environment variable
/// 2. `/run/stornode` if running as root
/// 3. `$XDG_RUNTIME_DIR/stornode` if XDG_RUNTIME_DIR is set
/// 4. `/tmp/stornode-run` as fallback
pub fn run_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STORNODE_RUN_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/run/stornode");
        }
    }

    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("stornode");
    }

    PathBuf::from("/tmp/stornode-run")
}

/// Get the path of the configuration file.
///
/// `STORNODE_CONFIG` overrides the default `/etc/stornode/config.json`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("STORNODE_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/stornode/config.json")
}

/// Lock file guarding all mutations of a volume.
pub fn volume_resource(run_dir: &Path, volume_id: &str) -> PathBuf {
    run_dir.join("volumes").join(volume_id).join("resource")
}

/// Lock file guarding the iSCSI export of a volume.
pub fn volume_export(run_dir: &Path, volume_id: &str) -> PathBuf {
    run_dir.join("volumes").join(volume_id).join("export")
}

/// Device node of a logical volume, e.g. `/dev/<vg>/<id>`.
pub fn lv_device(device_prefix: &Path, volume_group: &str, volume_id: &str) -> PathBuf {
    device_prefix.join(volume_group).join(volume_id)
}

/// Device-mapper name of a logical volume.
///
/// LVM doubles every `-` inside the volume group and volume names so the
/// single `-` separator stays unambiguous.
pub fn dm_name(volume_group: &str, volume_id: &str) -> String {
    format!("{}-{}", volume_group.replace('-', "--"), volume_id.replace('-', "--"))
}
