//! Outbound block transport for clones.
//!
//! A clone copies a snapshot onto a volume that another node exports. The
//! [`BlockTransport`] attaches that export as a local block device for the
//! duration of the copy.

use crate::config::IscsiConfig;
use crate::error::{Result, StorageError};
use crate::exec::CommandRunner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// iscsiadm exit status when the session is already logged in.
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// iscsiadm exit status when there is no session to log out of.
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A volume exported by another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTarget {
    pub iqn: String,
    pub ip: String,
    pub port: u16,
    pub lun: u32,
}

impl ExportTarget {
    pub fn portal(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Name udev gives the attached device under `/dev/disk/by-path`.
    pub fn by_path_name(&self) -> String {
        format!("ip-{}-iscsi-{}-lun-{}", self.portal(), self.iqn, self.lun)
    }
}

/// Attaches and detaches remote block devices.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    /// Attach `target`, returning the local device path.
    async fn connect(&self, target: &ExportTarget) -> Result<PathBuf>;

    /// Detach `target`. Detaching something not attached is not an error.
    async fn disconnect(&self, target: &ExportTarget) -> Result<()>;
}

/// `iscsiadm`-driven initiator.
pub struct IscsiTransport {
    runner: Arc<dyn CommandRunner>,
    config: IscsiConfig,
}

impl IscsiTransport {
    pub fn new(runner: Arc<dyn CommandRunner>, config: IscsiConfig) -> Self {
        Self { runner, config }
    }

    pub fn device_path(&self, target: &ExportTarget) -> PathBuf {
        self.config.by_path_dir.join(target.by_path_name())
    }

    async fn iscsiadm(&self, args: &[&str]) -> Result<String> {
        self.runner.run(&self.config.iscsiadm, args).await
    }

    async fn wait_for_device(&self, device: &PathBuf) -> Result<()> {
        let deadline = Instant::now() + self.config.login_timeout();
        while !device.exists() {
            if Instant::now() >= deadline {
                return Err(StorageError::ServiceUnavailable {
                    reason: format!(
                        "{} did not appear within {:?}",
                        device.display(),
                        self.config.login_timeout()
                    ),
                });
            }
            tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockTransport for IscsiTransport {
    #[instrument(skip(self), fields(iqn = %target.iqn, portal = %target.portal()))]
    async fn connect(&self, target: &ExportTarget) -> Result<PathBuf> {
        let portal = target.portal();
        self.iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", &portal]).await?;

        match self.iscsiadm(&["-m", "node", "-T", &target.iqn, "-p", &portal, "--login"]).await {
            Ok(_) => {}
            Err(StorageError::Process { exit_code: ISCSI_ERR_SESS_EXISTS, .. }) => {
                debug!("Session already logged in");
            }
            Err(e) => return Err(e),
        }

        let device = self.device_path(target);
        if let Err(e) = self.wait_for_device(&device).await {
            if let Err(logout) = self.disconnect(target).await {
                warn!(error = %logout, "Failed to log out after device timeout");
            }
            return Err(e);
        }
        info!(device = %device.display(), "Attached remote volume");
        Ok(device)
    }

    #[instrument(skip(self), fields(iqn = %target.iqn, portal = %target.portal()))]
    async fn disconnect(&self, target: &ExportTarget) -> Result<()> {
        let portal = target.portal();
        match self.iscsiadm(&["-m", "node", "-T", &target.iqn, "-p", &portal, "--logout"]).await {
            Ok(_) => {
                info!("Detached remote volume");
                Ok(())
            }
            Err(StorageError::Process { exit_code: ISCSI_ERR_NO_OBJS_FOUND, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
