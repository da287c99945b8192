//! Control-plane status callback.
//!
//! Background jobs never return their outcome to the request that started
//! them. Instead they report it here, and this is the only way job results
//! become visible outside the node.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Lifecycle status of a volume or backup as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    Active,
    Building,
    Cloning,
    Imaging,
    Deleting,
    Deleted,
    /// A finished backup.
    Available,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Building => "BUILDING",
            Self::Cloning => "CLONING",
            Self::Imaging => "IMAGING",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Available => "AVAILABLE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection a reported resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volumes,
    Backups,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volumes => "volumes",
            Self::Backups => "backups",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields sent with a status report. `status` is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: VolumeStatus,
    pub fields: Map<String, Value>,
}

impl StatusUpdate {
    pub fn new(status: VolumeStatus) -> Self {
        Self { status, fields: Map::new() }
    }

    /// Attach an extra field, e.g. the size of a finished backup.
    pub fn field(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// The JSON body sent to the control plane.
    pub fn to_json(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert("status".to_string(), Value::String(self.status.as_str().to_string()));
        Value::Object(body)
    }
}

/// Receives job outcomes.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_status(&self, kind: ResourceKind, id: &str, update: StatusUpdate)
        -> Result<()>;
}

/// Reporter used when no control plane is configured: outcomes are only logged.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn report_status(
        &self,
        kind: ResourceKind,
        id: &str,
        update: StatusUpdate,
    ) -> Result<()> {
        info!(
            kind = %kind,
            id = %id,
            status = %update.status,
            fields = %update.to_json(),
            "Status update"
        );
        Ok(())
    }
}

/// Reports to the control plane with `PUT {base_url}/{kind}/{id}`.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: Client,
    base_url: String,
}

impl HttpReporter {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::InvalidConfig {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    pub fn url_for(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind, id)
    }
}

#[async_trait]
impl StatusReporter for HttpReporter {
    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn report_status(
        &self,
        kind: ResourceKind,
        id: &str,
        update: StatusUpdate,
    ) -> Result<()> {
        let url = self.url_for(kind, id);
        let response = self
            .client
            .put(&url)
            .json(&update.to_json())
            .send()
            .await
            .map_err(|e| StorageError::ServiceUnavailable {
                reason: format!("control plane unreachable at {}: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                url = %url,
                status = %status,
                body = %body,
                "Control plane rejected status update"
            );
            return Err(StorageError::ServiceUnavailable {
                reason: format!("control plane returned {} for {}", status, url),
            });
        }
        debug!(url = %url, "Status reported");
        Ok(())
    }
}

/// Report `update`, logging instead of failing. Used from job callbacks,
/// which have nobody to return an error to.
pub async fn report_or_warn(
    reporter: &dyn StatusReporter,
    kind: ResourceKind,
    id: &str,
    update: StatusUpdate,
) {
    let status = update.status;
    if let Err(e) = reporter.report_status(kind, id, update).await {
        warn!(kind = %kind, id = %id, status = %status, error = %e, "Failed to report status");
    }
}
