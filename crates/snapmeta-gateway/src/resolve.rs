//! Snapshot-name to driver-handle resolution and credential assembly.
//!
//! Lookup order is observable through the reported errors and is pinned by
//! the tests: existence and readiness of every snapshot first, then driver
//! identity (target before base), then source-volume equality, then secrets.

use std::collections::HashMap;
use std::sync::Arc;

use snapmeta_cluster::{ClusterOps, SecretRef};

use crate::error::GatewayError;

/// Driver-facing view of one resolved snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub driver: String,
    pub snapshot_handle: String,
    pub class_name: Option<String>,
    pub source_volume: Option<String>,
}

/// Result of resolving a delta pair.
#[derive(Debug, Clone)]
pub struct DeltaResolution {
    pub base: SnapshotInfo,
    pub target: SnapshotInfo,
    pub secrets: HashMap<String, String>,
}

pub struct Resolver {
    cluster: Arc<dyn ClusterOps>,
    driver_name: String,
}

impl Resolver {
    pub fn new(cluster: Arc<dyn ClusterOps>, driver_name: impl Into<String>) -> Self {
        Self {
            cluster,
            driver_name: driver_name.into(),
        }
    }

    /// Resolve a single snapshot and the credentials its class designates.
    pub async fn resolve_allocated(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(SnapshotInfo, HashMap<String, String>), GatewayError> {
        let info = self.snapshot_info(namespace, name).await?;
        self.check_driver(&info)?;
        let secrets = self.credentials_for(info.class_name.as_deref()).await?;
        Ok((info, secrets))
    }

    /// Resolve a (base, target) pair that must share a source volume.
    ///
    /// The credentials come from the target's snapshot class.
    pub async fn resolve_delta(
        &self,
        namespace: &str,
        base_name: &str,
        target_name: &str,
    ) -> Result<DeltaResolution, GatewayError> {
        let target = self.snapshot_info(namespace, target_name).await?;
        let base = self.snapshot_info(namespace, base_name).await?;

        self.check_driver(&target)?;
        self.check_driver(&base)?;

        if base.source_volume != target.source_volume {
            return Err(GatewayError::DiffSourceVolumes);
        }

        let secrets = self.credentials_for(target.class_name.as_deref()).await?;
        Ok(DeltaResolution {
            base,
            target,
            secrets,
        })
    }

    async fn snapshot_info(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SnapshotInfo, GatewayError> {
        let vs = self
            .cluster
            .volume_snapshot(namespace, name)
            .await
            .map_err(|e| GatewayError::FailedToGetSnapshot {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let status = vs.status.unwrap_or_default();
        if status.ready_to_use != Some(true) {
            return Err(GatewayError::SnapshotNotReady(name.to_string()));
        }
        let content_name = status
            .bound_volume_snapshot_content_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| GatewayError::InvalidSnapshotStatus(name.to_string()))?;

        let vsc = self
            .cluster
            .volume_snapshot_content(&content_name)
            .await
            .map_err(|e| GatewayError::FailedToGetContent {
                name: content_name.clone(),
                reason: e.to_string(),
            })?;

        let content_status = vsc.status.unwrap_or_default();
        if content_status.ready_to_use != Some(true) {
            return Err(GatewayError::ContentNotReady(content_name.clone()));
        }
        let snapshot_handle = content_status
            .snapshot_handle
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::InvalidContentStatus(content_name.clone()))?;

        Ok(SnapshotInfo {
            name: name.to_string(),
            driver: vsc.spec.driver,
            snapshot_handle,
            class_name: vsc.spec.volume_snapshot_class_name,
            source_volume: vs.spec.source.persistent_volume_claim_name,
        })
    }

    fn check_driver(&self, info: &SnapshotInfo) -> Result<(), GatewayError> {
        if info.driver != self.driver_name {
            return Err(GatewayError::DriverMismatch {
                snapshot: info.name.clone(),
                driver: self.driver_name.clone(),
            });
        }
        Ok(())
    }

    /// Assemble the secret map the driver expects for `class_name`.
    ///
    /// A snapshot without a class, or a class without a secret reference,
    /// yields an empty map; only fetch failures are errors.
    async fn credentials_for(
        &self,
        class_name: Option<&str>,
    ) -> Result<HashMap<String, String>, GatewayError> {
        let Some(class_name) = class_name else {
            return Ok(HashMap::new());
        };

        let secret_ref = self
            .cluster
            .snapshot_class_secret_ref(class_name)
            .await
            .map_err(|e| GatewayError::FailedToGetCredentials(e.to_string()))?;
        let Some(SecretRef { name, namespace }) = secret_ref else {
            return Ok(HashMap::new());
        };

        let data = self
            .cluster
            .secret_data(&namespace, &name)
            .await
            .map_err(|e| GatewayError::FailedToGetCredentials(e.to_string()))?;

        Ok(data
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect())
    }
}
