//! The two server-streaming handlers.
//!
//! Both follow the same shape: validate, authenticate, gate on driver
//! readiness, resolve names to handles, then hand the driver stream to the
//! forwarder. Readiness is checked before any cluster lookup because it is
//! cheap to answer and saves API-server round trips when the driver is down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::Instrument;

use snapmeta_api::csi;
use snapmeta_api::csi::snapshot_metadata_client::SnapshotMetadataClient;
use snapmeta_api::gateway;
use snapmeta_api::gateway::snapshot_metadata_server::SnapshotMetadata;
use snapmeta_cluster::ClusterOps;

use crate::auth::Authenticator;
use crate::driver::DriverConn;
use crate::error::GatewayError;
use crate::forward::{convert_allocated, convert_delta, forward};
use crate::resolve::Resolver;

/// Handler state shared across all in-flight requests.
pub struct MetadataService {
    auth: Authenticator,
    resolver: Resolver,
    driver: Arc<DriverConn>,
    op_seq: AtomicU64,
}

impl MetadataService {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        driver: Arc<DriverConn>,
        driver_name: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        let driver_name = driver_name.into();
        Self {
            auth: Authenticator::new(Arc::clone(&cluster), audience),
            resolver: Resolver::new(cluster, driver_name),
            driver,
            op_seq: AtomicU64::new(1),
        }
    }

    fn operation_id(&self, op: &str) -> String {
        format!("{op}-{}", self.op_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn validate_allocated(
        &self,
        req: &gateway::GetMetadataAllocatedRequest,
    ) -> Result<(), GatewayError> {
        if req.security_token.is_empty() {
            return Err(GatewayError::SecurityTokenMissing);
        }
        if req.namespace.is_empty() {
            return Err(GatewayError::NamespaceMissing);
        }
        if req.snapshot_name.is_empty() {
            return Err(GatewayError::SnapshotNameMissing);
        }
        Ok(())
    }

    fn validate_delta(&self, req: &gateway::GetMetadataDeltaRequest) -> Result<(), GatewayError> {
        if req.security_token.is_empty() {
            return Err(GatewayError::SecurityTokenMissing);
        }
        if req.namespace.is_empty() {
            return Err(GatewayError::NamespaceMissing);
        }
        if req.base_snapshot_name.is_empty() {
            return Err(GatewayError::BaseSnapshotNameMissing);
        }
        if req.target_snapshot_name.is_empty() {
            return Err(GatewayError::TargetSnapshotNameMissing);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl SnapshotMetadata for MetadataService {
    type GetMetadataAllocatedStream =
        ReceiverStream<Result<gateway::GetMetadataAllocatedResponse, Status>>;

    async fn get_metadata_allocated(
        &self,
        request: Request<gateway::GetMetadataAllocatedRequest>,
    ) -> Result<Response<Self::GetMetadataAllocatedStream>, Status> {
        let req = request.into_inner();
        let span = tracing::info_span!(
            "GetMetadataAllocated",
            op = %self.operation_id("GetMetadataAllocated"),
            namespace = %req.namespace,
            snapshot_name = %req.snapshot_name,
            starting_offset = req.starting_offset,
            max_results = req.max_results,
        );

        async move {
            self.validate_allocated(&req).map_err(|e| {
                tracing::error!(error = %e, "validation failed");
                Status::from(e)
            })?;
            self.auth
                .authenticate(&req.security_token, &req.namespace)
                .await?;
            self.driver.ensure_ready()?;

            let (info, secrets) = self
                .resolver
                .resolve_allocated(&req.namespace, &req.snapshot_name)
                .await?;
            let csi_req = csi::GetMetadataAllocatedRequest {
                snapshot_id: info.snapshot_handle,
                starting_offset: req.starting_offset,
                max_results: req.max_results,
                secrets,
            };

            tracing::debug!(snapshot_id = %csi_req.snapshot_id, "calling CSI driver");
            let mut client = SnapshotMetadataClient::new(self.driver.channel());
            let inbound = client.get_metadata_allocated(csi_req).await?.into_inner();

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(
                async move {
                    match forward(inbound, tx, convert_allocated).await {
                        Ok(()) => tracing::debug!("stream EOF"),
                        Err(status) => tracing::warn!(%status, "stream terminated"),
                    }
                }
                .in_current_span(),
            );

            Ok(Response::new(ReceiverStream::new(rx)))
        }
        .instrument(span)
        .await
    }

    type GetMetadataDeltaStream =
        ReceiverStream<Result<gateway::GetMetadataDeltaResponse, Status>>;

    async fn get_metadata_delta(
        &self,
        request: Request<gateway::GetMetadataDeltaRequest>,
    ) -> Result<Response<Self::GetMetadataDeltaStream>, Status> {
        let req = request.into_inner();
        let span = tracing::info_span!(
            "GetMetadataDelta",
            op = %self.operation_id("GetMetadataDelta"),
            namespace = %req.namespace,
            base_snapshot_name = %req.base_snapshot_name,
            target_snapshot_name = %req.target_snapshot_name,
            starting_offset = req.starting_offset,
            max_results = req.max_results,
        );

        async move {
            self.validate_delta(&req).map_err(|e| {
                tracing::error!(error = %e, "validation failed");
                Status::from(e)
            })?;
            self.auth
                .authenticate(&req.security_token, &req.namespace)
                .await?;
            self.driver.ensure_ready()?;

            let resolved = self
                .resolver
                .resolve_delta(
                    &req.namespace,
                    &req.base_snapshot_name,
                    &req.target_snapshot_name,
                )
                .await?;
            let csi_req = csi::GetMetadataDeltaRequest {
                base_snapshot_id: resolved.base.snapshot_handle,
                target_snapshot_id: resolved.target.snapshot_handle,
                starting_offset: req.starting_offset,
                max_results: req.max_results,
                secrets: resolved.secrets,
            };

            tracing::debug!(
                base_snapshot_id = %csi_req.base_snapshot_id,
                target_snapshot_id = %csi_req.target_snapshot_id,
                "calling CSI driver"
            );
            let mut client = SnapshotMetadataClient::new(self.driver.channel());
            let inbound = client.get_metadata_delta(csi_req).await?.into_inner();

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(
                async move {
                    match forward(inbound, tx, convert_delta).await {
                        Ok(()) => tracing::debug!("stream EOF"),
                        Err(status) => tracing::warn!(%status, "stream terminated"),
                    }
                }
                .in_current_span(),
            );

            Ok(Response::new(ReceiverStream::new(rx)))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmeta_cluster::fake::FakeCluster;
    use tonic::transport::Endpoint;

    fn service() -> MetadataService {
        let _guard = tokio::runtime::Runtime::new().unwrap();
        let _enter = _guard.enter();
        let channel = Endpoint::try_from("http://127.0.0.1:1").unwrap().connect_lazy();
        MetadataService::new(
            Arc::new(FakeCluster::new()),
            Arc::new(DriverConn::with_channel(channel)),
            "driver-x",
            "gateway-audience",
        )
    }

    #[test]
    fn allocated_validation_precedence() {
        let svc = service();
        let mut req = gateway::GetMetadataAllocatedRequest::default();

        assert_eq!(
            svc.validate_allocated(&req).unwrap_err().to_string(),
            "security token missing"
        );
        req.security_token = "token".to_string();
        assert_eq!(
            svc.validate_allocated(&req).unwrap_err().to_string(),
            "Namespace missing"
        );
        req.namespace = "test-ns".to_string();
        assert_eq!(
            svc.validate_allocated(&req).unwrap_err().to_string(),
            "SnapshotName missing"
        );
        req.snapshot_name = "snap-1".to_string();
        svc.validate_allocated(&req).unwrap();
    }

    #[test]
    fn delta_validation_precedence() {
        let svc = service();
        let mut req = gateway::GetMetadataDeltaRequest::default();

        assert_eq!(
            svc.validate_delta(&req).unwrap_err().to_string(),
            "security token missing"
        );
        req.security_token = "token".to_string();
        assert_eq!(
            svc.validate_delta(&req).unwrap_err().to_string(),
            "Namespace missing"
        );
        req.namespace = "test-ns".to_string();
        assert_eq!(
            svc.validate_delta(&req).unwrap_err().to_string(),
            "BaseSnapshotName missing"
        );
        req.base_snapshot_name = "snap-1".to_string();
        assert_eq!(
            svc.validate_delta(&req).unwrap_err().to_string(),
            "TargetSnapshotName missing"
        );
        req.target_snapshot_name = "snap-2".to_string();
        svc.validate_delta(&req).unwrap();
    }

    #[test]
    fn operation_ids_are_sequential() {
        let svc = service();
        assert_eq!(svc.operation_id("GetMetadataAllocated"), "GetMetadataAllocated-1");
        assert_eq!(svc.operation_id("GetMetadataDelta"), "GetMetadataDelta-2");
    }
}
