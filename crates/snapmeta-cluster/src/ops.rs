//! The cluster-facing operation surface.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{SnapshotMetadataServiceSpec, VolumeSnapshot, VolumeSnapshotContent};

/// Error from a cluster API operation.
///
/// Callers wrap this with their own context (status codes on the gateway
/// side, path-qualified messages on the iterator side), so a single variant
/// carrying the API server's message is all that is needed here.
#[derive(Debug, Error, Clone)]
pub enum ClusterError {
    #[error("{0}")]
    Api(String),
}

/// Reference to the secret a snapshot class designates for its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

/// Outcome of submitting a bearer token for review.
#[derive(Debug, Clone, Default)]
pub struct TokenReviewOutcome {
    pub authenticated: bool,
    pub username: String,
}

/// Read and token operations against the cluster.
///
/// Implemented by [`crate::KubeCluster`] in production and by
/// [`crate::fake::FakeCluster`] in tests. Every call hits the API server
/// afresh; nothing is cached.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    async fn volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ClusterError>;

    async fn volume_snapshot_content(
        &self,
        name: &str,
    ) -> Result<VolumeSnapshotContent, ClusterError>;

    /// Resolve a snapshot class to its secret reference, if it names one.
    async fn snapshot_class_secret_ref(
        &self,
        class_name: &str,
    ) -> Result<Option<SecretRef>, ClusterError>;

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClusterError>;

    /// Fetch the discovery record published for `driver`.
    async fn metadata_service(
        &self,
        driver: &str,
    ) -> Result<SnapshotMetadataServiceSpec, ClusterError>;

    /// Submit `token` for review against `audience`.
    async fn review_token(
        &self,
        token: &str,
        audience: &str,
    ) -> Result<TokenReviewOutcome, ClusterError>;

    /// The username the cluster attributes to this client's own credentials.
    async fn current_username(&self) -> Result<String, ClusterError>;

    /// Mint a bound service-account token scoped to `audience`.
    async fn create_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audience: &str,
        expiry_secs: i64,
    ) -> Result<String, ClusterError>;
}
