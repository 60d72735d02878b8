//! Cluster access for the snapshot-metadata gateway and its client iterator.
//!
//! The gateway never caches cluster state: every request re-reads the
//! snapshot objects it needs. All reads and token operations go through the
//! [`ClusterOps`] trait so that the request pipeline can be exercised against
//! the in-memory [`fake::FakeCluster`] in tests, while production wires in
//! [`KubeCluster`] backed by a real API server connection.

pub mod fake;
mod kube_client;
mod ops;
mod types;

pub use k8s_openapi::ByteString;
pub use kube_client::KubeCluster;
pub use ops::{ClusterError, ClusterOps, SecretRef, TokenReviewOutcome};
pub use types::{
    SnapshotMetadataService, SnapshotMetadataServiceSpec, VolumeSnapshot, VolumeSnapshotContent,
    VolumeSnapshotContentSpec, VolumeSnapshotContentStatus, VolumeSnapshotSource,
    VolumeSnapshotSpec, VolumeSnapshotStatus,
};
