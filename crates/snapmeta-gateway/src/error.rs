//! Error taxonomy of the request pipeline.
//!
//! The display strings and status codes here are part of the external
//! contract: clients match on them, and the tests pin them. Fixed strings are
//! asserted for equality, formatted ones by prefix.

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("security token missing")]
    SecurityTokenMissing,

    #[error("Namespace missing")]
    NamespaceMissing,

    #[error("SnapshotName missing")]
    SnapshotNameMissing,

    #[error("BaseSnapshotName missing")]
    BaseSnapshotNameMissing,

    #[error("TargetSnapshotName missing")]
    TargetSnapshotNameMissing,

    #[error("VolumeSnapshot {snapshot} is not backed by driver {driver}")]
    DriverMismatch { snapshot: String, driver: String },

    #[error("snapshots have different source volumes")]
    DiffSourceVolumes,

    #[error("failed to review the security token: {0}")]
    TokenReviewFailed(String),

    #[error("unauthenticated user")]
    InvalidUser,

    #[error("driver not ready")]
    DriverNotReady,

    #[error("failed to get VolumeSnapshot {namespace}/{name}: {reason}")]
    FailedToGetSnapshot {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("VolumeSnapshot {0} is not ready to use")]
    SnapshotNotReady(String),

    #[error("invalid status for VolumeSnapshot {0}")]
    InvalidSnapshotStatus(String),

    #[error("failed to get VolumeSnapshotContent {name}: {reason}")]
    FailedToGetContent { name: String, reason: String },

    #[error("VolumeSnapshotContent {0} is not ready to use")]
    ContentNotReady(String),

    #[error("invalid status for VolumeSnapshotContent {0}")]
    InvalidContentStatus(String),

    #[error("failed to get credentials: {0}")]
    FailedToGetCredentials(String),

    #[error("CSI driver response failure: {0}")]
    DriverResponse(String),

    #[error("failed to send response: {0}")]
    SendResponse(String),
}

impl GatewayError {
    pub fn code(&self) -> Code {
        use GatewayError::*;
        match self {
            SecurityTokenMissing
            | NamespaceMissing
            | SnapshotNameMissing
            | BaseSnapshotNameMissing
            | TargetSnapshotNameMissing
            | DriverMismatch { .. }
            | DiffSourceVolumes => Code::InvalidArgument,
            TokenReviewFailed(_) | InvalidUser => Code::Unauthenticated,
            DriverNotReady
            | FailedToGetSnapshot { .. }
            | SnapshotNotReady(_)
            | InvalidSnapshotStatus(_)
            | FailedToGetContent { .. }
            | ContentNotReady(_)
            | InvalidContentStatus(_)
            | FailedToGetCredentials(_) => Code::Unavailable,
            DriverResponse(_) | SendResponse(_) => Code::Internal,
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
