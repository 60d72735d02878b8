//! Wire contracts for the snapshot-metadata gateway.
//!
//! Two protobuf packages are compiled here:
//! - [`gateway`]: the cluster-facing `SnapshotMetadata` service with its two
//!   server-streaming RPCs, addressed by namespace and snapshot name.
//! - [`csi`]: the storage driver's native interface, addressed by snapshot
//!   handle, plus the `Identity` probe used by the readiness loop.
//!
//! Record shapes are intentionally parallel between the two packages: the
//! gateway copies block records field by field and never reinterprets them.

pub mod gateway {
    //! Generated types and service stubs for the gateway API.
    tonic::include_proto!("snapshotmetadata.v1");
}

pub mod csi {
    //! Generated types and service stubs for the driver interface.
    tonic::include_proto!("csi.v1");
}
