//! Client-side enumeration of snapshot metadata.
//!
//! [`iterate`] performs the inverse of the gateway's handler pipeline: it
//! discovers the gateway's address and CA from the driver's discovery record,
//! mints an audience-scoped service-account token, dials the gateway over
//! TLS, drives one of the two streaming calls, and hands each record to a
//! caller-supplied [`RecordSink`].
//!
//! [`VerifierSink`] is one such sink: it replays the enumerated extents from
//! a source block device onto a target device and compares the results.

mod iter;
pub mod verifier;

pub use iter::{
    iterate, Args, IterError, IteratorMetadata, RecordSink, DEFAULT_TOKEN_EXPIRY_SECONDS,
    SERVICE_ACCOUNT_USERNAME_PREFIX,
};
pub use verifier::VerifierSink;
