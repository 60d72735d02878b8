//! Request-handler pipeline of the snapshot-metadata gateway.
//!
//! The gateway sits between backup clients in the cluster and a storage
//! driver's snapshot-metadata socket. Each streaming request is validated,
//! authenticated against the cluster's token-review facility, gated on driver
//! readiness, resolved from snapshot names to driver handles, and then
//! relayed record-for-record from the driver's stream.
//!
//! Module layout:
//! - [`auth`]: bearer-token authentication and namespace authorization
//! - [`resolve`]: snapshot resolution and credential assembly
//! - [`driver`]: the shared driver channel and its readiness probe
//! - [`service`]: the two server-streaming handlers
//! - [`forward`]: the record relay and terminal-error classification
//! - [`server`]: server lifecycle (TLS, bind, shutdown)

pub mod auth;
pub mod driver;
pub mod error;
mod forward;
pub mod resolve;
pub mod server;
pub mod service;

pub use driver::DriverConn;
pub use error::GatewayError;
pub use server::{GatewayServer, GatewayServerError};
pub use service::MetadataService;
