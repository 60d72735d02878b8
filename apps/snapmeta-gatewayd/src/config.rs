//! Daemon configuration.
//!
//! Loads and validates configuration from a YAML file or environment
//! variables. The TLS material and the driver socket are mounted into the
//! pod by the deployment at the configured paths.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Gateway configuration.
///
/// Example YAML:
/// ```yaml
/// driver_name: "hostpath.csi.k8s.io"
/// audience: "snapmeta.example.com"
/// listen_addr: "0.0.0.0:50051"
/// csi_socket: "/csi/csi.sock"
/// tls_cert: "/tmp/certificates/tls.crt"
/// tls_key: "/tmp/certificates/tls.key"
/// probe_interval_secs: 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Name of the CSI driver this gateway fronts. Snapshots backed by any
    /// other driver are rejected.
    pub driver_name: String,

    /// Token audience callers must mint their tokens for.
    pub audience: String,

    /// gRPC listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path of the driver's Unix-domain socket.
    #[serde(default = "default_csi_socket")]
    pub csi_socket: PathBuf,

    /// Mounted TLS certificate and key.
    #[serde(default = "default_tls_cert")]
    pub tls_cert: PathBuf,
    #[serde(default = "default_tls_key")]
    pub tls_key: PathBuf,

    /// Interval of the driver readiness probe, in seconds.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_csi_socket() -> PathBuf {
    PathBuf::from("/csi/csi.sock")
}

fn default_tls_cert() -> PathBuf {
    PathBuf::from("/tmp/certificates/tls.crt")
}

fn default_tls_key() -> PathBuf {
    PathBuf::from("/tmp/certificates/tls.key")
}

fn default_probe_interval_secs() -> u64 {
    5
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read config file: {e}")))?;

        let config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse YAML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - SNAPMETA_DRIVER_NAME
    /// - SNAPMETA_AUDIENCE
    /// - SNAPMETA_LISTEN_ADDR
    /// - SNAPMETA_CSI_SOCKET
    /// - SNAPMETA_TLS_CERT / SNAPMETA_TLS_KEY
    /// - SNAPMETA_PROBE_INTERVAL_SECS
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let driver_name = std::env::var("SNAPMETA_DRIVER_NAME")
            .map_err(|_| ConfigError::MissingField("SNAPMETA_DRIVER_NAME".to_string()))?;
        let audience = std::env::var("SNAPMETA_AUDIENCE")
            .map_err(|_| ConfigError::MissingField("SNAPMETA_AUDIENCE".to_string()))?;

        let listen_addr =
            std::env::var("SNAPMETA_LISTEN_ADDR").unwrap_or_else(|_| default_listen_addr());
        let csi_socket = std::env::var("SNAPMETA_CSI_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_csi_socket());
        let tls_cert = std::env::var("SNAPMETA_TLS_CERT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_tls_cert());
        let tls_key = std::env::var("SNAPMETA_TLS_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_tls_key());
        let probe_interval_secs = match std::env::var("SNAPMETA_PROBE_INTERVAL_SECS") {
            Ok(v) => v.parse().map_err(|e| {
                ConfigError::InvalidField(format!("invalid SNAPMETA_PROBE_INTERVAL_SECS: {e}"))
            })?,
            Err(_) => default_probe_interval_secs(),
        };

        let config = GatewayConfig {
            driver_name,
            audience,
            listen_addr,
            csi_socket,
            tls_cert,
            tls_key,
            probe_interval_secs,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_name.is_empty() {
            return Err(ConfigError::InvalidField(
                "driver_name cannot be empty".to_string(),
            ));
        }
        if self.audience.is_empty() {
            return Err(ConfigError::InvalidField(
                "audience cannot be empty".to_string(),
            ));
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidField(format!("invalid listen_addr: {e}")))?;
        if self.probe_interval_secs == 0 {
            return Err(ConfigError::InvalidField(
                "probe_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        // Checked by validate().
        self.listen_addr.parse().expect("validated listen_addr")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid field: {0}")]
    InvalidField(String),
}
