//! gRPC server lifecycle for the gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};

use snapmeta_api::gateway::snapshot_metadata_server::SnapshotMetadataServer;
use snapmeta_cluster::ClusterOps;

use crate::driver::DriverConn;
use crate::service::MetadataService;

/// Hosts the SnapshotMetadata service and manages the server lifecycle.
pub struct GatewayServer {
    addr: SocketAddr,
    cluster: Arc<dyn ClusterOps>,
    driver: Arc<DriverConn>,
    driver_name: String,
    audience: String,
    tls: Option<(PathBuf, PathBuf)>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl GatewayServer {
    pub fn new(
        addr: SocketAddr,
        cluster: Arc<dyn ClusterOps>,
        driver: Arc<DriverConn>,
        driver_name: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            cluster,
            driver,
            driver_name: driver_name.into(),
            audience: audience.into(),
            tls: None,
            local_addr: None,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Serve with the TLS identity mounted at the given cert/key paths.
    ///
    /// Without this the server speaks plaintext, which is only appropriate
    /// for tests.
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert_path.into(), key_path.into()));
        self
    }

    /// Bind and start serving. Returns once the listener is bound.
    pub async fn start(&mut self) -> Result<(), GatewayServerError> {
        tracing::info!("starting gateway gRPC server on {}", self.addr);

        let service = MetadataService::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.driver),
            self.driver_name.clone(),
            self.audience.clone(),
        );

        let mut builder = Server::builder();
        if let Some((cert_path, key_path)) = &self.tls {
            let cert = tokio::fs::read(cert_path)
                .await
                .map_err(|e| GatewayServerError::Tls(format!("read {}: {e}", cert_path.display())))?;
            let key = tokio::fs::read(key_path)
                .await
                .map_err(|e| GatewayServerError::Tls(format!("read {}: {e}", key_path.display())))?;
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                .map_err(|e| GatewayServerError::Tls(e.to_string()))?;
        } else {
            tracing::warn!("gateway serving without TLS");
        }

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| GatewayServerError::Bind(e.to_string()))?;
        self.local_addr = Some(
            listener
                .local_addr()
                .map_err(|e| GatewayServerError::Bind(e.to_string()))?,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let server = builder
            .add_service(SnapshotMetadataServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                shutdown_rx.await.ok();
            });

        let handle = tokio::spawn(async move {
            let result = server.await;
            tracing::info!("gateway gRPC server task stopped");
            result
        });
        self.server_handle = Some(handle);

        tracing::info!(addr = %self.local_addr.unwrap_or(self.addr), "gateway gRPC server started");
        Ok(())
    }

    /// Address the listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal shutdown and wait for the server task to finish.
    pub async fn shutdown(mut self) -> Result<(), GatewayServerError> {
        tracing::info!("shutting down gateway gRPC server");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| GatewayServerError::Shutdown(e.to_string()))?
                .map_err(|e| GatewayServerError::Server(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("shutdown error: {0}")]
    Shutdown(String),
}
