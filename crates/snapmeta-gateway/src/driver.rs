//! Connection to the storage driver's local socket and its readiness state.
//!
//! One channel is shared by every handler for the life of the process. The
//! readiness flag starts false at startup and is owned by the probe loop;
//! handlers only read it, and must do so before any cluster lookup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint, Uri};

use snapmeta_api::csi;

use crate::error::GatewayError;

pub struct DriverConn {
    channel: Channel,
    ready: Mutex<bool>,
}

impl DriverConn {
    /// Lazily connect to the driver's Unix-domain socket.
    ///
    /// The socket may not exist yet when the gateway starts; the channel
    /// establishes the connection on first use and the probe loop reports
    /// readiness once the driver answers.
    pub fn connect_uds(path: impl Into<PathBuf>) -> Result<Self, tonic::transport::Error> {
        let path = path.into();
        // The endpoint URI is required by the builder but ignored by the
        // connector, which always dials the socket path.
        let channel = Endpoint::try_from("http://[::1]:0")?.connect_with_connector_lazy(
            tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }),
        );
        Ok(Self::with_channel(channel))
    }

    /// Wrap an already-built channel, e.g. a TCP channel in tests.
    pub fn with_channel(channel: Channel) -> Self {
        Self {
            channel,
            ready: Mutex::new(false),
        }
    }

    /// A cheap clone of the shared channel, safe for concurrent use.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    pub fn mark_ready(&self) {
        *self.ready.lock() = true;
    }

    pub fn mark_not_ready(&self) {
        *self.ready.lock() = false;
    }

    pub fn ensure_ready(&self) -> Result<(), GatewayError> {
        if !self.is_ready() {
            return Err(GatewayError::DriverNotReady);
        }
        Ok(())
    }

    /// Start the identity-probe loop that drives the readiness flag.
    ///
    /// Runs until the returned handle is aborted.
    pub fn spawn_probe(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let conn = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut client = csi::identity_client::IdentityClient::new(conn.channel());
                match client.probe(csi::ProbeRequest {}).await {
                    Ok(resp) if resp.get_ref().ready => {
                        if !conn.is_ready() {
                            tracing::info!("CSI driver is ready");
                        }
                        conn.mark_ready();
                    }
                    Ok(_) => {
                        tracing::debug!("CSI driver probe answered not ready");
                        conn.mark_not_ready();
                    }
                    Err(status) => {
                        tracing::warn!(%status, "CSI driver probe failed");
                        conn.mark_not_ready();
                    }
                }
            }
        })
    }
}
