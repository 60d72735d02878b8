//! The metadata iterator.

use std::sync::Arc;

use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use snapmeta_api::gateway;
use snapmeta_api::gateway::snapshot_metadata_client::SnapshotMetadataClient;
use snapmeta_cluster::ClusterOps;

/// Token TTL applied when the caller leaves `token_expiry_secs` at zero.
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: i64 = 600;

/// Prefix the cluster guarantees on every service-account username; used to
/// recognise our own identity in a self-subject review.
pub const SERVICE_ACCOUNT_USERNAME_PREFIX: &str = "system:serviceaccount:";

/// One record received from the metadata stream.
///
/// `block_metadata_type` and `volume_capacity_bytes` repeat unchanged on
/// every record of a stream; the logical response is the concatenation of the
/// `block_metadata` lists in delivery order.
#[derive(Debug, Clone)]
pub struct IteratorMetadata {
    pub block_metadata_type: i32,
    pub volume_capacity_bytes: i64,
    pub block_metadata: Vec<gateway::BlockMetadata>,
}

/// Receives the enumerated records.
///
/// `on_record` is invoked once per record with a 1-based record number; an
/// error aborts the enumeration and is returned from [`iterate`] unchanged.
/// `on_done` is invoked exactly once after a clean end of stream, and never
/// after a failed `on_record`.
pub trait RecordSink {
    fn on_record(&mut self, record_number: u64, metadata: &IteratorMetadata) -> anyhow::Result<()>;

    fn on_done(&mut self, record_count: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum IterError {
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    #[error("failed to add the SnapshotMetadataService CA certificate")]
    CaCert,

    #[error("failed to identify the caller: {0}")]
    SelfReview(String),

    #[error("failed to get VolumeSnapshot {namespace}/{name}: {reason}")]
    GetSnapshot {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("VolumeSnapshot {namespace}/{name} has no bound VolumeSnapshotContent")]
    NoBoundContent { namespace: String, name: String },

    #[error("failed to get VolumeSnapshotContent {content} for VolumeSnapshot {namespace}/{name}: {reason}")]
    GetContent {
        content: String,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("failed to get SnapshotMetadataService for driver {driver}: {reason}")]
    GetMetadataService { driver: String, reason: String },

    #[error("failed to create a token for ServiceAccount {namespace}/{name}: {reason}")]
    CreateToken {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("{op}: {status}")]
    Stream { op: String, status: tonic::Status },

    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}

/// Invocation arguments for [`iterate`].
pub struct Args {
    /// Cluster access for discovery, identity and token minting.
    pub cluster: Arc<dyn ClusterOps>,

    /// Namespace of the snapshot(s).
    pub namespace: String,

    /// The primary (or sole) snapshot.
    pub snapshot_name: String,

    /// If non-empty, enumerate the blocks changed between this snapshot and
    /// `snapshot_name`; otherwise enumerate `snapshot_name`'s allocated
    /// blocks.
    pub prev_snapshot_name: String,

    /// Initial byte offset, forwarded to the driver unchanged.
    pub starting_offset: i64,

    /// Tuples per record; zero lets the driver choose.
    pub max_results: i32,

    /// Driver whose discovery record to use. If empty it is read from the
    /// primary snapshot's bound content.
    pub csi_driver: String,

    /// Identity to mint the token for. Both empty means "use my own
    /// identity"; specifying only one is rejected.
    pub sa_namespace: String,
    pub sa_name: String,

    /// Token TTL in seconds; zero selects [`DEFAULT_TOKEN_EXPIRY_SECONDS`].
    pub token_expiry_secs: i64,
}

impl Args {
    pub fn validate(&self) -> Result<(), IterError> {
        if self.namespace.is_empty() {
            return Err(IterError::InvalidArgs("missing Namespace"));
        }
        if self.snapshot_name.is_empty() {
            return Err(IterError::InvalidArgs("missing SnapshotName"));
        }
        if self.starting_offset < 0 {
            return Err(IterError::InvalidArgs("negative StartingOffset"));
        }
        if self.max_results < 0 {
            return Err(IterError::InvalidArgs("negative MaxResults"));
        }
        if self.sa_namespace.is_empty() != self.sa_name.is_empty() {
            return Err(IterError::InvalidArgs(
                "SANamespace and SAName must be specified together",
            ));
        }
        if self.token_expiry_secs < 0 {
            return Err(IterError::InvalidArgs("invalid TokenExpirySecs"));
        }
        Ok(())
    }
}

/// Enumerate snapshot metadata and deliver each record to `sink`.
///
/// Dropping the returned future on any path tears down the gateway stream,
/// so an aborting caller or sink never leaves a driver stream dangling.
pub async fn iterate(args: Args, sink: &mut dyn RecordSink) -> Result<(), IterError> {
    args.validate()?;
    SnapshotMetadataIterator::new(args).run(sink).await
}

struct SnapshotMetadataIterator {
    args: Args,
    record_num: u64,
}

impl SnapshotMetadataIterator {
    fn new(mut args: Args) -> Self {
        if args.token_expiry_secs == 0 {
            args.token_expiry_secs = DEFAULT_TOKEN_EXPIRY_SECONDS;
        }
        Self {
            args,
            record_num: 0,
        }
    }

    async fn run(&mut self, sink: &mut dyn RecordSink) -> Result<(), IterError> {
        let (channel, token) = self.prepare().await?;
        let client = SnapshotMetadataClient::new(channel);
        self.emit(client, &token, sink).await
    }

    /// Everything up to the dial: identity, driver discovery, token mint.
    async fn prepare(&self) -> Result<(Channel, String), IterError> {
        let (sa_namespace, sa_name) = if self.args.sa_name.is_empty() {
            self.default_service_account().await?
        } else {
            (self.args.sa_namespace.clone(), self.args.sa_name.clone())
        };

        let driver = if self.args.csi_driver.is_empty() {
            self.driver_from_primary_snapshot().await?
        } else {
            self.args.csi_driver.clone()
        };

        let service = self
            .args
            .cluster
            .metadata_service(&driver)
            .await
            .map_err(|e| IterError::GetMetadataService {
                driver: driver.clone(),
                reason: e.to_string(),
            })?;

        let token = self
            .args
            .cluster
            .create_service_account_token(
                &sa_namespace,
                &sa_name,
                &service.audience,
                self.args.token_expiry_secs,
            )
            .await
            .map_err(|e| IterError::CreateToken {
                namespace: sa_namespace.clone(),
                name: sa_name.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(driver = %driver, address = %service.address, "dialing gateway");
        let channel = connect_gateway(&service.address, &service.ca_cert.0).await?;
        Ok((channel, token))
    }

    /// Resolve our own service account from a self-subject review.
    async fn default_service_account(&self) -> Result<(String, String), IterError> {
        let username = self
            .args
            .cluster
            .current_username()
            .await
            .map_err(|e| IterError::SelfReview(e.to_string()))?;

        if let Some(rest) = username.strip_prefix(SERVICE_ACCOUNT_USERNAME_PREFIX) {
            if let Some((namespace, name)) = rest.split_once(':') {
                if !namespace.is_empty() && !name.is_empty() && !name.contains(':') {
                    return Ok((namespace.to_string(), name.to_string()));
                }
            }
        }

        Err(IterError::InvalidArgs(
            "ServiceAccount unspecified and default cannot be determined",
        ))
    }

    /// Read the driver name off the primary snapshot's bound content.
    async fn driver_from_primary_snapshot(&self) -> Result<String, IterError> {
        let namespace = &self.args.namespace;
        let name = &self.args.snapshot_name;

        let vs = self
            .args
            .cluster
            .volume_snapshot(namespace, name)
            .await
            .map_err(|e| IterError::GetSnapshot {
                namespace: namespace.clone(),
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let content = vs
            .status
            .and_then(|s| s.bound_volume_snapshot_content_name)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| IterError::NoBoundContent {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;

        let vsc = self
            .args
            .cluster
            .volume_snapshot_content(&content)
            .await
            .map_err(|e| IterError::GetContent {
                content: content.clone(),
                namespace: namespace.clone(),
                name: name.clone(),
                reason: e.to_string(),
            })?;

        Ok(vsc.spec.driver)
    }

    /// Drive the stream and fire `on_done` after a clean close.
    async fn emit(
        &mut self,
        client: SnapshotMetadataClient<Channel>,
        token: &str,
        sink: &mut dyn RecordSink,
    ) -> Result<(), IterError> {
        self.stream_records(client, token, sink).await?;
        sink.on_done(self.record_num).map_err(IterError::Sink)
    }

    async fn stream_records(
        &mut self,
        mut client: SnapshotMetadataClient<Channel>,
        token: &str,
        sink: &mut dyn RecordSink,
    ) -> Result<(), IterError> {
        let args = &self.args;

        if args.prev_snapshot_name.is_empty() {
            let op = format!(
                "GetMetadataAllocated({},{})",
                args.namespace, args.snapshot_name
            );
            let mut stream = client
                .get_metadata_allocated(gateway::GetMetadataAllocatedRequest {
                    security_token: token.to_string(),
                    namespace: args.namespace.clone(),
                    snapshot_name: args.snapshot_name.clone(),
                    starting_offset: args.starting_offset,
                    max_results: args.max_results,
                })
                .await
                .map_err(|status| IterError::Stream {
                    op: op.clone(),
                    status,
                })?
                .into_inner();

            loop {
                let resp = stream.message().await.map_err(|status| IterError::Stream {
                    op: format!("{op} receive"),
                    status,
                })?;
                let Some(resp) = resp else { return Ok(()) };
                self.deliver(
                    sink,
                    IteratorMetadata {
                        block_metadata_type: resp.block_metadata_type,
                        volume_capacity_bytes: resp.volume_capacity_bytes,
                        block_metadata: resp.block_metadata,
                    },
                )?;
            }
        } else {
            let op = format!(
                "GetMetadataDelta({},{},{})",
                args.namespace, args.prev_snapshot_name, args.snapshot_name
            );
            let mut stream = client
                .get_metadata_delta(gateway::GetMetadataDeltaRequest {
                    security_token: token.to_string(),
                    namespace: args.namespace.clone(),
                    base_snapshot_name: args.prev_snapshot_name.clone(),
                    target_snapshot_name: args.snapshot_name.clone(),
                    starting_offset: args.starting_offset,
                    max_results: args.max_results,
                })
                .await
                .map_err(|status| IterError::Stream {
                    op: op.clone(),
                    status,
                })?
                .into_inner();

            loop {
                let resp = stream.message().await.map_err(|status| IterError::Stream {
                    op: format!("{op} receive"),
                    status,
                })?;
                let Some(resp) = resp else { return Ok(()) };
                self.deliver(
                    sink,
                    IteratorMetadata {
                        block_metadata_type: resp.block_metadata_type,
                        volume_capacity_bytes: resp.volume_capacity_bytes,
                        block_metadata: resp.block_metadata,
                    },
                )?;
            }
        }
    }

    fn deliver(
        &mut self,
        sink: &mut dyn RecordSink,
        metadata: IteratorMetadata,
    ) -> Result<(), IterError> {
        self.record_num += 1;
        sink.on_record(self.record_num, &metadata)
            .map_err(IterError::Sink)
    }
}

/// Validate the discovery record's CA bundle before dialing with it.
fn validate_ca_pem(ca_pem: &[u8]) -> Result<(), IterError> {
    let mut reader = ca_pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| IterError::CaCert)?;
    if certs.is_empty() {
        return Err(IterError::CaCert);
    }
    Ok(())
}

/// Dial `address` over TLS, trusting exclusively the discovery record's CA.
async fn connect_gateway(address: &str, ca_pem: &[u8]) -> Result<Channel, IterError> {
    validate_ca_pem(ca_pem)?;

    let connect_err = |e: tonic::transport::Error| IterError::Connect {
        address: address.to_string(),
        reason: e.to_string(),
    };

    let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem));
    Endpoint::from_shared(format!("https://{address}"))
        .map_err(connect_err)?
        .tls_config(tls)
        .map_err(connect_err)?
        .connect()
        .await
        .map_err(connect_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use snapmeta_cluster::fake::{ready_content, ready_snapshot, FakeCluster};
    use snapmeta_cluster::{ByteString, SnapshotMetadataServiceSpec};
    use tokio::sync::{mpsc, oneshot};
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::transport::Server;
    use tonic::{Code, Request, Response, Status};

    const NS: &str = "backup-ns";

    fn base_args(cluster: Arc<FakeCluster>) -> Args {
        Args {
            cluster,
            namespace: NS.to_string(),
            snapshot_name: "snap-1".to_string(),
            prev_snapshot_name: String::new(),
            starting_offset: 0,
            max_results: 0,
            csi_driver: String::new(),
            sa_namespace: String::new(),
            sa_name: String::new(),
            token_expiry_secs: 0,
        }
    }

    #[derive(Default)]
    struct TestSink {
        records: Vec<(u64, i64, Vec<i64>)>,
        done: Option<u64>,
        fail_at: Option<u64>,
    }

    impl RecordSink for TestSink {
        fn on_record(
            &mut self,
            record_number: u64,
            metadata: &IteratorMetadata,
        ) -> anyhow::Result<()> {
            if self.fail_at == Some(record_number) {
                anyhow::bail!("sink aborted at record {record_number}");
            }
            self.records.push((
                record_number,
                metadata.volume_capacity_bytes,
                metadata
                    .block_metadata
                    .iter()
                    .map(|b| b.byte_offset)
                    .collect(),
            ));
            Ok(())
        }

        fn on_done(&mut self, record_count: u64) -> anyhow::Result<()> {
            self.done = Some(record_count);
            Ok(())
        }
    }

    #[test]
    fn args_validation_precedence() {
        let cluster = Arc::new(FakeCluster::new());
        let mut args = base_args(Arc::clone(&cluster));

        args.namespace = String::new();
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: missing Namespace"
        );

        args.namespace = NS.to_string();
        args.snapshot_name = String::new();
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: missing SnapshotName"
        );

        args.snapshot_name = "snap-1".to_string();
        args.starting_offset = -1;
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: negative StartingOffset"
        );

        args.starting_offset = 0;
        args.max_results = -1;
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: negative MaxResults"
        );

        args.max_results = 0;
        args.sa_name = "sa-only".to_string();
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: SANamespace and SAName must be specified together"
        );

        args.sa_namespace = "sa-ns".to_string();
        args.token_expiry_secs = -1;
        assert_eq!(
            args.validate().unwrap_err().to_string(),
            "invalid argument: invalid TokenExpirySecs"
        );

        args.token_expiry_secs = 0;
        args.validate().unwrap();
    }

    #[tokio::test]
    async fn default_service_account_parses_username() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_username("system:serviceaccount:ns-a:sa-b");

        let iter = SnapshotMetadataIterator::new(base_args(cluster));
        let (namespace, name) = iter.default_service_account().await.unwrap();
        assert_eq!(namespace, "ns-a");
        assert_eq!(name, "sa-b");
    }

    #[tokio::test]
    async fn unresolvable_identity_is_rejected() {
        for username in ["kubernetes-admin", "system:serviceaccount:only-ns"] {
            let cluster = Arc::new(FakeCluster::new());
            cluster.set_username(username);

            let iter = SnapshotMetadataIterator::new(base_args(cluster));
            let err = iter.default_service_account().await.unwrap_err();
            assert_eq!(
                err.to_string(),
                "invalid argument: ServiceAccount unspecified and default cannot be determined"
            );
        }
    }

    #[tokio::test]
    async fn driver_discovered_from_primary_snapshot() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_snapshot(ready_snapshot(NS, "snap-1", "vsc-1", "pvc-1"));
        cluster.add_content(ready_content("vsc-1", "driver-z", "handle-1", None));

        let iter = SnapshotMetadataIterator::new(base_args(cluster));
        assert_eq!(iter.driver_from_primary_snapshot().await.unwrap(), "driver-z");
    }

    #[tokio::test]
    async fn missing_bound_content_is_reported() {
        let cluster = Arc::new(FakeCluster::new());
        let mut vs = ready_snapshot(NS, "snap-1", "vsc-1", "pvc-1");
        vs.status.as_mut().unwrap().bound_volume_snapshot_content_name = None;
        cluster.add_snapshot(vs);

        let iter = SnapshotMetadataIterator::new(base_args(cluster));
        let err = iter.driver_from_primary_snapshot().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("VolumeSnapshot {NS}/snap-1 has no bound VolumeSnapshotContent")
        );
    }

    #[tokio::test]
    async fn content_fetch_failure_is_path_qualified() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_snapshot(ready_snapshot(NS, "snap-1", "vsc-1", "pvc-1"));
        cluster.fail_content("vsc-1", "backend down");

        let iter = SnapshotMetadataIterator::new(base_args(cluster));
        let err = iter.driver_from_primary_snapshot().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "failed to get VolumeSnapshotContent vsc-1 for VolumeSnapshot {NS}/snap-1: backend down"
            )
        );
    }

    #[test]
    fn garbage_ca_pem_is_rejected() {
        let err = validate_ca_pem(b"not a pem at all").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to add the SnapshotMetadataService CA certificate"
        );
    }

    #[test]
    fn pem_framed_ca_is_accepted() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        validate_ca_pem(pem).unwrap();
    }

    /// Self-identity and token minting run before the dial, so a bad CA in
    /// the discovery record still lets us observe the minted token.
    #[tokio::test]
    async fn token_minted_for_reviewed_identity() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_username("system:serviceaccount:ns-a:sa-b");
        cluster.set_issued_token("minted-token");
        cluster.add_snapshot(ready_snapshot(NS, "snap-1", "vsc-1", "pvc-1"));
        cluster.add_content(ready_content("vsc-1", "driver-z", "handle-1", None));
        cluster.add_metadata_service(
            "driver-z",
            SnapshotMetadataServiceSpec {
                audience: "gateway-audience".to_string(),
                address: "gateway.example:6443".to_string(),
                ca_cert: ByteString(b"garbage".to_vec()),
            },
        );

        let iter = SnapshotMetadataIterator::new(base_args(Arc::clone(&cluster)));
        let err = iter.prepare().await.unwrap_err();
        assert!(matches!(err, IterError::CaCert));

        let grants = cluster.grants();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].namespace, "ns-a");
        assert_eq!(grants[0].name, "sa-b");
        assert_eq!(grants[0].audience, "gateway-audience");
        assert_eq!(grants[0].expiry_secs, DEFAULT_TOKEN_EXPIRY_SECONDS);
    }

    // A scripted gateway good enough to exercise the stream loop.
    #[derive(Clone, Default)]
    struct ScriptedGateway {
        records: Arc<Mutex<Vec<Vec<i64>>>>,
        trailing_error: Arc<Mutex<Option<(Code, &'static str)>>>,
        allocated_reqs: Arc<Mutex<Vec<gateway::GetMetadataAllocatedRequest>>>,
        delta_reqs: Arc<Mutex<Vec<gateway::GetMetadataDeltaRequest>>>,
    }

    impl ScriptedGateway {
        fn respond<T: Send + 'static>(
            &self,
            make: fn(&[i64]) -> T,
        ) -> ReceiverStream<Result<T, Status>> {
            let records = self.records.lock().clone();
            let trailing = *self.trailing_error.lock();
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for offsets in records {
                    if tx.send(Ok(make(&offsets))).await.is_err() {
                        return;
                    }
                }
                if let Some((code, msg)) = trailing {
                    let _ = tx.send(Err(Status::new(code, msg))).await;
                }
            });
            ReceiverStream::new(rx)
        }

        fn allocated_record(offsets: &[i64]) -> gateway::GetMetadataAllocatedResponse {
            gateway::GetMetadataAllocatedResponse {
                block_metadata_type: gateway::BlockMetadataType::FixedLength as i32,
                volume_capacity_bytes: 1 << 30,
                block_metadata: offsets
                    .iter()
                    .map(|o| gateway::BlockMetadata {
                        byte_offset: *o,
                        size_bytes: 1024,
                    })
                    .collect(),
            }
        }

        fn delta_record(offsets: &[i64]) -> gateway::GetMetadataDeltaResponse {
            gateway::GetMetadataDeltaResponse {
                block_metadata_type: gateway::BlockMetadataType::FixedLength as i32,
                volume_capacity_bytes: 1 << 30,
                block_metadata: offsets
                    .iter()
                    .map(|o| gateway::BlockMetadata {
                        byte_offset: *o,
                        size_bytes: 1024,
                    })
                    .collect(),
            }
        }
    }

    #[tonic::async_trait]
    impl gateway::snapshot_metadata_server::SnapshotMetadata for ScriptedGateway {
        type GetMetadataAllocatedStream =
            ReceiverStream<Result<gateway::GetMetadataAllocatedResponse, Status>>;

        async fn get_metadata_allocated(
            &self,
            request: Request<gateway::GetMetadataAllocatedRequest>,
        ) -> Result<Response<Self::GetMetadataAllocatedStream>, Status> {
            self.allocated_reqs.lock().push(request.into_inner());
            Ok(Response::new(self.respond(Self::allocated_record)))
        }

        type GetMetadataDeltaStream =
            ReceiverStream<Result<gateway::GetMetadataDeltaResponse, Status>>;

        async fn get_metadata_delta(
            &self,
            request: Request<gateway::GetMetadataDeltaRequest>,
        ) -> Result<Response<Self::GetMetadataDeltaStream>, Status> {
            self.delta_reqs.lock().push(request.into_inner());
            Ok(Response::new(self.respond(Self::delta_record)))
        }
    }

    async fn start_gateway(gw: ScriptedGateway) -> (Channel, oneshot::Sender<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(
            Server::builder()
                .add_service(gateway::snapshot_metadata_server::SnapshotMetadataServer::new(gw))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    shutdown_rx.await.ok();
                }),
        );
        let channel = Endpoint::try_from(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        (channel, shutdown_tx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn records_are_numbered_and_done_fires() {
        let gw = ScriptedGateway::default();
        *gw.records.lock() = vec![vec![0], vec![1, 2]];
        let (channel, _shutdown) = start_gateway(gw.clone()).await;

        let mut iter = SnapshotMetadataIterator::new(base_args(Arc::new(FakeCluster::new())));
        let mut sink = TestSink::default();
        iter.emit(SnapshotMetadataClient::new(channel), "tok", &mut sink)
            .await
            .unwrap();

        assert_eq!(
            sink.records,
            vec![(1, 1 << 30, vec![0]), (2, 1 << 30, vec![1, 2])]
        );
        assert_eq!(sink.done, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sink_error_aborts_without_done() {
        let gw = ScriptedGateway::default();
        *gw.records.lock() = vec![vec![0], vec![1], vec![2]];
        let (channel, _shutdown) = start_gateway(gw.clone()).await;

        let mut iter = SnapshotMetadataIterator::new(base_args(Arc::new(FakeCluster::new())));
        let mut sink = TestSink {
            fail_at: Some(2),
            ..Default::default()
        };
        let err = iter
            .emit(SnapshotMetadataClient::new(channel), "tok", &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, IterError::Sink(_)));
        assert!(err.to_string().contains("sink aborted at record 2"));
        // Record 1 was delivered; on_done must not fire after a sink error.
        assert_eq!(sink.records, vec![(1, 1 << 30, vec![0])]);
        assert_eq!(sink.done, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_status_error_is_reported_with_op() {
        let gw = ScriptedGateway::default();
        *gw.trailing_error.lock() = Some((Code::Aborted, "is a status error"));
        let (channel, _shutdown) = start_gateway(gw.clone()).await;

        let mut iter = SnapshotMetadataIterator::new(base_args(Arc::new(FakeCluster::new())));
        let mut sink = TestSink::default();
        let err = iter
            .emit(SnapshotMetadataClient::new(channel), "tok", &mut sink)
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.starts_with("GetMetadataAllocated(backup-ns,snap-1)"), "{msg}");
        assert!(msg.contains("is a status error"), "{msg}");
        assert_eq!(sink.done, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paging_fields_pass_through_unchanged() {
        let gw = ScriptedGateway::default();
        let (channel, _shutdown) = start_gateway(gw.clone()).await;

        for (starting_offset, max_results) in [(0i64, 0i32), (0, 256), (50, 256), (25, 1)] {
            let mut args = base_args(Arc::new(FakeCluster::new()));
            args.starting_offset = starting_offset;
            args.max_results = max_results;
            let mut iter = SnapshotMetadataIterator::new(args);
            let mut sink = TestSink::default();
            iter.emit(
                SnapshotMetadataClient::new(channel.clone()),
                "tok",
                &mut sink,
            )
            .await
            .unwrap();
        }

        let seen: Vec<(i64, i32)> = gw
            .allocated_reqs
            .lock()
            .iter()
            .map(|r| (r.starting_offset, r.max_results))
            .collect();
        assert_eq!(seen, vec![(0, 0), (0, 256), (50, 256), (25, 1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prev_snapshot_selects_the_delta_call() {
        let gw = ScriptedGateway::default();
        *gw.records.lock() = vec![vec![7]];
        let (channel, _shutdown) = start_gateway(gw.clone()).await;

        let mut args = base_args(Arc::new(FakeCluster::new()));
        args.prev_snapshot_name = "snap-0".to_string();
        let mut iter = SnapshotMetadataIterator::new(args);
        let mut sink = TestSink::default();
        iter.emit(SnapshotMetadataClient::new(channel), "tok", &mut sink)
            .await
            .unwrap();

        let reqs = gw.delta_reqs.lock();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].base_snapshot_name, "snap-0");
        assert_eq!(reqs[0].target_snapshot_name, "snap-1");
        assert_eq!(reqs[0].security_token, "tok");
        assert!(gw.allocated_reqs.lock().is_empty());
        assert_eq!(sink.done, Some(1));
    }
}
