//! Verify the metadata of a VolumeSnapshot's content.
//!
//! Enumerates the allocated blocks of a snapshot, or the changed blocks
//! between two snapshots of the same PersistentVolume, and replays the
//! enumerated extents from a source device onto a target device. The devices
//! compare equal afterwards exactly when the metadata covered every
//! differing block.
//!
//! The command is usually invoked in a pod in the cluster, as the gRPC
//! client needs to resolve the DNS address in the SnapshotMetadataService CR.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use snapmeta_cluster::KubeCluster;
use snapmeta_iter::{iterate, Args, VerifierSink};

#[derive(Parser, Debug)]
#[command(
    name = "snapmeta-verifier",
    about = "Verify snapshot block metadata by copying extents between devices"
)]
struct Cli {
    /// The namespace containing the VolumeSnapshot objects.
    #[arg(long, short = 'n')]
    namespace: String,

    /// The VolumeSnapshot whose metadata is to be verified.
    #[arg(long = "snapshot", short = 's')]
    snapshot: String,

    /// An earlier VolumeSnapshot; if set, changed-block metadata between the
    /// two snapshots is verified instead of allocated-block metadata.
    #[arg(long = "previous-snapshot", short = 'p', default_value = "")]
    previous_snapshot: String,

    /// The source device to copy verified extents from.
    #[arg(long = "source-device-path", visible_alias = "src")]
    source_device_path: PathBuf,

    /// The target device to copy verified extents to.
    #[arg(long = "target-device-path", visible_alias = "tgt")]
    target_device_path: PathBuf,

    /// Path to the kubeconfig file; in-cluster configuration is used if the
    /// file does not exist.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// ServiceAccount used to create the security token. If unspecified the
    /// ServiceAccount of the invoking pod is used.
    #[arg(long = "service-account", default_value = "")]
    service_account: String,

    /// Namespace of the ServiceAccount used to create the security token.
    #[arg(long = "service-account-namespace", default_value = "")]
    service_account_namespace: String,

    /// Expiry time in seconds for the security token.
    #[arg(long = "token-expiry", default_value_t = 600)]
    token_expiry: i64,

    /// The starting byte offset.
    #[arg(long = "starting-offset", default_value_t = 0)]
    starting_offset: i64,

    /// The maximum results per record.
    #[arg(long = "max-results", default_value_t = 0)]
    max_results: i32,
}

impl Cli {
    fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(".kube").join("config")
        })
    }
}

/// Load from the kubeconfig file if it exists, else in-cluster.
async fn cluster_config(path: &PathBuf) -> anyhow::Result<kube::Config> {
    if path.exists() {
        let kubeconfig = kube::config::Kubeconfig::read_from(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
            .await
            .with_context(|| format!("failed to load kubeconfig {}", path.display()))
    } else {
        kube::Config::incluster().context("failed to load in-cluster configuration")
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cluster_config(&cli.kubeconfig_path()).await?;
    let client = kube::Client::try_from(config).context("failed to create cluster client")?;

    let source = File::open(&cli.source_device_path).with_context(|| {
        format!(
            "failed to open source device {}",
            cli.source_device_path.display()
        )
    })?;
    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.target_device_path)
        .with_context(|| {
            format!(
                "failed to open target device {}",
                cli.target_device_path.display()
            )
        })?;
    let mut sink = VerifierSink::new(source, target);

    let args = Args {
        cluster: Arc::new(KubeCluster::new(client)),
        namespace: cli.namespace,
        snapshot_name: cli.snapshot,
        prev_snapshot_name: cli.previous_snapshot,
        starting_offset: cli.starting_offset,
        max_results: cli.max_results,
        csi_driver: String::new(),
        sa_namespace: cli.service_account_namespace,
        sa_name: cli.service_account,
        token_expiry_secs: cli.token_expiry,
    };

    // Dropping the iterator future on interrupt tears the stream down.
    tokio::select! {
        result = iterate(args, &mut sink) => Ok(result?),
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
