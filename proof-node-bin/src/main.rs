//! Proof node: pooled validator sandboxes behind an operator API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use validator_runtime::api::{ApiState, operator_api_router};
use validator_runtime::attestation::{HttpQuoteSource, IasClient, TrustAnchor};
use validator_runtime::docker::DockerProvider;
use validator_runtime::image::{BuildInputs, ImageBuilder, ImageMetadata};
use validator_runtime::metrics::PoolMetrics;
use validator_runtime::reaper::{reconcile_on_startup, run_reaper};
use validator_runtime::sealed::SealedStore;
use validator_runtime::transport::transport_for;
use validator_runtime::{AttestationVerifier, PoolConfig, PoolManager, SandboxError, TaskRouter};

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("operator API: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "proof-node", about = "Pooled validator sandboxes with remote attestation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the operator API and sandbox pool (default).
    Serve,
    /// Build and sign a hardware-isolated validator image.
    BuildImage {
        /// Unsigned image, e.g. `doordash-proof`.
        image: String,
        #[arg(long)]
        distro: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    setup_log();
    let cli = Cli::parse();
    let config = PoolConfig::load();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::BuildImage {
            image,
            distro,
            version,
            manifest,
            config: tool_config,
        } => {
            let signed = ImageBuilder::new(&config.image_tool)
                .build_signed(
                    &image,
                    &ImageMetadata::new(distro, version),
                    &BuildInputs {
                        manifest,
                        config: tool_config,
                    },
                )
                .await?;
            println!("{signed}");
            Ok(())
        }
    }
}

async fn attestation_verifier(
    config: &PoolConfig,
    metrics: Arc<PoolMetrics>,
) -> Result<Option<Arc<AttestationVerifier>>, NodeError> {
    let Some(attestation) = config.attestation.as_ref() else {
        if config.hardware_isolation {
            warn!("SGX enabled but IAS_API_KEY / IAS_ROOT_CA_PATH unset; attestation disabled");
        }
        return Ok(None);
    };
    let anchor = TrustAnchor::load(&attestation.root_ca_path).await?;
    let verifier = AttestationVerifier::new(
        Arc::new(HttpQuoteSource::new(config.request_timeout)),
        Arc::new(IasClient::new(
            attestation.service_url.clone(),
            config.request_timeout,
        )),
        attestation.api_key.clone(),
        anchor,
    )
    .with_metrics(metrics);
    info!("Attestation enabled (service {})", attestation.service_url);
    Ok(Some(Arc::new(verifier)))
}

async fn serve(config: &'static PoolConfig) -> Result<(), NodeError> {
    info!(
        "Starting proof node (max_validators={}, sgx={}, transport={:?})",
        config.max_validators, config.hardware_isolation, config.transport
    );

    let metrics = Arc::new(PoolMetrics::new());
    let provider = Arc::new(DockerProvider::new(config));
    let pool = Arc::new(PoolManager::new(config.clone(), provider, metrics.clone()));
    let router = Arc::new(TaskRouter::new(pool.clone(), transport_for(config.transport)));
    let verifier = attestation_verifier(config, metrics).await?;

    // Remove sandboxes orphaned by a previous run before admitting new ones.
    let stale = reconcile_on_startup(&pool).await;
    if stale > 0 {
        info!("Removed {stale} stale sandboxes");
    }

    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn(run_reaper(pool.clone(), shutdown.clone()));

    let app = operator_api_router(ApiState {
        router,
        verifier,
        sealed: SealedStore::new(&config.sealed_root),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.operator_api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Operator API listening on {addr}");

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(err) = reaper.await {
        error!("Reaper task failed: {err}");
    }

    let report = pool.sweep().await;
    if !report.failures.is_empty() {
        warn!("{} sandboxes could not be removed", report.failures.len());
    }
    info!("Proof node stopped");
    served.map_err(NodeError::from)
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
