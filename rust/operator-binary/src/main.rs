use std::sync::Arc;

use anyhow::Context as _;
use cert_cache_operator::{
    cluster::KubeCluster,
    leader::LeaderElector,
    reconcile::schedule,
    store::{CertStore, KeyVaultCertStore, KubernetesCertStore},
    Ctx, FIELD_MANAGER,
};
use clap::{crate_description, crate_version, Parser};
use stackable_operator::logging::TracingTarget;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub const APP_NAME: &str = "cert-cache";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CacheOperatorRun>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CertStoreBackend {
    /// Azure Key Vault secrets, survive the loss of the cluster
    AzureKeyVault,
    /// Secrets in a namespace of this cluster
    Kubernetes,
}

#[derive(clap::Parser)]
struct CacheOperatorRun {
    /// Where the cache entries are kept
    #[arg(long, env, value_enum, default_value = "azure-key-vault")]
    cert_store: CertStoreBackend,
    /// Key Vault holding the cache entries, `https://<vault>.vault.azure.net`
    #[arg(long, env)]
    key_vault_url: Option<String>,
    /// Namespace that holds the cache entries of the `kubernetes` store
    #[arg(long, env)]
    cache_namespace: Option<String>,
    /// Namespace of the leader election Lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    lease_namespace: String,
    #[arg(long, env, default_value = "cert-cache-operator-lock")]
    lease_name: String,
    /// Identity to hold the Lease under, the Pod name when running in-cluster
    #[arg(long, env = "HOSTNAME")]
    lease_identity: String,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        // Only cert-manager's CRDs are used, none are owned
        stackable_operator::cli::Command::Crd => {}
        stackable_operator::cli::Command::Run(CacheOperatorRun {
            cert_store,
            key_vault_url,
            cache_namespace,
            lease_namespace,
            lease_name,
            lease_identity,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERT_CACHE_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            anyhow::ensure!(!lease_identity.is_empty(), "the lease identity must not be empty");
            let client =
                stackable_operator::client::create_client(Some(FIELD_MANAGER.to_string())).await?;
            let store: Arc<dyn CertStore> = match cert_store {
                CertStoreBackend::AzureKeyVault => {
                    let vault_url = key_vault_url
                        .context("--key-vault-url is required by the azure-key-vault store")?;
                    Arc::new(KeyVaultCertStore::new(&vault_url)?)
                }
                CertStoreBackend::Kubernetes => {
                    let namespace = cache_namespace
                        .context("--cache-namespace is required by the kubernetes store")?;
                    Arc::new(KubernetesCertStore::new(&client, &namespace))
                }
            };
            info!(?cert_store, "cache store configured");
            let ctx = Ctx {
                cluster: Arc::new(KubeCluster::new(client.clone())),
                store,
            };
            let elector = Arc::new(LeaderElector::new(
                &client,
                &lease_name,
                &lease_namespace,
                &lease_identity,
            ));

            let mut sigterm = signal(SignalKind::terminate())?;
            let guard = tokio::select! {
                guard = elector.acquire() => guard,
                _ = sigterm.recv() => {
                    info!("received SIGTERM while waiting for leadership, shutting down");
                    return Ok(());
                }
            };
            tokio::select! {
                () = schedule::run(&ctx, guard.leadership()) => {
                    warn!("leadership lost, shutting down so that a fresh replica can take over");
                }
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            if let Err(err) = guard.release().await {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to release Lease, the next leader has to wait for it to expire"
                );
            }
        }
    }
    Ok(())
}
