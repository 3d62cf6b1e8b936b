//! # Command Line Interface
//!
//! `sealplane` subcommands: bootstrap planning and apply, state maintenance,
//! the runtime unseal gate, the secret sync loop and the dev server.

pub mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::{CloudProvider, InMemoryCloud};
use crate::config::Settings;
use crate::dev::{DevVaultServer, SupervisedTask};
use crate::observability::{init_logging, init_metrics, log_config_info, HealthChecker};
use crate::reconcile::Engine;
use crate::secrets::{ManifestSecretSink, SecretSyncBridge, VaultSecretSource, VaultSourceConfig};
use crate::state::LockMode;
use crate::unseal::{KeyDecryptor, Unsealer};
use output::OutputFormat;

/// File the memory provider persists its simulated cloud to, inside the state directory
pub const SIMULATED_CLOUD_FILE: &str = "simulated-cloud.json";

#[derive(Parser)]
#[command(name = "sealplane")]
#[command(about = "Vault KMS auto-unseal bootstrap and secret sync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML settings file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Cloud backend
    #[arg(long, global = true, value_enum, default_value_t = ProviderKind::Memory)]
    pub provider: ProviderKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Simulated cloud persisted under the state directory
    Memory,
    /// AWS (requires the `aws` feature)
    Aws,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the changes an apply would make
    Plan,

    /// Converge the cloud to the declared configuration
    Apply {
        /// Fail immediately if another run holds the state lock
        #[arg(long)]
        no_wait: bool,
    },

    /// Print the recorded bucket, key and role outputs
    Outputs {
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },

    /// Delete the storage bucket; the unseal key is kept
    DestroyBucket {
        #[arg(long)]
        bucket: String,

        /// Repeat the bucket name to confirm
        #[arg(long)]
        confirm: String,
    },

    /// State maintenance
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Decrypt unseal material with the managed key
    Unseal {
        /// File holding the KMS ciphertext blob
        #[arg(long)]
        ciphertext_file: PathBuf,
    },

    /// Mirror secret store paths into Kubernetes Secret manifests
    Sync {
        /// Run a single iteration and exit
        #[arg(long)]
        once: bool,
    },

    /// Run a development-mode secret store until interrupted
    Dev,
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Remove a stale state lock
    Unlock {
        #[arg(long)]
        lock_id: String,
    },
}

/// Cloud backend selected on the command line.
enum Backend {
    Memory { cloud: Arc<InMemoryCloud>, snapshot: PathBuf },
    #[cfg(feature = "aws")]
    Aws(Arc<crate::cloud::AwsCloud>),
}

impl Backend {
    async fn open(kind: ProviderKind, settings: &Settings) -> anyhow::Result<Self> {
        match kind {
            ProviderKind::Memory => {
                let snapshot = settings.engine.state_dir.join(SIMULATED_CLOUD_FILE);
                let cloud = InMemoryCloud::load_or_new(&snapshot, "123456789012", &settings.bootstrap.region).await?;
                Ok(Backend::Memory { cloud: Arc::new(cloud), snapshot })
            }
            #[cfg(feature = "aws")]
            ProviderKind::Aws => Ok(Backend::Aws(Arc::new(crate::cloud::AwsCloud::from_env(&settings.bootstrap.region).await))),
            #[cfg(not(feature = "aws"))]
            ProviderKind::Aws => bail!("sealplane was built without the `aws` feature"),
        }
    }

    fn provider(&self) -> Arc<dyn CloudProvider> {
        match self {
            Backend::Memory { cloud, .. } => cloud.clone(),
            #[cfg(feature = "aws")]
            Backend::Aws(cloud) => cloud.clone(),
        }
    }

    fn decryptor(&self) -> Arc<dyn KeyDecryptor> {
        match self {
            Backend::Memory { cloud, .. } => cloud.clone(),
            #[cfg(feature = "aws")]
            Backend::Aws(cloud) => cloud.clone(),
        }
    }

    /// Persist simulated cloud state so later commands see it.
    async fn persist(&self) -> anyhow::Result<()> {
        if let Backend::Memory { cloud, snapshot } = self {
            if let Some(dir) = snapshot.parent() {
                tokio::fs::create_dir_all(dir).await.with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            cloud.save(snapshot).await?;
        }
        Ok(())
    }
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.observability, cli.verbose)?;
    log_config_info(&settings);

    match cli.command {
        Commands::Plan => {
            let backend = Backend::open(cli.provider, &settings).await?;
            let engine = Engine::new(backend.provider(), settings.engine.clone());
            let plan = engine.plan(&settings.bootstrap).await?;
            output::print_plan(&plan);
        }
        Commands::Apply { no_wait } => {
            if no_wait {
                settings.engine.lock_mode = LockMode::FailFast;
            }
            let backend = Backend::open(cli.provider, &settings).await?;
            let engine = Engine::new(backend.provider(), settings.engine.clone());
            let result = engine.apply(&settings.bootstrap).await;
            backend.persist().await?;
            output::print_apply_report(&result?);
        }
        Commands::Outputs { output } => {
            let backend = Backend::open(cli.provider, &settings).await?;
            let engine = Engine::new(backend.provider(), settings.engine.clone());
            match engine.outputs()? {
                Some(outputs) => output::print_output(&outputs, output)?,
                None => bail!("No outputs recorded; run `sealplane apply` first"),
            }
        }
        Commands::DestroyBucket { bucket, confirm } => {
            let backend = Backend::open(cli.provider, &settings).await?;
            let engine = Engine::new(backend.provider(), settings.engine.clone());
            engine.destroy_bucket(&bucket, &confirm).await?;
            backend.persist().await?;
            println!("Bucket '{}' destroyed. The unseal key was not modified.", bucket);
        }
        Commands::State { command: StateCommands::Unlock { lock_id } } => {
            let backend = Backend::open(cli.provider, &settings).await?;
            let engine = Engine::new(backend.provider(), settings.engine.clone());
            engine.force_unlock(&lock_id)?;
            println!("Lock {} released.", lock_id);
        }
        Commands::Unseal { ciphertext_file } => {
            let backend = Backend::open(cli.provider, &settings).await?;
            handle_unseal(backend.decryptor(), &ciphertext_file, &settings).await?;
        }
        Commands::Sync { once } => handle_sync(&settings, once).await?,
        Commands::Dev => handle_dev(&settings).await?,
    }

    Ok(())
}

async fn handle_unseal(decryptor: Arc<dyn KeyDecryptor>, ciphertext_file: &Path, settings: &Settings) -> anyhow::Result<()> {
    let ciphertext = tokio::fs::read(ciphertext_file)
        .await
        .with_context(|| format!("Failed to read ciphertext from {}", ciphertext_file.display()))?;

    let unsealer = Unsealer::new(decryptor, ciphertext, &settings.unseal);
    let gate = unsealer.gate();
    let plaintext = unsealer.unseal().await?;
    gate.ensure_serving()?;

    println!("Unsealed: recovered {} byte(s) of unseal material under {}.", plaintext.len(), settings.unseal.key_id);
    Ok(())
}

async fn handle_sync(settings: &Settings, once: bool) -> anyhow::Result<()> {
    let source = VaultSecretSource::new(VaultSourceConfig {
        address: settings.sync.vault_addr.clone(),
        token: settings.sync.token.clone(),
    })?;
    let sink = ManifestSecretSink::new(settings.sync.output_dir.clone());
    let bridge = Arc::new(SecretSyncBridge::new(Arc::new(source), Arc::new(sink), &settings.sync)?);

    if once {
        let report = bridge.sync_once().await;
        output::print_sync_status(&bridge.status().await);
        if report.failed > 0 {
            bail!("{} of {} path(s) failed to sync", report.failed, report.failed + report.synced);
        }
        return Ok(());
    }

    init_metrics(&settings.observability).await?;
    let health = HealthChecker::new();
    health.register_provider("secret_sync", bridge.clone()).await;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        shutdown.cancel();
    });

    bridge.run(cancel).await?;
    output::print_sync_status(&bridge.status().await);
    Ok(())
}

async fn handle_dev(settings: &Settings) -> anyhow::Result<()> {
    let mut server = DevVaultServer::new(settings.dev.clone())?;
    server.start().await?;

    println!("Dev secret store running. Not for production use.");
    println!("  export VAULT_ADDR={}", server.address());
    println!("  export VAULT_TOKEN={}", server.root_token().expose_secret());
    println!("Press Ctrl-C to stop.");

    let stopped = tokio::signal::ctrl_c().await;
    info!("Stopping dev server");
    server.stop().await?;
    stopped.context("Failed to listen for shutdown signal")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_destroy_bucket() {
        let cli = Cli::try_parse_from([
            "sealplane",
            "destroy-bucket",
            "--bucket",
            "acme-eks-vault-storage",
            "--confirm",
            "acme-eks-vault-storage",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::DestroyBucket { .. }));
        assert_eq!(cli.provider, ProviderKind::Memory);
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sealplane", "apply", "--no-wait", "--verbose", "--provider", "aws"]).unwrap();
        assert!(matches!(cli.command, Commands::Apply { no_wait: true }));
        assert!(cli.verbose);
        assert_eq!(cli.provider, ProviderKind::Aws);
    }

    #[test]
    fn test_destroy_bucket_requires_confirmation() {
        assert!(Cli::try_parse_from(["sealplane", "destroy-bucket", "--bucket", "b"]).is_err());
    }
}
