//! # Dev Bootstrap
//!
//! Runs a development-mode secret store as a supervised background process:
//! start it, poll its health endpoint until it answers, stop it on request or
//! when the handle is dropped. Dev mode is unsealed in memory and never
//! touches the KMS key, so nothing here is fit for production.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::config::DevSettings;
use crate::errors::{Result, SealplaneError};
use crate::observability::{HealthCheck, HealthProvider, HealthStatus};
use crate::secrets::SecretString;

const ROOT_TOKEN_LEN: usize = 32;
const HEALTH_PATH: &str = "/v1/sys/health";

/// A background task with an explicit lifecycle.
#[async_trait]
pub trait SupervisedTask: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<()>;

    async fn health_check(&self) -> Result<HealthStatus>;

    async fn stop(&mut self) -> Result<()>;
}

/// Polls `GET /v1/sys/health` on a secret store.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    address: String,
}

impl HealthProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SealplaneError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, address: address.into() })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 200 and 429 (standby) are serving; 501 and 503 mean not initialized or
    /// sealed; anything else, including no answer, is unhealthy.
    pub async fn probe(&self) -> HealthStatus {
        let url = format!("{}{}", self.address.trim_end_matches('/'), HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(response) => match response.status().as_u16() {
                200 | 429 => HealthStatus::Healthy,
                501 => HealthStatus::Degraded { message: "not initialized".to_string() },
                503 => HealthStatus::Degraded { message: "sealed".to_string() },
                code => HealthStatus::Unhealthy { message: format!("unexpected status {}", code) },
            },
            Err(e) => HealthStatus::Unhealthy { message: format!("unreachable: {}", e) },
        }
    }
}

#[async_trait]
impl HealthProvider for HealthProbe {
    async fn health_check(&self) -> Result<HealthCheck> {
        Ok(HealthCheck::new("dev_server", self.probe().await).with_metadata("address", self.address.clone()))
    }
}

/// Development-mode secret store process.
#[derive(Debug)]
pub struct DevVaultServer {
    settings: DevSettings,
    root_token: SecretString,
    probe: HealthProbe,
    child: Option<Child>,
}

impl DevVaultServer {
    pub fn new(settings: DevSettings) -> Result<Self> {
        let address = format!("http://{}", settings.listen_address);
        let probe = HealthProbe::new(address, settings.health_poll_interval().max(Duration::from_secs(1)))?;
        Ok(Self { settings, root_token: generate_root_token(), probe, child: None })
    }

    pub fn address(&self) -> &str {
        self.probe.address()
    }

    pub fn root_token(&self) -> &SecretString {
        &self.root_token
    }

    /// A probe that can be registered with the health checker.
    pub fn health_probe(&self) -> HealthProbe {
        self.probe.clone()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.as_mut().map(|c| c.try_wait()), Some(Ok(None)))
    }

    fn args(&self) -> Vec<String> {
        if self.settings.args.is_empty() {
            vec!["server".to_string(), "-dev".to_string()]
        } else {
            self.settings.args.clone()
        }
    }

    async fn wait_healthy(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settings.startup_timeout();
        loop {
            if let Some(status) = self.exited()? {
                let stderr = self.drain_stderr().await;
                self.child = None;
                return Err(SealplaneError::internal(format!(
                    "dev server exited during startup with {}: {}",
                    status,
                    stderr.trim()
                )));
            }

            match self.probe.probe().await {
                HealthStatus::Healthy => return Ok(()),
                other => debug!(status = ?other, "Dev server not ready yet"),
            }

            if tokio::time::Instant::now() >= deadline {
                self.stop().await?;
                return Err(SealplaneError::timeout(
                    "dev server startup",
                    self.settings.startup_timeout().as_millis() as u64,
                ));
            }
            tokio::time::sleep(self.settings.health_poll_interval()).await;
        }
    }

    fn exited(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait().map_err(|e| SealplaneError::io(e, "Failed to poll dev server process")),
            None => Ok(None),
        }
    }

    async fn drain_stderr(&mut self) -> String {
        let mut message = String::new();
        if let Some(mut stderr) = self.child.as_mut().and_then(|c| c.stderr.take()) {
            let mut buf = vec![0u8; 4096];
            if let Ok(n) = stderr.read(&mut buf).await {
                message = String::from_utf8_lossy(&buf[..n]).to_string();
            }
        }
        message
    }
}

#[async_trait]
impl SupervisedTask for DevVaultServer {
    fn name(&self) -> &str {
        "dev_server"
    }

    #[instrument(skip(self), fields(command = %self.settings.command, listen = %self.settings.listen_address))]
    async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let child = Command::new(&self.settings.command)
            .args(self.args())
            .env("VAULT_DEV_ROOT_TOKEN_ID", self.root_token.expose_secret())
            .env("VAULT_DEV_LISTEN_ADDRESS", &self.settings.listen_address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SealplaneError::io(e, format!("Failed to start dev server '{}'", self.settings.command)))?;
        info!(pid = ?child.id(), "Dev server process spawned");
        self.child = Some(child);

        self.wait_healthy().await?;
        info!(address = %self.address(), "Dev server is healthy");
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.child.is_none() {
            return Ok(HealthStatus::Unhealthy { message: "not started".to_string() });
        }
        Ok(self.probe.probe().await)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill dev server process");
            }
            info!("Dev server stopped");
        }
        Ok(())
    }
}

fn generate_root_token() -> SecretString {
    let token: String = OsRng.sample_iter(&Alphanumeric).take(ROOT_TOKEN_LEN).map(char::from).collect();
    SecretString::new(token)
}
