//! # Health Checking
//!
//! Aggregates component health for the long-running commands. The unseal gate
//! and the dev server register here; `Unhealthy` means liveness has failed,
//! `Degraded` means alive but not ready to serve.

use crate::errors::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Health status for a component
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Component is healthy and operational
    Healthy,
    /// Component is alive but not ready
    Degraded { message: String },
    /// Component has failed
    Unhealthy { message: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded { message } | HealthStatus::Unhealthy { message } => Some(message),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    pub last_check: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, String>,
}

impl HealthCheck {
    pub fn new(component: impl Into<String>, status: HealthStatus) -> Self {
        Self { component: component.into(), status, last_check: chrono::Utc::now(), metadata: HashMap::new() }
    }

    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy)
    }

    pub fn degraded<S: Into<String>>(component: impl Into<String>, message: S) -> Self {
        Self::new(component, HealthStatus::Degraded { message: message.into() })
    }

    pub fn unhealthy<S: Into<String>>(component: impl Into<String>, message: S) -> Self {
        Self::new(component, HealthStatus::Unhealthy { message: message.into() })
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Component that provides health checking functionality
#[async_trait]
pub trait HealthProvider: Send + Sync {
    async fn health_check(&self) -> Result<HealthCheck>;
}

/// Central health checker that manages health checks for all components
#[derive(Clone)]
pub struct HealthChecker {
    providers: Arc<RwLock<HashMap<String, Arc<dyn HealthProvider>>>>,
    cache: Arc<RwLock<HashMap<String, HealthCheck>>>,
    instance_id: String,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").field("instance_id", &self.instance_id).finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(RwLock::new(HashMap::new())),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub async fn register_provider<S: Into<String>>(&self, name: S, provider: Arc<dyn HealthProvider>) {
        self.providers.write().await.insert(name.into(), provider);
    }

    /// Perform health checks for all registered providers
    pub async fn check_all(&self) -> HashMap<String, HealthCheck> {
        let providers: Vec<(String, Arc<dyn HealthProvider>)> =
            self.providers.read().await.iter().map(|(name, p)| (name.clone(), Arc::clone(p))).collect();

        let checks = providers.into_iter().map(|(name, provider)| async move {
            let check = match provider.health_check().await {
                Ok(check) => check,
                Err(e) => HealthCheck::unhealthy(name.clone(), format!("Health check failed: {}", e)),
            };
            (name, check)
        });
        let results: HashMap<String, HealthCheck> = join_all(checks).await.into_iter().collect();

        self.cache.write().await.extend(results.clone());
        results
    }

    /// Worst status across all components
    pub async fn overall_status(&self) -> HealthStatus {
        let checks = self.check_all().await;
        if checks.is_empty() {
            return HealthStatus::Degraded { message: "No health providers registered".to_string() };
        }

        let unhealthy = checks.values().filter(|c| matches!(c.status, HealthStatus::Unhealthy { .. })).count();
        let degraded = checks.values().filter(|c| matches!(c.status, HealthStatus::Degraded { .. })).count();

        if unhealthy > 0 {
            HealthStatus::Unhealthy {
                message: format!("{} unhealthy, {} degraded out of {} components", unhealthy, degraded, checks.len()),
            }
        } else if degraded > 0 {
            HealthStatus::Degraded { message: format!("{} degraded out of {} components", degraded, checks.len()) }
        } else {
            HealthStatus::Healthy
        }
    }

    /// Ready to serve: every component healthy.
    pub async fn is_ready(&self) -> bool {
        self.overall_status().await.is_healthy()
    }

    /// Alive: no component has failed.
    pub async fn is_alive(&self) -> bool {
        self.overall_status().await.is_operational()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn get_cached_checks(&self) -> HashMap<String, HealthCheck> {
        self.cache.read().await.clone()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
