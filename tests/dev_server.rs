//! Dev server supervision against a mocked health endpoint.

use std::time::Duration;

use sealplane::config::DevSettings;
use sealplane::dev::{DevVaultServer, HealthProbe, SupervisedTask};
use sealplane::observability::{HealthProvider, HealthStatus};
use sealplane::SealplaneError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn health_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn settings_for(server: &MockServer, command: &str, args: &[&str]) -> DevSettings {
    DevSettings {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        listen_address: server.address().to_string(),
        startup_timeout_secs: 1,
        health_poll_interval_ms: 50,
    }
}

#[tokio::test]
async fn probe_maps_health_codes() {
    let active = health_server(200).await;
    let standby = health_server(429).await;
    let sealed = health_server(503).await;
    let broken = health_server(500).await;
    let timeout = Duration::from_secs(2);

    assert_eq!(HealthProbe::new(active.uri(), timeout).unwrap().probe().await, HealthStatus::Healthy);
    assert_eq!(HealthProbe::new(standby.uri(), timeout).unwrap().probe().await, HealthStatus::Healthy);
    assert!(matches!(
        HealthProbe::new(sealed.uri(), timeout).unwrap().probe().await,
        HealthStatus::Degraded { .. }
    ));
    assert!(matches!(
        HealthProbe::new(broken.uri(), timeout).unwrap().probe().await,
        HealthStatus::Unhealthy { .. }
    ));
}

#[tokio::test]
async fn probe_reports_as_health_provider() {
    let sealed = health_server(503).await;
    let probe = HealthProbe::new(sealed.uri(), Duration::from_secs(2)).unwrap();

    let check = probe.health_check().await.unwrap();
    assert_eq!(check.component, "dev_server");
    assert_eq!(check.status, HealthStatus::Degraded { message: "sealed".to_string() });
}

#[cfg(unix)]
#[tokio::test]
async fn start_waits_for_health_and_stop_kills_the_process() {
    let health = health_server(200).await;
    let mut server = DevVaultServer::new(settings_for(&health, "sleep", &["30"])).unwrap();

    server.start().await.unwrap();
    assert!(server.is_running());
    assert_eq!(server.health_check().await.unwrap(), HealthStatus::Healthy);
    assert_eq!(server.address(), health.uri());

    server.stop().await.unwrap();
    assert!(!server.is_running());
    assert!(matches!(server.health_check().await.unwrap(), HealthStatus::Unhealthy { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn process_exiting_during_startup_is_an_error() {
    let health = health_server(503).await;
    let mut server = DevVaultServer::new(settings_for(&health, "true", &[])).unwrap();

    let err = server.start().await.unwrap_err();
    assert!(err.to_string().contains("exited during startup"), "got {}", err);
    assert!(!server.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn never_healthy_times_out_and_cleans_up() {
    let health = health_server(503).await;
    let mut server = DevVaultServer::new(settings_for(&health, "sleep", &["30"])).unwrap();

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, SealplaneError::Timeout { .. }), "got {:?}", err);
    assert!(!server.is_running());
}

#[tokio::test]
async fn missing_binary_is_reported() {
    let health = health_server(200).await;
    let mut server = DevVaultServer::new(settings_for(&health, "/nonexistent/sealplane-vault", &[])).unwrap();

    assert!(server.start().await.is_err());
    assert!(!server.is_running());
}
