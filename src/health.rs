//! Endpoint health checks.
//!
//! Checks HTTP endpoints of a deployed stack, typically the load
//! balancer. URLs may reference recorded attributes such as
//! `http://${WebLb.DNSName}:8080/`.

use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;
use crate::error::{CumulusError, Result};
use crate::resource::reference::value_to_text;
use crate::state::DeploymentState;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Result of one configured check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// Check name.
    pub name: String,
    /// Resolved URL, if it could be resolved.
    pub url: Option<String>,
    /// Overall health status.
    pub healthy: bool,
    /// HTTP status code of the last attempt (if any).
    pub status_code: Option<u16>,
    /// Response time of the last attempt in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Attempts made.
    pub attempts: u32,
    /// Optional error message.
    pub error: Option<String>,
}

/// Health checker for deployed endpoints.
#[derive(Debug)]
pub struct HealthChecker {
    /// HTTP client for health checks.
    client: Client,
}

impl HealthChecker {
    /// Creates a new health checker.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CumulusError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Runs every check against the recorded state.
    pub async fn check_all(&self, checks: &[HealthCheckConfig], state: &DeploymentState) -> Vec<HealthStatus> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            results.push(self.check(check, state).await);
        }
        results
    }

    /// Runs one check, retrying until it passes or attempts run out.
    pub async fn check(&self, config: &HealthCheckConfig, state: &DeploymentState) -> HealthStatus {
        let url = match state.resolve_value(&Value::String(config.url.clone())) {
            Ok(value) => value_to_text(&value),
            Err(e) => {
                warn!("Cannot resolve URL of check {}: {e}", config.name);
                return HealthStatus {
                    name: config.name.clone(),
                    url: None,
                    healthy: false,
                    status_code: None,
                    response_time_ms: None,
                    attempts: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        let attempts = config.attempts.max(1);
        let mut status = self.attempt(config, &url).await;
        status.attempts = 1;
        while !status.healthy && status.attempts < attempts {
            tokio::time::sleep(Duration::from_secs(config.interval_secs)).await;
            let made = status.attempts + 1;
            status = self.attempt(config, &url).await;
            status.attempts = made;
        }
        status
    }

    /// Requests the endpoint once.
    async fn attempt(&self, config: &HealthCheckConfig, url: &str) -> HealthStatus {
        debug!("Checking health of {}: {url}", config.name);
        let start = Instant::now();

        let mut status = HealthStatus {
            name: config.name.clone(),
            url: Some(url.to_string()),
            healthy: false,
            status_code: None,
            response_time_ms: None,
            attempts: 0,
            error: None,
        };

        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .send()
            .await
        {
            Ok(response) => {
                let code = response.status();
                status.status_code = Some(code.as_u16());
                status.response_time_ms = Some(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
                status.healthy = config
                    .expected_status
                    .map_or_else(|| code.is_success(), |expected| code.as_u16() == expected);
                if !status.healthy {
                    debug!("Endpoint {url} returned status {code}");
                    status.error = Some(format!("HTTP {code}"));
                }
            }
            Err(e) => {
                warn!("Health check failed for {url}: {e}");
                status.error = Some(e.to_string());
            }
        }
        status
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy { "healthy" } else { "unhealthy" };
        write!(f, "{}: {status}", self.name)?;
        if let Some(ms) = self.response_time_ms {
            write!(f, " ({ms}ms)")?;
        }
        if let Some(error) = &self.error {
            write!(f, " - {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ResourceState, ResourceStatus};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_with_endpoint(endpoint: &str) -> DeploymentState {
        let mut state = DeploymentState::new("web", "dev");
        let mut lb = ResourceState::new("WebLb", "AWS::ElasticLoadBalancingV2::LoadBalancer", ResourceStatus::Applied);
        lb.physical_id = Some(String::from("arn:lb"));
        lb.outputs.insert(String::from("DNSName"), json!(endpoint));
        state.set_resource(lb);
        state
    }

    fn check(url: &str, expected_status: Option<u16>) -> HealthCheckConfig {
        HealthCheckConfig {
            name: String::from("web"),
            url: url.to_string(),
            expected_status,
            timeout_secs: 2,
            attempts: 2,
            interval_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let host = server.uri().trim_start_matches("http://").to_string();
        let state = state_with_endpoint(&host);
        let status = HealthChecker::new()
            .unwrap()
            .check(&check("http://${WebLb.DNSName}/", None), &state)
            .await;

        assert!(status.healthy);
        assert_eq!(status.status_code, Some(200));
        assert_eq!(status.attempts, 1);
        assert_eq!(status.url, Some(format!("http://{host}/")));
    }

    #[tokio::test]
    async fn test_unexpected_status_is_retried_then_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let state = DeploymentState::new("web", "dev");
        let status = HealthChecker::new()
            .unwrap()
            .check(&check(&server.uri(), Some(200)), &state)
            .await;

        assert!(!status.healthy);
        assert_eq!(status.attempts, 2);
        assert_eq!(status.error.as_deref(), Some("HTTP 503 Service Unavailable"));
    }

    #[tokio::test]
    async fn test_unresolved_url() {
        let state = DeploymentState::new("web", "dev");
        let status = HealthChecker::new()
            .unwrap()
            .check(&check("http://${WebLb.DNSName}/", None), &state)
            .await;
        assert!(!status.healthy);
        assert_eq!(status.attempts, 0);
        assert!(status.url.is_none());
    }
}
