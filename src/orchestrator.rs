//! Client for the orchestration service that provisions tenants and apps
//!
//! Every call is a single GET with a fixed timeout. Nothing is retried: a
//! timeout or connection failure is returned to the caller as
//! [`GatewayError::ActivationTransport`].

use crate::config::OrchestrationConfig;
use crate::error::GatewayError;
use crate::resolver::RouteClass;
use hyper::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

/// Sends activation requests to the orchestration service
#[derive(Clone)]
pub struct Orchestrator {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(config: &OrchestrationConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create orchestration HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
        })
    }

    /// `{orchestration}/{tenant}`
    pub fn tenant_url(&self, tenant: &str) -> String {
        format!("{}/{}", self.base_url, tenant)
    }

    /// `{orchestration}/{tenant}/{appType}/{app}/{port}`
    pub fn app_url(&self, tenant: &str, app_type: &str, app: &str, port: u16) -> String {
        format!("{}/{}/{}/{}/{}", self.base_url, tenant, app_type, app, port)
    }

    /// Ask the orchestration service to provision a tenant
    pub async fn activate_tenant(&self, tenant: &str) -> Result<StatusCode, GatewayError> {
        let url = self.tenant_url(tenant);
        let status = self.call(&url).await?;
        info!(tenant, status = status.as_u16(), "Tenant activation requested");
        Ok(status)
    }

    /// Ask the orchestration service to provision an app's frontend or backend.
    ///
    /// Returns the orchestration service's status, whatever it is.
    pub async fn activate_app(
        &self,
        tenant: &str,
        class: RouteClass,
        app: &str,
        port: u16,
    ) -> Result<StatusCode, GatewayError> {
        let app_type = class.app_type().ok_or_else(|| GatewayError::InvalidTarget {
            target: format!("{}/{}", self.base_url, tenant),
            reason: format!("route class '{}' has no app type", class),
        })?;
        let url = self.app_url(tenant, app_type, app, port);
        let status = self.call(&url).await?;
        info!(tenant, app, class = %class, status = status.as_u16(), "App activation requested");
        Ok(status)
    }

    async fn call(&self, url: &str) -> Result<StatusCode, GatewayError> {
        debug!(url, timeout_secs = self.timeout.as_secs(), "Calling orchestration service");

        let response = self.http_client.get(url).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("no answer within {} seconds", self.timeout.as_secs())
            } else {
                e.to_string()
            };
            debug!(url, error = %reason, "Orchestration call failed");
            GatewayError::ActivationTransport {
                url: url.to_string(),
                reason,
            }
        })?;

        StatusCode::from_u16(response.status().as_u16()).map_err(|e| GatewayError::ActivationTransport {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}
