use hyper::header::HeaderName;
use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Placeholder substituted with the tenant identifier in host templates
pub const TENANT_PLACEHOLDER: &str = "{tenant}";
/// Placeholder substituted with the application identifier in host templates
pub const APP_PLACEHOLDER: &str = "{app}";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Service-naming convention used to synthesize target hosts
    #[serde(default)]
    pub naming: NamingConfig,

    /// Orchestration collaborator settings
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Liveness probing and activation behavior
    #[serde(default)]
    pub activation: ActivationConfig,

    /// Static address overrides, keyed by synthesized service host
    #[serde(default)]
    pub upstreams: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Gateway port (default: 80, the internal role runs on 81)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the loopback admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max seconds to wait for upstream response headers when proxying
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Service-naming convention.
///
/// The "cluster" and "instance" deployments of the gateway differ only in
/// these templates and the listen port.
#[derive(Debug, Deserialize, Clone)]
pub struct NamingConfig {
    /// URL scheme for all synthesized targets
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host of the shared loading service
    #[serde(default = "default_loading_host")]
    pub loading_host: String,

    #[serde(default = "default_frontend_port")]
    pub loading_port: u16,

    /// Frontend host template, e.g. `{tenant}-frontend-{app}`
    #[serde(default = "default_frontend_host")]
    pub frontend_host: String,

    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,

    /// Backend host template, e.g. `{tenant}-backend-{app}`
    #[serde(default = "default_backend_host")]
    pub backend_host: String,

    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            loading_host: default_loading_host(),
            loading_port: default_frontend_port(),
            frontend_host: default_frontend_host(),
            frontend_port: default_frontend_port(),
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestrationConfig {
    /// Base URL of the orchestration service
    #[serde(default = "default_orchestration_url")]
    pub url: String,

    /// Timeout for a single activation call in seconds
    #[serde(default = "default_activation_timeout")]
    pub timeout_secs: u64,
}

impl OrchestrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            url: default_orchestration_url(),
            timeout_secs: default_activation_timeout(),
        }
    }
}

/// Which tenant-scoped routes consult the activation registry
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantGate {
    /// Only tenant-root requests kick off tenant provisioning (default)
    #[default]
    Root,
    /// Every tenant-scoped request is gated on the registry
    All,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActivationConfig {
    /// Health endpoint probed on candidate targets
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Liveness probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Substring in the request target that signals activation intent
    #[serde(default = "default_intent_marker")]
    pub intent_marker: String,

    /// Header carrying the originating tenant on proxied requests
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    #[serde(default)]
    pub tenant_gate: TenantGate,
}

impl ActivationConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            probe_path: default_probe_path(),
            probe_timeout_secs: default_probe_timeout(),
            intent_marker: default_intent_marker(),
            tenant_header: default_tenant_header(),
            tenant_gate: TenantGate::default(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_loading_host() -> String {
    "service-frontend-loading".to_string()
}

fn default_frontend_host() -> String {
    "{tenant}-frontend-{app}".to_string()
}

fn default_frontend_port() -> u16 {
    80
}

fn default_backend_host() -> String {
    "{tenant}-backend-{app}".to_string()
}

fn default_backend_port() -> u16 {
    81
}

fn default_orchestration_url() -> String {
    "http://service-backend-orchestration:81".to_string()
}

fn default_activation_timeout() -> u64 {
    5
}

fn default_probe_path() -> String {
    "/echo".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_intent_marker() -> String {
    "activate".to_string()
}

fn default_tenant_header() -> String {
    "Tenant".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[upstreams]` table into socket addresses
    pub fn upstream_addrs(&self) -> anyhow::Result<HashMap<String, SocketAddr>> {
        self.upstreams
            .iter()
            .map(|(host, addr)| {
                addr.parse::<SocketAddr>()
                    .map(|a| (host.clone(), a))
                    .map_err(|e| anyhow::anyhow!("upstream '{}' has invalid address '{}': {}", host, addr, e))
            })
            .collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let naming = &self.naming;

        if naming.scheme != "http" {
            errors.push(format!("naming.scheme must be 'http', got '{}'", naming.scheme));
        }
        if naming.loading_host.is_empty() {
            errors.push("naming.loading_host must not be empty".to_string());
        }
        for (name, template) in [
            ("naming.frontend_host", &naming.frontend_host),
            ("naming.backend_host", &naming.backend_host),
        ] {
            if !template.contains(TENANT_PLACEHOLDER) || !template.contains(APP_PLACEHOLDER) {
                errors.push(format!(
                    "{} must reference both {} and {}",
                    name, TENANT_PLACEHOLDER, APP_PLACEHOLDER
                ));
            }
        }
        for (name, port) in [
            ("naming.loading_port", naming.loading_port),
            ("naming.frontend_port", naming.frontend_port),
            ("naming.backend_port", naming.backend_port),
        ] {
            if port == 0 {
                errors.push(format!("{} must not be 0", name));
            }
        }

        match self.orchestration.url.parse::<Uri>() {
            Ok(uri) if uri.scheme_str() == Some("http") && uri.authority().is_some() => {}
            _ => errors.push(format!(
                "orchestration.url must be an absolute http URL, got '{}'",
                self.orchestration.url
            )),
        }

        for (name, secs) in [
            ("orchestration.timeout_secs", self.orchestration.timeout_secs),
            ("activation.probe_timeout_secs", self.activation.probe_timeout_secs),
            ("server.request_timeout_secs", self.server.request_timeout_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        if !self.activation.probe_path.starts_with('/') {
            errors.push(format!(
                "activation.probe_path must start with '/', got '{}'",
                self.activation.probe_path
            ));
        }
        if self.activation.intent_marker.is_empty() {
            errors.push("activation.intent_marker must not be empty".to_string());
        }
        if HeaderName::from_bytes(self.activation.tenant_header.as_bytes()).is_err() {
            errors.push(format!(
                "activation.tenant_header is not a valid header name: '{}'",
                self.activation.tenant_header
            ));
        }

        if let Err(e) = self.upstream_addrs() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
