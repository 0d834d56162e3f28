//! Connection pool for upstream HTTP connections
//!
//! Proxied requests and liveness probes share pooled keep-alive connections
//! to each target service. Targets are addressed by their synthesized host
//! unless the `[upstreams]` table pins that host to a fixed socket address.

use crate::error::GatewayBody;
use crate::resolver::TargetDescriptor;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("upstream client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("could not build upstream request: {0}")]
    RequestBuild(String),
}

/// Counters exposed on the admin API
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to targets
    pub total_requests: AtomicU64,
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept per target host
    pub max_idle_per_host: usize,
    /// How long an idle connection may sit in the pool
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Host-to-address overrides, replaceable at runtime
pub type SharedUpstreams = Arc<RwLock<HashMap<String, SocketAddr>>>;

/// A connection pool for HTTP connections to target services
pub struct ConnectionPool {
    /// Client for proxied requests (streams the inbound body)
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for liveness probes
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    upstreams: SharedUpstreams,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, upstreams: HashMap<String, SocketAddr>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            upstream_overrides = upstreams.len(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            upstreams: Arc::new(RwLock::new(upstreams)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Swap the address overrides (used on config reload)
    pub fn replace_upstreams(&self, upstreams: HashMap<String, SocketAddr>) {
        *self.upstreams.write() = upstreams;
    }

    /// Address to dial for a target: its override if pinned, otherwise `host:port`
    pub fn connect_authority(&self, target: &TargetDescriptor) -> String {
        self.upstreams
            .read()
            .get(&target.host)
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| target.authority())
    }

    /// Send a request to the target, rewriting its URI to the target path.
    ///
    /// The response body is returned unbuffered.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &TargetDescriptor,
    ) -> Result<Response<GatewayBody>, PoolError> {
        let uri = match req.uri().query() {
            Some(query) => format!("{}://{}{}?{}", target.scheme, self.connect_authority(target), target.path, query),
            None => format!("{}://{}{}", target.scheme, self.connect_authority(target), target.path),
        };

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Issue a GET to `path` on the target and return the response status
    pub async fn probe(&self, target: &TargetDescriptor, path: &str) -> Result<StatusCode, PoolError> {
        let uri = format!("{}://{}{}", target.scheme, self.connect_authority(target), path);
        let host = HeaderValue::from_str(&target.authority())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header(hyper::header::HOST, host)
            .header(hyper::header::CONNECTION, "keep-alive")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_probe();

        let response = self.probe_client.request(req).await?;
        Ok(response.status())
    }
}
