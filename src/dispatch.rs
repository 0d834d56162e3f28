//! Per-request activation and dispatch
//!
//! Every tenant-scoped request runs through the same sequence:
//! resolve the target, check liveness (or the registry for tenant roots),
//! activate when asked to, otherwise forward.
//!
//! Outbound calls are awaited inside the connection's service future, so a
//! client that disconnects cancels its pending probe or activation call.
//! The tenant kick-off is the exception: it runs detached because the
//! client has already been redirected. The redirect may reach the client
//! before the orchestration call has been sent.

use crate::config::{Config, TenantGate};
use crate::error::{
    full_body, json_error_response, json_response, text_response, GatewayBody, GatewayError,
    GatewayErrorCode,
};
use crate::forward::ReverseProxy;
use crate::orchestrator::Orchestrator;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::probe::{LivenessProber, ProbeOutcome};
use crate::registry::ActivationStore;
use crate::resolver::{check_identifier, PathResolver, RouteClass};
use crate::routes::{wants_activation, RequestContext, Route};
use dashmap::DashSet;
use hyper::body::Incoming;
use hyper::header::HeaderName;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Body returned after an app activation call
#[derive(Debug, Serialize)]
pub struct ActivationReport<'a> {
    pub tenant: &'a str,
    pub app: &'a str,
    pub class: &'static str,
    /// Status answered by the orchestration service
    pub status: u16,
    pub errors: Vec<String>,
}

impl<'a> ActivationReport<'a> {
    fn new(context: &'a RequestContext, class: RouteClass, status: StatusCode, errors: Vec<String>) -> Self {
        Self {
            tenant: &context.tenant,
            app: context.app_name(),
            class: class.as_str(),
            status: status.as_u16(),
            errors,
        }
    }

    fn into_response(self) -> Response<GatewayBody> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        json_response(status, body)
    }
}

pub struct Dispatcher {
    resolver: PathResolver,
    registry: Arc<dyn ActivationStore>,
    /// Tenants with a kick-off sent or already acknowledged
    kicked: Arc<DashSet<String>>,
    prober: LivenessProber,
    orchestrator: Orchestrator,
    proxy: ReverseProxy,
    pool: Arc<ConnectionPool>,
    intent_marker: String,
    tenant_gate: TenantGate,
}

impl Dispatcher {
    /// Build the dispatcher and its collaborators from configuration
    pub fn from_config(config: &Config, registry: Arc<dyn ActivationStore>) -> anyhow::Result<Self> {
        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };
        let pool = Arc::new(ConnectionPool::new(pool_config, config.upstream_addrs()?));

        let tenant_header = HeaderName::from_bytes(config.activation.tenant_header.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid tenant header '{}': {}", config.activation.tenant_header, e))?;

        Ok(Self {
            resolver: PathResolver::new(config.naming.clone()),
            registry,
            kicked: Arc::new(DashSet::new()),
            prober: LivenessProber::new(
                Arc::clone(&pool),
                config.activation.probe_path.clone(),
                config.activation.probe_timeout(),
            ),
            orchestrator: Orchestrator::new(&config.orchestration)?,
            proxy: ReverseProxy::new(Arc::clone(&pool), tenant_header, config.server.request_timeout()),
            pool,
            intent_marker: config.activation.intent_marker.clone(),
            tenant_gate: config.activation.tenant_gate,
        })
    }

    pub fn registry(&self) -> &Arc<dyn ActivationStore> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Handle a classified request
    pub async fn dispatch(&self, req: Request<Incoming>, route: Route, request_id: &str) -> Response<GatewayBody> {
        match route {
            Route::Echo => text_response(StatusCode::OK, "echo"),
            Route::NotFound => text_response(StatusCode::NOT_FOUND, "not found"),
            Route::MethodNotAllowed => json_error_response(
                GatewayErrorCode::MethodNotAllowed,
                format!("Method {} not allowed on {}", req.method(), req.uri().path()),
            ),
            Route::Loading => self.serve_loading(req, "", request_id).await,
            Route::Tenant { class, context } => {
                if let Err(e) = check_identifier("tenant", &context.tenant) {
                    warn!(tenant = %context.tenant, error = %e, "Rejected tenant identifier");
                    return e.to_response();
                }
                if let Some(redirect) = self.verify_tenant(&req, class, &context) {
                    return redirect;
                }
                match class {
                    RouteClass::TenantRoot => self.serve_loading(req, &context.tenant, request_id).await,
                    RouteClass::Frontend | RouteClass::Backend => {
                        self.serve_app(req, class, &context, request_id).await
                    }
                }
            }
        }
    }

    /// Check the registry for the request's tenant.
    ///
    /// For an unknown tenant, provisioning is kicked off without waiting for
    /// it and the client is bounced back to the tenant root. The tenant is
    /// recorded once the orchestration service accepts the kick-off.
    fn verify_tenant(
        &self,
        req: &Request<Incoming>,
        class: RouteClass,
        context: &RequestContext,
    ) -> Option<Response<GatewayBody>> {
        let gated = class == RouteClass::TenantRoot || self.tenant_gate == TenantGate::All;
        if !gated || self.registry.contains(&context.tenant) {
            return None;
        }

        // Only one kick-off per tenant is outstanding at a time
        if self.kicked.insert(context.tenant.clone()) {
            self.kick_tenant(&context.tenant);
        }

        let location = format!("http://{}/{}", request_host(req), context.tenant);
        info!(tenant = %context.tenant, location, "Unknown tenant, redirecting while it is provisioned");

        Some(
            Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(hyper::header::LOCATION, location.as_str())
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(full_body("Temporary Redirect"))
                .unwrap_or_else(|e| {
                    error!(tenant = %context.tenant, error = %e, "Invalid redirect location");
                    json_error_response(GatewayErrorCode::InternalError, "Invalid redirect location")
                }),
        )
    }

    /// Fire the tenant activation call in the background.
    ///
    /// A success status records the tenant. Anything else releases the
    /// kick-off so the next request for the tenant tries again.
    fn kick_tenant(&self, tenant: &str) {
        let orchestrator = self.orchestrator.clone();
        let registry = Arc::clone(&self.registry);
        let kicked = Arc::clone(&self.kicked);
        let tenant = tenant.to_string();
        tokio::spawn(async move {
            match orchestrator.activate_tenant(&tenant).await {
                Ok(status) if status.is_success() => {
                    registry.mark_active(&tenant);
                }
                Ok(status) => {
                    warn!(tenant, status = status.as_u16(), "Tenant activation rejected");
                    kicked.remove(&tenant);
                }
                Err(e) => {
                    warn!(tenant, error = %e, "Tenant activation failed");
                    kicked.remove(&tenant);
                }
            }
        });
    }

    /// Forward to the shared loading service; no liveness check
    async fn serve_loading(&self, req: Request<Incoming>, tenant: &str, request_id: &str) -> Response<GatewayBody> {
        let target = match self
            .resolver
            .resolve(RouteClass::TenantRoot, tenant, "", req.uri().path())
        {
            Ok(target) => target,
            Err(e) => {
                error!(tenant, error = %e, "Failed to resolve loading target");
                return e.to_response();
            }
        };

        self.proxy.forward(req, &target, request_id).await
    }

    /// Frontend and backend requests: probe, then forward or activate
    async fn serve_app(
        &self,
        req: Request<Incoming>,
        class: RouteClass,
        context: &RequestContext,
        request_id: &str,
    ) -> Response<GatewayBody> {
        let target = match self
            .resolver
            .resolve(class, &context.tenant, context.app_name(), req.uri().path())
        {
            Ok(target) => target,
            Err(e) => {
                error!(tenant = %context.tenant, app = context.app_name(), class = %class, error = %e, "Failed to resolve target");
                return e.to_response();
            }
        };

        match self.prober.probe(&target).await {
            ProbeOutcome::Reachable(_) => self.proxy.forward(req, &target, request_id).await,
            ProbeOutcome::NotProvisioned { status, reason } => {
                // Backends match against the full request target, query included
                let intent_source = match class {
                    RouteClass::Backend => req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str())
                        .unwrap_or_else(|| req.uri().path()),
                    _ => req.uri().path(),
                };

                if wants_activation(intent_source, &self.intent_marker) {
                    return self.activate(class, context, target.port).await;
                }

                debug!(host = %target.host, status = status.as_u16(), reason, "Target not provisioned");
                GatewayError::UpstreamUnavailable {
                    host: target.host,
                    status,
                    reason,
                }
                .to_response()
            }
        }
    }

    /// Ask the orchestration service for the app and relay its status.
    ///
    /// The client's request is not replayed.
    async fn activate(&self, class: RouteClass, context: &RequestContext, port: u16) -> Response<GatewayBody> {
        let result = self
            .orchestrator
            .activate_app(&context.tenant, class, context.app_name(), port)
            .await;

        match result {
            Ok(status) => ActivationReport::new(context, class, status, Vec::new()).into_response(),
            // A failed backend activation is fatal for the request
            Err(e) if class == RouteClass::Backend => {
                error!(tenant = %context.tenant, app = context.app_name(), error = %e, "Backend activation failed");
                e.to_response()
            }
            // Frontends still get a report, carrying the error and the probe's status
            Err(e) => {
                warn!(tenant = %context.tenant, app = context.app_name(), error = %e, "Frontend activation failed");
                ActivationReport::new(context, class, StatusCode::BAD_GATEWAY, vec![e.to_string()]).into_response()
            }
        }
    }
}

/// Host the client addressed, for building redirects
fn request_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string())
}
