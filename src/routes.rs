//! Route table for inbound requests
//!
//! Turns `(method, path)` into a [`Route`], extracting the typed
//! [`RequestContext`] for tenant-scoped requests.

use crate::resolver::RouteClass;
use hyper::Method;

/// Identifiers extracted from a tenant-scoped request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Tenant identifier, never empty
    pub tenant: String,
    /// Application identifier, absent for tenant-root requests
    pub app: Option<String>,
}

impl RequestContext {
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            app: None,
        }
    }

    pub fn app(tenant: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            app: Some(app.into()),
        }
    }

    pub fn app_name(&self) -> &str {
        self.app.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /echo`
    Echo,
    /// `GET /loading`, `GET /loading/*`
    Loading,
    /// Tenant root, frontend or backend request
    Tenant {
        class: RouteClass,
        context: RequestContext,
    },
    /// Known pattern, unsupported method
    MethodNotAllowed,
    NotFound,
}

/// Classify a request.
///
/// One segment (or a trailing slash after it) is a tenant root; two or more
/// segments are a frontend request unless the third segment is `api`.
pub fn classify(method: &Method, path: &str) -> Route {
    let get_only = |route: Route| {
        if method == Method::GET {
            route
        } else {
            Route::MethodNotAllowed
        }
    };

    if path == "/echo" {
        return get_only(Route::Echo);
    }

    let mut segments = path.strip_prefix('/').unwrap_or(path).split('/');

    let tenant = segments.next().unwrap_or("");
    if tenant.is_empty() {
        return Route::NotFound;
    }
    if tenant == "loading" {
        return get_only(Route::Loading);
    }

    let app = segments.next().unwrap_or("");
    if app.is_empty() {
        return get_only(Route::Tenant {
            class: RouteClass::TenantRoot,
            context: RequestContext::tenant(tenant),
        });
    }

    let class = match segments.next() {
        Some("api") => RouteClass::Backend,
        _ => RouteClass::Frontend,
    };

    if method == Method::GET || method == Method::POST {
        Route::Tenant {
            class,
            context: RequestContext::app(tenant, app),
        }
    } else {
        Route::MethodNotAllowed
    }
}

/// Whether the request target signals that the caller wants the service
/// provisioned.
///
/// This is a plain substring match, so any app path containing the marker
/// also triggers activation.
pub fn wants_activation(target: &str, marker: &str) -> bool {
    target.contains(marker)
}
