//! Maps tenant/app identifiers and request paths onto target services
//!
//! Resolution is pure: the same inputs always produce the same
//! [`TargetDescriptor`], and nothing is cached between requests.

use crate::config::{NamingConfig, APP_PLACEHOLDER, TENANT_PLACEHOLDER};
use crate::error::GatewayError;
use hyper::Uri;
use std::fmt;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// The three classes of tenant-scoped requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Tenant root and loading pages, served by the shared loading service
    TenantRoot,
    /// An app's frontend deployment
    Frontend,
    /// An app's backend deployment
    Backend,
}

impl RouteClass {
    /// Leading path segments that identify the route rather than the target path
    pub fn skipped_segments(&self) -> i64 {
        match self {
            RouteClass::TenantRoot => 1,
            RouteClass::Frontend | RouteClass::Backend => 2,
        }
    }

    /// App type as understood by the orchestration service
    pub fn app_type(&self) -> Option<&'static str> {
        match self {
            RouteClass::TenantRoot => None,
            RouteClass::Frontend => Some("frontend"),
            RouteClass::Backend => Some("backend"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::TenantRoot => "tenant",
            RouteClass::Frontend => "frontend",
            RouteClass::Backend => "backend",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Request path with the routing segments removed
    pub path: String,
}

impl TargetDescriptor {
    /// `host:port` of the target service
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tenant tag derived from the host: everything before the first `-`
    pub fn tenant_tag(&self) -> &str {
        self.host.split('-').next().unwrap_or(&self.host)
    }

    /// Full URL of the forwarded request, preserving the client's query string
    pub fn uri_with_query(&self, query: Option<&str>) -> Result<Uri, GatewayError> {
        let mut url = format!("{}://{}{}", self.scheme, self.authority(), self.path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url.parse::<Uri>().map_err(|e| GatewayError::InvalidTarget {
            target: url.clone(),
            reason: e.to_string(),
        })
    }
}

/// Return the suffix of `path` starting at its `(n + 1)`-th `/`.
///
/// Falls back to `/` when `n` is negative or the path has too few separators.
pub fn skip_path_params(path: &str, n: i64) -> &str {
    if n < 0 {
        return "/";
    }

    let mut slash_count: i64 = 0;
    for (i, c) in path.char_indices() {
        if c == '/' {
            slash_count += 1;
        }
        if slash_count == n + 1 {
            return &path[i..];
        }
    }

    "/"
}

/// Synthesizes target descriptors from the configured naming convention
#[derive(Debug, Clone)]
pub struct PathResolver {
    naming: NamingConfig,
}

impl PathResolver {
    pub fn new(naming: NamingConfig) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    /// Port the service of the given class listens on
    pub fn port_for(&self, class: RouteClass) -> u16 {
        match class {
            RouteClass::TenantRoot => self.naming.loading_port,
            RouteClass::Frontend => self.naming.frontend_port,
            RouteClass::Backend => self.naming.backend_port,
        }
    }

    /// Host of the service for `(tenant, app)` in the given class
    pub fn host_for(&self, class: RouteClass, tenant: &str, app: &str) -> String {
        let template = match class {
            RouteClass::TenantRoot => return self.naming.loading_host.clone(),
            RouteClass::Frontend => &self.naming.frontend_host,
            RouteClass::Backend => &self.naming.backend_host,
        };
        template
            .replace(TENANT_PLACEHOLDER, tenant)
            .replace(APP_PLACEHOLDER, app)
    }

    /// Resolve a request into its target.
    ///
    /// Fails with [`GatewayError::InvalidTarget`] when the tenant or app is
    /// not a single DNS label, the synthesized host is not a valid DNS name,
    /// or the resulting URL does not parse. An empty tenant is accepted for
    /// the shared loading service only.
    pub fn resolve(
        &self,
        class: RouteClass,
        tenant: &str,
        app: &str,
        request_path: &str,
    ) -> Result<TargetDescriptor, GatewayError> {
        if class != RouteClass::TenantRoot || !tenant.is_empty() {
            check_identifier("tenant", tenant)?;
        }
        if class != RouteClass::TenantRoot {
            check_identifier("app", app)?;
        }

        let host = self.host_for(class, tenant, app);
        let target = TargetDescriptor {
            scheme: self.naming.scheme.clone(),
            port: self.port_for(class),
            path: skip_path_params(request_path, class.skipped_segments()).to_string(),
            host,
        };

        if let Err(reason) = validate_host(&target.host) {
            return Err(GatewayError::InvalidTarget {
                target: format!("{}://{}", target.scheme, target.authority()),
                reason,
            });
        }

        target.uri_with_query(None)?;
        Ok(target)
    }
}

/// Check that a tenant or app identifier is exactly one DNS label.
///
/// Identifiers are spliced into host names and orchestration URLs, so a dot
/// or a path separator would let a request address a foreign zone or path.
pub fn check_identifier(kind: &str, value: &str) -> Result<(), GatewayError> {
    validate_label(value).map_err(|reason| GatewayError::InvalidTarget {
        target: format!("{} '{}'", kind, value),
        reason,
    })
}

fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("empty label".to_string());
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!("label longer than {} characters", MAX_LABEL_LEN));
    }
    if let Some(c) = label.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(format!("invalid character {:?} in label", c));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("label '{}' starts or ends with '-'", label));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("empty host".to_string());
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(format!("host longer than {} characters", MAX_HOSTNAME_LEN));
    }
    host.split('.').try_for_each(validate_label)
}
