//! Reverse proxy: forwards a request to its resolved target
//!
//! Single target, single attempt. Request and response bodies stream through
//! without being buffered.

use crate::error::{full_body, json_error_response, GatewayBody, GatewayErrorCode};
use crate::pool::ConnectionPool;
use crate::resolver::TargetDescriptor;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upper bound on the upstream's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

pub struct ReverseProxy {
    pool: Arc<ConnectionPool>,
    tenant_header: HeaderName,
    request_timeout: Duration,
}

impl ReverseProxy {
    pub fn new(pool: Arc<ConnectionPool>, tenant_header: HeaderName, request_timeout: Duration) -> Self {
        Self {
            pool,
            tenant_header,
            request_timeout,
        }
    }

    /// Forward `req` to `target`, tagging it with the originating tenant
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: &TargetDescriptor,
        request_id: &str,
    ) -> Response<GatewayBody> {
        let tenant = target.tenant_tag();
        match HeaderValue::from_str(tenant) {
            Ok(value) => {
                req.headers_mut().insert(self.tenant_header.clone(), value);
            }
            Err(e) => warn!(host = %target.host, error = %e, "Tenant tag is not a valid header value"),
        }

        if is_upgrade_request(&req) {
            return self.tunnel(req, target, request_id).await;
        }

        strip_hop_by_hop(req.headers_mut());

        debug!(
            host = %target.host,
            path = %target.path,
            tenant,
            request_id,
            "Forwarding request"
        );

        let result = tokio::time::timeout(self.request_timeout, self.pool.send_request(req, target)).await;

        match result {
            Ok(Ok(mut response)) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Ok(Err(e)) => {
                error!(host = %target.host, request_id, error = %e, "Failed to forward request");
                json_error_response(
                    GatewayErrorCode::ProxyFailed,
                    format!("Failed to reach {}", target.host),
                )
            }
            Err(_) => {
                warn!(
                    host = %target.host,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    /// Relay an HTTP/1.1 upgrade (e.g. WebSocket) to the target
    async fn tunnel(
        &self,
        req: Request<Incoming>,
        target: &TargetDescriptor,
        request_id: &str,
    ) -> Response<GatewayBody> {
        let upgrade_type = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(host = %target.host, request_id, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req, target);
        let addr = self.pool.connect_authority(target);

        let connect = tokio::time::timeout(self.request_timeout, TcpStream::connect(&addr)).await;
        let mut upstream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(host = %target.host, addr, error = %e, "Failed to connect for upgrade");
                return json_error_response(
                    GatewayErrorCode::ProxyFailed,
                    format!("Failed to reach {}", target.host),
                );
            }
            Err(_) => {
                return json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!("Connecting to {} timed out", target.host),
                );
            }
        };

        if let Err(e) = upstream.write_all(&raw_request).await {
            error!(host = %target.host, error = %e, "Failed to send upgrade request");
            return json_error_response(GatewayErrorCode::ProxyFailed, "Failed to send upgrade request");
        }

        let head = match tokio::time::timeout(self.request_timeout, read_response_head(&mut upstream)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                error!(host = %target.host, error = %e, "Failed to read upgrade response");
                return json_error_response(GatewayErrorCode::ProxyFailed, "Invalid upgrade response from target");
            }
            Err(_) => {
                return json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!("Upgrade response from {} timed out", target.host),
                );
            }
        };

        let Some((status, headers)) = parse_response_head(&head.head) else {
            error!(host = %target.host, "Failed to parse upgrade response");
            return json_error_response(GatewayErrorCode::ProxyFailed, "Invalid upgrade response from target");
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(host = %target.host, status = %status, "Target rejected upgrade request");
            let mut response = Response::builder().status(status);
            for (name, value) in &headers {
                let lower = name.to_ascii_lowercase();
                if HOP_BY_HOP.contains(&lower.as_str()) || lower == "content-length" {
                    continue;
                }
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(full_body(head.rest))
                .unwrap_or_else(|_| json_error_response(GatewayErrorCode::ProxyFailed, "Invalid upgrade response from target"));
        }

        info!(host = %target.host, request_id, upgrade_type, "Upgrade accepted by target");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
            Ok(response) => response,
            Err(e) => {
                error!(host = %target.host, error = %e, "Invalid upgrade response headers");
                return json_error_response(GatewayErrorCode::ProxyFailed, "Invalid upgrade response from target");
            }
        };

        let host = target.host.clone();
        let request_id = request_id.to_string();
        let early_bytes = head.rest;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    relay(upgraded, upstream, early_bytes, &host, &request_id).await;
                }
                Err(e) => {
                    error!(host, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Whether the request asks for a protocol upgrade
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Raw HTTP/1.1 upgrade request for the target, with the rewritten path
fn build_upgrade_request(req: &Request<Incoming>, target: &TargetDescriptor) -> Vec<u8> {
    let path = match req.uri().query() {
        Some(query) => format!("{}?{}", target.path, query),
        None => target.path.clone(),
    };
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        request.push_str(&format!("host: {}\r\n", target.authority()));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

struct ResponseHead {
    head: Vec<u8>,
    /// Bytes read past the end of the head
    rest: Vec<u8>,
}

async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<ResponseHead> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "target closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok(ResponseHead { head: buf, rest });
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Parse status line and headers of a raw HTTP/1.1 response head
fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;
    let status = StatusCode::from_u16(status).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Copy bytes both ways between the upgraded client and the target
async fn relay(client: Upgraded, mut upstream: TcpStream, early_bytes: Vec<u8>, host: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early_bytes.is_empty() {
        if let Err(e) = client_io.write_all(&early_bytes).await {
            debug!(host, request_id, error = %e, "Failed to relay early upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((client_to_target, target_to_client)) => {
            debug!(
                host,
                request_id,
                client_to_target,
                target_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(host, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
