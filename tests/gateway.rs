//! End-to-end tests: the gateway in front of in-process mock services

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use activator::admin::AdminServer;
use activator::config::{Config, TenantGate};
use activator::dispatch::Dispatcher;
use activator::proxy::GatewayServer;
use activator::registry::{ActivationRegistry, ActivationStore};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// ============================================================================
// Mock services
// ============================================================================

/// A request as seen by a mock service
#[derive(Debug, Clone)]
struct Hit {
    method: String,
    uri: String,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Clone)]
struct MockBehavior {
    /// Status answered on the probe path
    probe_status: StatusCode,
    /// Status answered on every other path
    status: StatusCode,
    body: &'static str,
    delay: Option<Duration>,
}

impl MockBehavior {
    fn healthy(status: StatusCode, body: &'static str) -> Self {
        Self {
            probe_status: StatusCode::OK,
            status,
            body,
            delay: None,
        }
    }
}

struct MockService {
    addr: SocketAddr,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl MockService {
    fn hits(&self) -> Vec<Hit> {
        self.hits.lock().clone()
    }

    fn paths(&self) -> Vec<String> {
        self.hits().into_iter().map(|h| h.uri).collect()
    }

    fn count(&self, uri: &str) -> usize {
        self.hits().iter().filter(|h| h.uri == uri).count()
    }
}

async fn start_mock(behavior: MockBehavior) -> MockService {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let recorded = Arc::clone(&recorded);
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = Arc::clone(&recorded);
                    let behavior = behavior.clone();
                    async move { Ok::<_, Infallible>(mock_response(req, recorded, behavior).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    MockService { addr, hits }
}

async fn mock_response(
    req: Request<Incoming>,
    recorded: Arc<Mutex<Vec<Hit>>>,
    behavior: MockBehavior,
) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
        .unwrap_or_default();

    let is_probe = uri == "/echo";
    recorded.lock().push(Hit {
        method,
        uri,
        headers,
        body,
    });

    if is_probe {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"echo")));
        *resp.status_mut() = behavior.probe_status;
        return resp;
    }

    if let Some(delay) = behavior.delay {
        tokio::time::sleep(delay).await;
    }

    let mut resp = Response::new(Full::new(Bytes::from_static(behavior.body.as_bytes())));
    *resp.status_mut() = behavior.status;
    resp.headers_mut().insert("x-mock", "1".parse().unwrap());
    resp
}

/// An address nothing listens on
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// ============================================================================
// Gateway harness
// ============================================================================

struct Gateway {
    addr: SocketAddr,
    registry: Arc<ActivationRegistry>,
    dispatcher: Arc<Dispatcher>,
    _shutdown: watch::Sender<bool>,
}

fn base_config(orchestrator: SocketAddr) -> Config {
    let mut config = Config::default();
    config.server.admin_port = 0;
    config.orchestration.url = format!("http://{}", orchestrator);
    config.orchestration.timeout_secs = 2;
    config.activation.probe_timeout_secs = 2;
    config
}

fn pin(config: &mut Config, host: &str, addr: SocketAddr) {
    config.upstreams.insert(host.to_string(), addr.to_string());
}

async fn start_gateway(config: Config) -> Gateway {
    config.validate().unwrap();

    let registry = Arc::new(ActivationRegistry::new());
    let dispatcher = Arc::new(Dispatcher::from_config(&config, registry.clone()).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(addr, Arc::clone(&dispatcher), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Gateway {
        addr,
        registry,
        dispatcher,
        _shutdown: shutdown_tx,
    }
}

// ============================================================================
// Raw HTTP client
// ============================================================================

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

fn parse_response(raw: &str) -> HttpResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

async fn send(addr: SocketAddr, request: String) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    parse_response(&raw)
}

async fn http_get(addr: SocketAddr, path: &str) -> HttpResponse {
    http_get_with_headers(addr, path, &[]).await
}

async fn http_get_with_headers(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let extra: String = headers.iter().map(|(k, v)| format!("{}: {}\r\n", k, v)).collect();
    send(
        addr,
        format!(
            "GET {} HTTP/1.1\r\nHost: gw.local\r\n{}Connection: close\r\n\r\n",
            path, extra
        ),
    )
    .await
}

async fn http_post(addr: SocketAddr, path: &str, body: &str) -> HttpResponse {
    send(
        addr,
        format!(
            "POST {} HTTP/1.1\r\nHost: gw.local\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path,
            body.len(),
            body
        ),
    )
    .await
}

async fn http_get_with_auth(addr: SocketAddr, path: &str, token: &str) -> HttpResponse {
    let authorization = format!("Bearer {}", token);
    http_get_with_headers(addr, path, &[("Authorization", authorization.as_str())]).await
}

/// Poll until `check` holds or two seconds pass
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

// ============================================================================
// Static routes
// ============================================================================

#[tokio::test]
async fn test_echo_and_root() {
    let gateway = start_gateway(base_config(closed_addr())).await;

    let resp = http_get(gateway.addr, "/echo").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "echo");

    let resp = http_get(gateway.addr, "/").await;
    assert_eq!(resp.status, 404);
    assert_eq!(resp.body, "not found");
}

#[tokio::test]
async fn test_unsupported_method() {
    let gateway = start_gateway(base_config(closed_addr())).await;

    let resp = http_post(gateway.addr, "/echo", "{}").await;
    assert_eq!(resp.status, 405);
    assert_eq!(resp.header("X-Gateway-Error"), Some("METHOD_NOT_ALLOWED"));
}

#[tokio::test]
async fn test_loading_route_skips_liveness_check() {
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "spinner")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/loading/spinner.gif").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "spinner");
    assert_eq!(loading.paths(), vec!["/spinner.gif".to_string()]);
}

// ============================================================================
// Tenant roots
// ============================================================================

#[tokio::test]
async fn test_unknown_tenant_is_redirected_and_provisioned() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 307);
    assert_eq!(resp.header("Location"), Some("http://gw.local/acme"));
    assert!(eventually(|| orchestrator.count("/acme") == 1).await);
    assert!(eventually(|| gateway.registry.contains("acme")).await);
    assert!(loading.hits().is_empty());

    // Follow the redirect: now forwarded to the loading service
    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "loading page");

    let hits = loading.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, "/");
    assert_eq!(hits[0].headers.get("tenant").map(String::as_str), Some("service"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.count("/acme"), 1);
}

#[tokio::test]
async fn test_concurrent_first_requests_provision_once() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let addr = gateway.addr;
        handles.push(tokio::spawn(async move { http_get(addr, "/globex").await.status }));
    }
    for handle in handles {
        let status = handle.await.unwrap();
        // Requests that arrive after the tenant is recorded go to the loading service
        assert!(status == 307 || status == 200, "unexpected status {}", status);
    }

    assert!(eventually(|| orchestrator.count("/globex") == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.count("/globex"), 1);
}

#[tokio::test]
async fn test_failed_kick_off_is_retried() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::SERVICE_UNAVAILABLE, "down")).await;
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 307);
    assert!(eventually(|| orchestrator.count("/acme") == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!gateway.registry.contains("acme"));

    // Still unknown, so the next request kicks provisioning again
    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 307);
    assert!(eventually(|| orchestrator.count("/acme") == 2).await);
    assert!(!gateway.registry.contains("acme"));
    assert!(loading.hits().is_empty());
}

#[tokio::test]
async fn test_unreachable_orchestrator_leaves_tenant_unknown() {
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 307);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!gateway.registry.contains("acme"));

    let resp = http_get(gateway.addr, "/acme").await;
    assert_eq!(resp.status, 307);
    assert!(loading.hits().is_empty());
}

#[tokio::test]
async fn test_dotted_tenant_is_rejected() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let gateway = start_gateway(base_config(orchestrator.addr)).await;

    let resp = http_get(gateway.addr, "/evil.example").await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header("X-Gateway-Error"), Some("INVALID_TARGET"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.hits().is_empty());
    assert!(!gateway.registry.contains("evil.example"));
}

#[tokio::test]
async fn test_registered_tenant_is_not_reprovisioned() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "service-frontend-loading", loading.addr);
    let gateway = start_gateway(config).await;
    gateway.registry.mark_active("acme");

    let resp = http_get(gateway.addr, "/acme/").await;
    assert_eq!(resp.status, 200);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.hits().is_empty());
}

#[tokio::test]
async fn test_gate_all_redirects_app_requests() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let mut config = base_config(orchestrator.addr);
    config.activation.tenant_gate = TenantGate::All;
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/initech/dashboard/reports").await;
    assert_eq!(resp.status, 307);
    assert_eq!(resp.header("Location"), Some("http://gw.local/initech"));
    assert!(eventually(|| orchestrator.count("/initech") == 1).await);
}

// ============================================================================
// Frontends
// ============================================================================

#[tokio::test]
async fn test_reachable_frontend_is_forwarded() {
    let frontend = start_mock(MockBehavior::healthy(StatusCode::SERVICE_UNAVAILABLE, "busy")).await;
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-frontend-dashboard", frontend.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get_with_headers(
        gateway.addr,
        "/acme/dashboard/some/page?x=1",
        &[
            ("Tenant", "evil"),
            ("X-Forwarded-For", "1.2.3.4"),
            ("Proxy-Authorization", "Basic Zm9vOmJhcg=="),
        ],
    )
    .await;

    // The app's own error status is relayed, not treated as missing
    assert_eq!(resp.status, 503);
    assert_eq!(resp.body, "busy");
    assert_eq!(resp.header("x-mock"), Some("1"));

    let hits = frontend.hits();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].uri, "/echo");
    assert_eq!(
        hits[0].headers.get("host").map(String::as_str),
        Some("acme-frontend-dashboard:80")
    );

    let forwarded = &hits[1];
    assert_eq!(forwarded.method, "GET");
    assert_eq!(forwarded.uri, "/some/page?x=1");
    assert_eq!(forwarded.headers.get("tenant").map(String::as_str), Some("acme"));
    assert_eq!(forwarded.headers.get("host").map(String::as_str), Some("gw.local"));
    assert_eq!(forwarded.headers.get("x-forwarded-for").map(String::as_str), Some("127.0.0.1"));
    assert_eq!(forwarded.headers.get("x-forwarded-host").map(String::as_str), Some("gw.local"));
    assert_eq!(forwarded.headers.get("x-forwarded-proto").map(String::as_str), Some("http"));
    assert!(forwarded.headers.contains_key("x-request-id"));
    assert!(!forwarded.headers.contains_key("proxy-authorization"));

    assert!(orchestrator.hits().is_empty());
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let frontend = start_mock(MockBehavior::healthy(StatusCode::OK, "page")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-dashboard", frontend.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get_with_headers(gateway.addr, "/acme/dashboard", &[("X-Request-ID", "req-42")]).await;
    assert_eq!(resp.status, 200);

    let hits = frontend.hits();
    assert_eq!(hits[1].uri, "/");
    assert_eq!(hits[1].headers.get("x-request-id").map(String::as_str), Some("req-42"));
}

#[tokio::test]
async fn test_unreachable_frontend_without_intent() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-frontend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard").await;
    assert_eq!(resp.status, 502);
    assert_eq!(resp.header("X-Gateway-Error"), Some("UPSTREAM_UNAVAILABLE"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.hits().is_empty());
}

#[tokio::test]
async fn test_bad_gateway_probe_means_not_provisioned() {
    let frontend = start_mock(MockBehavior {
        probe_status: StatusCode::BAD_GATEWAY,
        status: StatusCode::OK,
        body: "page",
        delay: None,
    })
    .await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-dashboard", frontend.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard").await;
    assert_eq!(resp.status, 502);
    assert_eq!(frontend.paths(), vec!["/echo".to_string()]);
}

#[tokio::test]
async fn test_frontend_activation_relays_orchestrator_status() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-frontend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard/activate").await;
    assert_eq!(resp.status, 200);
    assert!(resp.body.contains("\"status\":200"));
    assert!(resp.body.contains("\"class\":\"frontend\""));
    assert_eq!(orchestrator.paths(), vec!["/acme/frontend/dashboard/80".to_string()]);
}

#[tokio::test]
async fn test_frontend_activation_relays_conflict() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::CONFLICT, "exists")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-frontend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_post(gateway.addr, "/acme/dashboard/activate", "").await;
    assert_eq!(resp.status, 409);
    assert_eq!(orchestrator.count("/acme/frontend/dashboard/80"), 1);
}

#[tokio::test]
async fn test_dotted_app_is_rejected() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let gateway = start_gateway(base_config(orchestrator.addr)).await;

    let resp = http_get(gateway.addr, "/acme/x.evil.com/activate").await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header("X-Gateway-Error"), Some("INVALID_TARGET"));

    let resp = http_get(gateway.addr, "/acme/x.evil.com/api/items").await;
    assert_eq!(resp.status, 500);

    assert!(orchestrator.hits().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_cancels_probe() {
    // Accepts the probe, never answers, reports when the gateway hangs up
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let (probed_tx, probed_rx) = tokio::sync::oneshot::channel();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = silent.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let _ = probed_tx.send(String::from_utf8_lossy(&head).to_string());
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    let mut config = base_config(closed_addr());
    config.activation.probe_timeout_secs = 30;
    pin(&mut config, "acme-frontend-web", silent_addr);
    let gateway = start_gateway(config).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /acme/web HTTP/1.1\r\nHost: gw.local\r\n\r\n")
        .await
        .unwrap();

    let probe = tokio::time::timeout(Duration::from_secs(5), probed_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(probe.starts_with("GET /echo "));

    drop(client);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("probe connection still open after client left")
        .unwrap();
}

#[tokio::test]
async fn test_frontend_activation_transport_failure() {
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard/activate").await;
    assert_eq!(resp.status, 502);
    assert!(resp.body.contains("\"status\":502"));
    assert!(!resp.body.contains("\"errors\":[]"));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let frontend = start_mock(MockBehavior {
        probe_status: StatusCode::OK,
        status: StatusCode::OK,
        body: "late",
        delay: Some(Duration::from_secs(3)),
    })
    .await;
    let mut config = base_config(closed_addr());
    config.server.request_timeout_secs = 1;
    pin(&mut config, "acme-frontend-dashboard", frontend.addr);
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard").await;
    assert_eq!(resp.status, 504);
    assert_eq!(resp.header("X-Gateway-Error"), Some("REQUEST_TIMEOUT"));
}

// ============================================================================
// Backends
// ============================================================================

#[tokio::test]
async fn test_backend_post_is_forwarded_with_body() {
    let backend = start_mock(MockBehavior::healthy(StatusCode::CREATED, "created")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-backend-dashboard", backend.addr);
    let gateway = start_gateway(config).await;

    let resp = http_post(gateway.addr, "/acme/dashboard/api/items", r#"{"name":"widget"}"#).await;
    assert_eq!(resp.status, 201);
    assert_eq!(resp.body, "created");

    let hits = backend.hits();
    assert_eq!(hits.len(), 2);
    assert_eq!(
        hits[0].headers.get("host").map(String::as_str),
        Some("acme-backend-dashboard:81")
    );
    assert_eq!(hits[1].method, "POST");
    assert_eq!(hits[1].uri, "/api/items");
    assert_eq!(hits[1].body, r#"{"name":"widget"}"#);
    assert_eq!(hits[1].headers.get("tenant").map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn test_backend_activation_from_query() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::ACCEPTED, "queued")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-backend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard/api/items?activate=1").await;
    assert_eq!(resp.status, 202);
    assert_eq!(orchestrator.paths(), vec!["/acme/backend/dashboard/81".to_string()]);
}

#[tokio::test]
async fn test_backend_activation_transport_failure() {
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-backend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_get(gateway.addr, "/acme/dashboard/api/activate").await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header("X-Gateway-Error"), Some("ACTIVATION_FAILED"));
}

#[tokio::test]
async fn test_unreachable_backend_without_intent() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "acme-backend-dashboard", closed_addr());
    let gateway = start_gateway(config).await;

    let resp = http_post(gateway.addr, "/acme/dashboard/api/items", "{}").await;
    assert_eq!(resp.status, 502);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.hits().is_empty());
}

// ============================================================================
// Admin API
// ============================================================================

#[tokio::test]
async fn test_admin_api() {
    let frontend = start_mock(MockBehavior::healthy(StatusCode::OK, "page")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-dashboard", frontend.addr);
    let gateway = start_gateway(config).await;
    gateway.registry.mark_active("acme");
    gateway.registry.mark_active("globex");

    let resp = http_get(gateway.addr, "/acme/dashboard").await;
    assert_eq!(resp.status, 200);

    let (_tx, rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();
    let admin = AdminServer::new(admin_addr, Arc::clone(&gateway.dispatcher), rx, "secret".to_string());
    tokio::spawn(async move {
        let _ = admin.serve(listener).await;
    });

    let resp = http_get(admin_addr, "/health").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "ok");

    let resp = http_get(admin_addr, "/version").await;
    assert_eq!(resp.status, 200);
    assert!(resp.body.contains("\"name\":\"activator\""));

    let resp = http_get(admin_addr, "/tenants").await;
    assert_eq!(resp.status, 401);

    let resp = http_get_with_auth(admin_addr, "/tenants", "wrong").await;
    assert_eq!(resp.status, 401);

    let resp = http_get_with_auth(admin_addr, "/tenants", "secret").await;
    assert_eq!(resp.status, 200);
    let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(body["count"], 2);
    assert_eq!(body["tenants"], serde_json::json!(["acme", "globex"]));

    let resp = http_get_with_auth(admin_addr, "/stats", "secret").await;
    assert_eq!(resp.status, 200);
    let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(body["probes"], 1);
    assert_eq!(body["proxied_requests"], 1);

    let resp = http_get(admin_addr, "/backends").await;
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn test_upstreams_can_be_replaced() {
    let first = start_mock(MockBehavior::healthy(StatusCode::OK, "first")).await;
    let second = start_mock(MockBehavior::healthy(StatusCode::OK, "second")).await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-dashboard", first.addr);
    let gateway = start_gateway(config).await;

    assert_eq!(http_get(gateway.addr, "/acme/dashboard").await.body, "first");

    let mut upstreams = HashMap::new();
    upstreams.insert("acme-frontend-dashboard".to_string(), second.addr);
    gateway.dispatcher.pool().replace_upstreams(upstreams);

    assert_eq!(http_get(gateway.addr, "/acme/dashboard").await.body, "second");
}

// ============================================================================
// Upgrades
// ============================================================================

/// Read from `stream` until the end of an HTTP head
async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Answers probes with 200 and echoes raw bytes after accepting an upgrade
async fn start_upgrade_echo() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let heads = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&heads);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                recorded.lock().push(head.clone());

                if head.starts_with("GET /echo ") {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\necho")
                        .await;
                    return;
                }

                let _ = stream
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
                    .await;
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    (addr, heads)
}

#[tokio::test]
async fn test_upgrade_is_tunnelled() {
    let (upstream, heads) = start_upgrade_echo().await;
    let mut config = base_config(closed_addr());
    pin(&mut config, "acme-frontend-chat", upstream);
    let gateway = start_gateway(config).await;

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream
        .write_all(
            b"GET /acme/chat/socket?room=1 HTTP/1.1\r\nHost: gw.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    let heads = heads.lock().clone();
    assert_eq!(heads.len(), 2);
    assert!(heads[1].starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
    assert!(heads[1].to_ascii_lowercase().contains("\r\ntenant: acme\r\n"));
}

// ============================================================================
// Injected registry
// ============================================================================

/// Store that already knows every tenant and records lookups
#[derive(Default)]
struct KnowsEveryone {
    lookups: Mutex<Vec<String>>,
}

impl ActivationStore for KnowsEveryone {
    fn contains(&self, tenant: &str) -> bool {
        self.lookups.lock().push(tenant.to_string());
        true
    }

    fn mark_active(&self, _tenant: &str) -> bool {
        false
    }

    fn tenants(&self) -> Vec<String> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_custom_store_is_consulted() {
    let orchestrator = start_mock(MockBehavior::healthy(StatusCode::OK, "ok")).await;
    let loading = start_mock(MockBehavior::healthy(StatusCode::OK, "loading page")).await;
    let mut config = base_config(orchestrator.addr);
    pin(&mut config, "service-frontend-loading", loading.addr);

    let store = Arc::new(KnowsEveryone::default());
    let dispatcher = Arc::new(Dispatcher::from_config(&config, store.clone()).unwrap());
    let (_tx, rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(addr, dispatcher, rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let resp = http_get(addr, "/umbrella").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "loading page");
    assert_eq!(store.lookups.lock().clone(), vec!["umbrella".to_string()]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.hits().is_empty());
}
