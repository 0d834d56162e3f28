use crate::dispatch::Dispatcher;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

fn json(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = plain(status, body);
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Internal admin API: health, version, registry and pool introspection
pub struct AdminServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, dispatcher, auth_token).await {
                                    debug!(client = %addr, error = %e, "Admin connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Admin accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let dispatcher = Arc::clone(&dispatcher);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, dispatcher, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin API connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, path, "Admin request");

    let reply = match (method, path) {
        (&Method::GET, "/health") => plain(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let body = serde_json::json!({ "name": PKG_NAME, "version": VERSION });
            json(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/tenants") | (&Method::GET, "/stats") if !check_auth(&req, &auth_token) => {
            warn!(path, "Admin request rejected: bad or missing token");
            plain(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/tenants") => {
            let mut tenants = dispatcher.registry().tenants();
            tenants.sort();
            let body = serde_json::json!({
                "count": tenants.len(),
                "tenants": tenants,
            });
            json(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/stats") => {
            let stats = dispatcher.pool().stats();
            let body = serde_json::json!({
                "proxied_requests": stats.get_total_requests(),
                "probes": stats.get_probes(),
            });
            json(StatusCode::OK, body.to_string())
        }

        _ => plain(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(reply)
}
