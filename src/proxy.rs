//! Public HTTP listener of the gateway
//!
//! Accepts connections, stamps the forwarding headers on every request and
//! hands it to the [`Dispatcher`].

use crate::dispatch::Dispatcher;
use crate::error::GatewayBody;
use crate::routes;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub struct GatewayServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, dispatcher: Arc<Dispatcher>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(client = %addr, error = %e, "Gateway connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Gateway accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    // Dropping this future (client gone) cancels whatever the request awaits
    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_request(req, dispatcher, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let started = Instant::now();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    stamp_forwarding_headers(&mut req, &request_id, client_addr);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = routes::classify(&method, &path);

    debug!(%method, path, request_id, ?route, "Incoming request");

    let response = dispatcher.dispatch(req, route, &request_id).await;

    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        request_id,
        "Request completed"
    );

    Ok(response)
}

/// Overwrite (never append) the forwarding headers: the gateway is the first
/// trusted hop.
fn stamp_forwarding_headers(req: &mut Request<Incoming>, request_id: &str, client_addr: SocketAddr) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(client_ip) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, client_ip);
    }
    if let Some(original_host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, original_host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
