//! Optional HTTP endpoint exposing metrics and the latest status.
//!
//! Runs on its own small tokio runtime so the rest of the process can
//! stay blocking. Keep the returned [`ServerHandle`] alive for as long
//! as the endpoint should serve.

use std::net::SocketAddr;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::Mutex;

use axum::extract::Extension;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::errors::Error;
use crate::errors::Result;
use crate::metrics::Metrics;

/// Latest status document published by the running component.
#[derive(Default)]
pub struct StatusBoard(Mutex<serde_json::Value>);

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, status: &impl Serialize) -> Result<()> {
        let value = serde_json::to_value(status)?;
        *self.0.lock().map_err(|_| Error::LockPoisoned)? = value;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(self.0.lock().map_err(|_| Error::LockPoisoned)?.clone())
    }
}

struct State {
    metrics: Arc<Metrics>,
    status: Arc<StatusBoard>,
}

pub struct ServerHandle {
    addr: SocketAddr,
    _rt: Runtime,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn get_metrics(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            err.to_string(),
        ),
    }
}

async fn get_status(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    match state.status.snapshot() {
        Ok(value) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            err.to_string(),
        ),
    }
}

/// Start the tokio runtime for the webserver and begin serving on
/// `addr`.
///
/// The socket is bound before returning, so a port conflict is
/// reported here rather than lost in a background task.
pub fn start_server_runtime(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    status: Arc<StatusBoard>,
) -> Result<ServerHandle> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()?;

    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        .layer(Extension(Arc::new(State { metrics, status })));

    let server = {
        let _guard = rt.enter();
        axum::Server::from_tcp(listener)
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
            .serve(app.into_make_service())
    };
    tracing::info!("Starting metrics server on {addr:?}");
    rt.spawn(async move {
        if let Err(err) = server.await {
            tracing::error!("Metrics server stopped: {err}");
        }
    });
    Ok(ServerHandle { addr, _rt: rt })
}

#[cfg(test)]
fn http_get(addr: SocketAddr, path: &str) -> String {
    use std::io::Read;
    use std::io::Write;

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn serves_metrics_and_status() {
    let metrics = Metrics::new().unwrap();
    metrics.failovers.inc();
    let status = StatusBoard::new();
    status
        .publish(&serde_json::json!({"cycle": "done"}))
        .unwrap();

    let server =
        start_server_runtime("127.0.0.1:0".parse().unwrap(), metrics, status.clone()).unwrap();

    let body = http_get(server.local_addr(), "/metrics");
    assert!(body.starts_with("HTTP/1.1 200"), "got: {body}");
    assert!(body.contains("meterflow_failovers_total 1"), "got: {body}");

    let body = http_get(server.local_addr(), "/status");
    assert!(body.contains(r#"{"cycle":"done"}"#), "got: {body}");
}
