//! Trace span collector
//!
//! A minimal Zipkin-compatible ingestion endpoint. The dev server, started
//! with `TRACE_TARGET=ZIPKIN`, POSTs JSON arrays of spans here; every array
//! element is appended to an in-memory accumulator. Requests of any other
//! shape are acknowledged with 200 and otherwise ignored.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use devprof_core::{ProfileError, ProfileResult};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the dev server sends spans by default
pub const DEFAULT_COLLECTOR_ADDR: &str = "0.0.0.0:9411";

/// Ingestion path
pub const SPANS_PATH: &str = "/api/v2/spans";

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

type Spans = Arc<Mutex<Vec<Value>>>;

pub struct TraceCollector;

impl TraceCollector {
    /// Bind `addr` and start accepting spans in the background.
    pub async fn start(addr: &str) -> ProfileResult<CollectorHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProfileError::collector(format!("Failed to bind to {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let spans: Spans = Arc::default();
        let router = Router::new()
            .fallback(ingest)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(Arc::clone(&spans));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        info!(address = %local_addr, "Trace collector listening");

        Ok(CollectorHandle {
            local_addr,
            spans,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        })
    }
}

/// Running collector. Dropping it stops the server without returning spans.
pub struct CollectorHandle {
    local_addr: SocketAddr,
    spans: Spans,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl CollectorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Full ingestion URL for this collector.
    pub fn spans_url(&self) -> String {
        format!("http://{}{SPANS_PATH}", self.local_addr)
    }

    pub fn span_count(&self) -> usize {
        lock(&self.spans).len()
    }

    /// Stop accepting requests, wait for in-flight ones, and return the spans.
    pub async fn finish(mut self) -> ProfileResult<Vec<Value>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server
                .await
                .map_err(|e| ProfileError::collector(format!("Collector task failed: {e}")))?
                .map_err(|e| ProfileError::collector(format!("Collector server error: {e}")))?;
        }

        let spans = std::mem::take(&mut *lock(&self.spans));
        info!(spans = spans.len(), "Trace collector stopped");
        Ok(spans)
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn lock(spans: &Spans) -> std::sync::MutexGuard<'_, Vec<Value>> {
    spans.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_span_upload(method: &Method, uri: &Uri, headers: &HeaderMap) -> bool {
    method == Method::POST
        && uri.path() == SPANS_PATH
        && headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            == Some("application/json")
}

async fn ingest(
    State(spans): State<Spans>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !is_span_upload(&method, &uri, &headers) {
        debug!(%method, %uri, "Ignoring non-span request");
        return StatusCode::OK;
    }

    match serde_json::from_slice::<Vec<Value>>(&body) {
        Ok(batch) => {
            debug!(count = batch.len(), "Received spans");
            lock(&spans).extend(batch);
            StatusCode::OK
        }
        Err(e) => {
            warn!(error = %e, "Rejecting malformed span batch");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
