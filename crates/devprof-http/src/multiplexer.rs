//! Event Stream Multiplexer
//!
//! One long-lived SSE connection presented as any number of independent
//! consumers. Consumers register in a registry keyed by a small integer
//! handle; every message event is fanned out to all registrations present
//! when it arrives.
//!
//! # Registrations
//!
//! | Kind | Created by | Receives | Removed |
//! |------|------------|----------|---------|
//! | one-shot | [`EventMultiplexer::next_event`] | the next event | after that event, or when dropped |
//! | unbounded | [`EventMultiplexer::subscribe_all`] | every later event, in order | when dropped, or on teardown |
//!
//! Registration happens when the method is called, not when the returned
//! future is first polled, and dispatch takes the same lock. An event is
//! therefore either fully dispatched before a registration exists or
//! delivered to it; there is no lost-wakeup window.
//!
//! # Lifecycle
//!
//! `Open -> Closed`. Connecting happens inside [`EventMultiplexer::open`],
//! which only returns once response headers arrive. Events are dispatched
//! only while `Open`.
//! On teardown or upstream error every registration is dropped and pending
//! consumers resolve with [`ProfileError::StreamClosed`].

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use devprof_core::{ProfileError, ProfileResult};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sse::{SseDecoder, SseEvent, discriminator};

/// Lifecycle of the underlying stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

enum Watch {
    Once(Option<oneshot::Sender<SseEvent>>),
    Every(mpsc::UnboundedSender<SseEvent>),
}

struct Registry {
    state: StreamState,
    next_handle: u64,
    watches: HashMap<u64, Watch>,
}

impl Registry {
    fn register(&mut self, watch: Watch) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.watches.insert(handle, watch);
        handle
    }

    fn dispatch(&mut self, event: &SseEvent) {
        if self.state != StreamState::Open {
            return;
        }
        self.watches.retain(|_, watch| match watch {
            Watch::Once(slot) => {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(event.clone());
                }
                false
            }
            Watch::Every(tx) => tx.send(event.clone()).is_ok(),
        });
    }

    fn close(&mut self) {
        self.state = StreamState::Closed;
        self.watches.clear();
    }
}

#[derive(Clone)]
struct Shared {
    registry: Arc<Mutex<Registry>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                state: StreamState::Open,
                next_handle: 0,
                watches: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Dispatch never panics while holding the lock; recover the data if it did.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register unless closed. A closed stream drops the watch immediately,
    /// which resolves its consumer with `StreamClosed`.
    fn register(&self, watch: Watch) -> Option<u64> {
        let mut registry = self.lock();
        if registry.state == StreamState::Closed {
            return None;
        }
        Some(registry.register(watch))
    }

    fn unregister(&self, handle: u64) {
        self.lock().watches.remove(&handle);
    }
}

/// A single SSE connection shared by many consumers
pub struct EventMultiplexer {
    url: String,
    shared: Shared,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMultiplexer")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventMultiplexer {
    /// Connect to `url` and resolve once the stream is open.
    ///
    /// Fails with [`ProfileError::StreamConnect`] if the connection cannot be
    /// made or the server answers with a non-success status.
    pub async fn open(url: &str) -> ProfileResult<Self> {
        Self::open_with(&Client::new(), url).await
    }

    pub async fn open_with(client: &Client, url: &str) -> ProfileResult<Self> {
        debug!(url = %url, "Opening event stream");

        let response = client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| ProfileError::stream_connect(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProfileError::stream_connect(url, format!("HTTP {status}")));
        }

        info!(url = %url, "Event stream open");
        Ok(Self::from_byte_stream(url, response.bytes_stream()))
    }

    /// Multiplex an already-established byte stream.
    ///
    /// Must be called from within a tokio runtime; the stream is read on a
    /// background task until it ends, fails, or the multiplexer is closed.
    pub fn from_byte_stream<S, B, E>(url: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let url = url.into();
        let shared = Shared::new();

        let reader = tokio::spawn(read_stream(url.clone(), shared.clone(), stream));

        Self {
            url,
            shared,
            reader,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.shared.lock().watches.len()
    }

    /// Register a one-shot listener for the next event delivered after this call.
    ///
    /// Concurrent one-shot listeners all receive the same next event.
    pub fn next_event(&self) -> NextEvent {
        let (tx, rx) = oneshot::channel();
        let handle = self.shared.register(Watch::Once(Some(tx)));
        NextEvent {
            rx,
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Register a listener that observes every subsequent event until dropped.
    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.shared.register(Watch::Every(tx));
        Subscription {
            rx,
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Resolve with the first structured payload, delivered after this call,
    /// whose discriminator equals `action`.
    ///
    /// Never times out on its own; wrap it in `tokio::time::timeout` to bound it.
    pub async fn event_of_type(&self, action: &str) -> ProfileResult<Value> {
        self.subscribe_all().event_of_type(action).await
    }

    /// Tear down the stream. Pending consumers resolve with `StreamClosed`.
    pub fn close(&self) {
        let mut registry = self.shared.lock();
        if registry.state != StreamState::Closed {
            debug!(url = %self.url, "Closing event stream");
            registry.close();
        }
        drop(registry);
        self.reader.abort();
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_stream<S, B, E>(url: String, shared: Shared, stream: S)
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for event in decoder.feed(bytes.as_ref()) {
                    if event.is_message() {
                        shared.lock().dispatch(&event);
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Event stream failed");
                shared.lock().close();
                return;
            }
        }
    }

    info!(url = %url, "Event stream ended");
    shared.lock().close();
}

/// Pending one-shot registration
pub struct NextEvent {
    rx: oneshot::Receiver<SseEvent>,
    handle: Option<u64>,
    shared: Shared,
}

impl Future for NextEvent {
    type Output = ProfileResult<SseEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ProfileError::StreamClosed))
    }
}

impl Drop for NextEvent {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.unregister(handle);
        }
    }
}

/// Unbounded registration observing every event in arrival order
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SseEvent>,
    handle: Option<u64>,
    shared: Shared,
}

impl Subscription {
    pub async fn next_event(&mut self) -> ProfileResult<SseEvent> {
        self.rx.recv().await.ok_or(ProfileError::StreamClosed)
    }

    /// Next structured payload together with its discriminator, skipping
    /// opaque payloads.
    pub async fn next_structured(&mut self) -> ProfileResult<(Option<String>, Value)> {
        loop {
            let event = self.next_event().await?;
            if let Some(payload) = event.structured_payload()? {
                let action = discriminator(&payload).map(str::to_owned);
                return Ok((action, payload));
            }
        }
    }

    /// Skip events until a structured payload with the given discriminator arrives.
    pub async fn event_of_type(&mut self, action: &str) -> ProfileResult<Value> {
        loop {
            let (seen, payload) = self.next_structured().await?;
            if seen.as_deref() == Some(action) {
                return Ok(payload);
            }
        }
    }
}

impl Stream for Subscription {
    type Item = SseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.unregister(handle);
        }
    }
}
