//! # devprof-http
//!
//! Network-facing pieces of devprof:
//!
//! - [`ConnectRetrier`]: wait for a freshly started server to answer
//! - [`EventMultiplexer`]: one SSE connection, many independent consumers
//! - [`TraceCollector`]: in-process span ingestion endpoint

pub mod collector;
pub mod multiplexer;
pub mod retry;
pub mod sse;

pub use collector::{CollectorHandle, DEFAULT_COLLECTOR_ADDR, SPANS_PATH, TraceCollector};
pub use multiplexer::{EventMultiplexer, NextEvent, StreamState, Subscription};
pub use retry::{ConnectRetrier, Connected, HttpProbe, Probe, fetch_until_connect};
pub use sse::{DISCRIMINATOR, SseDecoder, SseEvent, discriminator};
