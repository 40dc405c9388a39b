//! Readiness probing
//!
//! The dev server's listening socket appears at an unpredictable point
//! during startup. [`ConnectRetrier`] repeats a real request until the first
//! one that produces *any* HTTP response; transport failures are counted
//! and swallowed. There is no backoff and, unless a deadline is configured,
//! no upper bound.

use std::time::Duration;

use async_trait::async_trait;
use devprof_core::{ProfileError, ProfileResult};
use reqwest::{Client, Method, Response};
use tracing::{debug, trace};

/// One idempotent attempt at reaching the target
#[async_trait]
pub trait Probe: Send + Sync {
    type Response: Send;
    type Error: std::fmt::Display + Send;

    async fn attempt(&self) -> Result<Self::Response, Self::Error>;
}

/// Plain HTTP request probe. Any status code counts as a response.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    method: Method,
    url: String,
}

impl HttpProbe {
    pub fn get(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), Method::GET, url)
    }

    pub fn with_client(client: Client, method: Method, url: impl Into<String>) -> Self {
        Self {
            client,
            method,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    type Response = Response;
    type Error = reqwest::Error;

    async fn attempt(&self) -> Result<Response, reqwest::Error> {
        self.client
            .request(self.method.clone(), &self.url)
            .send()
            .await
    }
}

/// First successful response and how many attempts failed before it
#[derive(Debug)]
pub struct Connected<R> {
    pub response: R,
    pub retries: u32,
}

/// Retry loop around a [`Probe`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectRetrier {
    deadline: Option<Duration>,
}

impl ConnectRetrier {
    /// Retry forever. Callers needing bounded startup must use [`Self::with_deadline`].
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn with_deadline(deadline: Option<Duration>) -> Self {
        Self { deadline }
    }

    pub async fn connect<P: Probe>(&self, probe: &P) -> ProfileResult<Connected<P::Response>> {
        let attempts = async {
            let mut retries = 0u32;
            loop {
                match probe.attempt().await {
                    Ok(response) => return Connected { response, retries },
                    Err(e) => {
                        retries = retries.saturating_add(1);
                        trace!(retries, error = %e, "Readiness probe attempt failed");
                    }
                }
            }
        };

        let connected = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, attempts)
                .await
                .map_err(|_| ProfileError::timeout("readiness probe", deadline))?,
            None => attempts.await,
        };

        debug!(retries = connected.retries, "Target reachable");
        Ok(connected)
    }
}

/// GET `url` until the server answers.
pub async fn fetch_until_connect(url: &str) -> ProfileResult<Connected<Response>> {
    ConnectRetrier::unbounded()
        .connect(&HttpProbe::get(url))
        .await
}
