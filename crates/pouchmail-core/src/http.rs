//! Injected HTTP fetch seam
//!
//! The core never hard-codes an endpoint beyond what callers pass in; all
//! remote traffic goes through the [`HttpFetch`] trait so tests can swap
//! the network out entirely.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// A single outbound request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method (GET, POST, ...)
    pub method: String,

    /// Absolute URL
    pub url: String,

    /// Header name/value pairs
    pub headers: Vec<(String, String)>,

    /// Optional request body
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    /// Build a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Attach a bearer token
    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        self
    }

    /// Attach an arbitrary header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A completed response; status interpretation is left to the caller
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8, lossy
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trait for the caller-supplied fetch function
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Perform one request, returning status and body.
    ///
    /// Transport failures are errors; non-2xx statuses are not.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Default fetch implementation backed by reqwest
pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| Error::Config(format!("invalid HTTP method: {}", request.method)))?;

        debug!("{} {}", request.method, request.url);

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::NetworkTimeout(request.url.clone())
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();

        Ok(FetchResponse { status, body })
    }
}
