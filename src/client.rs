//! The request capability virtual users depend on.
//!
//! Skein does not care how requests reach the target system: anything that can take
//! an [`HttpRequest`] and hand back a status, a latency and a body implements
//! [`Transport`]. [`ReqwestTransport`] is the default, built on
//! [`reqwest`](https://docs.rs/reqwest), with one client (and so one cookie jar) per
//! virtual user.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::user::WorkloadError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A request, with a path relative to the base URL or an absolute URL.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Name used to tag the request's samples, defaults to the path.
    pub name: Option<String>,
    pub timeout: Option<Duration>,
}
impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Self {
        HttpRequest {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            name: None,
            timeout: None,
        }
    }

    pub fn get(url: &str) -> Self {
        HttpRequest::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        HttpRequest::new(Method::POST, url)
    }

    pub fn put(url: &str) -> Self {
        HttpRequest::new(Method::PUT, url)
    }

    pub fn delete(url: &str) -> Self {
        HttpRequest::new(Method::DELETE, url)
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Set an `Authorization: Bearer` header.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", &format!("Bearer {}", token))
    }

    pub fn body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, WorkloadError> {
        let body = serde_json::to_vec(value).map_err(|e| WorkloadError::Custom {
            detail: format!("failed to serialize request body: {}", e),
        })?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What came back.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Time from sending the request until the whole body was read.
    pub latency: Duration,
}
impl HttpResponse {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, WorkloadError> {
        serde_json::from_slice(&self.body).map_err(|e| WorkloadError::Custom {
            detail: format!("invalid JSON response body: {}", e),
        })
    }

    /// Turn a non-2xx response into [`WorkloadError::RequestFailed`].
    pub fn error_for_status(self) -> Result<Self, WorkloadError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(WorkloadError::RequestFailed {
                status: self.status.as_u16(),
            })
        }
    }
}

/// A request could not be completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    pub detail: String,
    pub timed_out: bool,
}
impl TransportError {
    pub fn new(detail: &str) -> Self {
        TransportError {
            detail: detail.to_string(),
            timed_out: false,
        }
    }
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.timed_out {
            write!(f, "request timed out: {}", self.detail)
        } else {
            write!(f, "request failed: {}", self.detail)
        }
    }
}
impl std::error::Error for TransportError {}

/// Issue a request and report status, latency and body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `request.url` is absolute by the time a transport sees it.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a [`reqwest::Client`].
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}
impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let builder = reqwest::Client::builder().user_agent(APP_USER_AGENT);
        #[cfg(feature = "cookies")]
        let builder = builder.cookie_store(true);
        let client = builder
            .build()
            .map_err(|e| TransportError::new(&format!("failed to build client: {}", e)))?;
        Ok(ReqwestTransport { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError {
            detail: e.to_string(),
            timed_out: e.is_timeout(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
            latency: started.elapsed(),
        })
    }
}
