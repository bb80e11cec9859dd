//! # TOGA Net
//!
//! Request/response model and network fetching for the TOGA offline worker.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: strategies talk to the network only through [`Fetch`]
//! 2. **Cheap clones**: response bodies are [`Bytes`] so a response can be stored and returned
//! 3. **fetch() semantics**: a non-2xx status is a response, only transport problems are errors

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod fetch;
pub mod origin;

pub use fetch::{fetch_with_timeout, Fetch, HttpFetcher, LoaderConfig};
pub use origin::Origin;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the page intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// `fetch()` / XHR.
    #[default]
    Empty,
    /// Top-level or nested document.
    Document,
    Image,
    Style,
    Script,
    Font,
    Manifest,
    Other,
}

impl Destination {
    /// Parse the Fetch-standard destination token.
    pub fn from_token(token: &str) -> Self {
        match token {
            "" => Destination::Empty,
            "document" | "iframe" => Destination::Document,
            "image" => Destination::Image,
            "style" => Destination::Style,
            "script" | "worker" | "sharedworker" => Destination::Script,
            "font" => Destination::Font,
            "manifest" => Destination::Manifest,
            _ => Destination::Other,
        }
    }

    /// Whether this is a style, script or font subresource.
    pub fn is_static_asset(&self) -> bool {
        matches!(
            self,
            Destination::Style | Destination::Script | Destination::Font
        )
    }
}

/// Request mode. Only `Navigate` matters to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// How intermediate HTTP caches should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Revalidate with the origin server.
    NoCache,
    /// Never use or store in an HTTP cache.
    NoStore,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: Destination,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination: Destination::Empty,
            mode: RequestMode::default(),
            cache: CacheMode::Default,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: Destination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the cache mode.
    pub fn cache_mode(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Whether this request loads a new top-level document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Served from a cache partition rather than the network.
    pub from_cache: bool,
}

impl Response {
    /// Build a network response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
            from_cache: false,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Content-Type header value, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}
