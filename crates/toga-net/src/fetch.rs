//! Network fetching.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{CacheMode, NetError, Request, Response};

/// The network as seen by the worker.
///
/// Implementations resolve with a [`Response`] for every HTTP status and return
/// an error only when no response was received at all.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("toga-sw/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
        }
    }
}

/// [`Fetch`] over a reqwest client.
///
/// No request timeout is configured here; the caching strategies wait on the
/// network indefinitely.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(
            request_id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        builder = match request.cache {
            CacheMode::Default => builder,
            CacheMode::NoCache => builder.header(reqwest::header::CACHE_CONTROL, "no-cache"),
            CacheMode::NoStore => builder.header(reqwest::header::CACHE_CONTROL, "no-store"),
        };

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(url, status, headers, body))
    }
}

/// Fetch with an abort deadline, for page-side data loading.
///
/// The caching strategies never call this.
pub async fn fetch_with_timeout(
    fetcher: &dyn Fetch,
    request: &Request,
    timeout: Duration,
) -> Result<Response, NetError> {
    match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(url = %request.url, ?timeout, "Fetch aborted");
            Err(NetError::Timeout(timeout))
        }
    }
}
