//! Scripted network for exercising strategies without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio::sync::watch;
use toga_net::{Fetch, NetError, Request, Response};
use url::Url;

/// An in-memory [`Fetch`].
///
/// URLs without a scripted response fail like an unreachable network. Every
/// call is counted before it can be held by [`pause`](MockFetcher::pause).
#[derive(Debug)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, (u16, Bytes)>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    paused: watch::Sender<bool>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            paused,
        }
    }

    /// Script the response for `url`.
    pub fn respond(&self, url: &Url, status: u16, body: impl Into<Bytes>) {
        lock(&self.routes).insert(key(url), (status, body.into()));
    }

    /// Make `url` unreachable again.
    pub fn forget(&self, url: &Url) {
        lock(&self.routes).remove(&key(url));
    }

    /// Fail every fetch regardless of scripted routes.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold all fetches until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &Url) -> usize {
        lock(&self.calls).get(&key(url)).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// A 200 `text/plain` response, for seeding partitions.
    pub fn ok_response(url: &Url, body: &str) -> Response {
        build(url, 200, Bytes::copy_from_slice(body.as_bytes()))
    }
}

#[async_trait]
impl Fetch for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        *lock(&self.calls).entry(key(&request.url)).or_insert(0) += 1;

        let mut paused = self.paused.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = paused.wait_for(|held| !*held).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed(format!("offline: {}", request.url)));
        }

        let route = lock(&self.routes).get(&key(&request.url)).cloned();
        match route {
            Some((status, body)) => Ok(build(&request.url, status, body)),
            None => Err(NetError::RequestFailed(format!(
                "unreachable: {}",
                request.url
            ))),
        }
    }
}

fn build(url: &Url, status: u16, body: Bytes) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::new(url.clone(), status, headers, body)
}

fn key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
