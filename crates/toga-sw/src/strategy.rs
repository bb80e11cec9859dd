//! Strategy engine: the four caching algorithms.
//!
//! Lookups consult the target partition first and then the app-shell
//! partition, so precached assets are served offline whichever partition they
//! are routed to. Writes only ever go to the target partition, and only 2xx
//! responses are stored.

use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio::sync::oneshot;
use toga_common::WorkerConfig;
use toga_net::{Fetch, NetError, Request, Response};
use tracing::{debug, warn};
use url::Url;

use crate::classify::Strategy;
use crate::event::FetchEvent;
use crate::navigation::Page;
use crate::partition::{PartitionNames, PartitionTag};
use crate::storage::{Cache, CacheStorage};
use crate::{Result, ServiceWorkerError};

/// Body of the response synthesized when nothing else is available.
pub const OFFLINE_BODY: &str = "Offline: this page is not available without a network connection.";

/// Runs strategies against the current version's partitions.
#[derive(Clone)]
pub struct StrategyEngine {
    config: Arc<WorkerConfig>,
    names: PartitionNames,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetch>,
}

impl StrategyEngine {
    pub fn new(config: Arc<WorkerConfig>, storage: CacheStorage, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            names: PartitionNames::new(config.version.clone()),
            config,
            storage,
            fetcher,
        }
    }

    /// Dispatch `event` to `strategy`.
    pub async fn respond(
        &self,
        event: &FetchEvent,
        strategy: Strategy,
        partition: PartitionTag,
    ) -> Result<Response> {
        let request = &event.request;
        match strategy {
            Strategy::CacheFirst => self.cache_first(request, partition).await,
            Strategy::NetworkFirst => self.network_first(request, partition).await,
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(event, partition).await
            }
            Strategy::Navigation => Ok(self.navigation(request).await),
        }
    }

    /// Cached entry if present, otherwise network (stored on success).
    pub async fn cache_first(&self, request: &Request, tag: PartitionTag) -> Result<Response> {
        let cache = self.open(tag).await?;
        if let Some(hit) = self.lookup(&cache, request).await {
            debug!(url = %request.url, partition = %cache.name(), "cache-first hit");
            return Ok(hit);
        }

        let response = self.fetcher.fetch(request).await?;
        if response.ok() {
            cache.put(request, &response).await?;
        }
        debug!(url = %request.url, status = %response.status, "cache-first miss, fetched");
        Ok(response)
    }

    /// Network if reachable (stored on success), otherwise the cached entry.
    pub async fn network_first(&self, request: &Request, tag: PartitionTag) -> Result<Response> {
        let cache = self.open(tag).await?;
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    cache.put(request, &response).await?;
                }
                Ok(response)
            }
            Err(e) => match self.lookup(&cache, request).await {
                Some(stale) => {
                    debug!(url = %request.url, error = %e, "network-first failed, serving cache");
                    Ok(stale)
                }
                None => Err(e.into()),
            },
        }
    }

    /// Cached entry immediately when present, network otherwise; the entry is
    /// refreshed in the background either way.
    pub async fn stale_while_revalidate(
        &self,
        event: &FetchEvent,
        tag: PartitionTag,
    ) -> Result<Response> {
        let request = &event.request;
        let cache = self.open(tag).await?;

        let (tx, rx) = oneshot::channel::<std::result::Result<Response, NetError>>();
        let fetcher = Arc::clone(&self.fetcher);
        let target = Arc::clone(&cache);
        let background = request.clone();
        // Registered before the lookup so both run concurrently.
        event.wait_until(async move {
            match fetcher.fetch(&background).await {
                Ok(response) => {
                    // Nobody is listening on a cache hit.
                    let _ = tx.send(Ok(response.clone()));
                    if !response.ok() {
                        return;
                    }
                    if let Err(e) = target.put(&background, &response).await {
                        warn!(url = %background.url, error = %e, "Revalidation write failed");
                    }
                }
                Err(e) => {
                    debug!(url = %background.url, error = %e, "Revalidation fetch failed");
                    let _ = tx.send(Err(e));
                }
            }
        });

        if let Some(hit) = self.lookup(&cache, request).await {
            debug!(url = %request.url, partition = %cache.name(), "stale-while-revalidate hit");
            return Ok(hit);
        }

        let response = rx
            .await
            .map_err(|_| ServiceWorkerError::StateError("revalidation task dropped".into()))??;
        Ok(response)
    }

    /// Fresh document, falling back through cached pages to a synthesized
    /// offline response. Never fails.
    pub async fn navigation(&self, request: &Request) -> Response {
        let page = Page::resolve(&request.url, &self.config.scope);
        let shell = self.open(PartitionTag::AppShell).await;

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    if let (Ok(cache), Ok(key)) = (&shell, self.config.resolve(page.path())) {
                        if let Err(e) = cache.put_url(&key, &response).await {
                            warn!(page = page.id(), error = %e, "Failed to store navigation");
                        }
                    }
                }
                return response;
            }
            Err(e) => {
                debug!(url = %request.url, page = page.id(), error = %e, "Navigation offline");
            }
        }

        if let Ok(ref cache) = shell {
            for path in [
                page.path(),
                self.config.offline_page.as_str(),
                self.config.home_page.as_str(),
            ] {
                let Ok(key) = self.config.resolve(path) else {
                    continue;
                };
                if let Some(cached) = cache.match_url(&key).await {
                    debug!(page = page.id(), fallback = path, "Serving cached page");
                    return cached;
                }
            }
        }

        offline_response(&request.url)
    }

    async fn open(&self, tag: PartitionTag) -> Result<Arc<Cache>> {
        self.storage.open_live(&self.names.name(tag)).await
    }

    async fn lookup(&self, cache: &Cache, request: &Request) -> Option<Response> {
        if let Some(hit) = cache.match_request(request).await {
            return Some(hit);
        }
        let shell_name = self.names.name(PartitionTag::AppShell);
        if cache.name() == shell_name {
            return None;
        }
        let shell = self.storage.get(&shell_name).await?;
        shell.match_request(request).await
    }
}

/// Minimal 503 plain-text response.
pub fn offline_response(url: &Url) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Response::new(
        url.clone(),
        StatusCode::SERVICE_UNAVAILABLE,
        headers,
        Bytes::from_static(OFFLINE_BODY.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use toga_test::MockFetcher;

    const SCOPE: &str = "https://toga.example/";

    fn setup(fetcher: &Arc<MockFetcher>) -> (StrategyEngine, CacheStorage, PartitionNames) {
        let config = Arc::new(WorkerConfig::with_scope(Url::parse(SCOPE).unwrap()).version("V1"));
        let storage = CacheStorage::new();
        let engine = StrategyEngine::new(
            config,
            storage.clone(),
            Arc::clone(fetcher) as Arc<dyn Fetch>,
        );
        (engine, storage, PartitionNames::new("V1"))
    }

    fn url(path: &str) -> Url {
        Url::parse(SCOPE).unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, storage, names) = setup(&fetcher);
        let u = url("data/plants.json");

        let cache = storage.open(&names.name(PartitionTag::Assets)).await.unwrap();
        cache.put_url(&u, &MockFetcher::ok_response(&u, "cached")).await.unwrap();

        let response = engine
            .cache_first(&Request::get(u.clone()), PartitionTag::Assets)
            .await
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(&response.body[..], b"cached");
        assert_eq!(fetcher.calls(&u), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_stores() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = url("markers/kunyit_v2.patt");
        fetcher.respond(&u, 200, "pattern");
        let (engine, storage, names) = setup(&fetcher);

        let response = engine
            .cache_first(&Request::get(u.clone()), PartitionTag::Assets)
            .await
            .unwrap();
        assert!(!response.from_cache);

        let cache = storage.open(&names.name(PartitionTag::Assets)).await.unwrap();
        assert!(cache.match_url(&u).await.is_some());
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = url("missing.js");
        fetcher.respond(&u, 404, "nope");
        let (engine, storage, names) = setup(&fetcher);

        let response = engine
            .cache_first(&Request::get(u.clone()), PartitionTag::Assets)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let cache = storage.open(&names.name(PartitionTag::Assets)).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_first_offline_miss_propagates() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, _, _) = setup(&fetcher);

        let result = engine
            .cache_first(&Request::get(url("nothing.json")), PartitionTag::Assets)
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
    }

    #[tokio::test]
    async fn test_cache_first_reads_precached_shell() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, storage, names) = setup(&fetcher);
        let u = url("data/plants.json");

        let shell = storage.open(&names.name(PartitionTag::AppShell)).await.unwrap();
        shell.put_url(&u, &MockFetcher::ok_response(&u, "[]")).await.unwrap();

        let response = engine
            .cache_first(&Request::get(u.clone()), PartitionTag::Assets)
            .await
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(fetcher.calls(&u), 0);
    }

    #[tokio::test]
    async fn test_network_first_prefers_network() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = Url::parse("https://script.google.com/macros/s/x/exec?mode=list").unwrap();
        fetcher.respond(&u, 200, "fresh");
        let (engine, storage, names) = setup(&fetcher);

        let cache = storage.open(&names.name(PartitionTag::Api)).await.unwrap();
        cache.put_url(&u, &MockFetcher::ok_response(&u, "stale")).await.unwrap();

        let response = engine
            .network_first(&Request::get(u.clone()), PartitionTag::Api)
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"fresh");
        assert_eq!(&cache.match_url(&u).await.unwrap().body[..], b"fresh");
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_stale() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = Url::parse("https://script.google.com/macros/s/x/exec?id=kunyit").unwrap();
        let (engine, storage, names) = setup(&fetcher);

        let cache = storage.open(&names.name(PartitionTag::Api)).await.unwrap();
        cache.put_url(&u, &MockFetcher::ok_response(&u, "stale")).await.unwrap();

        let response = engine
            .network_first(&Request::get(u.clone()), PartitionTag::Api)
            .await
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(&response.body[..], b"stale");
        assert_eq!(fetcher.calls(&u), 1);
    }

    #[tokio::test]
    async fn test_network_first_offline_miss_propagates() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, _, _) = setup(&fetcher);
        let u = Url::parse("https://cdn.example/lib.js").unwrap();

        assert!(engine
            .network_first(&Request::get(u), PartitionTag::Assets)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_swr_miss_waits_for_network_and_stores() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = url("images/kunyit.jpg");
        fetcher.respond(&u, 200, "jpeg-1");
        let (engine, storage, names) = setup(&fetcher);

        let event = FetchEvent::new(Request::get(u.clone()));
        let response = engine
            .stale_while_revalidate(&event, PartitionTag::Images)
            .await
            .unwrap();
        assert!(!response.from_cache);
        assert_eq!(&response.body[..], b"jpeg-1");

        event.settled().await;
        let cache = storage.open(&names.name(PartitionTag::Images)).await.unwrap();
        assert_eq!(fetcher.calls(&u), 1);
        assert_eq!(cache.write_count(), 1);
    }

    #[tokio::test]
    async fn test_swr_miss_offline_propagates() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, _, _) = setup(&fetcher);

        let event = FetchEvent::new(Request::get(url("images/none.jpg")));
        let result = engine.stale_while_revalidate(&event, PartitionTag::Images).await;
        assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
        event.settled().await;
    }

    #[tokio::test]
    async fn test_swr_background_failure_keeps_cached() {
        let fetcher = Arc::new(MockFetcher::new());
        let u = url("assets/style.css");
        let (engine, storage, names) = setup(&fetcher);

        let cache = storage.open(&names.name(PartitionTag::Assets)).await.unwrap();
        cache.put_url(&u, &MockFetcher::ok_response(&u, "old")).await.unwrap();

        let event = FetchEvent::new(Request::get(u.clone()));
        let response = engine
            .stale_while_revalidate(&event, PartitionTag::Assets)
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"old");

        event.settled().await;
        assert_eq!(&cache.match_url(&u).await.unwrap().body[..], b"old");
        assert_eq!(cache.write_count(), 1);
    }

    #[tokio::test]
    async fn test_navigation_stores_under_resolved_page() {
        let fetcher = Arc::new(MockFetcher::new());
        let nav = url("gallery.html/");
        fetcher.respond(&nav, 200, "<gallery>");
        let (engine, storage, names) = setup(&fetcher);

        let response = engine.navigation(&Request::navigate(nav)).await;
        assert_eq!(&response.body[..], b"<gallery>");

        let shell = storage.open(&names.name(PartitionTag::AppShell)).await.unwrap();
        assert!(shell.match_url(&url("gallery.html")).await.is_some());
        assert!(shell.match_url(&url("gallery.html/")).await.is_none());
    }

    #[tokio::test]
    async fn test_navigation_fallback_chain() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, storage, names) = setup(&fetcher);
        let shell = storage.open(&names.name(PartitionTag::AppShell)).await.unwrap();
        let profile = Request::navigate(url("profile.html"));

        let home = url("index.html");
        shell.put_url(&home, &MockFetcher::ok_response(&home, "home")).await.unwrap();
        assert_eq!(&engine.navigation(&profile).await.body[..], b"home");

        let offline = url("offline.html");
        shell
            .put_url(&offline, &MockFetcher::ok_response(&offline, "offline"))
            .await
            .unwrap();
        assert_eq!(&engine.navigation(&profile).await.body[..], b"offline");

        let page = url("profile.html");
        shell.put_url(&page, &MockFetcher::ok_response(&page, "profile")).await.unwrap();
        assert_eq!(&engine.navigation(&profile).await.body[..], b"profile");
    }

    #[tokio::test]
    async fn test_navigation_synthesizes_offline() {
        let fetcher = Arc::new(MockFetcher::new());
        let (engine, _, _) = setup(&fetcher);

        let response = engine.navigation(&Request::navigate(url("ar.html"))).await;
        assert!(response.status.is_server_error());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
        assert!(!response.body.is_empty());
    }
}
