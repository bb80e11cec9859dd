//! End-to-end behaviour of the worker through its container

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use toga_common::{init_logging, LogConfig, WorkerConfig};
use toga_net::{Destination, Fetch, Request};
use toga_sw::{
    CacheStorage, FetchEvent, FetchOutcome, MessageOutcome, PartitionNames, PartitionTag,
    ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerState, OFFLINE_BODY,
};
use toga_test::MockFetcher;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const SCOPE: &str = "https://toga.example/app/";

fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
}

fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

fn config(version: &str) -> WorkerConfig {
    WorkerConfig::with_scope(scope())
        .version(version)
        .manifest(Vec::<String>::new())
}

fn container(
    fetcher: &Arc<MockFetcher>,
    storage: CacheStorage,
) -> (ServiceWorkerContainer, UnboundedReceiver<ServiceWorkerEvent>) {
    ServiceWorkerContainer::new(scope(), storage, Arc::clone(fetcher) as Arc<dyn Fetch>)
}

async fn respond(container: &ServiceWorkerContainer, event: &FetchEvent) -> toga_net::Response {
    match container.handle_fetch(event).await.unwrap() {
        FetchOutcome::Respond(response) => response,
        FetchOutcome::Passthrough => panic!("request was not intercepted"),
    }
}

fn drain(rx: &mut UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn image_revalidates_in_background() {
    let _ = init_logging(LogConfig::debug().with_filter("toga_sw=trace"));
    let fetcher = Arc::new(MockFetcher::new());
    let storage = CacheStorage::new();
    let (container, _rx) = container(&fetcher, storage.clone());
    container.register(config("V1")).await.unwrap();

    let img = url("images/kunyit.jpg");
    fetcher.respond(&img, 200, "jpeg-1");

    let first = FetchEvent::new(Request::get(img.clone()).destination(Destination::Image));
    let response = respond(&container, &first).await;
    assert!(!response.from_cache);
    assert_eq!(&response.body[..], b"jpeg-1");
    first.settled().await;

    let images = storage.open("V1-images").await.unwrap();
    assert_eq!(fetcher.calls(&img), 1);
    assert_eq!(images.write_count(), 1);

    // Network stalls; the cached copy comes back without waiting for it.
    fetcher.respond(&img, 200, "jpeg-2");
    fetcher.pause();
    let second = FetchEvent::new(Request::get(img.clone()).destination(Destination::Image));
    let response = respond(&container, &second).await;
    assert!(response.from_cache);
    assert_eq!(&response.body[..], b"jpeg-1");
    assert_eq!(second.lifetime().pending(), 1);

    fetcher.resume();
    second.settled().await;
    assert_eq!(fetcher.calls(&img), 2);
    assert_eq!(images.write_count(), 2);
    assert_eq!(&images.match_url(&img).await.unwrap().body[..], b"jpeg-2");
}

#[tokio::test]
async fn non_get_is_never_intercepted() {
    let fetcher = Arc::new(MockFetcher::new());
    let (container, _rx) = container(&fetcher, CacheStorage::new());
    container.register(config("V1")).await.unwrap();

    let post = FetchEvent::new(Request::post(url("data/plants.json"), Bytes::from_static(b"{}")));
    assert!(matches!(
        container.handle_fetch(&post).await.unwrap(),
        FetchOutcome::Passthrough
    ));
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn nothing_intercepted_before_activation() {
    let fetcher = Arc::new(MockFetcher::new());
    let (container, _rx) = container(&fetcher, CacheStorage::new());

    let event = FetchEvent::new(Request::get(url("index.html")));
    assert!(matches!(
        container.handle_fetch(&event).await.unwrap(),
        FetchOutcome::Passthrough
    ));
}

#[tokio::test]
async fn cache_first_hit_never_fetches() {
    let fetcher = Arc::new(MockFetcher::new());
    let storage = CacheStorage::new();
    let (container, _rx) = container(&fetcher, storage.clone());
    container.register(config("V1")).await.unwrap();

    let data = url("data/plants.json");
    let assets = storage.open("V1-assets").await.unwrap();
    assets
        .put_url(&data, &MockFetcher::ok_response(&data, "[]"))
        .await
        .unwrap();

    for _ in 0..3 {
        let response = respond(&container, &FetchEvent::new(Request::get(data.clone()))).await;
        assert!(response.from_cache);
    }
    assert_eq!(fetcher.calls(&data), 0);
}

#[tokio::test]
async fn api_falls_back_to_stale_entry() {
    let fetcher = Arc::new(MockFetcher::new());
    let storage = CacheStorage::new();
    let (container, _rx) = container(&fetcher, storage.clone());
    container.register(config("V1")).await.unwrap();

    let api = Url::parse("https://script.google.com/macros/s/abc/exec?mode=list").unwrap();
    fetcher.respond(&api, 200, "fresh-list");
    let response = respond(&container, &FetchEvent::new(Request::get(api.clone()))).await;
    assert_eq!(&response.body[..], b"fresh-list");

    fetcher.set_offline(true);
    let response = respond(&container, &FetchEvent::new(Request::get(api.clone()))).await;
    assert!(response.from_cache);
    assert_eq!(&response.body[..], b"fresh-list");
    assert!(storage.open("V1-api").await.unwrap().match_url(&api).await.is_some());
}

#[tokio::test]
async fn offline_navigation_with_empty_caches_is_synthesized() {
    let fetcher = Arc::new(MockFetcher::new());
    let (container, _rx) = container(&fetcher, CacheStorage::new());
    container.register(config("V1")).await.unwrap();

    let nav = FetchEvent::new(Request::navigate(url("gallery.html/")));
    let response = respond(&container, &nav).await;

    assert!(response.status.is_server_error());
    assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
    assert_eq!(response.text().unwrap(), OFFLINE_BODY);
}

#[tokio::test]
async fn offline_navigation_serves_resolved_page() {
    let fetcher = Arc::new(MockFetcher::new());
    let (container, _rx) = container(&fetcher, CacheStorage::new());
    let manifest = config("V1").manifest(["./index.html", "./gallery.html", "./offline.html"]);
    for path in &manifest.precache_manifest {
        fetcher.respond(&manifest.resolve(path).unwrap(), 200, path.clone());
    }
    container.register(manifest).await.unwrap();

    fetcher.set_offline(true);
    for (path, expected) in [
        ("gallery.html", "./gallery.html"),
        ("gallery.html/", "./gallery.html"),
        ("", "./index.html"),
        ("profile.html", "./offline.html"),
        ("nowhere/at/all", "./index.html"),
    ] {
        let nav = FetchEvent::new(Request::navigate(url(path)));
        let response = respond(&container, &nav).await;
        assert_eq!(response.text().unwrap(), expected, "navigating to {path:?}");
    }
}

#[tokio::test]
async fn precache_skips_missing_asset() {
    let fetcher = Arc::new(MockFetcher::new());
    let storage = CacheStorage::new();
    let (container, _rx) = container(&fetcher, storage.clone());

    let paths: Vec<String> = (0..10).map(|i| format!("./assets/part-{i}.js")).collect();
    let cfg = config("V1").manifest(paths.clone());
    for (i, path) in paths.iter().enumerate() {
        let status = if i == 6 { 404 } else { 200 };
        fetcher.respond(&cfg.resolve(path).unwrap(), status, "x");
    }

    let (_, report) = container.register(cfg).await.unwrap();
    assert_eq!(report.stored.len(), 9);
    assert_eq!(report.skipped[0].0, "./assets/part-6.js");
    assert_eq!(storage.open("V1-app-shell").await.unwrap().len().await, 9);
    assert!(container.active().await.is_some());
}

#[tokio::test]
async fn update_waits_for_skip_waiting_then_collects_old_partitions() {
    let fetcher = Arc::new(MockFetcher::new());
    let storage = CacheStorage::new();
    let (container, mut rx) = container(&fetcher, storage.clone());

    let (v1, _) = container.register(config("V1")).await.unwrap();
    for tag in PartitionTag::ALL {
        storage.open(&PartitionNames::new("V1").name(tag)).await.unwrap();
    }
    container.add_client("tab-1").await;
    drain(&mut rx);

    let (v2, _) = container.register(config("V2")).await.unwrap();
    for tag in PartitionTag::ALL {
        storage.open(&PartitionNames::new("V2").name(tag)).await.unwrap();
    }
    assert_eq!(container.active().await.map(|(id, _)| id), Some(v1));
    assert_eq!(container.waiting().await, Some((v2, "V2".to_string())));
    assert!(storage.has("V1-assets").await);
    assert!(drain(&mut rx).contains(&ServiceWorkerEvent::StateChange {
        worker_id: v2,
        version: "V2".to_string(),
        new_state: ServiceWorkerState::Installed,
    }));

    // Unrecognized messages change nothing.
    assert_eq!(
        container.post_message(&json!({"type": "PING"})).await.unwrap(),
        MessageOutcome::Ignored
    );
    assert!(container.waiting().await.is_some());

    assert_eq!(
        container.post_message(&json!({"type": "SKIP_WAITING"})).await.unwrap(),
        MessageOutcome::SkipWaiting
    );
    assert_eq!(container.active().await.map(|(id, _)| id), Some(v2));
    assert!(container.waiting().await.is_none());

    let mut remaining = storage.keys().await;
    remaining.sort();
    let mut expected = PartitionNames::new("V2").allowlist();
    expected.sort();
    assert_eq!(remaining, expected);

    let events = drain(&mut rx);
    assert!(events.contains(&ServiceWorkerEvent::ControllerChange {
        client_id: "tab-1".to_string(),
        worker_id: v2,
    }));
    assert!(events.contains(&ServiceWorkerEvent::StateChange {
        worker_id: v1,
        version: "V1".to_string(),
        new_state: ServiceWorkerState::Redundant,
    }));
}

#[tokio::test]
async fn waiting_worker_activates_when_last_client_leaves() {
    let fetcher = Arc::new(MockFetcher::new());
    let (container, _rx) = container(&fetcher, CacheStorage::new());

    container.register(config("V1")).await.unwrap();
    container.add_client("tab-1").await;
    container.add_client("tab-2").await;
    let (v2, _) = container.register(config("V2")).await.unwrap();

    container.remove_client("tab-1").await.unwrap();
    assert!(container.waiting().await.is_some());

    container.remove_client("tab-2").await.unwrap();
    assert_eq!(container.active().await, Some((v2, "V2".to_string())));
}

#[tokio::test]
async fn revalidation_across_activation_does_not_restore_old_partition() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MockFetcher::new());
    let img = url("images/kunyit.jpg");
    fetcher.respond(&img, 200, "jpeg-1");

    {
        let storage = CacheStorage::open_dir(dir.path()).await.unwrap();
        let (container, _rx) = container(&fetcher, storage.clone());
        container.register(config("V1")).await.unwrap();
        container.add_client("tab-1").await;

        let first = FetchEvent::new(Request::get(img.clone()).destination(Destination::Image));
        respond(&container, &first).await;
        first.settled().await;
        assert!(dir.path().join("V1-images.json").exists());

        // The V1 revalidation is still in flight when V2 takes over.
        fetcher.respond(&img, 200, "jpeg-2");
        fetcher.pause();
        let second = FetchEvent::new(Request::get(img.clone()).destination(Destination::Image));
        assert!(respond(&container, &second).await.from_cache);

        container.register(config("V2")).await.unwrap();
        container
            .post_message(&json!({"type": "SKIP_WAITING"}))
            .await
            .unwrap();
        assert_eq!(storage.keys().await, vec!["V2-app-shell"]);

        fetcher.resume();
        second.settled().await;
        assert_eq!(storage.keys().await, vec!["V2-app-shell"]);
        assert!(!dir.path().join("V1-images.json").exists());
    }

    let storage = CacheStorage::open_dir(dir.path()).await.unwrap();
    assert_eq!(storage.keys().await, vec!["V2-app-shell"]);
}

#[tokio::test]
async fn durable_partitions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MockFetcher::new());
    let cfg = config("V1").manifest(["./index.html"]);
    fetcher.respond(&cfg.resolve("./index.html").unwrap(), 200, "<home>");

    {
        let storage = CacheStorage::open_dir(dir.path()).await.unwrap();
        let (container, _rx) = container(&fetcher, storage);
        container.register(cfg.clone()).await.unwrap();
    }

    fetcher.set_offline(true);
    let storage = CacheStorage::open_dir(dir.path()).await.unwrap();
    assert!(storage.has("V1-app-shell").await);

    let (container, _rx) = container(&fetcher, storage);
    container.register(cfg).await.unwrap();
    let response = respond(&container, &FetchEvent::new(Request::navigate(url("")))).await;
    assert_eq!(response.text().unwrap(), "<home>");
}
