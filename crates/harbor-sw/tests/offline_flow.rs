//! End-to-end worker tests against a real HTTP origin.

use std::sync::Arc;
use std::time::Duration;

use harbor_net::{LoaderConfig, Request, ResourceLoader};
use harbor_sw::{
    CacheKey, CacheStore, ClientMessage, ClientType, FetchEvent, FetchSource, InMemoryClients,
    LifecycleEvent, MemoryCacheStorage, OfflineWorker, RecordingNotifications, ServiceWorkerState,
    UpdateCheck, WorkerConfig,
};
use url::Url;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Site {
    server: MockServer,
    origin: Url,
}

impl Site {
    async fn start() -> Self {
        let server = MockServer::start().await;
        for (route, body) in [
            ("/", "<html>home</html>"),
            ("/app.js", "console.log('app')"),
            ("/fresh.css", "body {}"),
            ("/version.json", r#"{"version":"2.0.0"}"#),
        ] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }
        let origin = Url::parse(&server.uri()).unwrap();
        Self { server, origin }
    }

    fn url(&self, path: &str) -> Url {
        self.origin.join(path).unwrap()
    }

    /// Every request now outlives the worker's fetch timeout.
    async fn go_offline(&self) {
        self.server.reset().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&self.server)
            .await;
    }

    async fn requests_for(&self, route: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }
}

fn worker(
    site: &Site,
    store: Arc<MemoryCacheStorage>,
    clients: Arc<InMemoryClients>,
) -> OfflineWorker {
    let mut config = WorkerConfig::new("1.0.0", site.origin.clone());
    config.shell_urls.push(site.url("/app.js"));
    config.fetch_timeout = Duration::from_millis(500);

    let loader = ResourceLoader::new(LoaderConfig {
        origin: Some(site.origin.clone()),
        ..LoaderConfig::default()
    })
    .unwrap();

    let (worker, _events) = OfflineWorker::new(
        config,
        store,
        Arc::new(loader),
        clients,
        Arc::new(RecordingNotifications::new()),
    );
    worker
}

#[tokio::test]
async fn test_installed_app_keeps_working_offline() {
    let site = Site::start().await;
    let store = Arc::new(MemoryCacheStorage::new());
    let worker = worker(&site, store.clone(), Arc::new(InMemoryClients::new()));

    worker.handle_event(LifecycleEvent::Install).await.unwrap();
    assert_eq!(worker.state().await, ServiceWorkerState::Activated);
    assert_eq!(store.keys().await.unwrap(), vec!["harbor-1.0.0".to_string()]);

    // cached shell is served without touching the network
    let before = site.requests_for("/app.js").await;
    let hit = worker
        .handle_fetch(FetchEvent::new(Request::get(site.url("/app.js"))))
        .await
        .unwrap();
    assert_eq!(hit.source, FetchSource::Cache);
    assert_eq!(site.requests_for("/app.js").await, before);

    // uncached resource comes from the network and is stored for later
    let fresh = worker
        .handle_fetch(FetchEvent::new(Request::get(site.url("/fresh.css"))))
        .await
        .unwrap();
    assert_eq!(fresh.source, FetchSource::Network);
    assert_eq!(worker.shutdown().await, 0);
    assert!(store
        .match_in("harbor-1.0.0", &CacheKey::get(&site.url("/fresh.css")))
        .await
        .unwrap()
        .is_some());

    site.go_offline().await;

    let home = worker
        .handle_fetch(FetchEvent::new(Request::navigate(site.url("/"))))
        .await
        .unwrap();
    assert_eq!(home.response.text().unwrap(), "<html>home</html>");

    let fresh = worker
        .handle_fetch(FetchEvent::new(Request::get(site.url("/fresh.css"))))
        .await
        .unwrap();
    assert_eq!(fresh.source, FetchSource::Cache);

    let page = worker
        .handle_fetch(FetchEvent::new(Request::navigate(site.url("/settings"))))
        .await
        .unwrap();
    assert_eq!(page.source, FetchSource::OfflinePage);
    assert!(page.response.text().unwrap().contains("Offline"));

    let asset = worker
        .handle_fetch(FetchEvent::new(Request::get(site.url("/logo.png"))))
        .await
        .unwrap();
    assert_eq!(asset.source, FetchSource::Unavailable);
    assert_eq!(asset.response.status.as_u16(), 503);
}

#[tokio::test]
async fn test_non_get_is_passed_through() {
    let site = Site::start().await;
    let worker = worker(
        &site,
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(InMemoryClients::new()),
    );
    worker.handle_event(LifecycleEvent::Install).await.unwrap();

    let post = Request::post(site.url("/api/notes"), "{}".into());
    assert!(worker.handle_fetch(FetchEvent::new(post)).await.is_none());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_update_check_reaches_connected_clients() {
    let site = Site::start().await;
    let clients = Arc::new(InMemoryClients::new());
    let (_, mut rx) = clients.connect(site.url("/"), ClientType::Window).await;
    let worker = worker(&site, Arc::new(MemoryCacheStorage::new()), clients);

    let check = worker.check_for_update().await;

    assert_eq!(
        check,
        UpdateCheck::UpdateAvailable {
            version: "2.0.0".into(),
            notified: 1
        }
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        ClientMessage::UpdateAvailable {
            version: "2.0.0".into()
        }
    );
}

#[tokio::test]
async fn test_unreachable_origin_fails_install() {
    let site = Site::start().await;
    site.go_offline().await;
    let store = Arc::new(MemoryCacheStorage::new());
    let worker = worker(&site, store.clone(), Arc::new(InMemoryClients::new()));

    assert!(worker.handle_event(LifecycleEvent::Install).await.is_err());
    assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
    assert!(store.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redirected_page_is_never_cached_under_its_request_url() {
    let site = Site::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", site.url("/login").as_str()))
        .mount(&site.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&site.server)
        .await;
    let store = Arc::new(MemoryCacheStorage::new());
    let worker = worker(&site, store.clone(), Arc::new(InMemoryClients::new()));
    worker.handle_event(LifecycleEvent::Install).await.unwrap();

    let first = worker
        .handle_fetch(FetchEvent::new(Request::navigate(site.url("/old"))))
        .await
        .unwrap();
    assert_eq!(first.source, FetchSource::Network);
    assert!(first.response.redirected);
    assert_eq!(first.response.text().unwrap(), "<html>login</html>");
    assert_eq!(worker.shutdown().await, 0);

    assert!(store
        .match_in("harbor-1.0.0", &CacheKey::get(&site.url("/old")))
        .await
        .unwrap()
        .is_none());

    // the redirect is followed again rather than replayed from the cache
    let second = worker
        .handle_fetch(FetchEvent::new(Request::navigate(site.url("/old"))))
        .await
        .unwrap();
    assert_eq!(second.source, FetchSource::Network);
    assert_eq!(site.requests_for("/old").await, 2);
}
