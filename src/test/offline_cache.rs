use std::sync::Arc;

use reqwest::Method;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{temp_env, ScriptedFetcher};
use crate::error::CacheError;
use crate::local_db_state::DbEnvironment;
use crate::offline_cache::fetch::cache_key;
use crate::offline_cache::{
    CacheStorage, CachedResponse, ControlMessage, FetchOutcome, FetchRequest, HttpFetcher,
    LmdbCacheStorage, MemoryCacheStorage, NetworkFetch, OfflineCache, OfflineCacheConfig,
    OpenClients, ResponseSource, WorkerState,
};
use crate::sync_config::SyncHttpConfig;

const ORIGIN: &str = "https://app.test/";

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn app_config() -> OfflineCacheConfig {
    OfflineCacheConfig::new(Url::parse(ORIGIN).unwrap())
        .with_shell_routes(["/", "/offline"])
        .with_static_assets(["/assets/app.js", "/styles.css"])
}

fn scripted_site() -> Arc<ScriptedFetcher> {
    let network = Arc::new(ScriptedFetcher::new());
    network.respond(url("/").as_str(), 200, "<html>shell</html>");
    network.respond(url("/offline").as_str(), 200, "<html>offline</html>");
    network.respond(url("/assets/app.js").as_str(), 200, "console.log('app')");
    network.respond(url("/styles.css").as_str(), 200, "body {}");
    network
}

struct Harness {
    cache: OfflineCache,
    storage: Arc<MemoryCacheStorage>,
    network: Arc<ScriptedFetcher>,
    clients: Arc<OpenClients>,
}

fn harness(config: OfflineCacheConfig) -> Harness {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = scripted_site();
    let clients = Arc::new(OpenClients::new());
    let cache = OfflineCache::new(config, storage.clone(), network.clone(), clients.clone());
    Harness {
        cache,
        storage,
        network,
        clients,
    }
}

async fn active(config: OfflineCacheConfig) -> Harness {
    let h = harness(config);
    h.cache.install().await.unwrap();
    h.cache.activate().await.unwrap();
    h.network.reset_calls();
    h
}

fn body(outcome: &FetchOutcome) -> (&[u8], ResponseSource) {
    match outcome {
        FetchOutcome::Respond { response, source } => (response.body.as_slice(), *source),
        FetchOutcome::PassThrough => panic!("expected a response, got pass-through"),
    }
}

#[tokio::test]
async fn test_install_precaches_shell_and_static_buckets() {
    let h = harness(app_config());
    assert_eq!(h.cache.state(), WorkerState::Parsed);

    h.cache.install().await.unwrap();
    assert_eq!(h.cache.state(), WorkerState::Installed);

    let shell = h.storage.get("shell-v1", url("/").as_str()).await.unwrap();
    assert_eq!(shell.unwrap().body, b"<html>shell</html>".to_vec());
    assert!(h.storage.get("shell-v1", url("/offline").as_str()).await.unwrap().is_some());
    assert!(h.storage.get("static-v1", url("/assets/app.js").as_str()).await.unwrap().is_some());
    assert!(h.storage.get("static-v1", url("/styles.css").as_str()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_install_is_redundant() {
    let config = app_config().with_static_assets(["/assets/app.js", "/assets/missing.js"]);
    let h = harness(config);

    let result = h.cache.install().await;
    assert!(matches!(result, Err(CacheError::Install { .. })));
    assert_eq!(h.cache.state(), WorkerState::Redundant);
    assert!(matches!(h.cache.activate().await, Err(CacheError::InvalidState { .. })));
    assert!(h.storage.get("static-v1", url("/assets/app.js").as_str()).await.unwrap().is_none());

    let request = FetchRequest::get(url("/assets/app.js"));
    assert_eq!(h.cache.handle_fetch(&request).await.unwrap(), FetchOutcome::PassThrough);
}

#[tokio::test]
async fn test_install_fails_when_network_is_down() {
    let h = harness(app_config());
    h.network.set_offline(true);

    assert!(matches!(h.cache.install().await, Err(CacheError::Install { .. })));
    assert_eq!(h.cache.state(), WorkerState::Redundant);
    assert!(h.storage.bucket_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_activation_sweeps_stale_generations_and_claims_clients() {
    let h = harness(app_config().with_version("v2"));
    let stale = CachedResponse::new(200, "old");
    h.storage.put("shell-v1", url("/").as_str(), &stale).await.unwrap();
    h.storage.put("static-v1", url("/assets/app.js").as_str(), &stale).await.unwrap();
    h.storage.open("unrelated").await.unwrap();
    h.clients.register("tab-1");
    h.clients.register("tab-2");
    h.clients.register("closed-tab");
    h.clients.unregister("closed-tab");

    h.cache.install().await.unwrap();
    let report = h.cache.activate().await.unwrap();

    assert_eq!(h.cache.state(), WorkerState::Activated);
    let mut deleted = report.deleted_buckets.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["shell-v1", "static-v1", "unrelated"]);
    assert_eq!(report.claimed_clients, 2);
    assert_eq!(h.clients.controller("tab-1").as_deref(), Some("v2"));

    let mut live = h.storage.bucket_names().await.unwrap();
    live.sort();
    assert_eq!(live, vec!["shell-v2", "static-v2"]);
}

#[tokio::test]
async fn test_requests_pass_through_until_activated() {
    let h = harness(app_config());
    let request = FetchRequest::get(url("/assets/app.js"));
    assert_eq!(h.cache.handle_fetch(&request).await.unwrap(), FetchOutcome::PassThrough);

    h.cache.install().await.unwrap();
    assert_eq!(h.cache.handle_fetch(&request).await.unwrap(), FetchOutcome::PassThrough);

    h.cache.activate().await.unwrap();
    let outcome = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&outcome).1, ResponseSource::Cache);
}

#[tokio::test]
async fn test_non_get_and_foreign_requests_pass_through() {
    let h = active(app_config()).await;

    let post = FetchRequest::get(url("/api/items")).with_method(Method::POST);
    assert_eq!(h.cache.handle_fetch(&post).await.unwrap(), FetchOutcome::PassThrough);

    let foreign = FetchRequest::get(Url::parse("https://cdn.other.test/lib.js").unwrap());
    assert_eq!(h.cache.handle_fetch(&foreign).await.unwrap(), FetchOutcome::PassThrough);

    let insecure_scheme = FetchRequest::get(Url::parse("ws://app.test/socket").unwrap());
    assert_eq!(h.cache.handle_fetch(&insecure_scheme).await.unwrap(), FetchOutcome::PassThrough);

    assert!(h.network.calls().is_empty());
}

#[tokio::test]
async fn test_cached_static_asset_served_without_network() {
    let h = active(app_config()).await;

    let outcome = h
        .cache
        .handle_fetch(&FetchRequest::get(url("/assets/app.js#section")))
        .await
        .unwrap();

    assert_eq!(body(&outcome), (&b"console.log('app')"[..], ResponseSource::Cache));
    assert!(h.network.calls().is_empty());
}

#[tokio::test]
async fn test_cache_first_miss_fetches_and_stores() {
    let h = active(app_config()).await;
    h.network.respond(url("/icons/late.png").as_str(), 200, "png");

    let request = FetchRequest::get(url("/icons/late.png"));
    let first = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&first).1, ResponseSource::Network);
    assert!(h.storage.get("default-v1", url("/icons/late.png").as_str()).await.unwrap().is_some());

    h.network.set_offline(true);
    let second = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&second), (&b"png"[..], ResponseSource::Cache));
    assert_eq!(h.network.calls().len(), 1);
}

#[tokio::test]
async fn test_network_first_prefers_fresh_response() {
    let h = active(app_config()).await;
    h.network.respond(url("/api/items").as_str(), 200, "v1");
    let request = FetchRequest::get(url("/api/items"));

    let first = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&first), (&b"v1"[..], ResponseSource::Network));

    h.network.respond(url("/api/items").as_str(), 200, "v2");
    let second = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&second), (&b"v2"[..], ResponseSource::Network));

    h.network.set_offline(true);
    let offline = h.cache.handle_fetch(&request).await.unwrap();
    assert_eq!(body(&offline), (&b"v2"[..], ResponseSource::Cache));
}

#[tokio::test]
async fn test_error_statuses_are_returned_but_not_cached() {
    let h = active(app_config()).await;
    let request = FetchRequest::get(url("/api/missing"));

    let outcome = h.cache.handle_fetch(&request).await.unwrap();
    match &outcome {
        FetchOutcome::Respond { response, source } => {
            assert_eq!(response.status, 404);
            assert_eq!(*source, ResponseSource::Network);
        }
        FetchOutcome::PassThrough => panic!("expected a response"),
    }
    assert!(h.storage.get("default-v1", url("/api/missing").as_str()).await.unwrap().is_none());

    h.network.set_offline(true);
    assert!(matches!(
        h.cache.handle_fetch(&request).await,
        Err(CacheError::Network { .. })
    ));
}

#[tokio::test]
async fn test_offline_navigation_falls_back_to_root_document() {
    let h = active(app_config()).await;
    h.network.set_offline(true);

    let outcome = h
        .cache
        .handle_fetch(&FetchRequest::navigate(url("/tasks/42")))
        .await
        .unwrap();
    assert_eq!(body(&outcome), (&b"<html>shell</html>"[..], ResponseSource::Fallback));

    let cached_route = h
        .cache
        .handle_fetch(&FetchRequest::navigate(url("/offline")))
        .await
        .unwrap();
    assert_eq!(body(&cached_route), (&b"<html>offline</html>"[..], ResponseSource::Cache));
}

#[tokio::test]
async fn test_skip_waiting_message_activates_installed_worker() {
    let h = harness(app_config());

    h.cache.handle_message(ControlMessage::SkipWaiting).await.unwrap();
    assert_eq!(h.cache.state(), WorkerState::Parsed);

    h.cache.install().await.unwrap();
    h.cache.handle_message_json(r#"{"type":"SKIP_WAITING"}"#).await.unwrap();
    assert_eq!(h.cache.state(), WorkerState::Activated);
}

#[tokio::test]
async fn test_cache_urls_message_caches_reachable_urls() {
    let h = active(app_config()).await;
    h.network.respond(url("/reports/2024.json").as_str(), 200, "{}");

    h.cache
        .handle_message_json(r#"{"type":"CACHE_URLS","urls":["/reports/2024.json","/reports/missing.json"]}"#)
        .await
        .unwrap();

    assert!(h
        .storage
        .get("default-v1", url("/reports/2024.json").as_str())
        .await
        .unwrap()
        .is_some());
    assert!(h
        .storage
        .get("default-v1", url("/reports/missing.json").as_str())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unknown_message_is_rejected() {
    let h = harness(app_config());
    let result = h.cache.handle_message_json(r#"{"type":"CLAIM_EVERYTHING"}"#).await;
    assert!(matches!(result, Err(CacheError::BadMessage(_))));
}

#[test]
fn test_static_asset_allow_list() {
    let config = app_config();
    assert!(config.is_static_asset(&url("/assets/anything")));
    assert!(config.is_static_asset(&url("/fonts/inter")));
    assert!(config.is_static_asset(&url("/main.JS")));
    assert!(config.is_static_asset(&url("/manifest.webmanifest")));
    assert!(!config.is_static_asset(&url("/api/items")));
    assert!(!config.is_static_asset(&url("/js/")));

    assert_eq!(config.current_buckets(), ["shell-v1", "static-v1", "default-v1"].map(String::from));
    assert_eq!(cache_key(&url("/page?q=1#top")), "https://app.test/page?q=1");
}

#[tokio::test]
async fn test_lmdb_cache_storage_buckets() {
    let (_dir, env) = temp_env();
    let storage = LmdbCacheStorage::open(&env).unwrap();
    let response = CachedResponse::new(200, "body").with_header("content-type", "text/plain");

    storage.open("empty-v1").await.unwrap();
    storage.put("a", "https://app.test/x", &response).await.unwrap();
    storage.put("ab", "https://app.test/x", &response).await.unwrap();

    assert_eq!(storage.bucket_names().await.unwrap(), vec!["a", "ab", "empty-v1"]);
    assert_eq!(storage.get("a", "https://app.test/x").await.unwrap(), Some(response.clone()));
    assert!(storage.get("a", "https://app.test/y").await.unwrap().is_none());

    assert!(storage.delete_bucket("a").await.unwrap());
    assert!(!storage.delete_bucket("a").await.unwrap());
    assert!(!storage.delete_bucket("zzz").await.unwrap());
    assert_eq!(storage.bucket_names().await.unwrap(), vec!["ab", "empty-v1"]);
    assert_eq!(storage.get("ab", "https://app.test/x").await.unwrap(), Some(response));
}

#[tokio::test]
async fn test_lmdb_cache_survives_reopen_and_keeps_collections_apart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");

    {
        let env = DbEnvironment::open(&path).unwrap();
        let h = harness(app_config());
        let storage = Arc::new(LmdbCacheStorage::open(&env).unwrap());
        let cache = OfflineCache::new(app_config(), storage, h.network.clone(), h.clients.clone());
        cache.install().await.unwrap();
    }

    let env = DbEnvironment::open(&path).unwrap();
    let storage = env.cache_storage().unwrap();
    assert_eq!(storage.bucket_names().await.unwrap(), vec!["shell-v1", "static-v1"]);
    assert!(env.collection("__offline_cache").is_err());
}

#[tokio::test]
async fn test_http_fetcher_captures_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/assets/app.js"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("console.log('app')", "text/javascript")
                .insert_header("x-cache-generation", "v1"),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(&SyncHttpConfig::default()).unwrap();
    let base = Url::parse(&server.uri()).unwrap();

    let hit = fetcher
        .fetch(&FetchRequest::get(base.join("/assets/app.js").unwrap()))
        .await
        .unwrap();
    assert!(hit.is_success());
    assert_eq!(hit.body, b"console.log('app')".to_vec());
    assert!(hit
        .headers
        .iter()
        .any(|(name, value)| name == "content-type" && value == "text/javascript"));
    assert!(hit
        .headers
        .iter()
        .any(|(name, value)| name == "x-cache-generation" && value == "v1"));

    let miss = fetcher
        .fetch(&FetchRequest::get(base.join("/missing").unwrap()))
        .await
        .unwrap();
    assert_eq!(miss.status, 404);
    assert!(!miss.is_success());
}

#[tokio::test]
async fn test_fresh_lmdb_cache_has_no_buckets() {
    let (_dir, env) = temp_env();
    let storage = env.cache_storage().unwrap();

    assert!(storage.bucket_names().await.unwrap().is_empty());
    assert!(!storage.delete_bucket("shell-v1").await.unwrap());
    assert!(storage.get("shell-v1", "https://app.test/").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lmdb_cache_delete_of_bucket_sorting_after_all_keys() {
    let (_dir, env) = temp_env();
    let storage = env.cache_storage().unwrap();
    storage.put("a", "k", &CachedResponse::new(200, "x")).await.unwrap();

    assert!(!storage.delete_bucket("zzz").await.unwrap());
    assert_eq!(storage.bucket_names().await.unwrap(), vec!["a"]);
}

#[tokio::test]
async fn test_generation_upgrade_on_durable_cache() {
    let (_dir, env) = temp_env();
    let storage = Arc::new(env.cache_storage().unwrap());
    let network = scripted_site();
    let clients = Arc::new(OpenClients::new());
    clients.register("tab-1");

    let v1 = OfflineCache::new(app_config(), storage.clone(), network.clone(), clients.clone());
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    network.respond(url("/api/items").as_str(), 200, "items");
    v1.handle_fetch(&FetchRequest::get(url("/api/items"))).await.unwrap();

    network.respond(url("/").as_str(), 200, "<html>shell v2</html>");
    let v2 = OfflineCache::new(
        app_config().with_version("v2"),
        storage.clone(),
        network.clone(),
        clients.clone(),
    );
    v2.install().await.unwrap();
    let report = v2.activate().await.unwrap();

    let mut deleted = report.deleted_buckets.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["default-v1", "shell-v1", "static-v1"]);
    assert_eq!(clients.controller("tab-1").as_deref(), Some("v2"));
    assert_eq!(storage.bucket_names().await.unwrap(), vec!["shell-v2", "static-v2"]);
    assert!(storage.get("shell-v1", url("/").as_str()).await.unwrap().is_none());

    network.set_offline(true);
    let outcome = v2.handle_fetch(&FetchRequest::navigate(url("/"))).await.unwrap();
    assert_eq!(body(&outcome), (&b"<html>shell v2</html>"[..], ResponseSource::Cache));
}
