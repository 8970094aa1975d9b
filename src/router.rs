//! Request router that picks a caching strategy per request class.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CachedResponse, RequestKey, ResponseCache};
use crate::http::{Request, Response};
use crate::net::{Network, NetworkError};

/// Extensions answered with the placeholder image when offline.
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".svg"];

/// How a request is treated, decided by its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// API endpoint: network first, API collection
  Api,
  /// Root document: network first, offline page fallback
  Document,
  /// Everything else: cache first, static collection
  Static,
}

/// Cache names and well-known paths the router works with.
#[derive(Debug, Clone)]
pub struct RouteTable {
  pub static_cache: String,
  pub api_cache: String,
  pub api_prefixes: Vec<String>,
  pub offline_page: RequestKey,
  pub placeholder_image: RequestKey,
}

impl RouteTable {
  pub fn classify(&self, path: &str) -> RequestClass {
    if self
      .api_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      RequestClass::Api
    } else if path == "/" || path == "/index.html" {
      RequestClass::Document
    } else {
      RequestClass::Static
    }
  }
}

/// Answers fetch events from the response cache and the network.
///
/// Only GET requests are read from or written to the cache. Other methods go
/// through the same strategy with both cache steps skipped.
pub struct RequestRouter<N: Network, C: ResponseCache> {
  network: N,
  cache: Arc<C>,
  routes: Arc<RouteTable>,
}

impl<N: Network, C: ResponseCache> RequestRouter<N, C> {
  pub fn new(network: N, cache: Arc<C>, routes: RouteTable) -> Self {
    Self {
      network,
      cache,
      routes: Arc::new(routes),
    }
  }

  pub fn routes(&self) -> &RouteTable {
    &self.routes
  }

  /// Produce a response for `request`.
  ///
  /// Network failures are absorbed by the fallbacks of each strategy. The
  /// error only escapes when no fallback applies.
  pub async fn handle(&self, request: Request) -> Result<Response, NetworkError> {
    match self.routes.classify(request.path()) {
      RequestClass::Api => self.network_first_api(request).await,
      RequestClass::Document => self.network_first_document(request).await,
      RequestClass::Static => self.cache_first_static(request).await,
    }
  }

  /// 1. Try the network; cache a 200 into the API collection
  /// 2. On network failure, serve any cached copy
  /// 3. Otherwise answer with the offline error payload
  async fn network_first_api(&self, request: Request) -> Result<Response, NetworkError> {
    let key = RequestKey::from_url(&request.url);
    let cacheable = request.is_get();

    match self.network.fetch(request).await {
      Ok(response) => {
        if cacheable && response.status() == 200 {
          self.store(&self.routes.api_cache, &key, response.duplicate());
        }
        Ok(response)
      }
      Err(err) => {
        debug!(%key, error = %err, "API request failed, trying cache");
        let cached = if cacheable { self.lookup(&key) } else { None };
        Ok(cached.unwrap_or_else(Response::offline_api_error))
      }
    }
  }

  /// 1. Try the network; cache a 200 into the static collection
  /// 2. On network failure, serve the cached document
  /// 3. Otherwise serve the cached offline page
  async fn network_first_document(&self, request: Request) -> Result<Response, NetworkError> {
    let key = RequestKey::from_url(&request.url);
    let cacheable = request.is_get();

    match self.network.fetch(request).await {
      Ok(response) => {
        if cacheable && response.status() == 200 {
          self.store(&self.routes.static_cache, &key, response.duplicate());
        }
        Ok(response)
      }
      Err(err) => {
        debug!(%key, error = %err, "Document request failed, trying cache");
        let cached = if cacheable { self.lookup(&key) } else { None };
        cached
          .or_else(|| self.lookup(&self.routes.offline_page))
          .ok_or(err)
      }
    }
  }

  /// 1. Serve from cache when present, without touching the network
  /// 2. Otherwise fetch; cache a 200 into the static collection
  /// 3. On network failure, images get the placeholder; the rest fail
  async fn cache_first_static(&self, request: Request) -> Result<Response, NetworkError> {
    let key = RequestKey::from_url(&request.url);
    let cacheable = request.is_get();

    if cacheable {
      if let Some(cached) = self.lookup(&key) {
        return Ok(cached);
      }
    }

    let is_image = has_image_extension(request.path());

    match self.network.fetch(request).await {
      Ok(response) => {
        if cacheable && response.status() == 200 {
          self.store(&self.routes.static_cache, &key, response.duplicate());
        }
        Ok(response)
      }
      Err(err) if is_image => {
        debug!(%key, error = %err, "Image request failed, serving placeholder");
        self.lookup(&self.routes.placeholder_image).ok_or(err)
      }
      Err(err) => Err(err),
    }
  }

  /// Look `key` up in every collection. Storage errors count as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<Response> {
    match self.cache.match_key(key, None) {
      Ok(Some(CachedResponse {
        response,
        collection,
        cached_at,
      })) => {
        debug!(%key, %collection, %cached_at, "Serving cached response");
        Some(response)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(%key, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Write a duplicated response. Storage errors are logged and dropped.
  fn store(&self, collection: &str, key: &RequestKey, response: Response) {
    let result = self
      .cache
      .open(collection)
      .and_then(|handle| self.cache.put(&handle, key, response));

    if let Err(e) = result {
      warn!(%key, collection, error = %e, "Failed to cache response");
    }
  }
}

impl<N: Network, C: ResponseCache> Clone for RequestRouter<N, C> {
  fn clone(&self) -> Self {
    Self {
      network: self.network.clone(),
      cache: Arc::clone(&self.cache),
      routes: Arc::clone(&self.routes),
    }
  }
}

fn has_image_extension(path: &str) -> bool {
  IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteResponseCache;
  use crate::http::OFFLINE_API_ERROR;
  use crate::test_support::ScriptedNetwork;
  use url::Url;

  const STATIC: &str = "nutrition-app-v1";
  const API: &str = "api-cache-v1";

  fn routes() -> RouteTable {
    RouteTable {
      static_cache: STATIC.to_string(),
      api_cache: API.to_string(),
      api_prefixes: vec![
        "/api/user-profile/".to_string(),
        "/api/meal-plan/".to_string(),
        "/api/food-database/".to_string(),
        "/api/journal-entries/".to_string(),
      ],
      offline_page: RequestKey::from_path("/offline/"),
      placeholder_image: RequestKey::from_path("/static/images/offline-placeholder.png"),
    }
  }

  fn setup() -> (
    ScriptedNetwork,
    Arc<SqliteResponseCache>,
    RequestRouter<ScriptedNetwork, SqliteResponseCache>,
  ) {
    let network = ScriptedNetwork::new();
    let cache = Arc::new(SqliteResponseCache::in_memory().unwrap());
    let router = RequestRouter::new(network.clone(), Arc::clone(&cache), routes());
    (network, cache, router)
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://origin.test").unwrap().join(path).unwrap())
  }

  fn seed(cache: &SqliteResponseCache, collection: &str, path: &str, body: &str) {
    let handle = cache.open(collection).unwrap();
    cache
      .put(
        &handle,
        &RequestKey::from_path(path),
        Response::new(200, Vec::new(), body.to_string()),
      )
      .unwrap();
  }

  fn cached_body(cache: &SqliteResponseCache, collection: &str, path: &str) -> Option<Vec<u8>> {
    cache
      .match_key(&RequestKey::from_path(path), Some(collection))
      .unwrap()
      .map(|hit| hit.response.into_body().to_vec())
  }

  #[test]
  fn test_classify() {
    let routes = routes();
    assert_eq!(routes.classify("/api/meal-plan/3/"), RequestClass::Api);
    assert_eq!(routes.classify("/api/user-profile/"), RequestClass::Api);
    assert_eq!(routes.classify("/"), RequestClass::Document);
    assert_eq!(routes.classify("/index.html"), RequestClass::Document);
    assert_eq!(routes.classify("/static/css/base.css"), RequestClass::Static);
    // Not in the prefix list
    assert_eq!(routes.classify("/api/add-food-to-journal/"), RequestClass::Static);
  }

  #[test]
  fn test_image_extensions() {
    assert!(has_image_extension("/static/images/apple.png"));
    assert!(has_image_extension("/media/logo.svg"));
    assert!(!has_image_extension("/static/js/main.js"));
    assert!(!has_image_extension("/static/images/apple.PNG"));
  }

  #[tokio::test]
  async fn test_static_hit_skips_network() {
    let (network, cache, router) = setup();
    seed(&cache, STATIC, "/static/css/base.css", "cached css");
    network.respond("/static/css/base.css", 200, "fresh css");

    let response = router.handle(get("/static/css/base.css")).await.unwrap();

    assert_eq!(response.body(), b"cached css");
    assert_eq!(network.request_count("/static/css/base.css"), 0);
  }

  #[tokio::test]
  async fn test_static_miss_is_fetched_and_cached() {
    let (network, cache, router) = setup();
    network.respond("/static/js/main.js", 200, "main");

    let response = router.handle(get("/static/js/main.js")).await.unwrap();
    assert_eq!(response.body(), b"main");
    assert_eq!(
      cached_body(&cache, STATIC, "/static/js/main.js"),
      Some(b"main".to_vec())
    );

    // Second request is served from cache
    router.handle(get("/static/js/main.js")).await.unwrap();
    assert_eq!(network.request_count("/static/js/main.js"), 1);
  }

  #[tokio::test]
  async fn test_static_error_status_not_cached() {
    let (network, cache, router) = setup();
    network.respond("/static/js/missing.js", 404, "not found");

    let response = router.handle(get("/static/js/missing.js")).await.unwrap();

    assert_eq!(response.status(), 404);
    assert!(cached_body(&cache, STATIC, "/static/js/missing.js").is_none());
  }

  #[tokio::test]
  async fn test_static_image_offline_gets_placeholder() {
    let (network, cache, router) = setup();
    seed(
      &cache,
      STATIC,
      "/static/images/offline-placeholder.png",
      "placeholder",
    );
    network.fail("/static/images/apple.png");

    let response = router.handle(get("/static/images/apple.png")).await.unwrap();
    assert_eq!(response.body(), b"placeholder");
  }

  #[tokio::test]
  async fn test_static_non_image_offline_propagates() {
    let (network, _cache, router) = setup();
    network.fail("/static/js/chart.js");

    let err = router.handle(get("/static/js/chart.js")).await.unwrap_err();
    assert!(matches!(err, NetworkError::Unreachable(_)));
  }

  #[tokio::test]
  async fn test_api_success_is_stored() {
    let (network, cache, router) = setup();
    network.respond("/api/meal-plan/", 200, r#"{"meals":[]}"#);

    let response = router.handle(get("/api/meal-plan/?week=2")).await.unwrap();

    let stored = cache
      .match_key(&RequestKey::from_path("/api/meal-plan/?week=2"), Some(API))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response, response);
    assert!(cached_body(&cache, STATIC, "/api/meal-plan/?week=2").is_none());
  }

  #[tokio::test]
  async fn test_api_error_status_passes_through() {
    let (network, cache, router) = setup();
    network.respond("/api/user-profile/", 403, "forbidden");

    let response = router.handle(get("/api/user-profile/")).await.unwrap();

    assert_eq!(response.status(), 403);
    assert!(cached_body(&cache, API, "/api/user-profile/").is_none());
  }

  #[tokio::test]
  async fn test_api_offline_serves_cached_copy() {
    let (network, cache, router) = setup();
    seed(&cache, API, "/api/food-database/", "foods");
    network.fail("/api/food-database/");

    let response = router.handle(get("/api/food-database/")).await.unwrap();
    assert_eq!(response.body(), b"foods");
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_returns_error_payload() {
    let (network, _cache, router) = setup();
    network.fail("/api/journal-entries/");

    let response = router.handle(get("/api/journal-entries/")).await.unwrap();

    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body, serde_json::json!({ "error": OFFLINE_API_ERROR }));
  }

  #[tokio::test]
  async fn test_api_post_is_never_cached() {
    let (network, cache, router) = setup();
    seed(&cache, API, "/api/meal-plan/", "cached plan");
    network.fail("/api/meal-plan/");

    let post = Request::post_json(
      Url::parse("http://origin.test/api/meal-plan/").unwrap(),
      b"{}".to_vec(),
    );
    let response = router.handle(post).await.unwrap();

    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], OFFLINE_API_ERROR);
  }

  #[tokio::test]
  async fn test_document_success_updates_cache() {
    let (network, cache, router) = setup();
    seed(&cache, STATIC, "/", "old home");
    network.respond("/", 200, "new home");

    let response = router.handle(get("/")).await.unwrap();

    assert_eq!(response.body(), b"new home");
    assert_eq!(cached_body(&cache, STATIC, "/"), Some(b"new home".to_vec()));
  }

  #[tokio::test]
  async fn test_document_offline_serves_cached_document() {
    let (network, cache, router) = setup();
    seed(&cache, STATIC, "/", "home");
    seed(&cache, STATIC, "/offline/", "offline page");
    network.fail("/");

    let response = router.handle(get("/")).await.unwrap();
    assert_eq!(response.body(), b"home");
  }

  #[tokio::test]
  async fn test_document_offline_without_cache_serves_offline_page() {
    let (network, cache, router) = setup();
    seed(&cache, STATIC, "/offline/", "offline page");
    network.fail("/index.html");

    let response = router.handle(get("/index.html")).await.unwrap();
    assert_eq!(response.body(), b"offline page");
  }

  #[tokio::test]
  async fn test_document_offline_with_nothing_cached_fails() {
    let (network, _cache, router) = setup();
    network.fail("/");

    assert!(router.handle(get("/")).await.is_err());
  }

  /// Cache whose every operation fails, as with a corrupt or locked database.
  struct BrokenCache;

  impl ResponseCache for BrokenCache {
    fn open(&self, name: &str) -> color_eyre::Result<crate::cache::CacheHandle> {
      Err(color_eyre::eyre::eyre!("cannot open {}", name))
    }

    fn put(
      &self,
      _handle: &crate::cache::CacheHandle,
      key: &RequestKey,
      _response: Response,
    ) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("cannot store {}", key))
    }

    fn match_key(
      &self,
      key: &RequestKey,
      _collection: Option<&str>,
    ) -> color_eyre::Result<Option<CachedResponse>> {
      Err(color_eyre::eyre::eyre!("cannot read {}", key))
    }

    fn delete(&self, name: &str) -> color_eyre::Result<bool> {
      Err(color_eyre::eyre::eyre!("cannot delete {}", name))
    }

    fn keys(&self) -> color_eyre::Result<std::collections::BTreeSet<String>> {
      Err(color_eyre::eyre::eyre!("cannot list caches"))
    }
  }

  fn broken_router(network: &ScriptedNetwork) -> RequestRouter<ScriptedNetwork, BrokenCache> {
    RequestRouter::new(network.clone(), Arc::new(BrokenCache), routes())
  }

  #[tokio::test]
  async fn test_cache_write_failure_still_returns_network_response() {
    let network = ScriptedNetwork::new();
    network
      .respond("/api/meal-plan/", 200, "plan")
      .respond("/", 200, "home")
      .respond("/static/js/main.js", 200, "main");
    let router = broken_router(&network);

    for (path, body) in [
      ("/api/meal-plan/", "plan"),
      ("/", "home"),
      ("/static/js/main.js", "main"),
    ] {
      let response = router.handle(get(path)).await.unwrap();
      assert_eq!(response.status(), 200);
      assert_eq!(response.body(), body.as_bytes());
    }
  }

  #[tokio::test]
  async fn test_cache_read_failure_falls_back_like_a_miss() {
    let network = ScriptedNetwork::new();
    network.fail("/api/user-profile/").fail("/logo.png").fail("/");
    let router = broken_router(&network);

    let response = router.handle(get("/api/user-profile/")).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["error"], OFFLINE_API_ERROR);

    assert!(matches!(
      router.handle(get("/logo.png")).await,
      Err(NetworkError::Unreachable(_))
    ));
    assert!(router.handle(get("/")).await.is_err());
  }
}
