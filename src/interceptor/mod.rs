//! Network-interception process.
//!
//! Sits between every proxied request and the upstream and picks a strategy by
//! request class:
//! - API: network first, cached copy on failure, then an offline payload
//! - images: cache first, placeholder on failure
//! - everything else: cache first, offline document for failed navigations
//!
//! Nothing is kept in memory between requests; the lifecycle state, the active
//! clinic and the cached responses are read from the store each time.

mod classify;
pub mod fallback;
mod lifecycle;
mod records;
mod versions;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::precache::PrecacheFetcher;
use crate::scope::ClinicScopeManager;
use crate::store::{CacheKey, Partition, SqliteStore};
use crate::sync::ClientMessage;
use crate::transport::{Request, Response, Transport, Upstream};

pub use classify::{classify, RequestClass};
pub use lifecycle::Lifecycle;
pub use versions::{CacheLayout, CacheVersions};

use records::count_records;

const LIFECYCLE_KEY: &str = "lifecycle";

#[derive(Debug, Clone)]
pub struct InterceptorSettings {
  pub api_prefix: String,
  pub layout: CacheLayout,
  /// App shell cached on install
  pub shell: Vec<String>,
  /// Served for failed navigations when cached
  pub offline_page: String,
}

impl Default for InterceptorSettings {
  fn default() -> Self {
    Self {
      api_prefix: "/api".to_string(),
      layout: CacheLayout::new("ocusync", CacheVersions::default()),
      shell: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
    }
  }
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  Network,
  Cache,
  Fallback,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
    }
  }
}

#[derive(Debug)]
pub struct Intercepted {
  pub class: RequestClass,
  pub source: ResponseSource,
  pub response: Response,
}

/// Reply to a control message posted by a UI instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum MessageOutcome {
  Activated { removed: Vec<String> },
  AlreadyActive,
  Cached { cached: usize },
}

pub struct Interceptor {
  store: Arc<SqliteStore>,
  scope: ClinicScopeManager,
  transport: Arc<dyn Transport>,
  upstream: Upstream,
  settings: InterceptorSettings,
}

impl Interceptor {
  pub fn new(
    store: Arc<SqliteStore>,
    scope: ClinicScopeManager,
    transport: Arc<dyn Transport>,
    upstream: Upstream,
    settings: InterceptorSettings,
  ) -> Self {
    Self {
      store,
      scope,
      transport,
      upstream,
      settings,
    }
  }

  pub fn upstream(&self) -> &Upstream {
    &self.upstream
  }

  pub fn settings(&self) -> &InterceptorSettings {
    &self.settings
  }

  pub fn lifecycle(&self) -> Result<Option<Lifecycle>> {
    self
      .store
      .meta(LIFECYCLE_KEY)?
      .map(|s| s.parse())
      .transpose()
  }

  fn set_lifecycle(&self, state: Lifecycle) -> Result<()> {
    self.store.set_meta(LIFECYCLE_KEY, state.as_str())?;
    debug!(state = %state, "lifecycle changed");
    Ok(())
  }

  fn is_active(&self) -> bool {
    match self.lifecycle() {
      Ok(state) => state == Some(Lifecycle::Active),
      Err(e) => {
        warn!("failed to read lifecycle: {}", e);
        false
      }
    }
  }

  /// Fetch the app shell into the static partition.
  ///
  /// Every shell asset must come back 200 before anything is written, so a
  /// failed install leaves the store as it was. An active interceptor whose
  /// partitions are already current stays active; a version change waits for
  /// the next activation.
  pub async fn install(&self) -> Result<usize> {
    let previous = self.lifecycle()?;
    let keep_active = previous == Some(Lifecycle::Active) && self.layout_is_current()?;
    if !keep_active {
      self.set_lifecycle(Lifecycle::Installing)?;
    }

    let fetched = match self.fetch_shell().await {
      Ok(fetched) => fetched,
      Err(e) => {
        if let Some(previous) = previous {
          self.set_lifecycle(previous)?;
        }
        return Err(e);
      }
    };

    let partition = self.settings.layout.name(Partition::StaticAssets);
    for (url, response) in &fetched {
      let key = CacheKey::new(partition.as_str(), &Method::GET, url, None);
      self.store.put_entry(&key, response, 0)?;
    }

    let state = if keep_active {
      Lifecycle::Active
    } else {
      Lifecycle::Installed
    };
    self.set_lifecycle(state)?;
    info!(assets = fetched.len(), partition = %partition, state = %state, "app shell installed");
    Ok(fetched.len())
  }

  /// Whether the stored partitions are exactly the configured ones.
  fn layout_is_current(&self) -> Result<bool> {
    let mut existing = self.store.list_partitions()?;
    let mut current = self.settings.layout.current();
    existing.sort();
    current.sort();
    Ok(existing == current)
  }

  async fn fetch_shell(&self) -> Result<Vec<(Url, Response)>> {
    let mut fetched = Vec::with_capacity(self.settings.shell.len());
    for path in &self.settings.shell {
      let request = self.upstream.request(Method::GET, path, None)?;
      let url = request.url.clone();
      let response = self
        .transport
        .send(request)
        .await
        .map_err(|e| eyre!("Failed to fetch shell asset '{}': {}", path, e))?;
      if response.status != StatusCode::OK {
        return Err(eyre!(
          "Shell asset '{}' returned HTTP {}",
          path,
          response.status.as_u16()
        ));
      }
      fetched.push((url, response));
    }
    Ok(fetched)
  }

  /// Delete every partition that is not current, then take over serving.
  /// Returns the names of the partitions removed.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.settings.layout.current();
    let mut removed = Vec::new();
    for name in self.store.list_partitions()? {
      if !current.contains(&name) {
        let entries = self.store.delete_partition(&name)?;
        info!(partition = %name, entries, "stale partition deleted");
        removed.push(name);
      }
    }
    for name in &current {
      self.store.ensure_partition(name)?;
    }

    self.set_lifecycle(Lifecycle::Active)?;
    info!(removed = removed.len(), "interceptor active");
    Ok(removed)
  }

  /// Handle `SKIP_WAITING` and `CACHE_URLS`. Sync messages only flow the other way.
  pub async fn handle_message(&self, message: ClientMessage) -> Result<MessageOutcome> {
    match message {
      ClientMessage::SkipWaiting => {
        if self.lifecycle()? == Some(Lifecycle::Active) {
          return Ok(MessageOutcome::AlreadyActive);
        }
        let removed = self.activate()?;
        Ok(MessageOutcome::Activated { removed })
      }
      ClientMessage::CacheUrls { payload } => {
        let cached = self.cache_urls(&payload).await;
        Ok(MessageOutcome::Cached { cached })
      }
      other => Err(eyre!("{} is not accepted from clients", other.kind())),
    }
  }

  /// Best-effort warm-up. Returns how many URLs ended up cached.
  pub async fn cache_urls(&self, urls: &[String]) -> usize {
    let clinic = self.active_clinic();
    let mut cached = 0;
    for raw in urls {
      match self.cache_url(raw, clinic.as_deref()).await {
        Ok(()) => cached += 1,
        Err(e) => debug!(url = %raw, "not cached: {}", e),
      }
    }
    info!(requested = urls.len(), cached, "cache warm-up finished");
    cached
  }

  async fn cache_url(&self, raw: &str, clinic: Option<&str>) -> Result<()> {
    let url = self.upstream.url(raw)?;
    if url.origin() != self.upstream.base().origin() {
      return Err(eyre!("'{}' is not on the upstream", raw));
    }

    let class = classify(&Method::GET, url.path(), &Default::default(), &self.settings.api_prefix);
    let mut request = Request::get(url.clone());
    if class == RequestClass::Api {
      request = self.upstream.request(Method::GET, raw, clinic)?;
    }

    let response = self.transport.send(request).await?;
    if response.status != StatusCode::OK {
      return Err(eyre!("HTTP {}", response.status.as_u16()));
    }

    let records = match class {
      RequestClass::Api => count_records(&response.body),
      _ => 0,
    };
    let key = self.key(class, &Method::GET, &url, clinic);
    self.store.put_entry(&key, &response, records)
  }

  /// Serve one proxied request. Never fails: network errors end in the
  /// cache or a fallback.
  pub async fn handle(&self, request: Request) -> Intercepted {
    let class = classify(
      &request.method,
      request.url.path(),
      &request.headers,
      &self.settings.api_prefix,
    );
    let active = self.is_active();
    let clinic = self.active_clinic();

    match class {
      RequestClass::Api => self.network_first(request, active, clinic.as_deref()).await,
      _ => {
        self
          .cache_first(request, class, active, clinic.as_deref())
          .await
      }
    }
  }

  async fn network_first(&self, request: Request, active: bool, clinic: Option<&str>) -> Intercepted {
    let class = RequestClass::Api;
    let is_get = request.method == Method::GET;
    let key = self.key(class, &request.method, &request.url, clinic);
    let target = request.path_and_query();

    match self.transport.send(request).await {
      Ok(response) => {
        if active && is_get && response.status == StatusCode::OK {
          self.store_best_effort(&key, &response, count_records(&response.body));
        }
        Intercepted::network(class, response)
      }
      Err(e) => {
        debug!(target = %target, "network failed: {}", e);
        if !is_get {
          return Intercepted::fallback(class, fallback::write());
        }
        if active {
          match self.store.get_entry(&key) {
            Ok(Some(entry)) => return Intercepted::cached(class, entry.into_response()),
            Ok(None) => {}
            Err(e) => warn!(target = %target, "cache lookup failed: {}", e),
          }
        }
        Intercepted::fallback(class, fallback::read())
      }
    }
  }

  async fn cache_first(
    &self,
    request: Request,
    class: RequestClass,
    active: bool,
    clinic: Option<&str>,
  ) -> Intercepted {
    let is_get = request.method == Method::GET;
    let key = self.key(class, &request.method, &request.url, clinic);
    let target = request.path_and_query();

    if active && is_get {
      match self.store.get_shared_entry(&key) {
        Ok(Some(entry)) => return Intercepted::cached(class, entry.into_response()),
        Ok(None) => {}
        Err(e) => warn!(target = %target, "cache lookup failed: {}", e),
      }
    }

    match self.transport.send(request).await {
      Ok(response) => {
        if active && is_get && response.status == StatusCode::OK {
          self.store_best_effort(&key, &response, 0);
        }
        Intercepted::network(class, response)
      }
      Err(e) => {
        debug!(target = %target, "network failed: {}", e);
        let response = match class {
          RequestClass::Image => fallback::image_placeholder(),
          RequestClass::Navigation => fallback::document(self.cached_offline_page(clinic)),
          _ => fallback::static_unavailable(),
        };
        Intercepted::fallback(class, response)
      }
    }
  }

  fn cached_offline_page(&self, clinic: Option<&str>) -> Option<Response> {
    let url = self.upstream.url(&self.settings.offline_page).ok()?;
    let key = self.key(RequestClass::Static, &Method::GET, &url, clinic);
    match self.store.get_shared_entry(&key) {
      Ok(entry) => entry.map(|e| e.into_response()),
      Err(e) => {
        warn!("offline page lookup failed: {}", e);
        None
      }
    }
  }

  fn key(&self, class: RequestClass, method: &Method, url: &Url, clinic: Option<&str>) -> CacheKey {
    CacheKey::new(self.settings.layout.name(class.partition()), method, url, clinic)
  }

  /// Caching must never get in the way of the response.
  fn store_best_effort(&self, key: &CacheKey, response: &Response, records: u64) {
    if let Err(e) = self.store.put_entry(key, response, records) {
      warn!(url = %key.url, "cache write failed: {}", e);
    }
  }

  fn active_clinic(&self) -> Option<String> {
    self.scope.active_clinic().unwrap_or_else(|e| {
      warn!("failed to read active clinic: {}", e);
      None
    })
  }
}

impl Intercepted {
  fn network(class: RequestClass, response: Response) -> Self {
    Self {
      class,
      source: ResponseSource::Network,
      response,
    }
  }

  fn cached(class: RequestClass, response: Response) -> Self {
    Self {
      class,
      source: ResponseSource::Cache,
      response,
    }
  }

  fn fallback(class: RequestClass, response: Response) -> Self {
    Self {
      class,
      source: ResponseSource::Fallback,
      response,
    }
  }
}

impl PrecacheFetcher for Interceptor {
  fn fetch<'a>(&'a self, clinic_id: &'a str, path: &'a str) -> BoxFuture<'a, Result<u64>> {
    Box::pin(async move {
      let request = self.upstream.request(Method::GET, path, Some(clinic_id))?;
      let url = request.url.clone();
      let response = self.transport.send(request).await?;
      if response.status != StatusCode::OK {
        return Err(eyre!("{} returned HTTP {}", path, response.status.as_u16()));
      }

      let records = count_records(&response.body);
      let key = self.key(RequestClass::Api, &Method::GET, &url, Some(clinic_id));
      self.store.put_entry(&key, &response, records)?;
      Ok(records)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{upstream, FakeTransport, BASE_URL};
  use serde_json::{json, Value};

  struct Fixture {
    store: Arc<SqliteStore>,
    scope: ClinicScopeManager,
    transport: FakeTransport,
    interceptor: Interceptor,
  }

  fn fixture_with(settings: InterceptorSettings) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let scope = ClinicScopeManager::new(store.clone());
    let transport = FakeTransport::new();
    let interceptor = Interceptor::new(
      store.clone(),
      scope.clone(),
      Arc::new(transport.clone()),
      upstream(),
      settings,
    );
    Fixture {
      store,
      scope,
      transport,
      interceptor,
    }
  }

  /// Active interceptor with clinic-a selected.
  fn fixture() -> Fixture {
    let f = fixture_with(InterceptorSettings::default());
    f.interceptor.activate().unwrap();
    f.scope.set_active_clinic("clinic-a").unwrap();
    f
  }

  fn request(method: Method, path: &str) -> Request {
    Request::new(method, Url::parse(BASE_URL).unwrap().join(path).unwrap())
  }

  fn serve_shell(transport: &FakeTransport) {
    transport.route("GET", "/", Response::new(StatusCode::OK, "<html>app</html>"));
    transport.json("GET", "/manifest.json", 200, r#"{"name":"clinic"}"#);
    transport.route(
      "GET",
      "/offline.html",
      Response::new(StatusCode::OK, "<html>offline copy</html>"),
    );
  }

  #[tokio::test]
  async fn test_cached_get_served_byte_for_byte_when_offline() {
    let f = fixture();
    let body = r#"[{"id":1,"name":"Ada"},{"id":2,"name":"Grace"}]"#;
    f.transport.json("GET", "/api/patients?limit=2", 200, body);

    let online = f.interceptor.handle(request(Method::GET, "/api/patients?limit=2")).await;
    assert_eq!(online.source, ResponseSource::Network);

    f.transport.set_online(false);
    let offline = f.interceptor.handle(request(Method::GET, "/api/patients?limit=2")).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.status, StatusCode::OK);
    assert_eq!(offline.response.body, body.as_bytes().to_vec());
    assert_eq!(offline.response.header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_non_get_is_never_cached() {
    let f = fixture();
    for status in [200, 201, 500] {
      f.transport.json("POST", "/api/patients", status, r#"{"id":9}"#);
      f.transport.json("PUT", "/api/patients/9", status, r#"{"id":9}"#);
      f.transport.json("DELETE", "/api/patients/9", status, "");
      f.interceptor.handle(request(Method::POST, "/api/patients")).await;
      f.interceptor.handle(request(Method::PUT, "/api/patients/9")).await;
      f.interceptor.handle(request(Method::DELETE, "/api/patients/9")).await;
    }
    f.transport.route("POST", "/upload.png", Response::new(StatusCode::OK, "ok"));
    f.interceptor.handle(request(Method::POST, "/upload.png")).await;

    for name in f.interceptor.settings().layout.current() {
      assert_eq!(f.store.count_entries(&name).unwrap(), 0, "{}", name);
    }
  }

  #[tokio::test]
  async fn test_non_200_get_is_not_cached() {
    let f = fixture();
    f.transport.json("GET", "/api/visits", 500, "{}");
    f.interceptor.handle(request(Method::GET, "/api/visits")).await;
    assert_eq!(f.store.count_entries("ocusync-api-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_image_fetched_once() {
    let f = fixture();
    f.transport.route(
      "GET",
      "/img/retina.png",
      Response::new(StatusCode::OK, vec![0x89, 0x50, 0x4e, 0x47]).with_content_type("image/png"),
    );

    let first = f.interceptor.handle(request(Method::GET, "/img/retina.png")).await;
    let second = f.interceptor.handle(request(Method::GET, "/img/retina.png")).await;

    assert_eq!(first.class, RequestClass::Image);
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(f.transport.calls("GET", "/img/retina.png"), 1);
  }

  #[tokio::test]
  async fn test_image_placeholder_when_offline() {
    let f = fixture();
    f.transport.set_online(false);
    let out = f.interceptor.handle(request(Method::GET, "/img/fundus.jpg")).await;
    assert_eq!(out.source, ResponseSource::Fallback);
    assert_eq!(out.response.header(fallback::FALLBACK_HEADER), Some("image"));
    assert_eq!(out.response.header("content-type"), Some("image/svg+xml"));
  }

  #[tokio::test]
  async fn test_offline_read_payload() {
    let f = fixture();
    f.transport.set_online(false);
    let out = f.interceptor.handle(request(Method::GET, "/api/invoices")).await;

    assert_eq!(out.source, ResponseSource::Fallback);
    assert_eq!(out.response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_slice(&out.response.body).unwrap();
    let message = body["message"].as_str().unwrap().to_string();
    assert_eq!(body, json!({ "offline": true, "message": message }));
  }

  #[tokio::test]
  async fn test_offline_write_is_distinguishable() {
    let f = fixture();
    f.transport.set_online(false);
    let out = f.interceptor.handle(request(Method::POST, "/api/invoices")).await;
    assert_eq!(out.response.header(fallback::FALLBACK_HEADER), Some("write"));
    let body: Value = serde_json::from_slice(&out.response.body).unwrap();
    assert_eq!(body["queued"], false);
  }

  #[tokio::test]
  async fn test_api_cache_is_per_clinic() {
    let f = fixture();
    f.transport.json("GET", "/api/queue", 200, r#"[{"id":1}]"#);
    f.interceptor.handle(request(Method::GET, "/api/queue")).await;

    f.scope.set_active_clinic("clinic-b").unwrap();
    f.transport.set_online(false);
    let out = f.interceptor.handle(request(Method::GET, "/api/queue")).await;
    assert_eq!(out.source, ResponseSource::Fallback);
  }

  #[tokio::test]
  async fn test_install_then_navigation_offline() {
    let f = fixture_with(InterceptorSettings::default());
    serve_shell(&f.transport);

    assert_eq!(f.interceptor.install().await.unwrap(), 3);
    assert_eq!(f.interceptor.lifecycle().unwrap(), Some(Lifecycle::Installed));
    f.interceptor.activate().unwrap();

    f.transport.set_online(false);
    let root = f
      .interceptor
      .handle(request(Method::GET, "/").with_header("accept", "text/html"))
      .await;
    assert_eq!(root.source, ResponseSource::Cache);
    assert_eq!(root.response.body, b"<html>app</html>".to_vec());

    let page = f
      .interceptor
      .handle(request(Method::GET, "/patients/12").with_header("sec-fetch-mode", "navigate"))
      .await;
    assert_eq!(page.source, ResponseSource::Fallback);
    assert_eq!(page.response.body, b"<html>offline copy</html>".to_vec());
    assert_eq!(page.response.header(fallback::FALLBACK_HEADER), Some("document"));
  }

  #[tokio::test]
  async fn test_reinstall_keeps_active_interceptor_serving() {
    let f = fixture();
    serve_shell(&f.transport);
    f.transport.json("GET", "/api/users", 200, "[]");
    f.interceptor.handle(request(Method::GET, "/api/users")).await;

    f.interceptor.install().await.unwrap();
    assert_eq!(f.interceptor.lifecycle().unwrap(), Some(Lifecycle::Active));

    f.transport.set_online(false);
    let out = f.interceptor.handle(request(Method::GET, "/api/users")).await;
    assert_eq!(out.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_reinstall_after_version_bump_waits_for_activation() {
    let f = fixture();
    serve_shell(&f.transport);
    let next = Interceptor::new(
      f.store.clone(),
      f.scope.clone(),
      Arc::new(f.transport.clone()),
      upstream(),
      InterceptorSettings {
        layout: CacheLayout::new(
          "ocusync",
          CacheVersions {
            static_assets: "v2".to_string(),
            ..Default::default()
          },
        ),
        ..Default::default()
      },
    );

    next.install().await.unwrap();
    assert_eq!(next.lifecycle().unwrap(), Some(Lifecycle::Installed));
    assert_eq!(f.store.count_entries("ocusync-static-v2").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_install_writes_nothing_on_partial_failure() {
    let f = fixture_with(InterceptorSettings::default());
    f.transport.route("GET", "/", Response::new(StatusCode::OK, "<html></html>"));
    f.transport.json("GET", "/manifest.json", 200, "{}");

    assert!(f.interceptor.install().await.is_err());
    assert_eq!(f.store.count_entries("ocusync-static-v1").unwrap(), 0);
    assert_eq!(f.interceptor.lifecycle().unwrap(), Some(Lifecycle::Installing));
  }

  #[tokio::test]
  async fn test_version_bump_leaves_no_stale_partitions() {
    let f = fixture();
    f.transport.json("GET", "/api/users", 200, "[]");
    f.transport.route("GET", "/img/a.png", Response::new(StatusCode::OK, "png"));
    f.interceptor.handle(request(Method::GET, "/api/users")).await;
    f.interceptor.handle(request(Method::GET, "/img/a.png")).await;

    let bumped = InterceptorSettings {
      layout: CacheLayout::new(
        "ocusync",
        CacheVersions {
          api: "v2".to_string(),
          images: "v7".to_string(),
          ..Default::default()
        },
      ),
      ..Default::default()
    };
    let next = Interceptor::new(
      f.store.clone(),
      f.scope.clone(),
      Arc::new(f.transport.clone()),
      upstream(),
      bumped.clone(),
    );
    let removed = next.activate().unwrap();

    assert_eq!(removed, vec!["ocusync-api-v1", "ocusync-images-v1"]);
    let current = bumped.layout.current();
    let stale: Vec<String> = f
      .store
      .list_partitions()
      .unwrap()
      .into_iter()
      .filter(|name| !current.contains(name))
      .collect();
    assert!(stale.is_empty(), "stale partitions: {:?}", stale);
  }

  #[tokio::test]
  async fn test_not_active_means_no_caching() {
    let f = fixture_with(InterceptorSettings::default());
    f.transport.json("GET", "/api/users", 200, "[]");
    let out = f.interceptor.handle(request(Method::GET, "/api/users")).await;
    assert_eq!(out.source, ResponseSource::Network);
    assert!(f.store.list_partitions().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_once() {
    let f = fixture_with(InterceptorSettings::default());
    let first = f.interceptor.handle_message(ClientMessage::SkipWaiting).await.unwrap();
    assert!(matches!(first, MessageOutcome::Activated { .. }));
    let second = f.interceptor.handle_message(ClientMessage::SkipWaiting).await.unwrap();
    assert_eq!(second, MessageOutcome::AlreadyActive);

    let rejected = f
      .interceptor
      .handle_message(ClientMessage::BackgroundSync { timestamp: 0 })
      .await;
    assert!(rejected.is_err());
  }

  #[tokio::test]
  async fn test_cache_urls_is_best_effort() {
    let f = fixture();
    f.transport.json("GET", "/api/clinics", 200, r#"[{"id":"a"},{"id":"b"}]"#);
    f.transport.route("GET", "/assets/app.js", Response::new(StatusCode::OK, "js"));

    let outcome = f
      .interceptor
      .handle_message(ClientMessage::CacheUrls {
        payload: vec![
          "/api/clinics".to_string(),
          "/assets/app.js".to_string(),
          "/missing".to_string(),
          "https://elsewhere.example/x".to_string(),
        ],
      })
      .await
      .unwrap();
    assert_eq!(outcome, MessageOutcome::Cached { cached: 2 });
    assert_eq!(f.scope.storage_stats("clinic-a").unwrap().cached_records, 2);
  }

  #[tokio::test]
  async fn test_precache_fetch_stores_under_clinic() {
    let f = fixture();
    f.transport.json("GET", "/api/lab-orders", 200, r#"{"data":[1,2,3]}"#);

    let records = f.interceptor.fetch("clinic-x", "/api/lab-orders").await.unwrap();
    assert_eq!(records, 3);
    let sent = f.transport.sent();
    assert_eq!(sent[0].header("x-clinic-id"), Some("clinic-x"));
    assert_eq!(f.scope.storage_stats("clinic-x").unwrap().cached_records, 3);

    f.transport.json("GET", "/api/lab-results", 404, "{}");
    assert!(f.interceptor.fetch("clinic-x", "/api/lab-results").await.is_err());
  }
}
