//! In-memory transport for tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::transport::{Request, Response, Transport, Upstream};

pub const BASE_URL: &str = "https://clinic.example.org/";

pub fn upstream() -> Upstream {
  Upstream::new(Url::parse(BASE_URL).unwrap(), Some("token".to_string()))
}

/// Canned responses keyed by `METHOD path?query`. Requests without a route get
/// a 404; while offline every request fails like a dropped connection.
#[derive(Clone, Default)]
pub struct FakeTransport {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  offline: AtomicBool,
  routes: Mutex<HashMap<String, Response>>,
  sent: Mutex<Vec<Request>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, method: &str, path_and_query: &str, response: Response) {
    self
      .inner
      .routes
      .lock()
      .unwrap()
      .insert(format!("{} {}", method, path_and_query), response);
  }

  pub fn json(&self, method: &str, path_and_query: &str, status: u16, body: &str) {
    self.route(
      method,
      path_and_query,
      Response::new(StatusCode::from_u16(status).unwrap(), body.as_bytes().to_vec())
        .with_content_type("application/json"),
    );
  }

  pub fn set_online(&self, online: bool) {
    self.inner.offline.store(!online, Ordering::SeqCst);
  }

  pub fn sent(&self) -> Vec<Request> {
    self.inner.sent.lock().unwrap().clone()
  }

  /// How many requests reached the network for `METHOD path?query`.
  pub fn calls(&self, method: &str, path_and_query: &str) -> usize {
    self
      .sent()
      .iter()
      .filter(|r| r.method.as_str() == method && r.path_and_query() == path_and_query)
      .count()
  }
}

impl Transport for FakeTransport {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
      if self.inner.offline.load(Ordering::SeqCst) {
        return Err(eyre!("{} {} failed: connection refused", request.method, request.url));
      }

      let key = format!("{} {}", request.method, request.path_and_query());
      self.inner.sent.lock().unwrap().push(request);

      let routes = self.inner.routes.lock().unwrap();
      Ok(
        routes
          .get(&key)
          .cloned()
          .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, Vec::new())),
      )
    })
  }
}
