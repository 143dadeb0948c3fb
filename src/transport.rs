//! Upstream HTTP access.
//!
//! Everything that leaves the workstation goes through a [`Transport`]. An `Err`
//! from [`Transport::send`] always means the network failed; any `Ok`, whatever
//! its status code, means the upstream answered.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

/// Header carrying the clinic a request is made on behalf of.
pub const CLINIC_HEADER: &str = "x-clinic-id";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "accept-encoding",
  "content-length",
];

/// An outbound request, fully buffered.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.insert(HeaderName::from_static(name), value);
    }
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  /// Path plus query, as the upstream sees it.
  pub fn path_and_query(&self) -> String {
    match self.url.query() {
      Some(q) => format!("{}?{}", self.url.path(), q),
      None => self.url.path().to_string(),
    }
  }
}

/// A buffered upstream (or synthesized) response.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  pub fn with_content_type(mut self, content_type: &'static str) -> Self {
    self
      .headers
      .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    self
  }

  pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
    self
      .headers
      .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }
}

/// Sends requests to the network.
pub trait Transport: Send + Sync {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

/// reqwest-backed transport used in production.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  timeout: Option<Duration>,
}

impl HttpTransport {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, timeout })
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone())
        .headers(forwardable(&request.headers));
      if !request.body.is_empty() {
        builder = builder.body(request.body);
      }
      if let Some(timeout) = self.timeout {
        builder = builder.timeout(timeout);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

      let status = response.status();
      let headers = forwardable(response.headers());
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

/// Copy of `headers` without hop-by-hop entries.
pub fn forwardable(headers: &HeaderMap) -> HeaderMap {
  let mut out = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if !HOP_BY_HOP.contains(&name.as_str()) {
      out.append(name.clone(), value.clone());
    }
  }
  out
}

/// The central server the proxy fronts.
#[derive(Debug, Clone)]
pub struct Upstream {
  base: Url,
  api_token: Option<String>,
}

impl Upstream {
  pub fn new(base: Url, api_token: Option<String>) -> Self {
    Self { base, api_token }
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// Resolve a path (with optional query) against the upstream base.
  pub fn url(&self, path_and_query: &str) -> Result<Url> {
    self
      .base
      .join(path_and_query)
      .map_err(|e| eyre!("Invalid upstream path '{}': {}", path_and_query, e))
  }

  /// Map an absolute redirect target on the upstream origin to the path the
  /// proxy serves it under. `None` for relative targets and other origins.
  pub fn local_path(&self, location: &str) -> Option<String> {
    let target = Url::parse(location).ok()?;
    if target.origin() != self.base.origin() {
      return None;
    }
    let mut path = target.path().to_string();
    if let Some(query) = target.query() {
      path.push('?');
      path.push_str(query);
    }
    if let Some(fragment) = target.fragment() {
      path.push('#');
      path.push_str(fragment);
    }
    Some(path)
  }

  /// Build a request issued by ocusync itself (install, pre-cache, replay, probe).
  pub fn request(&self, method: Method, path_and_query: &str, clinic_id: Option<&str>) -> Result<Request> {
    let mut request = Request::new(method, self.url(path_and_query)?);
    if let Some(token) = &self.api_token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("API token is not a valid header value: {}", e))?;
      request.headers.insert(header::AUTHORIZATION, value);
    }
    if let Some(clinic) = clinic_id {
      request = request.with_header(CLINIC_HEADER, clinic);
    }
    Ok(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use httpmock::prelude::*;

  #[test]
  fn test_forwardable_strips_hop_by_hop() {
    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));

    let out = forwardable(&headers);
    assert_eq!(out.len(), 1);
    assert!(out.contains_key(header::AUTHORIZATION));
  }

  #[test]
  fn test_local_path_only_for_upstream_origin() {
    let upstream = Upstream::new(Url::parse("https://clinic.example.org/").unwrap(), None);
    assert_eq!(
      upstream.local_path("https://clinic.example.org/login?next=%2F#top"),
      Some("/login?next=%2F#top".to_string())
    );
    assert_eq!(upstream.local_path("https://sso.example.org/login"), None);
    assert_eq!(upstream.local_path("http://clinic.example.org/login"), None);
    assert_eq!(upstream.local_path("/login"), None);
  }

  #[test]
  fn test_upstream_request_adds_auth_and_clinic() {
    let base = Url::parse("https://clinic.example.org/").unwrap();
    let upstream = Upstream::new(base, Some("secret".to_string()));

    let request = upstream
      .request(Method::GET, "/api/patients?limit=10", Some("clinic-a"))
      .unwrap();

    assert_eq!(
      request.url.as_str(),
      "https://clinic.example.org/api/patients?limit=10"
    );
    assert_eq!(request.header("authorization"), Some("Bearer secret"));
    assert_eq!(request.header(CLINIC_HEADER), Some("clinic-a"));
    assert_eq!(request.path_and_query(), "/api/patients?limit=10");
  }

  #[tokio::test]
  async fn test_http_transport_round_trip() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when.method(GET).path("/api/patients");
        then
          .status(200)
          .header("content-type", "application/json")
          .body(r#"[{"id":1}]"#);
      })
      .await;

    let transport = HttpTransport::new(None).unwrap();
    let url = Url::parse(&server.url("/api/patients")).unwrap();
    let response = transport.send(Request::get(url)).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, br#"[{"id":1}]"#.to_vec());
    assert_eq!(response.header("content-type"), Some("application/json"));
  }
}
