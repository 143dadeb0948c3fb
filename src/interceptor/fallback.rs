//! Synthesized responses for when the network is gone.
//!
//! Every fallback carries `x-offline-fallback` naming its kind, so callers can
//! tell a degraded answer from a real one.

use reqwest::StatusCode;
use serde_json::json;

use crate::transport::Response;

pub const FALLBACK_HEADER: &str = "x-offline-fallback";

const READ_MESSAGE: &str =
  "You are offline. This data is not available locally; it will sync once connectivity is restored.";
const WRITE_MESSAGE: &str =
  "You are offline. This change was not sent; queue it and it will sync once connectivity is restored.";

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64" viewBox="0 0 64 64"><rect width="64" height="64" fill="#e5e7eb"/><path d="M16 44l10-12 8 9 6-7 8 10z" fill="#9ca3af"/><circle cx="24" cy="22" r="5" fill="#9ca3af"/></svg>"##;

const OFFLINE_HTML: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page has not been saved for offline use. Cached patient data is still available from pages you opened before.</p>
</body>
</html>
"#;

/// A GET under the API prefix failed and nothing was cached.
pub fn read() -> Response {
  let body = json!({ "offline": true, "message": READ_MESSAGE });
  Response::new(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
    .with_content_type("application/json")
    .with_header(FALLBACK_HEADER, "read")
}

/// A write under the API prefix failed. Distinct from [`read`] so callers
/// re-queue the data instead of treating it as an empty result.
pub fn write() -> Response {
  let body = json!({ "offline": true, "queued": false, "message": WRITE_MESSAGE });
  Response::new(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
    .with_content_type("application/json")
    .with_header(FALLBACK_HEADER, "write")
}

pub fn image_placeholder() -> Response {
  Response::new(StatusCode::OK, PLACEHOLDER_SVG)
    .with_content_type("image/svg+xml")
    .with_header(FALLBACK_HEADER, "image")
}

/// Offline document for a failed navigation: the cached offline page when
/// there is one, a built-in page otherwise.
pub fn document(cached: Option<Response>) -> Response {
  match cached {
    Some(mut page) => {
      page.headers.insert(
        FALLBACK_HEADER,
        reqwest::header::HeaderValue::from_static("document"),
      );
      page
    }
    None => Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_HTML)
      .with_content_type("text/html; charset=utf-8")
      .with_header(FALLBACK_HEADER, "document"),
  }
}

/// A static asset that is neither cached nor reachable.
pub fn static_unavailable() -> Response {
  Response::new(StatusCode::SERVICE_UNAVAILABLE, "offline")
    .with_content_type("text/plain; charset=utf-8")
    .with_header(FALLBACK_HEADER, "static")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;

  #[test]
  fn test_read_and_write_are_distinguishable() {
    let read = read();
    let write = write();
    assert_eq!(read.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read.header(FALLBACK_HEADER), Some("read"));
    assert_eq!(write.header(FALLBACK_HEADER), Some("write"));

    let write_body: Value = serde_json::from_slice(&write.body).unwrap();
    assert_eq!(write_body["offline"], true);
    assert_eq!(write_body["queued"], false);
  }

  #[test]
  fn test_document_prefers_cached_page() {
    let cached = Response::new(StatusCode::OK, "<p>saved</p>");
    let page = document(Some(cached));
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.body, b"<p>saved</p>".to_vec());
    assert_eq!(page.header(FALLBACK_HEADER), Some("document"));

    let builtin = document(None);
    assert!(String::from_utf8_lossy(&builtin.body).contains("You are offline"));
  }
}
