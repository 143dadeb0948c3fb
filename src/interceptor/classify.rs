//! Request classification by URL shape.

use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Method;

use crate::store::Partition;

const IMAGE_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif", "bmp",
];

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Under the API prefix: network first
  Api,
  /// Cache first, placeholder on failure
  Image,
  /// Full-page load: cache first, offline document on failure
  Navigation,
  /// Any other application asset: cache first
  Static,
}

impl RequestClass {
  /// Partition responses of this class are cached in.
  pub fn partition(&self) -> Partition {
    match self {
      Self::Api => Partition::Api,
      Self::Image => Partition::Images,
      Self::Navigation | Self::Static => Partition::StaticAssets,
    }
  }
}

pub fn classify(method: &Method, path: &str, headers: &HeaderMap, api_prefix: &str) -> RequestClass {
  if is_under(path, api_prefix) {
    return RequestClass::Api;
  }

  let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

  if header("sec-fetch-dest") == Some("image") || has_image_extension(path) {
    return RequestClass::Image;
  }

  let navigate = header("sec-fetch-mode") == Some("navigate");
  let wants_html = *method == Method::GET
    && headers
      .get(ACCEPT)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|accept| accept.contains("text/html"));
  if navigate || wants_html {
    return RequestClass::Navigation;
  }

  RequestClass::Static
}

fn is_under(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  if prefix.is_empty() {
    return true;
  }
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
    None => false,
  }
}

fn has_image_extension(path: &str) -> bool {
  let file = path.rsplit('/').next().unwrap_or(path);
  file
    .rsplit_once('.')
    .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}
