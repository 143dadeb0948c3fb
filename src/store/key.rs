//! Cache keys: method + normalized URL + clinic scope.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Identifies one cached response inside a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
  /// Full partition name, e.g. `ocusync-api-v2`
  pub partition: String,
  pub method: String,
  /// Normalized URL (see [`normalize_url`])
  pub url: String,
  /// Clinic the entry belongs to; `None` for unscoped entries (app shell)
  pub clinic_id: Option<String>,
}

impl CacheKey {
  pub fn new(partition: impl Into<String>, method: &Method, url: &Url, clinic_id: Option<&str>) -> Self {
    Self {
      partition: partition.into(),
      method: method.as_str().to_string(),
      url: normalize_url(url),
      clinic_id: clinic_id.map(String::from),
    }
  }

  /// Stable, fixed-length digest of method and URL.
  ///
  /// The clinic is a separate column so lookups can fall back to the
  /// unscoped entry for the same resource.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Clinic column value; unscoped entries use the empty string.
  pub fn clinic_column(&self) -> &str {
    self.clinic_id.as_deref().unwrap_or("")
  }
}

/// Normalize a URL for consistent cache hits.
///
/// Scheme and host are already lowercased by `url`. The fragment is dropped and
/// query pairs are sorted so `?b=2&a=1` and `?a=1&b=2` share an entry.
pub fn normalize_url(url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();

  if pairs.is_empty() {
    normalized.set_query(None);
  } else {
    pairs.sort();
    normalized.query_pairs_mut().clear().extend_pairs(pairs);
  }

  normalized.to_string()
}
