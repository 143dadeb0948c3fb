//! Versioned cache partition names.
//!
//! Bumping a version renames its partition; the next activation deletes every
//! partition whose name is no longer current.

use serde::Deserialize;

use crate::store::Partition;

/// One version tag per partition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheVersions {
  #[serde(rename = "static", alias = "static_assets")]
  pub static_assets: String,
  pub api: String,
  pub images: String,
}

impl Default for CacheVersions {
  fn default() -> Self {
    Self {
      static_assets: "v1".to_string(),
      api: "v1".to_string(),
      images: "v1".to_string(),
    }
  }
}

impl CacheVersions {
  pub fn version(&self, partition: Partition) -> &str {
    match partition {
      Partition::StaticAssets => &self.static_assets,
      Partition::Api => &self.api,
      Partition::Images => &self.images,
    }
  }
}

/// Prefix plus versions: everything needed to name the current partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
  pub prefix: String,
  pub versions: CacheVersions,
}

impl CacheLayout {
  pub fn new(prefix: impl Into<String>, versions: CacheVersions) -> Self {
    Self {
      prefix: prefix.into(),
      versions,
    }
  }

  /// `<prefix>-<partition>-<version>`
  pub fn name(&self, partition: Partition) -> String {
    format!(
      "{}-{}-{}",
      self.prefix,
      partition.as_str(),
      self.versions.version(partition)
    )
  }

  /// Names of the current partitions, one per kind.
  pub fn current(&self) -> Vec<String> {
    Partition::ALL.iter().map(|p| self.name(*p)).collect()
  }
}
