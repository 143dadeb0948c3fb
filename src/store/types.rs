//! Records held by the local store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::sync::SyncTag;
use crate::transport::Response;

/// The three kinds of cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  StaticAssets,
  Api,
  Images,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::StaticAssets, Partition::Api, Partition::Images];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::StaticAssets => "static",
      Self::Api => "api",
      Self::Images => "images",
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub partition: String,
  pub method: String,
  pub url: String,
  pub clinic_id: Option<String>,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Number of business records in the body (0 for non-API content)
  pub record_count: u64,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Rebuild the response exactly as it was captured.
  pub fn into_response(self) -> Response {
    let mut headers = HeaderMap::with_capacity(self.headers.len());
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    Response {
      status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
      headers,
      body: self.body,
    }
  }
}

/// Serializable header list, skipping values that are not valid UTF-8.
pub(crate) fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

/// Lifecycle of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Syncing,
  Failed,
  Done,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Failed => "failed",
      Self::Done => "done",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "failed" => Ok(Self::Failed),
      "done" => Ok(Self::Done),
      other => Err(eyre!("Unknown mutation status '{}'", other)),
    }
  }
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A write to queue for later replay.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub tag: SyncTag,
  pub method: String,
  /// Path and query relative to the upstream base
  pub url: String,
  pub payload: Option<serde_json::Value>,
}

/// A queued write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMutation {
  pub id: i64,
  pub clinic_id: Option<String>,
  pub tag: SyncTag,
  pub method: String,
  pub url: String,
  pub payload: Option<serde_json::Value>,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: MutationStatus,
  pub last_error: Option<String>,
}

/// Per-clinic offline bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicCacheScope {
  pub clinic_id: String,
  pub last_sync: Option<DateTime<Utc>>,
  pub record_count: u64,
  pub created_at: DateTime<Utc>,
}

/// Storage usage for one clinic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
  pub clinic_id: String,
  pub cached_entries: u64,
  pub cached_records: u64,
  pub pending_mutations: u64,
  pub failed_mutations: u64,
  pub bytes: u64,
  pub last_sync: Option<DateTime<Utc>>,
}
