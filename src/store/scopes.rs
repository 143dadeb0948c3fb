//! Clinic scope rows and per-clinic usage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::storage::{parse_datetime, SqliteStore};
use super::types::{ClinicCacheScope, StorageStats};

impl SqliteStore {
  /// Create the scope row for a clinic if it does not exist yet.
  pub fn ensure_scope(&self, clinic_id: &str) -> Result<ClinicCacheScope> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO clinic_scopes (clinic_id, created_at) VALUES (?, ?)",
        params![clinic_id, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create scope for clinic '{}': {}", clinic_id, e))?;

    self
      .scope(clinic_id)?
      .ok_or_else(|| eyre!("Scope for clinic '{}' vanished", clinic_id))
  }

  pub fn scope(&self, clinic_id: &str) -> Result<Option<ClinicCacheScope>> {
    let conn = self.conn()?;
    let row: Option<(String, Option<String>, i64, String)> = conn
      .query_row(
        "SELECT clinic_id, last_sync, record_count, created_at FROM clinic_scopes
         WHERE clinic_id = ?",
        params![clinic_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read scope for clinic '{}': {}", clinic_id, e))?;

    row.map(scope_from_row).transpose()
  }

  pub fn list_scopes(&self) -> Result<Vec<ClinicCacheScope>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT clinic_id, last_sync, record_count, created_at FROM clinic_scopes
         ORDER BY clinic_id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to list scopes: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, Option<String>, i64, String)>>>()
      .map_err(|e| eyre!("Failed to read scope: {}", e))?;

    rows.into_iter().map(scope_from_row).collect()
  }

  pub fn set_last_sync(&self, clinic_id: &str, at: DateTime<Utc>) -> Result<()> {
    self.ensure_scope(clinic_id)?;
    self
      .conn()?
      .execute(
        "UPDATE clinic_scopes SET last_sync = ? WHERE clinic_id = ?",
        params![at.to_rfc3339(), clinic_id],
      )
      .map_err(|e| eyre!("Failed to set last sync for '{}': {}", clinic_id, e))?;
    Ok(())
  }

  /// Recompute the scope's record count from its cached entries.
  pub fn refresh_record_count(&self, clinic_id: &str) -> Result<u64> {
    self.ensure_scope(clinic_id)?;
    let conn = self.conn()?;
    let total: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(record_count), 0) FROM cache_entries WHERE clinic_id = ?",
        params![clinic_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to sum records for '{}': {}", clinic_id, e))?;
    conn
      .execute(
        "UPDATE clinic_scopes SET record_count = ? WHERE clinic_id = ?",
        params![total, clinic_id],
      )
      .map_err(|e| eyre!("Failed to update record count for '{}': {}", clinic_id, e))?;
    Ok(total.max(0) as u64)
  }

  pub fn delete_scope(&self, clinic_id: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM clinic_scopes WHERE clinic_id = ?",
        params![clinic_id],
      )
      .map_err(|e| eyre!("Failed to delete scope '{}': {}", clinic_id, e))?;
    Ok(removed > 0)
  }

  /// Entries, records, queued writes and bytes held for one clinic.
  pub fn storage_stats(&self, clinic_id: &str) -> Result<StorageStats> {
    let last_sync = self.scope(clinic_id)?.and_then(|s| s.last_sync);
    let conn = self.conn()?;

    let (entries, records, entry_bytes): (i64, i64, i64) = conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(record_count), 0), COALESCE(SUM(LENGTH(body)), 0)
         FROM cache_entries WHERE clinic_id = ?",
        params![clinic_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| eyre!("Failed to compute cache stats for '{}': {}", clinic_id, e))?;

    let (pending, failed, queue_bytes): (i64, i64, i64) = conn
      .query_row(
        "SELECT
           COALESCE(SUM(status IN ('pending', 'syncing')), 0),
           COALESCE(SUM(status = 'failed'), 0),
           COALESCE(SUM(CASE WHEN status != 'done' THEN LENGTH(COALESCE(payload, '')) ELSE 0 END), 0)
         FROM outbound_mutations WHERE clinic_id = ?",
        params![clinic_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| eyre!("Failed to compute queue stats for '{}': {}", clinic_id, e))?;

    Ok(StorageStats {
      clinic_id: clinic_id.to_string(),
      cached_entries: entries.max(0) as u64,
      cached_records: records.max(0) as u64,
      pending_mutations: pending.max(0) as u64,
      failed_mutations: failed.max(0) as u64,
      bytes: (entry_bytes + queue_bytes).max(0) as u64,
      last_sync,
    })
  }
}

fn scope_from_row(
  (clinic_id, last_sync, record_count, created_at): (String, Option<String>, i64, String),
) -> Result<ClinicCacheScope> {
  Ok(ClinicCacheScope {
    clinic_id,
    last_sync: last_sync.as_deref().map(parse_datetime).transpose()?,
    record_count: record_count.max(0) as u64,
    created_at: parse_datetime(&created_at)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{CacheKey, NewMutation};
  use crate::sync::{Entity, SyncTag};
  use crate::transport::Response;
  use reqwest::{Method, StatusCode};
  use url::Url;

  #[test]
  fn test_ensure_scope_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = store.ensure_scope("clinic-a").unwrap();
    let second = store.ensure_scope("clinic-a").unwrap();
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(store.list_scopes().unwrap().len(), 1);
  }

  #[test]
  fn test_stats_count_entries_records_and_queue() {
    let store = SqliteStore::open_in_memory().unwrap();
    let url = Url::parse("https://clinic.example.org/api/patients").unwrap();
    let key = CacheKey::new("api", &Method::GET, &url, Some("clinic-a"));
    store
      .put_entry(&key, &Response::new(StatusCode::OK, b"[1,2,3]".to_vec()), 3)
      .unwrap();
    store
      .enqueue_mutation(
        Some("clinic-a"),
        &NewMutation {
          tag: SyncTag::Entity(Entity::Patients),
          method: "POST".to_string(),
          url: "/api/patients".to_string(),
          payload: Some(serde_json::json!({ "name": "x" })),
        },
      )
      .unwrap();

    let stats = store.storage_stats("clinic-a").unwrap();
    assert_eq!(stats.cached_entries, 1);
    assert_eq!(stats.cached_records, 3);
    assert_eq!(stats.pending_mutations, 1);
    assert_eq!(stats.failed_mutations, 0);
    assert_eq!(stats.bytes, 7 + r#"{"name":"x"}"#.len() as u64);

    assert_eq!(store.refresh_record_count("clinic-a").unwrap(), 3);
    assert_eq!(store.scope("clinic-a").unwrap().unwrap().record_count, 3);
  }
}
