//! Cache partitions and cached responses.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::key::CacheKey;
use super::storage::{clinic_from_column, parse_datetime, SqliteStore};
use super::types::{header_pairs, CacheEntry};
use crate::transport::Response;

impl SqliteStore {
  /// Create a partition if it does not exist yet.
  pub fn ensure_partition(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create partition '{}': {}", name, e))?;
    Ok(())
  }

  /// Names of all partitions currently on disk.
  pub fn list_partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM cache_partitions
         UNION
         SELECT DISTINCT partition FROM cache_entries
         ORDER BY 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition: {}", e))?;

    Ok(names)
  }

  /// Drop a partition and every entry in it. Returns the number of entries removed.
  pub fn delete_partition(&self, name: &str) -> Result<usize> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM cache_entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", name, e))?;
    conn
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition '{}': {}", name, e))?;
    Ok(removed)
  }

  /// Store a response under `key`, replacing any previous entry.
  pub fn put_entry(&self, key: &CacheKey, response: &Response, record_count: u64) -> Result<()> {
    self.ensure_partition(&key.partition)?;

    let headers = serde_json::to_string(&header_pairs(&response.headers))
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (partition, cache_key, clinic_id, method, url, status, headers, body, record_count, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          key.partition,
          key.digest(),
          key.clinic_column(),
          key.method,
          key.url,
          response.status.as_u16(),
          headers,
          response.body,
          record_count as i64,
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry for {}: {}", key.url, e))?;

    Ok(())
  }

  /// Exact lookup: same partition, method, URL and clinic.
  pub fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    self.query_entry(
      "SELECT partition, method, url, clinic_id, status, headers, body, record_count, cached_at
       FROM cache_entries
       WHERE partition = ?1 AND cache_key = ?2 AND clinic_id = ?3",
      key,
    )
  }

  /// Lookup that prefers the clinic's own entry and falls back to the
  /// unscoped one. Used for shared assets (app shell, images).
  pub fn get_shared_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    self.query_entry(
      "SELECT partition, method, url, clinic_id, status, headers, body, record_count, cached_at
       FROM cache_entries
       WHERE partition = ?1 AND cache_key = ?2 AND clinic_id IN (?3, '')
       ORDER BY clinic_id = '' ASC
       LIMIT 1",
      key,
    )
  }

  fn query_entry(&self, sql: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        sql,
        params![key.partition, key.digest(), key.clinic_column()],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u16>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Vec<u8>>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, String>(8)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    let Some((partition, method, url, clinic, status, headers, body, records, cached_at)) = row
    else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Corrupt headers for {}: {}", url, e))?;

    Ok(Some(CacheEntry {
      partition,
      method,
      url,
      clinic_id: clinic_from_column(clinic),
      status,
      headers,
      body,
      record_count: records.max(0) as u64,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  /// Number of entries in a partition.
  pub fn count_entries(&self, partition: &str) -> Result<u64> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as u64)
  }

  /// Remove every cached entry tagged with `clinic_id`.
  pub fn delete_clinic_entries(&self, clinic_id: &str) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE clinic_id = ?",
        params![clinic_id],
      )
      .map_err(|e| eyre!("Failed to delete entries of clinic '{}': {}", clinic_id, e))
  }
}
