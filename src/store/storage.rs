//! SQLite connection, schema and small metadata helpers.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-backed local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    // Stores created before exhausted writes held their channel
    let has_hold: bool = conn
      .query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('outbound_mutations')
         WHERE name = 'holds_channel'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to inspect outbound_mutations: {}", e))?;
    if !has_hold {
      conn
        .execute_batch(
          "ALTER TABLE outbound_mutations ADD COLUMN holds_channel INTEGER NOT NULL DEFAULT 0",
        )
        .map_err(|e| eyre!("Failed to add holds_channel column: {}", e))?;
    }
    Ok(())
  }

  pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read a metadata value.
  pub fn meta(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read meta '{}': {}", key, e))
  }

  /// Write a metadata value.
  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta '{}': {}", key, e))?;
    Ok(())
  }

  pub fn delete_meta(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM meta WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete meta '{}': {}", key, e))?;
    Ok(())
  }

  /// Persist a sync-tag registration.
  pub fn add_registration(&self, tag: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO sync_registrations (tag, registered_at) VALUES (?, ?)",
        params![tag, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to register sync tag '{}': {}", tag, e))?;
    Ok(())
  }

  pub fn remove_registration(&self, tag: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM sync_registrations WHERE tag = ?", params![tag])
      .map_err(|e| eyre!("Failed to unregister sync tag '{}': {}", tag, e))?;
    Ok(())
  }

  /// Registered tags in registration order.
  pub fn registrations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM sync_registrations ORDER BY registered_at, tag")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query registrations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read registration: {}", e))?;

    Ok(tags)
  }
}

/// Schema for the local store.
const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Versioned cache buckets
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Cached responses (only successful GETs ever land here)
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    clinic_id TEXT NOT NULL DEFAULT '',
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    record_count INTEGER NOT NULL DEFAULT 0,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, cache_key, clinic_id),
    FOREIGN KEY (partition) REFERENCES cache_partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_clinic ON cache_entries(clinic_id);

-- Writes waiting for replay; id order is creation order
CREATE TABLE IF NOT EXISTS outbound_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clinic_id TEXT NOT NULL DEFAULT '',
    tag TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    holds_channel INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbound_mutations_queue
    ON outbound_mutations(clinic_id, tag, status, id);

CREATE TABLE IF NOT EXISTS clinic_scopes (
    clinic_id TEXT PRIMARY KEY,
    last_sync TEXT,
    record_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Parse a stored timestamp.
///
/// Timestamps are written as RFC 3339; SQLite's own `datetime('now')` format
/// is accepted as well.
pub(super) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }

  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Clinic column value for an optional clinic.
pub(super) fn clinic_column(clinic_id: Option<&str>) -> &str {
  clinic_id.unwrap_or("")
}

/// Optional clinic from a column value.
pub(super) fn clinic_from_column(value: String) -> Option<String> {
  if value.is_empty() {
    None
  } else {
    Some(value)
  }
}
