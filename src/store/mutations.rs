//! Outbound mutation queue.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Row};
use std::collections::HashMap;

use super::storage::{clinic_column, clinic_from_column, parse_datetime, SqliteStore};
use super::types::{MutationStatus, NewMutation, OutboundMutation};
use crate::sync::SyncTag;

const MUTATION_COLUMNS: &str =
  "id, clinic_id, tag, method, url, payload, created_at, retry_count, status, last_error";

impl SqliteStore {
  /// Append a write to the queue. Returns its id.
  pub fn enqueue_mutation(&self, clinic_id: Option<&str>, mutation: &NewMutation) -> Result<i64> {
    let payload = mutation
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO outbound_mutations (clinic_id, tag, method, url, payload, created_at, status)
         VALUES (?, ?, ?, ?, ?, ?, 'pending')",
        params![
          clinic_column(clinic_id),
          mutation.tag.as_str(),
          mutation.method,
          mutation.url,
          payload,
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  /// Pending mutations in creation order.
  ///
  /// `tag` of `None` or the generic tag returns every channel; `clinic_id` of
  /// `None` spans all clinics.
  pub fn pending_mutations(
    &self,
    clinic_id: Option<&str>,
    tag: Option<SyncTag>,
  ) -> Result<Vec<OutboundMutation>> {
    self.mutations_where(clinic_id, tag, Some(MutationStatus::Pending))
  }

  /// All mutations regardless of status, in creation order.
  pub fn list_mutations(&self, clinic_id: Option<&str>) -> Result<Vec<OutboundMutation>> {
    self.mutations_where(clinic_id, None, None)
  }

  fn mutations_where(
    &self,
    clinic_id: Option<&str>,
    tag: Option<SyncTag>,
    status: Option<MutationStatus>,
  ) -> Result<Vec<OutboundMutation>> {
    let tag = tag.filter(|t| !t.is_generic()).map(|t| t.as_str());
    let status = status.map(|s| s.as_str());
    let sql = format!(
      "SELECT {} FROM outbound_mutations
       WHERE (?1 IS NULL OR clinic_id = ?1)
         AND (?2 IS NULL OR tag = ?2)
         AND (?3 IS NULL OR status = ?3)
       ORDER BY id",
      MUTATION_COLUMNS
    );

    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![clinic_id, tag, status], read_mutation_row)
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read mutation: {}", e))?;

    rows.into_iter().map(MutationRow::into_mutation).collect()
  }

  /// Move a mutation to a new status, optionally recording an error.
  pub fn set_mutation_status(
    &self,
    id: i64,
    status: MutationStatus,
    last_error: Option<&str>,
  ) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE outbound_mutations SET status = ?, last_error = ? WHERE id = ?",
        params![status.as_str(), last_error, id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;
    Ok(())
  }

  /// Record a failed replay attempt. The mutation goes back to pending, or to
  /// failed once `budget` attempts have been spent. Returns the new status.
  ///
  /// A mutation failed this way holds its channel: later writes on the same
  /// tag wait until it is retried by hand.
  pub fn record_mutation_retry(&self, id: i64, error: &str, budget: u32) -> Result<MutationStatus> {
    let conn = self.conn()?;
    conn
      .execute(
        "UPDATE outbound_mutations SET retry_count = retry_count + 1, last_error = ?
         WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record retry for mutation {}: {}", id, e))?;
    let retries: u32 = conn
      .query_row(
        "SELECT retry_count FROM outbound_mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read retry count of mutation {}: {}", id, e))?;

    let status = if retries >= budget {
      MutationStatus::Failed
    } else {
      MutationStatus::Pending
    };

    conn
      .execute(
        "UPDATE outbound_mutations SET status = ?, holds_channel = ? WHERE id = ?",
        params![status.as_str(), status == MutationStatus::Failed, id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;

    Ok(status)
  }

  /// Put a mutation back to pending after a failed attempt, without spending
  /// its retry budget.
  pub fn release_mutation(&self, id: i64, error: &str) -> Result<()> {
    self.set_mutation_status(id, MutationStatus::Pending, Some(error))
  }

  /// Tags held by a mutation that ran out of retries, mapped to the oldest
  /// holding mutation id.
  pub fn held_channels(&self, clinic_id: Option<&str>) -> Result<HashMap<String, i64>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT tag, MIN(id) FROM outbound_mutations
         WHERE status = 'failed' AND holds_channel = 1 AND (?1 IS NULL OR clinic_id = ?1)
         GROUP BY tag",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let held = stmt
      .query_map(params![clinic_id], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query held channels: {}", e))?
      .collect::<rusqlite::Result<HashMap<String, i64>>>()
      .map_err(|e| eyre!("Failed to read held channel: {}", e))?;

    Ok(held)
  }

  /// Give a failed mutation a fresh budget. Returns false when `id` is not a
  /// failed mutation.
  pub fn retry_failed_mutation(&self, id: i64) -> Result<bool> {
    let changed = self
      .conn()?
      .execute(
        "UPDATE outbound_mutations
         SET status = 'pending', retry_count = 0, holds_channel = 0, last_error = NULL
         WHERE id = ? AND status = 'failed'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to retry mutation {}: {}", id, e))?;
    Ok(changed > 0)
  }

  /// Put mutations left in `syncing` by an interrupted drain back to pending.
  pub fn requeue_interrupted(&self) -> Result<usize> {
    self
      .conn()?
      .execute(
        "UPDATE outbound_mutations SET status = 'pending' WHERE status = 'syncing'",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue interrupted mutations: {}", e))
  }

  /// Tags that still have pending work, oldest first.
  pub fn pending_tags(&self, clinic_id: Option<&str>) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT tag FROM outbound_mutations
         WHERE status = 'pending' AND (?1 IS NULL OR clinic_id = ?1)
         GROUP BY tag
         ORDER BY MIN(id)",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map(params![clinic_id], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query pending tags: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read tag: {}", e))?;

    Ok(tags)
  }
}

struct MutationRow {
  id: i64,
  clinic_id: String,
  tag: String,
  method: String,
  url: String,
  payload: Option<String>,
  created_at: String,
  retry_count: u32,
  status: String,
  last_error: Option<String>,
}

fn read_mutation_row(row: &Row<'_>) -> rusqlite::Result<MutationRow> {
  Ok(MutationRow {
    id: row.get(0)?,
    clinic_id: row.get(1)?,
    tag: row.get(2)?,
    method: row.get(3)?,
    url: row.get(4)?,
    payload: row.get(5)?,
    created_at: row.get(6)?,
    retry_count: row.get(7)?,
    status: row.get(8)?,
    last_error: row.get(9)?,
  })
}

impl MutationRow {
  fn into_mutation(self) -> Result<OutboundMutation> {
    let payload = self
      .payload
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| eyre!("Corrupt payload for mutation {}: {}", self.id, e))?;

    Ok(OutboundMutation {
      id: self.id,
      clinic_id: clinic_from_column(self.clinic_id),
      tag: self.tag.parse()?,
      method: self.method,
      url: self.url,
      payload,
      created_at: parse_datetime(&self.created_at)?,
      retry_count: self.retry_count,
      status: self.status.parse()?,
      last_error: self.last_error,
    })
  }
}
