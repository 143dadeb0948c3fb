//! Clinic scope manager.
//!
//! Every cached response and queued write is tagged with the clinic that was
//! active when it was created, so switching clinics never mixes their data.
//! The active clinic lives in the store, not in memory.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::store::{ClinicCacheScope, SqliteStore, StorageStats};

const ACTIVE_CLINIC_KEY: &str = "active_clinic";

/// What a manual reset removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetSummary {
  pub entries_removed: usize,
  pub scope_removed: bool,
}

#[derive(Clone)]
pub struct ClinicScopeManager {
  store: Arc<SqliteStore>,
}

impl ClinicScopeManager {
  pub fn new(store: Arc<SqliteStore>) -> Self {
    Self { store }
  }

  /// Make `clinic_id` the active clinic. Creates its scope on first use.
  pub fn set_active_clinic(&self, clinic_id: &str) -> Result<ClinicCacheScope> {
    let clinic_id = validate(clinic_id)?;
    let scope = self.store.ensure_scope(clinic_id)?;
    self.store.set_meta(ACTIVE_CLINIC_KEY, clinic_id)?;
    info!(clinic = clinic_id, "active clinic set");
    Ok(scope)
  }

  pub fn clear_active_clinic(&self) -> Result<()> {
    self.store.delete_meta(ACTIVE_CLINIC_KEY)
  }

  pub fn active_clinic(&self) -> Result<Option<String>> {
    self.store.meta(ACTIVE_CLINIC_KEY)
  }

  /// Explicit clinic if given, otherwise the active one.
  pub fn resolve(&self, clinic_id: Option<&str>) -> Result<String> {
    match clinic_id {
      Some(id) => Ok(validate(id)?.to_string()),
      None => self
        .active_clinic()?
        .ok_or_else(|| eyre!("No clinic given and no active clinic set")),
    }
  }

  pub fn last_sync_time(&self, clinic_id: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(self.store.scope(clinic_id)?.and_then(|s| s.last_sync))
  }

  pub fn set_last_sync_time(&self, clinic_id: &str, at: DateTime<Utc>) -> Result<()> {
    self.store.set_last_sync(validate(clinic_id)?, at)
  }

  /// Storage used by one clinic. Other clinics never contribute.
  pub fn storage_stats(&self, clinic_id: &str) -> Result<StorageStats> {
    self.store.storage_stats(validate(clinic_id)?)
  }

  /// Re-sum the clinic's cached records into its scope row.
  pub fn refresh_record_count(&self, clinic_id: &str) -> Result<u64> {
    self.store.refresh_record_count(validate(clinic_id)?)
  }

  pub fn scopes(&self) -> Result<Vec<ClinicCacheScope>> {
    self.store.list_scopes()
  }

  /// Manual reset: drop the clinic's cached responses and its scope row.
  ///
  /// Queued writes are left alone; they leave the queue only by replay.
  pub fn reset_clinic(&self, clinic_id: &str) -> Result<ResetSummary> {
    let clinic_id = validate(clinic_id)?;
    let entries_removed = self.store.delete_clinic_entries(clinic_id)?;
    let scope_removed = self.store.delete_scope(clinic_id)?;
    if self.active_clinic()?.as_deref() == Some(clinic_id) {
      self.clear_active_clinic()?;
    }
    info!(
      clinic = clinic_id,
      entries_removed, "clinic cache reset"
    );
    Ok(ResetSummary {
      entries_removed,
      scope_removed,
    })
  }
}

fn validate(clinic_id: &str) -> Result<&str> {
  let trimmed = clinic_id.trim();
  if trimmed.is_empty() {
    return Err(eyre!("Clinic id must not be empty"));
  }
  Ok(trimmed)
}
