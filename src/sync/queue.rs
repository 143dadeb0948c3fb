//! Outbound mutation queue, scoped to the active clinic.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::info;

use crate::scope::ClinicScopeManager;
use crate::store::{NewMutation, OutboundMutation, SqliteStore};

use super::tags::SyncTag;

#[derive(Clone)]
pub struct OutboundQueue {
  store: Arc<SqliteStore>,
  scope: ClinicScopeManager,
}

impl OutboundQueue {
  pub fn new(store: Arc<SqliteStore>, scope: ClinicScopeManager) -> Self {
    Self { store, scope }
  }

  /// Queue a write under the active clinic. Returns its id.
  pub fn enqueue(&self, mutation: NewMutation) -> Result<i64> {
    let method = Method::from_bytes(mutation.method.to_ascii_uppercase().as_bytes())
      .map_err(|_| eyre!("Invalid method '{}'", mutation.method))?;
    if method == Method::GET || method == Method::HEAD {
      return Err(eyre!("Only writes can be queued, got {}", method));
    }
    if !mutation.url.starts_with('/') {
      return Err(eyre!("Mutation URL must be a path, got '{}'", mutation.url));
    }

    let clinic = self.scope.active_clinic()?;
    let mutation = NewMutation {
      method: method.to_string(),
      ..mutation
    };
    let id = self.store.enqueue_mutation(clinic.as_deref(), &mutation)?;
    info!(
      id,
      tag = %mutation.tag,
      method = %mutation.method,
      url = %mutation.url,
      "mutation queued"
    );
    Ok(id)
  }

  /// Pending writes of the active clinic for `tag`, oldest first.
  pub fn pending(&self, tag: SyncTag) -> Result<Vec<OutboundMutation>> {
    let clinic = self.scope.active_clinic()?;
    self.store.pending_mutations(clinic.as_deref(), Some(tag))
  }

  /// Every write of the active clinic, whatever its status.
  pub fn all(&self) -> Result<Vec<OutboundMutation>> {
    let clinic = self.scope.active_clinic()?;
    self.store.list_mutations(clinic.as_deref())
  }

  /// Give a write that ran out of retries a fresh budget, releasing the
  /// writes queued behind it.
  pub fn retry(&self, id: i64) -> Result<()> {
    if !self.store.retry_failed_mutation(id)? {
      return Err(eyre!("Mutation {} is not a failed write", id));
    }
    info!(id, "failed mutation requeued");
    Ok(())
  }

  /// Tags with pending writes for the active clinic.
  pub fn pending_tags(&self) -> Result<Vec<SyncTag>> {
    let clinic = self.scope.active_clinic()?;
    Ok(
      self
        .store
        .pending_tags(clinic.as_deref())?
        .into_iter()
        .filter_map(|t| t.parse().ok())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::Entity;
  use serde_json::json;

  fn queue() -> (OutboundQueue, ClinicScopeManager) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let scope = ClinicScopeManager::new(store.clone());
    (OutboundQueue::new(store, scope.clone()), scope)
  }

  fn write(tag: SyncTag, url: &str) -> NewMutation {
    NewMutation {
      tag,
      method: "post".to_string(),
      url: url.to_string(),
      payload: Some(json!({ "name": "x" })),
    }
  }

  #[test]
  fn test_enqueue_tags_active_clinic() {
    let (queue, scope) = queue();
    scope.set_active_clinic("clinic-a").unwrap();

    let tag = SyncTag::Entity(Entity::Patients);
    let id = queue.enqueue(write(tag, "/api/patients")).unwrap();

    let pending = queue.pending(tag).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].clinic_id.as_deref(), Some("clinic-a"));
    assert_eq!(queue.pending_tags().unwrap(), vec![tag]);

    scope.set_active_clinic("clinic-b").unwrap();
    assert!(queue.pending(tag).unwrap().is_empty());
    assert!(queue.all().unwrap().is_empty());
  }

  #[test]
  fn test_retry_only_applies_to_failed_writes() {
    let (queue, _) = queue();
    let tag = SyncTag::Entity(Entity::Exams);
    let id = queue.enqueue(write(tag, "/api/exams")).unwrap();
    assert!(queue.retry(id).is_err());

    queue.store.record_mutation_retry(id, "HTTP 503", 1).unwrap();
    queue.retry(id).unwrap();
    let pending = queue.pending(tag).unwrap();
    assert_eq!(pending[0].retry_count, 0);
    assert!(pending[0].last_error.is_none());
  }

  #[test]
  fn test_reads_and_absolute_urls_rejected() {
    let (queue, _) = queue();
    let mut read = write(SyncTag::Generic, "/api/patients");
    read.method = "GET".to_string();
    assert!(queue.enqueue(read).is_err());
    assert!(queue
      .enqueue(write(SyncTag::Generic, "https://elsewhere.example/api"))
      .is_err());
  }
}
