//! Replays queued writes against the upstream.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::scope::ClinicScopeManager;
use crate::store::{MutationStatus, OutboundMutation, SqliteStore};
use crate::transport::{Request, Transport, Upstream};

use super::coordinator::SyncDelegate;
use super::tags::SyncTag;

/// Creation time of the offline write, for last-write-wins on the server.
pub const OFFLINE_CREATED_AT_HEADER: &str = "x-offline-created-at";
pub const MUTATION_ID_HEADER: &str = "x-offline-mutation-id";

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
  /// Accepted by the upstream
  pub replayed: usize,
  /// Refused by the upstream for good (4xx)
  pub rejected: usize,
  /// Left pending behind an earlier write that ran out of retries
  pub held: usize,
}

/// Default [`SyncDelegate`]: drains the outbound queue in creation order.
pub struct QueueReplayer {
  store: Arc<SqliteStore>,
  scope: ClinicScopeManager,
  transport: Arc<dyn Transport>,
  upstream: Upstream,
  retry_budget: u32,
}

impl QueueReplayer {
  pub fn new(
    store: Arc<SqliteStore>,
    scope: ClinicScopeManager,
    transport: Arc<dyn Transport>,
    upstream: Upstream,
    retry_budget: u32,
  ) -> Self {
    Self {
      store,
      scope,
      transport,
      upstream,
      retry_budget,
    }
  }

  /// Replay the pending writes of `clinic_id` on `tag`'s channel, spending
  /// one unit of retry budget on a transient failure.
  ///
  /// Stops at the first transient failure and returns it, so later writes never
  /// overtake an earlier one. Writes queued behind a mutation that ran out of
  /// retries stay pending.
  pub async fn drain(&self, clinic_id: Option<&str>, tag: SyncTag) -> Result<DrainReport> {
    self.replay(clinic_id, tag, true).await
  }

  async fn replay(&self, clinic_id: Option<&str>, tag: SyncTag, spend_budget: bool) -> Result<DrainReport> {
    let pending = self.store.pending_mutations(clinic_id, Some(tag))?;
    if pending.is_empty() {
      debug!(tag = %tag, "nothing to replay");
      return Ok(DrainReport::default());
    }

    info!(tag = %tag, count = pending.len(), "replaying queued writes");
    let held = self.store.held_channels(clinic_id)?;
    let mut report = DrainReport::default();
    let result = self
      .replay_all(&pending, &held, spend_budget, &mut report)
      .await;

    if report.replayed > 0 {
      if let Some(clinic) = clinic_id {
        self.scope.set_last_sync_time(clinic, Utc::now())?;
      }
    }
    info!(
      tag = %tag,
      replayed = report.replayed,
      rejected = report.rejected,
      held = report.held,
      "replay finished"
    );

    result.map(|_| report)
  }

  async fn replay_all(
    &self,
    pending: &[OutboundMutation],
    held: &HashMap<String, i64>,
    spend_budget: bool,
    report: &mut DrainReport,
  ) -> Result<()> {
    for mutation in pending {
      if let Some(blocker) = held.get(mutation.tag.as_str()) {
        if *blocker < mutation.id {
          debug!(id = mutation.id, blocker, "held behind a failed write");
          report.held += 1;
          continue;
        }
      }

      self
        .store
        .set_mutation_status(mutation.id, MutationStatus::Syncing, None)?;

      let request = match self.build_request(mutation) {
        Ok(request) => request,
        Err(e) => {
          warn!(id = mutation.id, "unreplayable mutation: {}", e);
          self.store.set_mutation_status(
            mutation.id,
            MutationStatus::Failed,
            Some(&e.to_string()),
          )?;
          report.rejected += 1;
          continue;
        }
      };

      let error = match self.transport.send(request).await {
        Ok(response) if response.status.is_success() => {
          self
            .store
            .set_mutation_status(mutation.id, MutationStatus::Done, None)?;
          report.replayed += 1;
          continue;
        }
        Ok(response) if !is_transient(response.status) => {
          let error = format!(
            "HTTP {}: {}",
            response.status.as_u16(),
            String::from_utf8_lossy(&response.body)
          );
          warn!(id = mutation.id, status = response.status.as_u16(), "write rejected");
          self
            .store
            .set_mutation_status(mutation.id, MutationStatus::Failed, Some(&error))?;
          report.rejected += 1;
          continue;
        }
        Ok(response) => format!("HTTP {}", response.status.as_u16()),
        Err(e) => e.to_string(),
      };

      let status = if spend_budget {
        self
          .store
          .record_mutation_retry(mutation.id, &error, self.retry_budget)?
      } else {
        self.store.release_mutation(mutation.id, &error)?;
        MutationStatus::Pending
      };
      warn!(id = mutation.id, status = %status, "replay interrupted: {}", error);
      return Err(eyre!("Replay of mutation {} failed: {}", mutation.id, error));
    }
    Ok(())
  }

  fn build_request(&self, mutation: &OutboundMutation) -> Result<Request> {
    let method = Method::from_bytes(mutation.method.as_bytes())
      .map_err(|_| eyre!("Invalid method '{}'", mutation.method))?;
    let mut request = self
      .upstream
      .request(method, &mutation.url, mutation.clinic_id.as_deref())?
      .with_header(OFFLINE_CREATED_AT_HEADER, &mutation.created_at.to_rfc3339())
      .with_header(MUTATION_ID_HEADER, &mutation.id.to_string());

    if let Some(payload) = &mutation.payload {
      let body = serde_json::to_vec(payload)
        .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
      request = request
        .with_header("content-type", "application/json")
        .with_body(body);
    }
    Ok(request)
  }
}

/// Worth trying again later.
fn is_transient(status: StatusCode) -> bool {
  status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
}

impl SyncDelegate for QueueReplayer {
  fn resync(&self, tag: SyncTag, final_attempt: bool) -> BoxFuture<'_, Result<usize>> {
    Box::pin(async move {
      let clinic = self.scope.active_clinic()?;
      let report = self.replay(clinic.as_deref(), tag, final_attempt).await?;
      Ok(report.replayed)
    })
  }
}
