//! Sequential pre-cache runs.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::scope::ClinicScopeManager;

use super::catalog::{Catalog, Category};

/// Fetches one cache option for a clinic and stores it. Returns the number of
/// records cached.
pub trait PrecacheFetcher: Send + Sync {
  fn fetch<'a>(&'a self, clinic_id: &'a str, path: &'a str) -> BoxFuture<'a, Result<u64>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OptionResult {
  Cached { records: u64 },
  Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionOutcome {
  pub category: Category,
  pub option: String,
  pub label: String,
  #[serde(flatten)]
  pub result: OptionResult,
}

impl OptionOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self.result, OptionResult::Cached { .. })
  }
}

/// Result of a whole run. Partial failure is a normal outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheReport {
  pub clinic_id: String,
  pub outcomes: Vec<OptionOutcome>,
  pub succeeded: usize,
  pub failed: usize,
  pub total_records: u64,
  /// Set when at least one option succeeded
  pub last_sync: Option<DateTime<Utc>>,
}

/// Handed to the progress callback after each operation.
#[derive(Debug)]
pub struct Progress<'a> {
  /// 1-based position in the run
  pub index: usize,
  pub total: usize,
  pub outcome: &'a OptionOutcome,
}

pub struct PrecacheOrchestrator {
  catalog: Catalog,
  fetcher: Arc<dyn PrecacheFetcher>,
  scope: ClinicScopeManager,
}

impl PrecacheOrchestrator {
  pub fn new(catalog: Catalog, fetcher: Arc<dyn PrecacheFetcher>, scope: ClinicScopeManager) -> Self {
    Self {
      catalog,
      fetcher,
      scope,
    }
  }

  pub fn catalog(&self) -> &Catalog {
    &self.catalog
  }

  /// Fetch every option of `categories` for `clinic_id`, one at a time.
  ///
  /// Always completes. Each failure is recorded against its option and the run
  /// moves on.
  pub async fn run<F>(&self, clinic_id: &str, categories: &[Category], mut on_progress: F) -> PrecacheReport
  where
    F: FnMut(Progress<'_>),
  {
    let plan = self.catalog.plan(categories);
    let total = plan.len();
    info!(clinic = clinic_id, operations = total, "pre-cache started");

    let mut outcomes = Vec::with_capacity(total);
    for (index, (category, option)) in plan.into_iter().enumerate() {
      let result = match self.fetcher.fetch(clinic_id, &option.path).await {
        Ok(records) => OptionResult::Cached { records },
        Err(e) => {
          warn!(option = %option.id, "pre-cache option failed: {}", e);
          OptionResult::Failed {
            message: e.to_string(),
          }
        }
      };

      let outcome = OptionOutcome {
        category,
        option: option.id,
        label: option.label,
        result,
      };
      on_progress(Progress {
        index: index + 1,
        total,
        outcome: &outcome,
      });
      outcomes.push(outcome);
    }

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let total_records = outcomes
      .iter()
      .map(|o| match o.result {
        OptionResult::Cached { records } => records,
        OptionResult::Failed { .. } => 0,
      })
      .sum();

    let last_sync = if succeeded > 0 {
      self.record_sync(clinic_id)
    } else {
      None
    };

    info!(
      clinic = clinic_id,
      succeeded,
      failed = total - succeeded,
      total_records,
      "pre-cache finished"
    );

    PrecacheReport {
      clinic_id: clinic_id.to_string(),
      failed: outcomes.len() - succeeded,
      succeeded,
      total_records,
      outcomes,
      last_sync,
    }
  }

  fn record_sync(&self, clinic_id: &str) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    let result = self
      .scope
      .set_last_sync_time(clinic_id, now)
      .and_then(|_| self.scope.refresh_record_count(clinic_id));
    match result {
      Ok(_) => Some(now),
      Err(e) => {
        warn!(clinic = clinic_id, "failed to update clinic scope: {}", e);
        None
      }
    }
  }
}
