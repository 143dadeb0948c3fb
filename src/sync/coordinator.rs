//! Background-sync coordinator.
//!
//! Turns sync signals (a fired tag, the periodic timer, connectivity coming
//! back) into work. Each signal notifies every open UI instance exactly once,
//! then hands the actual resync to a [`SyncDelegate`] under the configured
//! [`RetryPolicy`]. A tag that exhausts its attempts stays registered so the
//! next signal picks it up again.

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::store::SqliteStore;

use super::clients::ClientRegistry;
use super::messages::ClientMessage;
use super::retry::RetryPolicy;
use super::tags::SyncTag;

/// Performs the resync behind a tag. Returns how many items it processed.
///
/// `final_attempt` is set on the last attempt the coordinator makes for one
/// signal, so per-item budgets are charged once per signal.
pub trait SyncDelegate: Send + Sync {
  fn resync(&self, tag: SyncTag, final_attempt: bool) -> BoxFuture<'_, Result<usize>>;
}

/// Where a tag is in its sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  /// Waiting for a signal
  Registered,
  /// Signal received, clients being notified
  Triggered,
  /// Handed to the delegate
  Delegated,
  /// Delegate finished; registration dropped
  Succeeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
  pub tag: SyncTag,
  /// UI instances that received the wake-up message
  pub notified: usize,
  pub attempts: u32,
  pub processed: usize,
}

pub struct SyncCoordinator {
  store: Arc<SqliteStore>,
  clients: ClientRegistry,
  delegate: Arc<dyn SyncDelegate>,
  retry: RetryPolicy,
  states: Mutex<HashMap<SyncTag, SyncState>>,
  /// One delegated run at a time, so replays never interleave.
  running: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    store: Arc<SqliteStore>,
    clients: ClientRegistry,
    delegate: Arc<dyn SyncDelegate>,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      store,
      clients,
      delegate,
      retry,
      states: Mutex::new(HashMap::new()),
      running: tokio::sync::Mutex::new(()),
    }
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  /// Ask for `tag` to be synced on the next signal. Survives restarts.
  pub fn register(&self, tag: SyncTag) -> Result<()> {
    self.store.add_registration(tag.as_str())?;
    self.set_state(tag, SyncState::Registered);
    debug!(tag = %tag, "sync registered");
    Ok(())
  }

  /// Tags waiting for a signal. Unknown tags left by older versions are skipped.
  pub fn registered(&self) -> Result<Vec<SyncTag>> {
    Ok(
      self
        .store
        .registrations()?
        .into_iter()
        .filter_map(|t| match t.parse() {
          Ok(tag) => Some(tag),
          Err(_) => {
            warn!(tag = %t, "ignoring unknown registered tag");
            None
          }
        })
        .collect(),
    )
  }

  pub fn state(&self, tag: SyncTag) -> Option<SyncState> {
    self
      .states
      .lock()
      .ok()
      .and_then(|states| states.get(&tag).copied())
  }

  /// Handle a fired sync tag.
  pub async fn on_sync(&self, tag: SyncTag) -> Result<SyncOutcome> {
    self.set_state(tag, SyncState::Triggered);
    let notified = self.clients.broadcast(&ClientMessage::for_tag(tag));
    info!(tag = %tag, notified, "sync signal received");

    self.set_state(tag, SyncState::Delegated);
    let _running = self.running.lock().await;

    let attempts = self.retry.attempts();
    let mut attempt = 1;
    loop {
      match self.delegate.resync(tag, attempt >= attempts).await {
        Ok(processed) => {
          self.store.remove_registration(tag.as_str())?;
          self.set_state(tag, SyncState::Succeeded);
          info!(tag = %tag, attempt, processed, "sync succeeded");
          return Ok(SyncOutcome {
            tag,
            notified,
            attempts: attempt,
            processed,
          });
        }
        Err(e) if attempt < attempts => {
          let delay = self.retry.backoff(attempt);
          warn!(
            tag = %tag,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "sync attempt failed: {}",
            e
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          warn!(tag = %tag, attempt, "sync gave up: {}", e);
          self.register(tag)?;
          return Err(e.wrap_err(format!("Sync '{}' failed after {} attempts", tag, attempt)));
        }
      }
    }
  }

  /// The periodic timer fired: sync everything.
  pub async fn on_periodic_sync(&self) -> Result<SyncOutcome> {
    self.on_sync(SyncTag::Generic).await
  }

  /// Connectivity came back: fire every registered tag and every tag with
  /// pending writes for `clinic_id`.
  pub async fn on_connectivity_restored(
    &self,
    clinic_id: Option<&str>,
  ) -> Result<Vec<(SyncTag, Result<SyncOutcome>)>> {
    let mut tags = self.registered()?;
    for tag in self.store.pending_tags(clinic_id)? {
      match tag.parse::<SyncTag>() {
        Ok(tag) if !tags.contains(&tag) => tags.push(tag),
        Ok(_) => {}
        Err(e) => warn!("skipping queued tag: {}", e),
      }
    }

    info!(count = tags.len(), "connectivity restored, firing sync tags");
    let mut results = Vec::with_capacity(tags.len());
    for tag in tags {
      let outcome = self.on_sync(tag).await;
      results.push((tag, outcome));
    }
    Ok(results)
  }

  fn set_state(&self, tag: SyncTag, state: SyncState) {
    if let Ok(mut states) = self.states.lock() {
      states.insert(tag, state);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::Entity;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Fails the first `failures` calls, then succeeds.
  #[derive(Default)]
  struct FlakyDelegate {
    failures: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<SyncTag>>,
    finals: Mutex<Vec<bool>>,
  }

  impl SyncDelegate for FlakyDelegate {
    fn resync(&self, tag: SyncTag, final_attempt: bool) -> BoxFuture<'_, Result<usize>> {
      Box::pin(async move {
        self.seen.lock().unwrap().push(tag);
        self.finals.lock().unwrap().push(final_attempt);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
          Err(eyre!("upstream unreachable"))
        } else {
          Ok(3)
        }
      })
    }
  }

  fn coordinator(failures: usize, max_attempts: u32) -> (SyncCoordinator, Arc<FlakyDelegate>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let delegate = Arc::new(FlakyDelegate {
      failures,
      ..Default::default()
    });
    let coordinator = SyncCoordinator::new(
      store,
      ClientRegistry::new(),
      delegate.clone(),
      RetryPolicy::immediate(max_attempts),
    );
    (coordinator, delegate)
  }

  #[tokio::test]
  async fn test_entity_tag_notifies_each_client_once() {
    let (coordinator, _) = coordinator(0, 3);
    let (_, mut a) = coordinator.clients().subscribe();
    let (_, mut b) = coordinator.clients().subscribe();

    let outcome = coordinator
      .on_sync(SyncTag::Entity(Entity::Patients))
      .await
      .unwrap();
    assert_eq!(outcome.notified, 2);

    for rx in [&mut a, &mut b] {
      match rx.try_recv().unwrap() {
        ClientMessage::EntitySync { entity, .. } => assert_eq!(entity, Entity::Patients),
        other => panic!("unexpected message {:?}", other),
      }
      assert!(rx.try_recv().is_err());
    }
  }

  #[tokio::test]
  async fn test_success_drops_registration() {
    let (coordinator, _) = coordinator(0, 3);
    let tag = SyncTag::Entity(Entity::LabOrders);
    coordinator.register(tag).unwrap();
    assert_eq!(coordinator.registered().unwrap(), vec![tag]);
    assert_eq!(coordinator.state(tag), Some(SyncState::Registered));

    let outcome = coordinator.on_sync(tag).await.unwrap();
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.attempts, 1);
    assert!(coordinator.registered().unwrap().is_empty());
    assert_eq!(coordinator.state(tag), Some(SyncState::Succeeded));
  }

  #[tokio::test]
  async fn test_retries_until_success() {
    let (coordinator, delegate) = coordinator(2, 3);
    let outcome = coordinator.on_periodic_sync().await.unwrap();
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.tag, SyncTag::Generic);
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_exhausted_tag_stays_registered() {
    let (coordinator, delegate) = coordinator(10, 2);
    let tag = SyncTag::Entity(Entity::Invoices);

    assert!(coordinator.on_sync(tag).await.is_err());
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*delegate.finals.lock().unwrap(), vec![false, true]);
    assert_eq!(coordinator.registered().unwrap(), vec![tag]);
    assert_eq!(coordinator.state(tag), Some(SyncState::Registered));
  }

  #[tokio::test]
  async fn test_connectivity_fires_registered_and_queued_tags() {
    let (coordinator, delegate) = coordinator(0, 1);
    let registered = SyncTag::Entity(Entity::Appointments);
    coordinator.register(registered).unwrap();
    coordinator
      .store
      .enqueue_mutation(
        Some("clinic-a"),
        &crate::store::NewMutation {
          tag: SyncTag::Entity(Entity::Queue),
          method: "POST".to_string(),
          url: "/api/queue".to_string(),
          payload: None,
        },
      )
      .unwrap();

    let results = coordinator
      .on_connectivity_restored(Some("clinic-a"))
      .await
      .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(
      *delegate.seen.lock().unwrap(),
      vec![registered, SyncTag::Entity(Entity::Queue)]
    );
  }

  #[tokio::test]
  async fn test_blip_does_not_let_update_overtake_create() {
    use crate::scope::ClinicScopeManager;
    use crate::store::{MutationStatus, NewMutation};
    use crate::sync::{OutboundQueue, QueueReplayer};
    use crate::test_support::{upstream, FakeTransport};

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let scope = ClinicScopeManager::new(store.clone());
    scope.set_active_clinic("clinic-a").unwrap();
    let transport = FakeTransport::new();
    let replayer = Arc::new(QueueReplayer::new(
      store.clone(),
      scope.clone(),
      Arc::new(transport.clone()),
      upstream(),
      5,
    ));
    let coordinator = SyncCoordinator::new(
      store.clone(),
      ClientRegistry::new(),
      replayer,
      RetryPolicy::immediate(5),
    );

    let queue = OutboundQueue::new(store.clone(), scope);
    let tag = SyncTag::Entity(Entity::Patients);
    let write = |method: &str, url: &str| NewMutation {
      tag,
      method: method.to_string(),
      url: url.to_string(),
      payload: None,
    };
    let create = queue.enqueue(write("POST", "/api/patients")).unwrap();
    queue.enqueue(write("PUT", "/api/patients/1")).unwrap();
    transport.json("POST", "/api/patients", 503, "");
    transport.json("PUT", "/api/patients/1", 200, "{}");

    // One signal spends one unit of budget, however many attempts it makes.
    assert!(coordinator.on_sync(tag).await.is_err());
    assert_eq!(transport.calls("POST", "/api/patients"), 5);
    let all = queue.all().unwrap();
    assert_eq!(all[0].status, MutationStatus::Pending);
    assert_eq!(all[0].retry_count, 1);

    for _ in 0..4 {
      assert!(coordinator.on_sync(tag).await.is_err());
    }
    assert_eq!(queue.all().unwrap()[0].status, MutationStatus::Failed);

    // Upstream recovers: the update still waits for the create.
    transport.json("POST", "/api/patients", 201, "{}");
    let outcome = coordinator.on_sync(tag).await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert_eq!(transport.calls("PUT", "/api/patients/1"), 0);
    assert_eq!(queue.all().unwrap()[1].status, MutationStatus::Pending);

    assert!(store.retry_failed_mutation(create).unwrap());
    let outcome = coordinator.on_sync(tag).await.unwrap();
    assert_eq!(outcome.processed, 2);
    let sent = transport.sent();
    let last_two: Vec<String> = sent[sent.len() - 2..]
      .iter()
      .map(|r| format!("{} {}", r.method, r.url.path()))
      .collect();
    assert_eq!(last_two, vec!["POST /api/patients", "PUT /api/patients/1"]);
  }
}
