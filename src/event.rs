use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::transport::{Transport, Upstream};

/// Reachability of the upstream as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
  Unknown,
  Online,
  Offline,
}

/// Sync signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// The upstream became reachable again
  ConnectivityRestored,
  /// The upstream stopped answering
  ConnectivityLost,
  /// Periodic timer fired while online
  PeriodicSync,
}

/// Polls a health path on the upstream.
///
/// Any answer, whatever its status, means the network is up.
pub struct Probe {
  transport: Arc<dyn Transport>,
  upstream: Upstream,
  path: String,
}

impl Probe {
  pub fn new(transport: Arc<dyn Transport>, upstream: Upstream, path: impl Into<String>) -> Self {
    Self {
      transport,
      upstream,
      path: path.into(),
    }
  }

  pub async fn check(&self) -> NetworkStatus {
    let request = match self.upstream.request(Method::GET, &self.path, None) {
      Ok(request) => request,
      Err(e) => {
        warn!("invalid probe request: {}", e);
        return NetworkStatus::Unknown;
      }
    };
    match self.transport.send(request).await {
      Ok(_) => NetworkStatus::Online,
      Err(e) => {
        debug!("probe failed: {}", e);
        NetworkStatus::Offline
      }
    }
  }
}

/// Turns raw probe results into transitions.
#[derive(Debug)]
pub struct ConnectivityTracker {
  status: NetworkStatus,
}

impl Default for ConnectivityTracker {
  fn default() -> Self {
    Self {
      status: NetworkStatus::Unknown,
    }
  }
}

impl ConnectivityTracker {
  pub fn status(&self) -> NetworkStatus {
    self.status
  }

  /// Record a probe result. Returns the event it causes, if any.
  ///
  /// Coming online from `Unknown` counts as a restore so work queued before a
  /// restart is picked up.
  pub fn observe(&mut self, status: NetworkStatus) -> Option<Event> {
    let previous = std::mem::replace(&mut self.status, status);
    match (previous, status) {
      (NetworkStatus::Online, NetworkStatus::Online) => None,
      (_, NetworkStatus::Online) => Some(Event::ConnectivityRestored),
      (NetworkStatus::Online, NetworkStatus::Offline) => Some(Event::ConnectivityLost),
      _ => None,
    }
  }
}

/// Event handler that produces sync signals from the probe and a periodic timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  status: watch::Receiver<NetworkStatus>,
}

impl EventHandler {
  pub fn new(probe: Probe, probe_interval: Duration, periodic_interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(NetworkStatus::Unknown);

    // Connectivity probe
    let probe_tx = tx.clone();
    tokio::spawn(async move {
      let mut tracker = ConnectivityTracker::default();
      let mut ticker = tokio::time::interval(probe_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let observed = probe.check().await;
        if let Some(event) = tracker.observe(observed) {
          info!(status = ?observed, "connectivity changed");
          if probe_tx.send(event).is_err() {
            break;
          }
        }
        status_tx.send_replace(tracker.status());
      }
    });

    // Periodic sync, only while online
    let periodic_status = status.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(periodic_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if *periodic_status.borrow() != NetworkStatus::Online {
          debug!("periodic sync skipped while offline");
          continue;
        }
        if tx.send(Event::PeriodicSync).is_err() {
          break;
        }
      }
    });

    Self { rx, status }
  }

  /// Live view of the connectivity status.
  pub fn status(&self) -> watch::Receiver<NetworkStatus> {
    self.status.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
