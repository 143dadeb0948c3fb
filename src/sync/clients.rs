//! Registry of open UI instances.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::messages::ClientMessage;

pub type ClientId = u64;

/// Open UI instances, each fed through its own channel.
///
/// A client disappears when its receiver is dropped; the next broadcast
/// notices the closed channel and forgets it.
#[derive(Clone, Default)]
pub struct ClientRegistry {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  next_id: AtomicU64,
  clients: Mutex<BTreeMap<ClientId, mpsc::UnboundedSender<ClientMessage>>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new instance.
  pub fn subscribe(&self) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut clients) = self.inner.clients.lock() {
      clients.insert(id, tx);
    }
    debug!(client = id, "ui instance connected");
    (id, rx)
  }

  /// Post `message` to every open instance. Returns how many received it.
  pub fn broadcast(&self, message: &ClientMessage) -> usize {
    let Ok(mut clients) = self.inner.clients.lock() else {
      return 0;
    };

    clients.retain(|id, tx| {
      let delivered = tx.send(message.clone()).is_ok();
      if !delivered {
        debug!(client = id, "ui instance gone");
      }
      delivered
    });

    clients.len()
  }

  /// Number of instances still connected.
  pub fn len(&self) -> usize {
    self
      .inner
      .clients
      .lock()
      .map(|mut clients| {
        clients.retain(|_, tx| !tx.is_closed());
        clients.len()
      })
      .unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
