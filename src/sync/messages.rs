//! Messages exchanged between the proxy and UI instances.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::tags::{Entity, SyncTag};

/// Closed set of messages. Serialized with a `type` discriminator:
///
/// ```json
/// { "type": "ENTITY_SYNC", "entity": "patients", "timestamp": 1767225600000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Drain the whole outbound queue
  BackgroundSync { timestamp: i64 },
  /// Drain one entity's queue
  EntitySync { entity: Entity, timestamp: i64 },
  /// Activate the installed version now
  SkipWaiting,
  /// Warm the cache with these URLs
  CacheUrls { payload: Vec<String> },
}

impl ClientMessage {
  /// The wake-up message for a sync tag, stamped with the current time.
  pub fn for_tag(tag: SyncTag) -> Self {
    let timestamp = Utc::now().timestamp_millis();
    match tag {
      SyncTag::Generic => ClientMessage::BackgroundSync { timestamp },
      SyncTag::Entity(entity) => ClientMessage::EntitySync { entity, timestamp },
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::BackgroundSync { .. } => "BACKGROUND_SYNC",
      Self::EntitySync { .. } => "ENTITY_SYNC",
      Self::SkipWaiting => "SKIP_WAITING",
      Self::CacheUrls { .. } => "CACHE_URLS",
    }
  }
}
