//! Background sync: tags, client messaging, the outbound queue and its replay.

mod clients;
mod coordinator;
mod messages;
mod queue;
mod replay;
mod retry;
mod tags;

pub use clients::ClientRegistry;
pub use coordinator::{SyncCoordinator, SyncOutcome};
pub use messages::ClientMessage;
pub use queue::OutboundQueue;
pub use replay::QueueReplayer;
pub use retry::RetryPolicy;
pub use tags::{Entity, SyncTag, CATALOGUE_VERSION, GENERIC_TAG};
