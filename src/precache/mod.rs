//! Pre-cache: warm the local store for a clinic before going offline.

mod catalog;
mod orchestrator;

pub use catalog::{CacheOption, Catalog, Category};
pub use orchestrator::{OptionResult, PrecacheFetcher, PrecacheOrchestrator};
