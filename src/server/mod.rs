//! HTTP surface: the control plane under `/__ocusync` plus the proxy fallback.

mod error;
mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::app::App;

pub fn create_router(app: Arc<App>) -> Router {
  Router::new()
    .route("/__ocusync/events", get(handlers::events))
    .route("/__ocusync/messages", post(handlers::post_message))
    .route("/__ocusync/status", get(handlers::status))
    .route("/__ocusync/sync/tags", get(handlers::sync_tags))
    .route("/__ocusync/sync", post(handlers::request_sync))
    .route(
      "/__ocusync/mutations",
      get(handlers::list_mutations).post(handlers::enqueue_mutation),
    )
    .route("/__ocusync/mutations/:id/retry", post(handlers::retry_mutation))
    .route(
      "/__ocusync/clinic",
      get(handlers::get_clinic).put(handlers::set_clinic),
    )
    .route("/__ocusync/stats", get(handlers::stats))
    .route("/__ocusync/precache/catalog", get(handlers::precache_catalog))
    .route("/__ocusync/precache", post(handlers::run_precache))
    .fallback(handlers::proxy)
    .with_state(app)
}
