use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query, Request as AxumRequest, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::App;
use crate::event::NetworkStatus;
use crate::precache::Category;
use crate::store::NewMutation;
use crate::sync::{ClientMessage, Entity, SyncTag, CATALOGUE_VERSION, GENERIC_TAG};
use crate::transport::{forwardable, Request};

use super::error::{ApiError, ApiResult};

/// Largest request body the proxy buffers.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub const SOURCE_HEADER: &str = "x-ocusync-source";

/// One SSE stream per open UI instance.
pub async fn events(State(app): State<Arc<App>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let (client, rx) = app.coordinator.clients().subscribe();
  debug!(client, "event stream opened");

  let stream = stream::unfold(rx, |mut rx| async move {
    let message = rx.recv().await?;
    let event = Event::default()
      .event(message.kind())
      .json_data(&message)
      .unwrap_or_else(|_| Event::default().comment("unserializable message"));
    Some((Ok(event), rx))
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn post_message(
  State(app): State<Arc<App>>,
  Json(message): Json<ClientMessage>,
) -> ApiResult<impl IntoResponse> {
  let outcome = app
    .interceptor
    .handle_message(message)
    .await
    .map_err(ApiError::bad_request)?;
  Ok(Json(outcome))
}

#[derive(Serialize)]
struct EntityTag {
  entity: Entity,
  tag: SyncTag,
}

pub async fn sync_tags() -> impl IntoResponse {
  let entities: Vec<EntityTag> = Entity::ALL
    .into_iter()
    .map(|entity| EntityTag {
      entity,
      tag: SyncTag::Entity(entity),
    })
    .collect();
  Json(json!({
    "version": CATALOGUE_VERSION,
    "generic": GENERIC_TAG,
    "entities": entities,
  }))
}

#[derive(Deserialize)]
pub struct SyncRequest {
  tag: String,
}

/// Register a tag; fire it right away when the upstream is reachable.
pub async fn request_sync(
  State(app): State<Arc<App>>,
  Json(body): Json<SyncRequest>,
) -> ApiResult<impl IntoResponse> {
  let tag: SyncTag = body.tag.parse().map_err(ApiError::bad_request)?;
  app.coordinator.register(tag)?;
  let fired = fire_if_online(&app, tag);
  Ok((
    StatusCode::ACCEPTED,
    Json(json!({ "tag": tag, "registered": true, "fired": fired })),
  ))
}

#[derive(Deserialize)]
pub struct MutationRequest {
  /// Entity channel; the generic channel when absent
  entity: Option<Entity>,
  method: String,
  url: String,
  payload: Option<Value>,
}

/// Queue a write the UI could not send, and register its sync tag.
pub async fn enqueue_mutation(
  State(app): State<Arc<App>>,
  Json(body): Json<MutationRequest>,
) -> ApiResult<impl IntoResponse> {
  let tag = body.entity.map(SyncTag::Entity).unwrap_or(SyncTag::Generic);
  let id = app
    .queue
    .enqueue(NewMutation {
      tag,
      method: body.method,
      url: body.url,
      payload: body.payload,
    })
    .map_err(ApiError::bad_request)?;
  app.coordinator.register(tag)?;
  fire_if_online(&app, tag);

  Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "tag": tag }))))
}

/// Give a write that ran out of retries another go.
pub async fn retry_mutation(State(app): State<Arc<App>>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
  app.queue.retry(id).map_err(ApiError::bad_request)?;
  let fired = fire_if_online(&app, SyncTag::Generic);
  Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "fired": fired }))))
}

pub async fn list_mutations(State(app): State<Arc<App>>) -> ApiResult<impl IntoResponse> {
  Ok(Json(app.queue.all()?))
}

pub async fn get_clinic(State(app): State<Arc<App>>) -> ApiResult<impl IntoResponse> {
  let clinic = app.scope.active_clinic()?;
  let last_sync = match &clinic {
    Some(id) => app.scope.last_sync_time(id)?,
    None => None,
  };
  Ok(Json(json!({ "clinicId": clinic, "lastSync": last_sync })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicRequest {
  clinic_id: String,
}

pub async fn set_clinic(
  State(app): State<Arc<App>>,
  Json(body): Json<ClinicRequest>,
) -> ApiResult<impl IntoResponse> {
  let scope = app
    .scope
    .set_active_clinic(&body.clinic_id)
    .map_err(ApiError::bad_request)?;
  Ok(Json(scope))
}

#[derive(Deserialize)]
pub struct ClinicQuery {
  clinic: Option<String>,
}

pub async fn stats(
  State(app): State<Arc<App>>,
  Query(query): Query<ClinicQuery>,
) -> ApiResult<impl IntoResponse> {
  let clinic = app
    .scope
    .resolve(query.clinic.as_deref())
    .map_err(ApiError::bad_request)?;
  Ok(Json(app.scope.storage_stats(&clinic)?))
}

pub async fn status(State(app): State<Arc<App>>) -> ApiResult<impl IntoResponse> {
  let mut partitions = serde_json::Map::new();
  for name in app.interceptor.settings().layout.current() {
    let entries = app.store.count_entries(&name)?;
    partitions.insert(name, json!(entries));
  }

  Ok(Json(json!({
    "network": app.network_status(),
    "lifecycle": app.interceptor.lifecycle()?,
    "partitions": partitions,
    "activeClinic": app.scope.active_clinic()?,
    "clients": app.coordinator.clients().len(),
    "registeredTags": app.coordinator.registered()?,
    "pendingTags": app.queue.pending_tags()?,
  })))
}

pub async fn precache_catalog(State(app): State<Arc<App>>) -> impl IntoResponse {
  Json(app.precache.catalog().entries())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheRequest {
  clinic_id: Option<String>,
  categories: Vec<Category>,
}

pub async fn run_precache(
  State(app): State<Arc<App>>,
  Json(body): Json<PrecacheRequest>,
) -> ApiResult<impl IntoResponse> {
  let clinic = app
    .scope
    .resolve(body.clinic_id.as_deref())
    .map_err(ApiError::bad_request)?;
  let report = app
    .precache
    .run(&clinic, &body.categories, |p| {
      debug!(
        index = p.index,
        total = p.total,
        option = %p.outcome.option,
        "pre-cache progress"
      )
    })
    .await;
  Ok(Json(report))
}

/// Everything outside the control plane goes through the interceptor.
pub async fn proxy(State(app): State<Arc<App>>, request: AxumRequest) -> AxumResponse {
  let (parts, body) = request.into_parts();
  let target = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => {
      return ApiError::bad_request(format!("Failed to read request body: {}", e)).into_response()
    }
  };
  let url = match app.interceptor.upstream().url(&target) {
    Ok(url) => url,
    Err(e) => return ApiError::bad_request(e).into_response(),
  };

  let mut request = Request::new(parts.method, url).with_body(body.to_vec());
  request.headers = forwardable(&parts.headers);

  let intercepted = app.interceptor.handle(request).await;
  if intercepted.response.status.is_server_error() {
    warn!(
      target = %target,
      status = intercepted.response.status.as_u16(),
      source = intercepted.source.as_str(),
      "degraded response"
    );
  }

  let mut response = AxumResponse::new(Body::from(intercepted.response.body));
  *response.status_mut() = intercepted.response.status;
  *response.headers_mut() = intercepted.response.headers;
  if intercepted.response.status.is_redirection() {
    rewrite_location(&app, response.headers_mut());
  }
  response.headers_mut().insert(
    SOURCE_HEADER,
    HeaderValue::from_static(intercepted.source.as_str()),
  );
  response
}

/// Point same-origin upstream redirects back at the proxy.
fn rewrite_location(app: &App, headers: &mut HeaderMap) {
  let local = headers
    .get(header::LOCATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|location| app.interceptor.upstream().local_path(location));
  let Some(path) = local else {
    return;
  };
  match HeaderValue::from_str(&path) {
    Ok(value) => {
      headers.insert(header::LOCATION, value);
    }
    Err(e) => debug!(path = %path, "redirect left as is: {}", e),
  }
}

/// Fire `tag` in the background when online. Returns whether it was fired.
fn fire_if_online(app: &Arc<App>, tag: SyncTag) -> bool {
  if app.network_status() != NetworkStatus::Online {
    return false;
  }
  let app = app.clone();
  tokio::spawn(async move {
    if let Err(e) = app.coordinator.on_sync(tag).await {
      warn!(tag = %tag, "sync failed: {:#}", e);
    }
  });
  true
}
