//! HTTP front: turns incoming requests into fetch events and exposes the
//! worker's control endpoints to the application.

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request as AxumRequest, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use url::Url;

use crate::event::{self, EventSender, WorkerEvent};
use crate::http::{Request, Response};
use crate::queue::NewPendingWrite;
use crate::sync::SyncTag;
use crate::worker::{Shared, WorkerState};

/// Largest request body forwarded to the worker.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
  pub events: EventSender,
  pub upstream: Url,
  pub shared: Shared,
  pub worker_state: watch::Receiver<WorkerState>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/__sw/status", get(status))
    .route("/__sw/queue/{tag}", post(enqueue))
    .route("/__sw/sync/{tag}", post(register_sync))
    .route("/__sw/push", post(push))
    .route("/__sw/notifications", get(notifications))
    .route("/__sw/notifications/{id}/click", post(click))
    .fallback(forward)
    .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
  listen: &str,
  state: AppState,
  shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
  let listener = TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to listen on {}: {}", listen, e))?;

  info!(%listen, upstream = %state.upstream, "Serving");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

#[derive(Serialize)]
struct StatusBody {
  online: bool,
  state: WorkerState,
  pending: BTreeMap<&'static str, usize>,
  deferred_syncs: Vec<&'static str>,
}

async fn status(State(state): State<AppState>) -> AxumResponse {
  let mut pending = BTreeMap::new();
  for tag in SyncTag::ALL {
    let collection = tag.collection();
    match state.shared.queue.count(collection) {
      Ok(count) => {
        pending.insert(collection.name(), count);
      }
      Err(e) => warn!(error = %e, "Failed to count pending writes"),
    }
  }

  Json(StatusBody {
    online: state.shared.connectivity.is_online(),
    state: *state.worker_state.borrow(),
    pending,
    deferred_syncs: state
      .shared
      .connectivity
      .pending()
      .iter()
      .map(|tag| tag.as_str())
      .collect(),
  })
  .into_response()
}

/// Queue an offline write and register its sync.
async fn enqueue(
  State(state): State<AppState>,
  Path(tag): Path<String>,
  Json(record): Json<NewPendingWrite>,
) -> AxumResponse {
  let Some(tag) = SyncTag::parse(&tag) else {
    return unknown_tag(&tag);
  };

  match state.shared.queue.enqueue(tag.collection(), &record) {
    Ok(id) => {
      info!(%tag, id, "Queued offline write");
      fire_or_defer(&state, tag);
      (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
    }
    Err(e) => {
      warn!(%tag, error = %e, "Failed to queue offline write");
      (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Could not save the change locally." })),
      )
        .into_response()
    }
  }
}

async fn register_sync(State(state): State<AppState>, Path(tag): Path<String>) -> AxumResponse {
  let Some(tag) = SyncTag::parse(&tag) else {
    return unknown_tag(&tag);
  };

  let fired = fire_or_defer(&state, tag);
  (StatusCode::ACCEPTED, Json(json!({ "fired": fired }))).into_response()
}

/// Fire the sync now when online, otherwise leave it for the next reconnect.
fn fire_or_defer(state: &AppState, tag: SyncTag) -> bool {
  if !state.shared.connectivity.register(tag) {
    return false;
  }

  let event = WorkerEvent::Sync {
    tag: tag.as_str().to_string(),
  };
  if state.events.send(event).is_err() {
    state.shared.connectivity.defer(tag);
    return false;
  }
  true
}

async fn push(State(state): State<AppState>, body: Bytes) -> StatusCode {
  match state.events.send(WorkerEvent::Push { payload: body }) {
    Ok(()) => StatusCode::ACCEPTED,
    Err(_) => StatusCode::SERVICE_UNAVAILABLE,
  }
}

async fn notifications(State(state): State<AppState>) -> AxumResponse {
  Json(state.shared.relay.shown()).into_response()
}

async fn click(State(state): State<AppState>, Path(id): Path<u64>) -> AxumResponse {
  let (respond_to, outcome) = oneshot::channel();
  if state
    .events
    .send(WorkerEvent::NotificationClick { id, respond_to })
    .is_err()
  {
    return StatusCode::SERVICE_UNAVAILABLE.into_response();
  }

  match outcome.await {
    Ok(Some(outcome)) => Json(outcome).into_response(),
    Ok(None) => StatusCode::NOT_FOUND.into_response(),
    Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
  }
}

/// Everything that is not a control endpoint becomes a fetch event.
async fn forward(State(state): State<AppState>, request: AxumRequest) -> AxumResponse {
  let request = match into_worker_request(&state.upstream, request).await {
    Ok(request) => request,
    Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
  };

  match event::fetch(&state.events, request).await {
    Ok(response) => into_axum_response(response),
    Err(e) => {
      warn!(error = %e, "Fetch failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

async fn into_worker_request(upstream: &Url, request: AxumRequest) -> Result<Request, String> {
  let (parts, body) = request.into_parts();

  // Only path and query are taken from the client; the origin stays fixed
  let mut url = upstream.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let body = to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| format!("could not read request body: {}", e))?;

  let mut request = Request::new(parts.method.as_str(), url).with_body(body);
  for (name, value) in &parts.headers {
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }

  Ok(request)
}

fn into_axum_response(response: Response) -> AxumResponse {
  let (status, headers, body) = response.into_parts();

  let mut out = AxumResponse::new(Body::from(body));
  *out.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

  for (name, value) in headers {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(&value),
    ) {
      out.headers_mut().append(name, value);
    }
  }

  out
}

fn unknown_tag(tag: &str) -> AxumResponse {
  (
    StatusCode::NOT_FOUND,
    Json(json!({ "error": format!("unknown sync tag: {}", tag) })),
  )
    .into_response()
}
