use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{
        StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheCoordinator, Outcome, PolicyDecision, UrlPolicy, normalize};
use crate::deploy::DeploySequencer;
use crate::storage::{FsObjectStore, StoredObject};

use super::middleware::log_responses;
use super::webhook::receive_webhook;
use super::{ErrorReport, failure_response, redirect_found, redirect_permanent};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<CacheCoordinator>,
    pub policy: Arc<UrlPolicy>,
    pub objects: Arc<FsObjectStore>,
    pub sequencer: Arc<DeploySequencer>,
    pub webhook_secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_health", get(health))
        .route("/_deploy", get(deploy_status))
        .route("/_webhook", post(receive_webhook))
        .route("/_webhook/", post(receive_webhook))
        .route("/o/{*key}", get(serve_object))
        .route("/{*url}", get(resolve))
        .layer(middleware::from_fn(log_responses))
        .with_state(state)
}

#[derive(Serialize)]
struct IndexBody {
    count: usize,
    objects: Vec<StoredObject>,
}

/// Machine-readable listing of everything currently cached.
async fn index(State(state): State<AppState>) -> Json<IndexBody> {
    let objects = state.coordinator.snapshot();
    Json(IndexBody {
        count: objects.len(),
        objects,
    })
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn deploy_status(State(state): State<AppState>) -> Response {
    Json(state.sequencer.status()).into_response()
}

/// Serve stored bytes directly. This is the target of the redirects the
/// resolver hands out, reachable under the configured public base URL.
async fn serve_object(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.objects.read(&key).await {
        Ok((bytes, content_type)) => {
            let content_type = content_type
                .or_else(|| {
                    mime_guess::from_path(&key)
                        .first_raw()
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            (
                [
                    (CONTENT_TYPE, content_type),
                    (CONTENT_LENGTH, bytes.len().to_string()),
                ],
                bytes,
            )
                .into_response()
        }
        Err(err) => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_error("infra::http::serve_object", StatusCode::NOT_FOUND, &err)
                .attach(&mut response);
            response
        }
    }
}

/// The redirector: turn the request path into an origin URL, consult the
/// policy, and answer with a redirect to wherever the bytes live.
async fn resolve(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let resource = match normalize(&raw) {
        Ok(resource) => resource,
        Err(err) => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_error("infra::http::resolve", StatusCode::NOT_FOUND, &err)
                .attach(&mut response);
            return response;
        }
    };

    match state.policy.decide(resource.url.as_str()) {
        PolicyDecision::Deny => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_message(
                "infra::http::resolve",
                StatusCode::NOT_FOUND,
                format!("denied by policy: {}", resource.url),
            )
            .attach(&mut response);
            response
        }
        PolicyDecision::PassThrough => {
            debug!(url = %resource.url, "Passing request through to the origin");
            redirect_permanent(&resource.url)
        }
        PolicyDecision::Cache => match state.coordinator.resolve(&resource).await {
            Outcome::Hit(object) | Outcome::Miss(object) => redirect_found(&object.location),
            Outcome::Failure(failure) => {
                failure_response("infra::http::resolve", &failure, &resource.url)
            }
        },
    }
}
