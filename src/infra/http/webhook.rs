//! Webhook receiver for push deliveries.
//!
//! The surface is disabled entirely (404) when no secret is configured;
//! an unverifiable delivery is rejected with 403 before the sequencer is
//! touched. Verification reads the raw body, so this handler takes
//! `Bytes`, not an extracted JSON payload.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::deploy::{SIGNATURE_HEADER, verify};

use super::ErrorReport;
use super::public::AppState;

#[derive(Serialize)]
struct WebhookAck {
    status: &'static str,
    disposition: &'static str,
}

pub(super) async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = verify(secret, &body, signature) {
        let mut response =
            (StatusCode::FORBIDDEN, "signature verification failed").into_response();
        ErrorReport::from_error("infra::http::webhook", StatusCode::FORBIDDEN, &err)
            .attach(&mut response);
        return response;
    }

    let outcome = state.sequencer.trigger();
    info!(disposition = outcome.as_str(), "Webhook delivery accepted");
    Json(WebhookAck {
        status: "accepted",
        disposition: outcome.as_str(),
    })
    .into_response()
}
