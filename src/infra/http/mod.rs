//! HTTP surface: redirector, object serving, webhook, index and health.

mod middleware;
mod public;
mod webhook;

pub use public::{AppState, build_router};

use std::error::Error as StdError;

use axum::http::{StatusCode, header::LOCATION};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::cache::{FailureKind, FetchFailure};

/// Diagnostic attached to error responses so the logging middleware can
/// report the full error chain without leaking it to clients.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// `302 Found`: the canonical "go fetch it over there" answer for both
/// fresh fills and hits.
fn redirect_found(location: &Url) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

/// `301 Moved Permanently`: pass-through resources the service will never
/// cache, so clients may remember the answer.
fn redirect_permanent(location: &Url) -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(LOCATION, location.to_string())],
    )
        .into_response()
}

/// Map a fill failure to the client-facing response. Not-cacheable bodies
/// still exist at the origin, so the client is sent there instead of
/// getting an error.
fn failure_response(source: &'static str, failure: &FetchFailure, origin: &Url) -> Response {
    let status = match failure.kind {
        FailureKind::NotCacheable => return redirect_found(origin),
        FailureKind::OriginUnavailable => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::OriginRejected | FailureKind::StorageWrite => StatusCode::BAD_GATEWAY,
    };
    let mut response = (status, "upstream retrieval failed").into_response();
    ErrorReport::from_message(source, status, failure.message.clone()).attach(&mut response);
    response
}
