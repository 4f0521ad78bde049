//! Origin fetcher: one bounded, retrying retrieval from an unreliable host.
//!
//! Transient failures (timeouts, transport errors, 5xx) are retried with
//! exponential backoff up to the configured attempt bound. A 4xx from the
//! origin is terminal and surfaced immediately; so is a body that exceeds
//! the size limit. The fetcher holds no cache state of its own.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use metrics::counter;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, ETAG};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::config::OriginSettings;

pub const METRIC_ORIGIN_RETRY_TOTAL: &str = "staffetta_origin_retry_total";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("origin unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("origin rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("resource exceeds the configured size limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Transient failures are worth another attempt; a 4xx or an oversized
    /// body will not improve on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Bytes retrieved from the origin plus the headers worth persisting.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

impl FetchedResource {
    /// Some hosts answer errors as a `200 OK` HTML page. We never cache
    /// HTML, so this marks the response as a disguised failure.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/html"))
    }
}

#[async_trait]
pub trait OriginFetch: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedResource, FetchError>;
}

/// reqwest-backed fetcher with connect/request timeouts and a streaming
/// size cap so a hostile origin cannot exhaust memory.
pub struct HttpOriginFetcher {
    client: Client,
    settings: OriginSettings,
}

impl HttpOriginFetcher {
    pub fn new(settings: OriginSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .user_agent(concat!("staffetta/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, settings })
    }

    async fn attempt(&self, url: &Url) -> Result<FetchedResource, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::unavailable("request timed out")
            } else {
                FetchError::unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Rejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::unavailable(format!("origin returned {status}")));
        }

        let content_type = header_value(&response, CONTENT_TYPE);
        let etag = header_value(&response, ETAG).map(|raw| raw.trim_matches('"').to_string());

        let limit = self.settings.max_object_bytes;
        if let Some(length) = response.content_length()
            && length > limit
        {
            return Err(FetchError::TooLarge { limit });
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                if err.is_timeout() {
                    FetchError::unavailable("response body timed out")
                } else {
                    FetchError::unavailable(err.to_string())
                }
            })?;
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedResource {
            bytes: body.freeze(),
            content_type,
            etag,
        })
    }
}

#[async_trait]
impl OriginFetch for HttpOriginFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedResource, FetchError> {
        let mut attempt = 1u32;
        loop {
            match self.attempt(url).await {
                Ok(resource) => return Ok(resource),
                Err(err) if err.is_transient() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Origin fetch failed, backing off"
                    );
                    counter!(METRIC_ORIGIN_RETRY_TOTAL).increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

    use super::*;

    fn settings(max_attempts: u32, max_object_bytes: u64) -> OriginSettings {
        OriginSettings {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_attempts,
            backoff_base: Duration::from_millis(5),
            max_object_bytes,
        }
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    fn origin_url(addr: SocketAddr, path: &str) -> Url {
        Url::parse(&format!("http://{addr}{path}")).expect("url")
    }

    async fn tarball(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        (
            [
                (CONTENT_TYPE, "application/gzip"),
                (ETAG, "\"etag-value\""),
            ],
            &b"compressed payload"[..],
        )
    }

    #[tokio::test]
    async fn success_returns_bytes_and_headers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = serve(
            Router::new()
                .route("/pkg.tar.gz", get(tarball))
                .with_state(hits.clone()),
        )
        .await;

        let fetcher = HttpOriginFetcher::new(settings(3, 1024)).expect("fetcher");
        let resource = fetcher
            .fetch(&origin_url(addr, "/pkg.tar.gz"))
            .await
            .expect("fetch");

        assert_eq!(&resource.bytes[..], b"compressed payload");
        assert_eq!(resource.content_type.as_deref(), Some("application/gzip"));
        assert_eq!(resource.etag.as_deref(), Some("etag-value"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_error_is_terminal_and_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let addr = serve(Router::new().route(
            "/missing",
            get(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }
            }),
        ))
        .await;

        let fetcher = HttpOriginFetcher::new(settings(3, 1024)).expect("fetcher");
        let err = fetcher
            .fetch(&origin_url(addr, "/missing"))
            .await
            .expect_err("should fail");

        assert!(matches!(err, FetchError::Rejected { status: 404 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let addr = serve(Router::new().route(
            "/flaky",
            get(move || {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::BAD_GATEWAY.into_response()
                    } else {
                        "finally".into_response()
                    }
                }
            }),
        ))
        .await;

        let fetcher = HttpOriginFetcher::new(settings(3, 1024)).expect("fetcher");
        let resource = fetcher
            .fetch(&origin_url(addr, "/flaky"))
            .await
            .expect("fetch");

        assert_eq!(&resource.bytes[..], b"finally");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_exhausted_after_the_bound() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let addr = serve(Router::new().route(
            "/down",
            get(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        ))
        .await;

        let fetcher = HttpOriginFetcher::new(settings(3, 1024)).expect("fetcher");
        let err = fetcher
            .fetch(&origin_url(addr, "/down"))
            .await
            .expect_err("should fail");

        assert!(matches!(err, FetchError::Unavailable { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let addr = serve(Router::new().route("/big", get(|| async { vec![0u8; 4096] }))).await;

        let fetcher = HttpOriginFetcher::new(settings(3, 1024)).expect("fetcher");
        let err = fetcher
            .fetch(&origin_url(addr, "/big"))
            .await
            .expect_err("should fail");

        assert!(matches!(err, FetchError::TooLarge { limit: 1024 }));
    }

    #[test]
    fn html_detection_covers_charset_suffixes() {
        let resource = FetchedResource {
            bytes: Bytes::new(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            etag: None,
        };
        assert!(resource.is_html());

        let resource = FetchedResource {
            bytes: Bytes::new(),
            content_type: Some("application/gzip".to_string()),
            etag: None,
        };
        assert!(!resource.is_html());
    }
}
