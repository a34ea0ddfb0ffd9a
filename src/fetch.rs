use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::EntityId;
use crate::error::MirrorError;

/// Response body of a remote entity request, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntityPayload {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(RawEntityPayload),
    NotFound,
}

/// Remote knowledge-base lookups.
///
/// Implementations bound every call with a timeout; unavailability is
/// reported as [`MirrorError::UpstreamUnavailable`].
pub trait EntityFetcher: Send + Sync {
    fn fetch(&self, id: &EntityId) -> Result<FetchOutcome, MirrorError>;
}

impl<T: EntityFetcher + ?Sized> EntityFetcher for Arc<T> {
    fn fetch(&self, id: &EntityId) -> Result<FetchOutcome, MirrorError> {
        (**self).fetch(id)
    }
}

#[derive(Clone)]
pub struct WikidataHttpClient {
    client: Client,
    api_url: String,
    max_retries: usize,
}

impl WikidataHttpClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("local-wikidata/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MirrorError::UpstreamUnavailable(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MirrorError::UpstreamUnavailable(err.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            max_retries: 3,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, MirrorError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, delay_ms = delay, "retrying entity fetch");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, attempt, delay_ms = delay, "retrying entity fetch");
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(MirrorError::UpstreamUnavailable(err.to_string()));
                }
            }
        }
    }
}

impl EntityFetcher for WikidataHttpClient {
    fn fetch(&self, id: &EntityId) -> Result<FetchOutcome, MirrorError> {
        let response = self.send_with_retries(|| {
            self.client.get(&self.api_url).query(&[
                ("action", "wbgetentities"),
                ("ids", id.as_str()),
                ("format", "json"),
                ("redirects", "yes"),
            ])
        })?;

        let status = response.status().as_u16();
        if status == 404 {
            return Ok(FetchOutcome::NotFound);
        }
        if is_retryable_status(status) {
            return Err(MirrorError::UpstreamUnavailable(format!(
                "status {status} for {id}"
            )));
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "Wikidata request failed".to_string());
            return Err(MirrorError::UpstreamStatus { status, message });
        }
        let bytes = response
            .bytes()
            .map_err(|err| MirrorError::UpstreamUnavailable(err.to_string()))?;
        Ok(FetchOutcome::Found(RawEntityPayload {
            bytes: bytes.to_vec(),
        }))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
