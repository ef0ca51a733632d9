//! HTTP transport, record sinks and run-output persistence for JTT.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod run_output;
mod sink;

pub use run_output::{target_file_stem, write_json_atomic, RunOutputStore};
pub use sink::{AirtableConfig, AirtableSink, MemorySink, RecordSink, SinkEntry, SinkError};

pub const CRATE_NAME: &str = "jtt-storage";

/// What a desktop browser sends; the portal has been seen to reject bare clients.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:75.0) Gecko/20100101 Firefox/75.0";

/// Extra per-request headers, e.g. `Referer` or `Authorization`.
pub type ExtraHeaders<'a> = &'a [(&'static str, String)];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Keep cookies between requests made through one client.
    pub cookie_store: bool,
    /// Send `X-Requested-With: XMLHttpRequest` like the portal's own web client.
    pub xhr_headers: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            cookie_store: true,
            xhr_headers: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// JSON-over-HTTP client. One instance per portal session, so cookies never leak
/// between targets.
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: reqwest::Client,
}

impl JsonClient {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        if config.xhr_headers {
            headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(config.cookie_store)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: ExtraHeaders<'_>,
    ) -> Result<T, TransportError> {
        self.request_json::<(), T>(Method::GET, url, headers, None).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        headers: ExtraHeaders<'_>,
        body: &B,
    ) -> Result<T, TransportError> {
        self.request_json(Method::POST, url, headers, Some(body)).await
    }

    pub async fn patch_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        headers: ExtraHeaders<'_>,
        body: &B,
    ) -> Result<T, TransportError> {
        self.request_json(Method::PATCH, url, headers, Some(body)).await
    }

    /// Plain GET whose body is discarded; used to pick up session cookies.
    pub async fn touch(&self, url: &str, headers: ExtraHeaders<'_>) -> Result<(), TransportError> {
        self.send(Method::GET, url, headers, None::<&()>).await.map(|_| ())
    }

    /// Any non-200 status is an error; the body must decode as `T`.
    pub async fn request_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        headers: ExtraHeaders<'_>,
        body: Option<&B>,
    ) -> Result<T, TransportError> {
        let bytes = self.send(method, url, headers, body).await?;
        serde_json::from_slice(&bytes).map_err(|source| TransportError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        headers: ExtraHeaders<'_>,
        body: Option<&B>,
    ) -> Result<Vec<u8>, TransportError> {
        let span = info_span!("http_request", %method, url);
        async move {
            let mut request = self.client.request(method, url);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let request_err = |source| TransportError::Request {
                url: url.to_string(),
                source,
            };
            let resp = request.send().await.map_err(request_err)?;
            let status = resp.status();
            if status != StatusCode::OK {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let bytes = resp.bytes().await.map_err(request_err)?;
            debug!(bytes = bytes.len(), "response received");
            Ok(bytes.to_vec())
        }
        .instrument(span)
        .await
    }
}

/// Joins path segments onto a base URL without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Appends query parameters, percent-encoding the values.
pub fn with_query(url: &str, params: &[(&str, &str)]) -> Result<String, TransportError> {
    reqwest::Url::parse_with_params(url, params)
        .map(String::from)
        .map_err(|err| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })
}
