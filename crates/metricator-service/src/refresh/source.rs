//! The remote system the dataset is fetched from.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::caching::CacheError;
use crate::config::SourceConfig;
use crate::utils::http::{SourceTimeouts, create_client};

/// Why a fetch attempt failed. Every variant is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Connection problems, non-2xx responses, or a body that is not JSON.
    #[error("fetch failed: {0}")]
    TransportFailure(String),
    /// The remote did not answer in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The payload was fetched, but could not be written to the cache.
    #[error(transparent)]
    Store(#[from] CacheError),
}

impl FetchError {
    /// A short, stable name used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::TransportFailure(_) => "transport",
            FetchError::Timeout(_) => "timeout",
            FetchError::Store(_) => "store",
        }
    }
}

/// Fetches the payload for a cache key from the remote system.
pub trait RemoteSource: Send + Sync + fmt::Debug {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

/// Reads the dataset from `GET {url}/api/data` with a bearer token.
///
/// There is a single dataset endpoint, so the cache key only shows up in logs.
#[derive(Debug)]
pub struct HttpSource {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(
        client: Client,
        base_url: &Url,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            endpoint: data_endpoint(base_url)?,
            token,
            timeout,
        })
    }

    /// Creates a source from the config, or `None` if no URL is configured.
    pub fn from_config(config: &SourceConfig) -> anyhow::Result<Option<Self>> {
        let Some(ref url) = config.url else {
            return Ok(None);
        };
        let client = create_client(&SourceTimeouts::from_config(config))?;
        let source = Self::new(client, url, config.token.clone(), config.timeout)?;
        Ok(Some(source))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn fetch_inner(&self, key: &str) -> Result<Bytes, FetchError> {
        tracing::debug!(key, "Fetching dataset from `{}`", self.endpoint);

        let mut request = self.client.get(self.endpoint.clone());
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::TransportFailure(describe_status(status)));
        }

        let body = response.bytes().await.map_err(|e| self.map_reqwest(e))?;
        serde_json::from_slice::<serde::de::IgnoredAny>(&body).map_err(|e| {
            FetchError::TransportFailure(format!("response is not valid JSON: {e}"))
        })?;

        metric!(histogram("refresh.fetch.size") = body.len() as u64);
        Ok(body)
    }

    fn map_reqwest(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout(self.timeout);
        }
        // the outermost reqwest message rarely says what went wrong
        let mut source: &dyn std::error::Error = &err;
        while let Some(inner) = source.source() {
            source = inner;
        }
        FetchError::TransportFailure(source.to_string())
    }
}

impl RemoteSource for HttpSource {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.fetch_inner(key))
                .await
                .map_err(|_| FetchError::Timeout(self.timeout))?
        })
    }
}

fn data_endpoint(base_url: &Url) -> Result<Url, url::ParseError> {
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("api/data")
}

fn describe_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("server responded with {} {reason}", status.as_u16()),
        None => format!("server responded with {}", status.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn source_for(server: &test::DataServer, token: Option<&str>, timeout: Duration) -> HttpSource {
        HttpSource::new(
            Client::new(),
            &server.url(),
            token.map(str::to_owned),
            timeout,
        )
        .unwrap()
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("http://localhost:8080/tableau").unwrap();
        assert_eq!(
            data_endpoint(&base).unwrap().as_str(),
            "http://localhost:8080/tableau/api/data"
        );
        let base = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            data_endpoint(&base).unwrap().as_str(),
            "http://localhost:8080/api/data"
        );
    }

    #[tokio::test]
    async fn fetches_with_bearer_token() {
        test::setup();
        let server = test::DataServer::new(r#"[{"value": 2}]"#).with_token("s3cret");

        let source = source_for(&server, Some("s3cret"), Duration::from_secs(5));
        let body = source.fetch("dataset").await.unwrap();
        assert_eq!(&body[..], br#"[{"value": 2}]"#);
        assert_eq!(server.hits(), 1);

        let source = source_for(&server, Some("wrong"), Duration::from_secs(5));
        assert!(matches!(
            source.fetch("dataset").await,
            Err(FetchError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        test::setup();
        let server = test::DataServer::new("[]");
        server.fail_next(1);

        let source = source_for(&server, None, Duration::from_secs(5));
        let err = source.fetch("dataset").await.unwrap_err();
        assert!(matches!(err, FetchError::TransportFailure(ref msg) if msg.contains("500")));

        assert!(source.fetch("dataset").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        test::setup();
        let server = test::DataServer::new("<html>maintenance</html>");

        let source = source_for(&server, None, Duration::from_secs(5));
        assert!(matches!(
            source.fetch("dataset").await,
            Err(FetchError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn slow_servers_time_out() {
        test::setup();
        let server = test::DataServer::new("[]");
        server.set_delay(Duration::from_secs(2));

        let source = source_for(&server, None, Duration::from_millis(100));
        assert_eq!(
            source.fetch("dataset").await,
            Err(FetchError::Timeout(Duration::from_millis(100)))
        );
    }
}
