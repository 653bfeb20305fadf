//! # HTTP Mapping Source
//!
//! Fetches a delimited mapping payload over HTTP(S). Change probes are `HEAD`
//! requests that read `ETag`, `Last-Modified` and `Content-Length` without
//! downloading the body.
//!
//! Uses the blocking client: mapping refreshes run on the synchronous engine
//! side, never on the async runtime's worker threads.

use kgforge_core::{DelimitedTransform, KgError, MappingError, MappingSource, RemoteMarker};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, LAST_MODIFIED};
use std::collections::BTreeMap;
use std::time::Duration;

/// Whole-request timeout for payload downloads.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection timeout, also bounding probes on unreachable hosts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpMappingSource {
    name: String,
    url: String,
    transform: DelimitedTransform,
    client: Client,
}

impl HttpMappingSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        transform: DelimitedTransform,
    ) -> Result<Self, KgError> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("kgforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KgError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            transform,
            client,
        })
    }

    fn fail(&self, reason: impl std::fmt::Display) -> MappingError {
        MappingError::Fetch {
            name: self.name.clone(),
            reason: format!("{}: {}", self.url, reason),
        }
    }

    fn check(&self, response: Response) -> Result<Response, MappingError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(self.fail(format!("HTTP {}", status)))
        }
    }
}

impl MappingSource for HttpMappingSource {
    fn fetch(&self) -> Result<Vec<u8>, MappingError> {
        tracing::info!(mapping = %self.name, url = %self.url, "downloading mapping");
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| self.fail(e))?;
        let bytes = self.check(response)?.bytes().map_err(|e| self.fail(e))?;
        Ok(bytes.to_vec())
    }

    fn probe(&self) -> Result<Option<RemoteMarker>, MappingError> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .map_err(|e| self.fail(e))?;
        let marker = marker_from_headers(self.check(response)?.headers());
        Ok((!marker.is_empty()).then_some(marker))
    }

    fn transform(&self, payload: &[u8]) -> Result<BTreeMap<String, String>, MappingError> {
        self.transform.apply(&self.name, payload)
    }
}

fn marker_from_headers(headers: &HeaderMap) -> RemoteMarker {
    let text = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    RemoteMarker {
        etag: text(ETAG),
        last_modified: text(LAST_MODIFIED),
        content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn markers_come_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1024"));
        let marker = marker_from_headers(&headers);
        assert_eq!(marker.etag.as_deref(), Some("\"abc\""));
        assert_eq!(marker.last_modified, None);
        assert_eq!(marker.content_length, Some(1024));
    }

    #[test]
    fn missing_headers_give_empty_marker() {
        assert!(marker_from_headers(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn unreachable_host_is_a_fetch_error() {
        let source = HttpMappingSource::new(
            "offline",
            "http://127.0.0.1:9/mapping.tsv",
            DelimitedTransform::default(),
        )
        .expect("client");
        assert!(matches!(source.fetch(), Err(MappingError::Fetch { .. })));
        assert!(matches!(source.probe(), Err(MappingError::Fetch { .. })));
    }
}
