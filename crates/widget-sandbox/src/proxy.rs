//! Network proxy that performs `fetchData` requests with the host's network access.
//!
//! The proxy forwards exactly `method`, `headers` and `body`. It applies no
//! retries, no caching and no timeout of its own; the bridge's execution
//! ceiling bounds every request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::error::ProxyError;
use crate::ipc::{FetchOptions, FetchReply};
use crate::FetchDispatcher;

/// A [`FetchDispatcher`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        let method = match options.method.as_deref() {
            Some(m) if !m.is_empty() => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid HTTP method: {m}")))?,
            _ => Method::GET,
        };

        let url = reqwest::Url::parse(url)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid URL '{url}': {e}")))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = options.headers {
            request = request.headers(header_map(&headers)?);
        }
        if let Some(body) = options.body.filter(|b| !b.is_empty()) {
            request = request.body(body);
        }

        Ok(request)
    }
}

fn header_map(
    headers: &std::collections::BTreeMap<String, String>,
) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid value for header {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

#[async_trait::async_trait]
impl FetchDispatcher for HttpFetcher {
    #[tracing::instrument(target = "widget::sandbox::proxy", skip(self, options), fields(status = tracing::field::Empty))]
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchReply, ProxyError> {
        let request = self.build_request(url, options)?;

        let response = request.send().await.map_err(|e| {
            tracing::debug!(target: "widget::sandbox::proxy", error = %e, "fetch failed");
            ProxyError::Transport(e.to_string())
        })?;

        let status = response.status().as_u16();
        tracing::Span::current().record("status", status);

        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;

        Ok(FetchReply { body, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn invalid_url_is_rejected_before_sending() {
        let err = HttpFetcher::new()
            .fetch("not a url", FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert!(err.to_string().contains("invalid URL"), "{err}");
    }

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let options = FetchOptions {
            method: Some("NOT A METHOD".into()),
            ..Default::default()
        };
        let err = HttpFetcher::new()
            .fetch("https://example.com", options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid HTTP method"), "{err}");
    }

    #[test]
    fn method_is_uppercased() {
        let fetcher = HttpFetcher::new();
        let options = FetchOptions {
            method: Some("post".into()),
            ..Default::default()
        };
        let request = fetcher
            .build_request("https://example.com/x", options)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.method(), &Method::POST);
    }

    #[test]
    fn headers_and_body_are_forwarded() {
        let fetcher = HttpFetcher::new();
        let mut headers = BTreeMap::new();
        headers.insert("X-Api-Key".to_string(), "k".to_string());
        let options = FetchOptions {
            method: Some("PUT".into()),
            headers: Some(headers),
            body: Some("payload".into()),
        };
        let request = fetcher
            .build_request("https://example.com/x", options)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers()["x-api-key"], "k");
        assert_eq!(
            request.body().and_then(|b| b.as_bytes()),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn empty_body_is_not_sent() {
        let fetcher = HttpFetcher::new();
        let options = FetchOptions {
            body: Some(String::new()),
            ..Default::default()
        };
        let request = fetcher
            .build_request("https://example.com/x", options)
            .unwrap()
            .build()
            .unwrap();
        assert!(request.body().is_none());
    }

    #[test]
    fn bad_header_name_is_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        let err = header_map(&headers).unwrap_err();
        assert!(err.to_string().contains("invalid header name"), "{err}");
    }
}
