//! Outbound HTTP transport.
//!
//! Wraps a shared `reqwest::Client` behind a request-spec model: callers
//! describe a request as `(url, method, follow_redirects)` plus query and
//! header parameters and an optional body, then send it buffered or
//! streamed. Cancellation is cooperative through a
//! [`CancellationToken`]; a cancelled transfer resolves to
//! [`CloudError::aborted`].
//!
//! Non-2xx statuses are not errors at this layer: the response (with its
//! captured error body) is handed back so the provider adapter can apply its
//! own success and re-authorization policy.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use cirrus_core::{CloudError, CloudResult};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use reqwest::Method;

/// Request body variants.
pub enum RequestBody {
    Bytes(Bytes),
    /// Streamed body of chunked data, used by uploads so the whole file
    /// never sits in memory.
    Stream {
        stream: BoxStream<'static, std::io::Result<Bytes>>,
        /// Total length when known; populates `Content-Length`.
        length: Option<u64>,
    },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream { length, .. } => write!(f, "Stream(length={length:?})"),
        }
    }
}

/// Description of one outbound request.
#[derive(Debug)]
pub struct HttpRequestSpec {
    pub url: String,
    pub method: Method,
    pub follow_redirects: bool,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl HttpRequestSpec {
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            follow_redirects: true,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::GET)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url, Method::POST)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(url, Method::PUT)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(url, Method::DELETE)
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    pub fn body_json(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body_bytes(value.to_string())
    }

    pub fn body_stream(
        mut self,
        stream: BoxStream<'static, std::io::Result<Bytes>>,
        length: Option<u64>,
    ) -> Self {
        self.body = Some(RequestBody::Stream { stream, length });
        self
    }
}

/// A completed exchange: status, response headers (keys lowercased) and the
/// buffered body. For streamed downloads the body holds only the error text
/// of a failed exchange; successful payload bytes went to the chunk sink.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Converts a non-success response into the matching error record.
    pub fn to_error(&self) -> CloudError {
        CloudError::from_status(self.status, self.text())
    }
}

/// Shared outbound transport.
///
/// Holds two `reqwest` clients because redirect policy is a client-level
/// setting there, while requests carry it individually.
#[derive(Clone)]
pub struct Transport {
    following: reqwest::Client,
    plain: reqwest::Client,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let following = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let plain = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { following, plain }
    }

    fn builder(&self, spec: HttpRequestSpec) -> reqwest::RequestBuilder {
        let client = if spec.follow_redirects {
            &self.following
        } else {
            &self.plain
        };
        let mut builder = client.request(spec.method, &spec.url);
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        for (key, value) in &spec.headers {
            builder = builder.header(key, value);
        }
        match spec.body {
            Some(RequestBody::Bytes(bytes)) => builder = builder.body(bytes),
            Some(RequestBody::Stream { stream, length }) => {
                if let Some(len) = length {
                    builder = builder.header("Content-Length", len.to_string());
                }
                builder = builder.body(reqwest::Body::wrap_stream(stream));
            }
            None => {}
        }
        builder
    }

    /// Sends a request and buffers the whole response body.
    pub async fn send(
        &self,
        spec: HttpRequestSpec,
        cancel: &CancellationToken,
    ) -> CloudResult<HttpResponse> {
        let url = spec.url.clone();
        trace!(url, method = %spec.method, "dispatching request");
        let builder = self.builder(spec);
        let fut = async move {
            let response = builder
                .send()
                .await
                .map_err(|e| CloudError::failure(format!("transport: {e}")))?;
            let status = response.status().as_u16();
            let headers = header_map(response.headers());
            let body = response
                .bytes()
                .await
                .map_err(|e| CloudError::failure(format!("transport body: {e}")))?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url, "request aborted");
                Err(CloudError::aborted())
            }
            result = fut => result,
        }
    }

    /// Sends a request and streams the response body to `on_chunk`, which
    /// receives each chunk together with `(received_so_far, total)`.
    ///
    /// On a non-2xx status no chunk callback fires; the error body is
    /// buffered into the returned response instead.
    pub async fn send_streaming(
        &self,
        spec: HttpRequestSpec,
        cancel: &CancellationToken,
        mut on_chunk: impl FnMut(&[u8], u64, Option<u64>),
    ) -> CloudResult<HttpResponse> {
        let url = spec.url.clone();
        let builder = self.builder(spec);
        let fut = async move {
            let response = builder
                .send()
                .await
                .map_err(|e| CloudError::failure(format!("transport: {e}")))?;
            let status = response.status().as_u16();
            let headers = header_map(response.headers());
            if !(200..300).contains(&status) {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| CloudError::failure(format!("transport body: {e}")))?;
                return Ok(HttpResponse {
                    status,
                    headers,
                    body,
                });
            }
            let total = response.content_length();
            let mut received = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| CloudError::failure(format!("transport body: {e}")))?;
                received += chunk.len() as u64;
                on_chunk(&chunk, received, total);
            }
            Ok(HttpResponse {
                status,
                headers,
                body: Bytes::new(),
            })
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url, "streaming request aborted");
                Err(CloudError::aborted())
            }
            result = fut => result,
        }
    }
}

fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}
