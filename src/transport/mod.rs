//! Single-attempt HTTP execution.
//!
//! A [`Transport`] performs exactly one request through a given proxy
//! endpoint, or direct when none is supplied. Statuses below 500 come back as
//! responses; classification is left to the dispatcher. Streaming requests
//! receive 2xx bodies as a chunk stream, everything else buffered.

mod reqwest_transport;

pub use reqwest_transport::{ReqwestTransport, TransportConfig};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Inputs for one attempt.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: HeaderMap,
    /// Canonical `protocol://[user:pass@]host:port` endpoint, `None` for direct.
    pub proxy: Option<String>,
    /// Hand a successful body back as a stream instead of buffering it.
    pub stream: bool,
}

impl TransportRequest {
    pub fn new(url: Url, headers: HeaderMap) -> Self {
        Self {
            url,
            headers,
            proxy: None,
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_proxy(mut self, endpoint: impl Into<String>) -> Self {
        self.proxy = Some(endpoint.into());
        self
    }

    /// Same request without a proxy.
    pub fn direct(&self) -> Self {
        Self {
            url: self.url.clone(),
            headers: self.headers.clone(),
            proxy: None,
            stream: self.stream,
        }
    }
}

/// Chunked response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(BodyStream),
}

impl ResponseBody {
    /// The buffered payload, `None` for streams.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Buffered(bytes) => Some(bytes),
            ResponseBody::Streaming(_) => None,
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Buffered(bytes)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Final URL after redirects.
    pub url: Url,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned server error {status}")]
    Server { status: u16 },
    #[error("invalid proxy endpoint: {0}")]
    InvalidProxy(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Connection resets, timeouts, DNS and proxy handshake failures.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_) | TransportError::Timeout(_) | TransportError::InvalidProxy(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Server { status } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_level_classification() {
        assert!(TransportError::Connect("reset".into()).is_connection_level());
        assert!(TransportError::Timeout(Duration::from_secs(15)).is_connection_level());
        assert!(!TransportError::Server { status: 502 }.is_connection_level());
        assert!(!TransportError::Request("decode".into()).is_connection_level());
        assert_eq!(TransportError::Server { status: 503 }.status(), Some(503));
    }

    #[test]
    fn direct_copy_drops_proxy() {
        let url = Url::parse("https://upstream.test/").unwrap();
        let request = TransportRequest::new(url, HeaderMap::new()).with_proxy("http://10.0.0.1:8080");
        assert!(request.direct().proxy.is_none());
        assert_eq!(request.proxy.as_deref(), Some("http://10.0.0.1:8080"));
    }

    #[test]
    fn direct_copy_keeps_streaming_flag() {
        let url = Url::parse("https://upstream.test/image.jpg").unwrap();
        let request = TransportRequest::new(url, HeaderMap::new())
            .with_proxy("http://10.0.0.1:8080")
            .streaming();
        assert!(request.direct().stream);
        assert!(!TransportRequest::new(request.url.clone(), HeaderMap::new()).stream);
    }
}
