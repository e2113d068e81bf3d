//! Pooled HTTP client for forwarding requests to the backend
//!
//! Bodies are passed through as streams in both directions; nothing is
//! buffered beyond what hyper itself holds.

use crate::config::BackendOrigin;
use crate::error::ForwardError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests handed to the backend
    pub total_requests: AtomicU64,
    /// Requests that failed before a backend response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// A pooled HTTP/1.1 client bound to one backend origin
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    backend: BackendOrigin,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(backend: BackendOrigin) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(backend = %backend, "Backend client initialized");

        Self {
            client,
            backend,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn backend(&self) -> &BackendOrigin {
        &self.backend
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to the backend, rewriting its target and Host header.
    ///
    /// Method, remaining headers, query string and body are preserved.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = self
            .backend
            .target_uri(req.uri().path(), req.uri().query());

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        remove_hop_by_hop_headers(&mut headers);

        let host = HeaderValue::from_str(&self.backend.authority())
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;
        headers.insert(HOST, host);

        let mut backend_req = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = headers;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_remove_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        remove_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let backend = BackendOrigin::parse("127.0.0.1:5000").unwrap();
        let pool = ConnectionPool::new(backend.clone());
        assert_eq!(pool.backend(), &backend);
        assert_eq!(pool.stats().get_total_requests(), 0);
    }
}
