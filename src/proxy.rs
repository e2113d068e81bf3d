//! Request handling and the listening server
//!
//! Every proxied request walks the same path: resolve the wake hostname,
//! send the magic packet, then forward to the backend. `/health` bypasses it.

use crate::config::ProxyConfig;
use crate::error::{text_error_response, ProxyErrorCode, ServerError};
use crate::pool::{remove_hop_by_hop_headers, ConnectionPool, PoolStats};
use crate::resolver::{resolve_with_timeout, Resolve, SystemResolver};
use crate::wol;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Liveness endpoint for the proxy process itself
pub const HEALTH_PATH: &str = "/health";
const HEALTH_BODY: &str = "ok";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head accepted from the backend
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Per-request pipeline: resolve the wake host, send the magic packet, forward.
///
/// Holds only read-only state, so one instance is shared by every connection.
#[derive(Clone)]
pub struct WakeProxy {
    config: Arc<ProxyConfig>,
    resolver: Arc<dyn Resolve>,
    pool: Arc<ConnectionPool>,
}

impl WakeProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: ProxyConfig, resolver: Arc<dyn Resolve>) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.backend.clone()));
        Self {
            config: Arc::new(config),
            resolver,
            pool,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forwarding statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    /// Route a request: the health path is answered locally, everything else
    /// goes through the wake-then-forward pipeline.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<ProxyResponse, hyper::Error> {
        if is_health_request(&req) {
            return Ok(health_response());
        }
        Ok(self.proxy_request(req, client_addr).await)
    }

    async fn proxy_request(&self, mut req: Request<Incoming>, client_addr: SocketAddr) -> ProxyResponse {
        let config = &self.config;

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let hostname = config.wol_hostname.as_str();
        let ip = match resolve_with_timeout(self.resolver.as_ref(), hostname, config.resolve_timeout).await {
            Ok(ip) => ip,
            Err(e) => {
                error!(hostname, request_id, error = %e, "Failed to resolve wake hostname");
                return text_error_response(
                    ProxyErrorCode::ResolutionFailed,
                    format!("could not get ip address: {}", e),
                );
            }
        };

        // Best effort: a failed wake never blocks forwarding
        let target = SocketAddr::new(ip, config.wol_port);
        match wol::wake(target, &config.wol_mac_address, config.wake_timeout).await {
            Ok(_) => {
                debug!(hostname, %ip, mac = %config.wol_mac_address, request_id, "Wake-on-lan packet sent");
            }
            Err(e) => {
                warn!(hostname, %ip, request_id, error = %e, "Could not send wake-on-lan packet");
            }
        }

        set_forwarding_headers(&mut req, &request_id, client_addr);

        if is_upgrade_request(&req) {
            return self.handle_upgrade(req, request_id).await;
        }

        let result = match config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.pool.send_request(req)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        backend = %config.backend,
                        request_id,
                        timeout_secs = timeout.as_secs(),
                        "Request timed out"
                    );
                    return text_error_response(
                        ProxyErrorCode::RequestTimeout,
                        format!("request timed out after {} seconds", timeout.as_secs()),
                    );
                }
            },
            None => self.pool.send_request(req).await,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(backend = %config.backend, request_id, error = %e, "Failed to forward request");
                text_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "failed to connect to backend",
                )
            }
        }
    }

    /// Tunnel a protocol upgrade (e.g. WebSocket) to the backend
    async fn handle_upgrade(&self, req: Request<Incoming>, request_id: String) -> ProxyResponse {
        let backend = &self.config.backend;
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(backend = %backend, request_id, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req, &self.config);

        let mut backend_stream = match TcpStream::connect(backend.socket_authority()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(backend = %backend, error = %e, "Failed to connect to backend for upgrade");
                return text_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "failed to connect to backend",
                );
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(backend = %backend, error = %e, "Failed to send upgrade request to backend");
            return text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "failed to send upgrade request to backend",
            );
        }

        let (head, leftover) = match read_response_head(&mut backend_stream).await {
            Ok(parts) => parts,
            Err(e) => {
                error!(backend = %backend, error = %e, "Failed to read upgrade response from backend");
                return text_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "invalid upgrade response from backend",
                );
            }
        };

        let (status, response_headers) = match parse_upgrade_response(&head) {
            Some(parsed) => parsed,
            None => {
                error!(backend = %backend, "Failed to parse backend upgrade response");
                return text_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "invalid upgrade response from backend",
                );
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(backend = %backend, status = %status, "Backend rejected upgrade request");
            // Only the bytes already read are relayed, so framing headers are dropped
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                let name_lower = name.to_lowercase();
                if name_lower == "content-length" || name_lower == "transfer-encoding" {
                    continue;
                }
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(Full::new(Bytes::from(leftover)).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| {
                    text_error_response(ProxyErrorCode::ConnectionFailed, "invalid upgrade response from backend")
                });
        }

        info!(backend = %backend, request_id, upgrade_type, "Upgrade successful");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }

        let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
            Ok(response) => response,
            Err(e) => {
                error!(backend = %backend, error = %e, "Invalid upgrade response headers");
                return text_error_response(ProxyErrorCode::InternalError, "invalid upgrade response");
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    debug!(request_id, "Client upgrade complete, starting forwarding");
                    forward_bidirectional(upgraded, backend_stream, leftover, &request_id).await;
                }
                Err(e) => {
                    error!(request_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

fn is_health_request(req: &Request<Incoming>) -> bool {
    req.uri().path() == HEALTH_PATH && (req.method() == Method::GET || req.method() == Method::HEAD)
}

fn health_response() -> ProxyResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(HEALTH_BODY.as_bytes())).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Set proxy headers. X-Forwarded-* values overwrite anything the client sent.
fn set_forwarding_headers(req: &mut Request<Incoming>, request_id: &str, client_addr: SocketAddr) {
    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP/1.1 upgrade request for the backend.
///
/// Connection and Upgrade survive here; other hop-by-hop headers are dropped
/// and Host is rewritten to the backend.
fn build_upgrade_request<B>(req: &Request<B>, config: &ProxyConfig) -> Vec<u8> {
    let path = config
        .backend
        .target_path_and_query(req.uri().path(), req.uri().query());
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    let upgrade = req.headers().get(hyper::header::UPGRADE).cloned();
    let mut headers = req.headers().clone();
    remove_hop_by_hop_headers(&mut headers);
    headers.remove(hyper::header::HOST);

    for (name, value) in &headers {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if let Some(upgrade) = upgrade.as_ref().and_then(|v| v.to_str().ok()) {
        request.push_str("Connection: Upgrade\r\n");
        request.push_str(&format!("Upgrade: {}\r\n", upgrade));
    }

    request.push_str(&format!("Host: {}\r\n", config.backend.authority()));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read until the end of the response head. Returns the head and any bytes
/// the backend already sent after it.
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            return Ok((buf, leftover));
        }

        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Parse the backend's response head: status and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, leftover: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Accepts connections and hands each one to the [`WakeProxy`]
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    proxy: WakeProxy,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the configured listen address
    pub async fn bind(proxy: WakeProxy, shutdown_rx: watch::Receiver<bool>) -> Result<Self, ServerError> {
        let address = proxy.config().address.clone();
        let bind_err = |source: std::io::Error| ServerError::Bind {
            addr: address.clone(),
            source,
        };

        let listener = TcpListener::bind(&address).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        Ok(Self {
            listener,
            local_addr,
            proxy,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown channel flips to `true`
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, backend = %self.proxy.config().backend, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let proxy = self.proxy.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, proxy).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, proxy: WakeProxy) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { proxy.handle(req, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyOptions;

    fn test_config() -> ProxyConfig {
        ProxyConfig::from_options(ProxyOptions {
            backend: Some("nas.lan:5000/app".to_string()),
            wol_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .uri("/ws")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));

        let req = Request::builder().uri("/").header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host_and_path() {
        let req = Request::builder()
            .method("GET")
            .uri("/ws?room=1")
            .header("Host", "proxy.lan:8080")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Keep-Alive", "timeout=5")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();

        let raw = String::from_utf8(build_upgrade_request(&req, &test_config())).unwrap();

        assert!(raw.starts_with("GET /app/ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: nas.lan:5000\r\n"));
        assert!(raw.contains("Connection: Upgrade\r\n"));
        assert!(raw.contains("Upgrade: websocket\r\n"));
        assert!(raw.contains("sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(!raw.contains("proxy.lan"));
        assert!(!raw.to_lowercase().contains("keep-alive"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_leftover() {
        let data: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi";
        let mut reader = data;
        let (head, leftover) = read_response_head(&mut reader).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(leftover, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let mut reader: &[u8] = b"HTTP/1.1 101";
        let err = read_response_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_bind_error_on_address_in_use() {
        let (_tx, rx) = watch::channel(false);
        let mut config = test_config();
        config.address = "127.0.0.1:0".to_string();
        let first = ProxyServer::bind(WakeProxy::new(config.clone()), rx.clone()).await.unwrap();

        config.address = first.local_addr().to_string();
        let err = ProxyServer::bind(WakeProxy::new(config), rx).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn test_health_response() {
        let response = health_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
