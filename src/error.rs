//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning options into a [`crate::config::ProxyConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backend is required")]
    MissingBackend,

    #[error("wake-on-lan mac address is required")]
    MissingMacAddress,

    #[error("invalid backend '{value}': {source}")]
    InvalidBackend {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported backend scheme '{0}' (only http is supported)")]
    UnsupportedScheme(String),

    #[error("backend '{0}' has no host")]
    MissingHost(String),

    #[error(transparent)]
    InvalidMacAddress(#[from] MacParseError),

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A hardware address string that is not six hex octets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mac address '{0}'")]
pub struct MacParseError(pub String);

/// Failure to turn the wake hostname into an IP address
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ip address for {0} not found")]
    NotFound(String),

    #[error("invalid ip address {0}")]
    InvalidAddress(String),

    #[error("lookup of {host} timed out after {timeout:?}")]
    TimedOut { host: String, timeout: Duration },
}

/// Failure to deliver the magic packet
#[derive(Debug, Error)]
pub enum WakeError {
    #[error("failed to open udp socket to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write magic packet to {addr}: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("short write to {addr}: {written} of {expected} bytes")]
    ShortWrite {
        addr: SocketAddr,
        written: usize,
        expected: usize,
    },

    #[error("sending magic packet to {addr} timed out after {timeout:?}")]
    TimedOut { addr: SocketAddr, timeout: Duration },
}

/// Fatal server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure forwarding a request to the backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Error codes reported in the `X-Proxy-Error` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// The wake hostname could not be resolved
    ResolutionFailed,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ResolutionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ResolutionFailed => "RESOLUTION_FAILED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Create a plain-text error response with an X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
