use crate::error::ConfigError;
use crate::wol::{HardwareAddress, DEFAULT_WAKE_PORT};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Raw proxy options as read from a config file or the command line
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxyOptions {
    /// Address to listen on (default: 0.0.0.0:8080)
    #[serde(default = "default_address")]
    pub address: String,

    /// Backend host[:port]; `http://` is added when no scheme is given
    pub backend: Option<String>,

    /// Hostname to send the wake-on-lan packet to (default: backend host)
    pub wol_hostname: Option<String>,

    /// Hardware address of the backend's network interface
    pub wol_mac_address: Option<String>,

    /// UDP port for the magic packet (default: 9)
    #[serde(default = "default_wol_port")]
    pub wol_port: u16,

    /// Upper bound on resolving the wake hostname, in milliseconds (default: 2000)
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,

    /// Upper bound on sending the magic packet, in milliseconds (default: 2000)
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_ms: u64,

    /// Backend request timeout in seconds (default: none)
    pub request_timeout_secs: Option<u64>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            backend: None,
            wol_hostname: None,
            wol_mac_address: None,
            wol_port: default_wol_port(),
            resolve_timeout_ms: default_resolve_timeout(),
            wake_timeout_ms: default_wake_timeout(),
            request_timeout_secs: None,
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_wol_port() -> u16 {
    DEFAULT_WAKE_PORT
}

fn default_resolve_timeout() -> u64 {
    2000
}

fn default_wake_timeout() -> u64 {
    2000
}

impl ProxyOptions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: ProxyOptions = toml::from_str(&content)?;
        Ok(options)
    }
}

/// The backend every request is forwarded to. Always plain HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOrigin {
    url: Url,
}

impl BackendOrigin {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let raw = if has_scheme(value) {
            value.to_string()
        } else {
            format!("http://{}", value)
        };

        let url = Url::parse(&raw).map_err(|source| ConfigError::InvalidBackend {
            value: value.to_string(),
            source,
        })?;

        if url.scheme() != "http" {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(ConfigError::MissingHost(value.to_string())),
        }

        Ok(Self { url })
    }

    /// Host without IPv6 brackets, suitable for a DNS lookup
    pub fn hostname(&self) -> &str {
        self.host().trim_start_matches('[').trim_end_matches(']')
    }

    /// Host as it appears in a URL (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// `host[:port]`, used for the rewritten Host header
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }

    /// Address to open raw TCP connections to
    pub fn socket_authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn base_path(&self) -> &str {
        self.url.path()
    }

    /// Path and query for a request to `path`/`query` on this backend
    pub fn target_path_and_query(&self, path: &str, query: Option<&str>) -> String {
        let mut target = join_paths(self.base_path(), path);

        let query = match (self.url.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(req)) => Some(format!("{}&{}", base, req)),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(req)) => Some(req.to_string()),
            (None, None) => None,
        };
        if let Some(query) = query {
            target.push('?');
            target.push_str(&query);
        }

        target
    }

    /// Absolute URI for a request to `path`/`query` on this backend
    pub fn target_uri(&self, path: &str, query: Option<&str>) -> String {
        format!(
            "http://{}{}",
            self.authority(),
            self.target_path_and_query(path, query)
        )
    }
}

impl std::fmt::Display for BackendOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}", self.authority())
    }
}

/// True when `value` starts with `scheme://`
fn has_scheme(value: &str) -> bool {
    match value.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        None => false,
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Validated, immutable proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub address: String,
    pub backend: BackendOrigin,
    pub wol_hostname: String,
    pub wol_mac_address: HardwareAddress,
    pub wol_port: u16,
    pub resolve_timeout: Duration,
    pub wake_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn from_options(options: ProxyOptions) -> Result<Self, ConfigError> {
        let backend = options.backend.as_deref().ok_or(ConfigError::MissingBackend)?;
        let backend = BackendOrigin::parse(backend)?;

        let wol_hostname = match options.wol_hostname {
            Some(hostname) if !hostname.is_empty() => hostname,
            _ => backend.hostname().to_string(),
        };

        let wol_mac_address = options
            .wol_mac_address
            .as_deref()
            .ok_or(ConfigError::MissingMacAddress)?
            .parse()?;

        Ok(Self {
            address: options.address,
            backend,
            wol_hostname,
            wol_mac_address,
            wol_port: options.wol_port,
            resolve_timeout: Duration::from_millis(options.resolve_timeout_ms),
            wake_timeout: Duration::from_millis(options.wake_timeout_ms),
            request_timeout: options.request_timeout_secs.map(Duration::from_secs),
        })
    }
}
