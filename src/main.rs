use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::{ProxyConfig, ProxyOptions};
use wakegate::proxy::{ProxyServer, WakeProxy};
use wakegate::{PKG_NAME, VERSION};

/// Reverse proxy that sends a wake-on-lan packet before forwarding each request
#[derive(Parser, Debug)]
#[command(name = "wakegate", version, about, long_about = None)]
struct Cli {
    /// Optional TOML file with proxy options; flags and env vars take precedence
    #[arg(short, long, env = "WOLPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:8080]
    #[arg(long, env = "WOLPROXY_ADDRESS")]
    address: Option<String>,

    /// Proxy backend (host[:port])
    #[arg(long, env = "WOLPROXY_BACKEND")]
    backend: Option<String>,

    /// Hostname to send wake-on-lan packet to [default: backend host]
    #[arg(long, env = "WOLPROXY_WOL_HOSTNAME")]
    wol_hostname: Option<String>,

    /// MAC address to send wake-on-lan packet to
    #[arg(long, env = "WOLPROXY_WOL_MAC_ADDRESS")]
    wol_mac_address: Option<String>,

    /// UDP port for the wake-on-lan packet [default: 9]
    #[arg(long, env = "WOLPROXY_WOL_PORT")]
    wol_port: Option<u16>,

    /// Upper bound on resolving the wake hostname, in milliseconds [default: 2000]
    #[arg(long, env = "WOLPROXY_RESOLVE_TIMEOUT_MS")]
    resolve_timeout_ms: Option<u64>,

    /// Upper bound on sending the wake-on-lan packet, in milliseconds [default: 2000]
    #[arg(long, env = "WOLPROXY_WAKE_TIMEOUT_MS")]
    wake_timeout_ms: Option<u64>,

    /// Backend request timeout in seconds [default: none]
    #[arg(long, env = "WOLPROXY_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,
}

impl Cli {
    fn apply(self, options: &mut ProxyOptions) {
        if let Some(address) = self.address {
            options.address = address;
        }
        if self.backend.is_some() {
            options.backend = self.backend;
        }
        if self.wol_hostname.is_some() {
            options.wol_hostname = self.wol_hostname;
        }
        if self.wol_mac_address.is_some() {
            options.wol_mac_address = self.wol_mac_address;
        }
        if let Some(port) = self.wol_port {
            options.wol_port = port;
        }
        if let Some(ms) = self.resolve_timeout_ms {
            options.resolve_timeout_ms = ms;
        }
        if let Some(ms) = self.wake_timeout_ms {
            options.wake_timeout_ms = ms;
        }
        if self.request_timeout_secs.is_some() {
            options.request_timeout_secs = self.request_timeout_secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    let mut cli = Cli::parse();

    let mut options = match cli.config.take() {
        Some(path) => {
            let options = ProxyOptions::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            options
        }
        None => ProxyOptions::default(),
    };
    cli.apply(&mut options);

    let config = ProxyConfig::from_options(options).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::bind(WakeProxy::new(config), shutdown_rx).await.map_err(|e| {
        error!(error = %e, "Failed to start proxy server");
        e
    })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &ProxyConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        address = %config.address,
        backend = %config.backend,
        "Server configuration"
    );
    info!(
        wol_hostname = %config.wol_hostname,
        wol_mac_address = %config.wol_mac_address,
        wol_port = config.wol_port,
        resolve_timeout_ms = config.resolve_timeout.as_millis() as u64,
        wake_timeout_ms = config.wake_timeout.as_millis() as u64,
        "Wake-on-lan settings"
    );
    if let Some(timeout) = config.request_timeout {
        info!(request_timeout_secs = timeout.as_secs(), "Backend request timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_options() {
        let cli = Cli::try_parse_from([
            "wakegate",
            "--backend",
            "nas.lan:8080",
            "--wol-mac-address",
            "aa:bb:cc:dd:ee:ff",
            "--resolve-timeout-ms",
            "250",
            "--wake-timeout-ms",
            "500",
            "--request-timeout-secs",
            "30",
        ])
        .unwrap();

        let mut options = ProxyOptions {
            wol_port: 4000,
            request_timeout_secs: Some(5),
            ..ProxyOptions::default()
        };
        cli.apply(&mut options);

        assert_eq!(options.backend.as_deref(), Some("nas.lan:8080"));
        assert_eq!(options.wol_mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(options.wol_port, 4000);
        assert_eq!(options.resolve_timeout_ms, 250);
        assert_eq!(options.wake_timeout_ms, 500);
        assert_eq!(options.request_timeout_secs, Some(30));

        let config = ProxyConfig::from_options(options).unwrap();
        assert_eq!(config.resolve_timeout, std::time::Duration::from_millis(250));
        assert_eq!(config.request_timeout, Some(std::time::Duration::from_secs(30)));
    }

    #[test]
    fn test_unset_timeout_flags_keep_defaults() {
        let cli = Cli::try_parse_from(["wakegate", "--wol-port", "7"]).unwrap();

        let mut options = ProxyOptions::default();
        cli.apply(&mut options);

        assert_eq!(options.wol_port, 7);
        assert_eq!(options.resolve_timeout_ms, 2000);
        assert_eq!(options.wake_timeout_ms, 2000);
        assert_eq!(options.request_timeout_secs, None);
    }
}
