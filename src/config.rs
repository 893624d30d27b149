use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::analytics::{AnalyticsClientConfig, ForwarderSettings};
use crate::proxy::{DownlinkAddrs, UdpProxyConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub analytics: AnalyticsConfig,
    pub forwarder: ForwarderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Where the packet forwarder connects
    pub listen_host: String,
    pub listen_port_up: u16,
    /// Same port as up means single-port mode
    pub listen_port_down: u16,
    /// The upstream LoRa server
    pub connect_host: String,
    pub connect_port_up: u16,
    pub connect_port_down: u16,
    /// Interface to bind for outbound sockets
    pub connect_interface: String,
    /// Per-datagram read buffer
    pub buffer_size: usize,
    /// Distinct UDP streams to maintain per direction; 0 picks the
    /// mode default (2 at the edge, 256 server-side)
    pub max_udp_streams: usize,
    /// Seconds before re-binding severed local sockets
    pub connect_retry_interval: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port_up: 1800,
            listen_port_down: 1801,
            connect_host: String::new(),
            connect_port_up: 1700,
            connect_port_down: 1700,
            connect_interface: "0.0.0.0".to_string(),
            buffer_size: 1500,
            max_udp_streams: 0,
            connect_retry_interval: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Client id for the analytics collector, hex-encoded
    pub client_id: String,
    /// Private client key, hex-encoded
    pub client_key: String,
    /// Collector endpoint, host:port
    pub endpoint: String,
    /// CA certificate overriding the system roots
    pub ca_file: Option<String>,
    /// Seconds to wait for the collector connection (0 = default)
    pub connect_timeout: u64,
    /// Seconds to wait for a push (0 = none)
    pub request_timeout: u64,
    /// Cap for the reconnect back-off in seconds (0 = default)
    pub max_backoff: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Seconds between metric flushes; 0 picks the mode default
    /// (10 at the edge, 5 server-side)
    pub flush_interval: u64,
    /// The gateway this relay forwards for (edge mode)
    pub gateway_id: String,
    /// Stat records carry gauge values
    pub gauge_stat: bool,
    /// The relay runs in front of a server terminating many gateways
    pub server_side: bool,
    /// Capture file receiving all relayed traffic
    pub debug_dump: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn resolve(name: &str, host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("invalid {} endpoint: {}:{}", name, host, port))?
        .next()
        .with_context(|| format!("unresolvable {} endpoint: {}:{}", name, host, port))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Config =
            toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Check the required options and fill in the mode-dependent
    /// defaults. Errors here are fatal at startup.
    pub fn validate(&mut self) -> Result<()> {
        if self.proxy.connect_host.is_empty() {
            bail!("you must specify a LoRa server to connect to (proxy.connect_host)");
        }
        if self.analytics.client_id.is_empty() {
            bail!("you must specify an analytics client id (analytics.client_id)");
        }
        if self.analytics.client_key.is_empty() {
            bail!("you must specify an analytics client key (analytics.client_key)");
        }
        if self.analytics.endpoint.is_empty() {
            bail!("you must specify an analytics endpoint (analytics.endpoint)");
        }
        if self.forwarder.gateway_id.is_empty() && !self.forwarder.server_side {
            bail!("you must specify a gateway id (forwarder.gateway_id) at the edge");
        }

        if self.proxy.max_udp_streams == 0 {
            self.proxy.max_udp_streams = if self.forwarder.server_side {
                // A server-side relay accepts streams from many gateways
                256
            } else {
                // Low-resource edge environments keep few streams
                2
            };
        }

        if self.forwarder.flush_interval == 0 {
            self.forwarder.flush_interval = if self.forwarder.server_side { 5 } else { 10 };
        }

        Ok(())
    }

    pub fn proxy_config(&self) -> Result<UdpProxyConfig> {
        let up_listen_addr = resolve(
            "local uplink",
            &self.proxy.listen_host,
            self.proxy.listen_port_up,
        )?;
        let up_connect_addr = resolve(
            "remote uplink",
            &self.proxy.connect_host,
            self.proxy.connect_port_up,
        )?;
        let bind_addr = resolve("remote bind", &self.proxy.connect_interface, 0)?;

        let dn = if self.proxy.listen_port_down != self.proxy.listen_port_up {
            Some(DownlinkAddrs {
                listen_addr: resolve(
                    "local downlink",
                    &self.proxy.listen_host,
                    self.proxy.listen_port_down,
                )?,
                connect_addr: resolve(
                    "remote downlink",
                    &self.proxy.connect_host,
                    self.proxy.connect_port_down,
                )?,
                bind_addr: Some(bind_addr),
            })
        } else {
            None
        };

        let dump_file = self.forwarder.debug_dump.as_deref().and_then(|path| {
            match std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
            {
                Ok(file) => {
                    info!("Writing all traffic to {}", path);
                    Some(file)
                }
                Err(err) => {
                    warn!("Could not open {}: {}", path, err);
                    None
                }
            }
        });

        Ok(UdpProxyConfig {
            up_listen_addr,
            up_connect_addr,
            up_connect_bind_addr: Some(bind_addr),
            dn,
            buffer_size: self.proxy.buffer_size,
            socket_streams: self.proxy.max_udp_streams,
            reconnect_interval: Duration::from_secs(self.proxy.connect_retry_interval.max(1)),
            dump_file,
        })
    }

    pub fn client_config(&self) -> AnalyticsClientConfig {
        AnalyticsClientConfig {
            client_id: self.analytics.client_id.clone(),
            client_key: self.analytics.client_key.clone(),
            endpoint: self.analytics.endpoint.clone(),
            ca_file: self.analytics.ca_file.clone(),
            connect_timeout: self.analytics.connect_timeout,
            request_timeout: self.analytics.request_timeout,
            max_reconnect_backoff: self.analytics.max_backoff,
            auto_reconnect: true,
            server_side: self.forwarder.server_side,
        }
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            max_udp_streams: self.proxy.max_udp_streams,
            flush_interval: self.forwarder.flush_interval,
            gateway_id: self.forwarder.gateway_id.clone(),
            gauge_stat: self.forwarder.gauge_stat,
            server_side: self.forwarder.server_side,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.proxy.connect_host = "lora.example.org".to_string();
        config.analytics.client_id = "aabb".to_string();
        config.analytics.client_key = "ccdd".to_string();
        config.analytics.endpoint = "analytics.example.org:50051".to_string();
        config.forwarder.gateway_id = "gw-1".to_string();
        config
    }

    #[test]
    fn parses_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            connect_host = "server.example.org"
            listen_port_up = 1700
            listen_port_down = 1700

            [analytics]
            client_id = "aabb"
            client_key = "ccdd"
            endpoint = "collector:50051"

            [forwarder]
            server_side = true

            [logging]
            level = "debug"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.proxy.connect_host, "server.example.org");
        assert_eq!(config.proxy.listen_port_up, 1700);
        assert_eq!(config.proxy.buffer_size, 1500);
        assert!(config.forwarder.server_side);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn edge_mode_defaults() {
        let mut config = minimal_config();
        config.validate().expect("valid config");
        assert_eq!(config.proxy.max_udp_streams, 2);
        assert_eq!(config.forwarder.flush_interval, 10);
    }

    #[test]
    fn server_side_defaults() {
        let mut config = minimal_config();
        config.forwarder.server_side = true;
        config.forwarder.gateway_id = String::new();
        config.validate().expect("valid config");
        assert_eq!(config.proxy.max_udp_streams, 256);
        assert_eq!(config.forwarder.flush_interval, 5);
    }

    #[test]
    fn missing_required_options_are_fatal() {
        let mut config = minimal_config();
        config.proxy.connect_host = String::new();
        assert!(config.validate().is_err());

        let mut config = minimal_config();
        config.analytics.client_id = String::new();
        assert!(config.validate().is_err());

        let mut config = minimal_config();
        config.forwarder.gateway_id = String::new();
        assert!(config.validate().is_err());

        // A server-side relay does not need a configured gateway id
        let mut config = minimal_config();
        config.forwarder.gateway_id = String::new();
        config.forwarder.server_side = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn same_port_selects_single_port_mode() {
        let mut config = minimal_config();
        config.proxy.connect_host = "127.0.0.1".to_string();
        config.proxy.listen_port_down = config.proxy.listen_port_up;
        config.validate().expect("valid config");

        let proxy_config = config.proxy_config().expect("valid proxy config");
        assert!(proxy_config.dn.is_none());

        config.proxy.listen_port_down = config.proxy.listen_port_up + 1;
        let proxy_config = config.proxy_config().expect("valid proxy config");
        assert!(proxy_config.dn.is_some());
    }
}
