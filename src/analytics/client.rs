//! Client for the analytics collector RPC service.
//!
//! Connection establishment performs the two-step handshake: Hello
//! fetches a login challenge, Login answers it with a SHA-256 over
//! `challenge | client_key` and yields an access token that is
//! attached as request metadata to every push.
//!
//! Pushes ride a reconnect loop: deadline and availability errors
//! back off exponentially (doubling, capped) and re-run the
//! handshake; anything else surfaces immediately.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, info};

use super::api::analytics_server_client::AnalyticsServerClient;
use super::api::{AnalyticsMetrics, ReqHello, ReqLogin};

/// Revision of the client protocol:
/// v1 - first public release
/// v2 - support for multiple antennas
pub const CLIENT_VERSION: i32 = 2;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Configuration for [`AnalyticsClient`].
#[derive(Debug, Clone, Default)]
pub struct AnalyticsClientConfig {
    /// API client id, hex-encoded
    pub client_id: String,
    /// API client key, hex-encoded
    pub client_key: String,
    /// Collector endpoint, host:port
    pub endpoint: String,
    /// CA certificate overriding the system roots
    pub ca_file: Option<String>,
    /// Connect timeout in seconds (0 = default)
    pub connect_timeout: u64,
    /// Per-request timeout in seconds (0 = none)
    pub request_timeout: u64,
    /// Cap for the reconnect back-off in seconds (0 = default)
    pub max_reconnect_backoff: u64,
    /// Re-run the handshake on retryable push errors
    pub auto_reconnect: bool,
    /// Tells the collector the data is forwarded from the server side
    pub server_side: bool,
}

struct Session {
    rpc: AnalyticsServerClient<Channel>,
    token: AsciiMetadataValue,
}

/// A connection to the analytics collector.
pub struct AnalyticsClient {
    config: AnalyticsClientConfig,
    session: Mutex<Option<Session>>,
}

/// Where batches of converted records are delivered.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn push_metrics(&self, metrics: AnalyticsMetrics) -> Result<()>;
}

impl AnalyticsClient {
    pub fn new(config: AnalyticsClientConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn connect_timeout(&self) -> Duration {
        if self.config.connect_timeout == 0 {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            Duration::from_secs(self.config.connect_timeout)
        }
    }

    fn max_backoff(&self) -> Duration {
        if self.config.max_reconnect_backoff == 0 {
            DEFAULT_MAX_RECONNECT_BACKOFF
        } else {
            Duration::from_secs(self.config.max_reconnect_backoff)
        }
    }

    /// Establish the channel and run the Hello/Login handshake.
    pub async fn connect(&self) -> Result<()> {
        let session = self.establish().await?;
        *self.session.lock().await = Some(session);
        Ok(())
    }

    /// Drop the current channel. Safe to call when not connected.
    pub async fn disconnect(&self) {
        *self.session.lock().await = None;
    }

    async fn establish(&self) -> Result<Session> {
        let client_id = hex::decode(&self.config.client_id).context("invalid client id")?;
        let client_key = hex::decode(&self.config.client_key).context("invalid client key")?;

        let mut endpoint = Endpoint::from_shared(format!("https://{}", self.config.endpoint))
            .context("invalid analytics endpoint")?
            .connect_timeout(self.connect_timeout());

        if let Some(ca_file) = &self.config.ca_file {
            let pem = std::fs::read(ca_file)
                .with_context(|| format!("could not read CA certificate {}", ca_file))?;
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))
                .context("invalid TLS configuration")?;
        }

        let channel = endpoint
            .connect()
            .await
            .context("could not connect to analytics server")?;
        let mut rpc = AnalyticsServerClient::new(channel);

        let hello = rpc
            .hello(Request::new(ReqHello {
                version: CLIENT_VERSION,
            }))
            .await
            .context("could not handshake with server")?
            .into_inner();
        debug!(
            "Server revision {}, challenge of {} bytes",
            hello.revision,
            hello.challenge.len()
        );

        let mut material = hello.challenge;
        material.push(b'|');
        material.extend_from_slice(&client_key);

        let login = rpc
            .login(Request::new(ReqLogin {
                client_id,
                hash: Sha256::digest(&material).to_vec(),
                server_side: self.config.server_side,
            }))
            .await
            .context("could not login")?
            .into_inner();

        let token: AsciiMetadataValue = login
            .access_token
            .parse()
            .context("server returned an unusable access token")?;

        info!("Logged in to analytics endpoint {}", self.config.endpoint);
        Ok(Session { rpc, token })
    }

    async fn try_push(&self, metrics: &AnalyticsMetrics) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.establish().await?);
        }
        let session = session.as_mut().context("client is not connected")?;

        let mut req = Request::new(metrics.clone());
        if self.config.request_timeout != 0 {
            req.set_timeout(Duration::from_secs(self.config.request_timeout));
        }
        req.metadata_mut().insert("token", session.token.clone());

        session.rpc.push_metrics(req).await?;
        Ok(())
    }

    /// Push one batch, reconnecting with exponential back-off on
    /// deadline or availability errors.
    pub async fn push_metrics(&self, metrics: AnalyticsMetrics) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.try_push(&metrics).await {
                Ok(()) => return Ok(()),
                Err(err) if self.config.auto_reconnect && is_retryable(&err) => {
                    debug!("Retryable push error, backing off {:?}: {err:#}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff());
                    self.disconnect().await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Status>()
        .map(|status| matches!(status.code(), Code::DeadlineExceeded | Code::Unavailable))
        .unwrap_or(false)
}

#[async_trait]
impl MetricsSink for AnalyticsClient {
    async fn connect(&self) -> Result<()> {
        AnalyticsClient::connect(self).await
    }

    async fn push_metrics(&self, metrics: AnalyticsMetrics) -> Result<()> {
        AnalyticsClient::push_metrics(self, metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(is_retryable(&Status::deadline_exceeded("slow").into()));
        assert!(is_retryable(&Status::unavailable("down").into()));
        assert!(!is_retryable(&Status::permission_denied("no").into()));
        assert!(!is_retryable(&anyhow::anyhow!("plain error")));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = AnalyticsClient::new(AnalyticsClientConfig::default());
        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_rejects_malformed_credentials() {
        let client = AnalyticsClient::new(AnalyticsClientConfig {
            client_id: "not-hex".to_string(),
            client_key: "aabb".to_string(),
            endpoint: "127.0.0.1:1".to_string(),
            ..Default::default()
        });
        assert!(client.connect().await.is_err());
    }
}
