use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Identifies one instance's capture stream.
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    /// Routable address of the instance, as resolved by the control-plane.
    pub host: String,
    pub app_id: String,
    pub index: u32,
    pub device: String,
    pub filter: String,
}

/// Raw capture-file bytes read from one agent.
pub type PacketStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Opens capture streams for resolved instances. The production
/// implementation dials agents over mutual TLS; tests inject fixtures.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// A single attempt, no retries. Success or failure is the
    /// orchestrator's to handle.
    async fn open(&self, target: &CaptureTarget) -> Result<PacketStream, AgentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("could not resolve a routable address for capture agent host {0}")]
    Lookup(String, #[source] std::io::Error),
    #[error("no routable address for capture agent host {0}")]
    NoAddress(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("expected status 200 from capture agent at {host} but got {status}")]
    Status {
        host: String,
        status: reqwest::StatusCode,
    },
}

/// TLS material and dialing parameters for capture agents.
pub struct AgentConfig {
    pub port: u16,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub ca_bundle: PathBuf,
    pub server_name: String,
    pub skip_verify: bool,
}

/// Mutual-TLS client of the per-instance capture agents. One set of
/// credentials is loaded at startup and shared by all capture tasks.
pub struct AgentClient {
    port: u16,
    server_name: String,
    skip_verify: bool,
    identity: reqwest::Identity,
    ca: reqwest::Certificate,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        let mut pem = std::fs::read(&config.client_cert).with_context(|| {
            format!(
                "reading agent client certificate from {}",
                config.client_cert.display()
            )
        })?;
        pem.extend(std::fs::read(&config.client_key).with_context(|| {
            format!(
                "reading agent client key from {}",
                config.client_key.display()
            )
        })?);
        let identity = reqwest::Identity::from_pem(&pem)
            .context("parsing agent client certificate and key")?;

        let ca_pem = std::fs::read(&config.ca_bundle)
            .with_context(|| format!("reading agent CA bundle from {}", config.ca_bundle.display()))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem).context("parsing agent CA bundle")?;

        Ok(Self {
            port: config.port,
            server_name: config.server_name.clone(),
            skip_verify: config.skip_verify,
            identity,
            ca,
        })
    }
}

#[async_trait]
impl CaptureSource for AgentClient {
    async fn open(&self, target: &CaptureTarget) -> Result<PacketStream, AgentError> {
        use tokio_util::compat::FuturesAsyncReadCompatExt;

        // Agents present certificates for the configured server name, not
        // for the resolved instance address. Dial the address while
        // requesting (and verifying) the configured name.
        let addr: SocketAddr = tokio::net::lookup_host((target.host.as_str(), self.port))
            .await
            .map_err(|err| AgentError::Lookup(target.host.clone(), err))?
            .next()
            .ok_or_else(|| AgentError::NoAddress(target.host.clone()))?;

        let client = reqwest::Client::builder()
            .identity(self.identity.clone())
            .add_root_certificate(self.ca.clone())
            .danger_accept_invalid_certs(self.skip_verify)
            .resolve(&self.server_name, addr)
            .build()?;

        let url = format!("https://{}:{}/capture", self.server_name, self.port);
        tracing::debug!(host = %target.host, index = target.index, %url, "opening capture stream");

        let index = target.index.to_string();
        let response = client
            .get(&url)
            .query(&[
                ("appid", target.app_id.as_str()),
                ("index", index.as_str()),
                ("device", target.device.as_str()),
                ("filter", target.filter.as_str()),
            ])
            .send()
            .await?;

        // The agent connection is closed when the response is dropped.
        if response.status() != reqwest::StatusCode::OK {
            return Err(AgentError::Status {
                host: target.host.clone(),
                status: response.status(),
            });
        }

        let reader = response
            .bytes_stream()
            // Wrap reqwest::Error as an io::Error for compatibility with AsyncRead.
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
            .into_async_read();

        Ok(Box::new(reader.compat()))
    }
}
