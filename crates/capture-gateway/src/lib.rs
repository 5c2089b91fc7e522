//! A gateway that captures live network traffic from instances of a
//! distributed application, without direct network access to them.
//!
//! A client presents a platform access token and names an application; the
//! gateway checks that the token may see the application, resolves where
//! each requested instance runs, opens a mutual-TLS capture stream to the
//! agent on each instance, and merges the per-instance capture streams into
//! one well-formed capture file streamed back over the HTTP response.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

mod agent;
mod capture;
mod control_plane;

pub use agent::{AgentClient, AgentConfig, AgentError, CaptureSource, CaptureTarget, PacketStream};
pub use control_plane::{ControlPlane, ResolverError};

#[derive(clap::Parser, Debug)]
#[clap(author, version, about = "Merges live packet captures from distributed application instances", long_about = None)]
pub struct Args {
    /// Address to bind the HTTP listener to.
    #[clap(
        long = "listen",
        env = "CAPTURE_GATEWAY_LISTEN",
        default_value = "0.0.0.0:8080"
    )]
    pub listen: std::net::SocketAddr,
    /// Root URL of the platform API. Fetched once at startup to discover the
    /// control-plane base URL.
    #[clap(long = "platform-api", env = "CAPTURE_GATEWAY_PLATFORM_API")]
    pub platform_api: url::Url,
    /// Port every instance's capture agent listens on.
    #[clap(
        long = "agent-port",
        env = "CAPTURE_GATEWAY_AGENT_PORT",
        default_value = "9494"
    )]
    pub agent_port: u16,
    /// Client certificate presented to capture agents (PEM).
    #[clap(long = "agent-client-cert", env = "CAPTURE_GATEWAY_AGENT_CLIENT_CERT")]
    pub agent_client_cert: PathBuf,
    /// Private key of the agent client certificate (PEM).
    #[clap(long = "agent-client-key", env = "CAPTURE_GATEWAY_AGENT_CLIENT_KEY")]
    pub agent_client_key: PathBuf,
    /// CA bundle that signs capture agent server certificates (PEM).
    #[clap(long = "agent-ca", env = "CAPTURE_GATEWAY_AGENT_CA")]
    pub agent_ca: PathBuf,
    /// Name that capture agent certificates are issued for. Agents are
    /// dialed by their resolved instance address, which need not match.
    #[clap(long = "agent-server-name", env = "CAPTURE_GATEWAY_AGENT_SERVER_NAME")]
    pub agent_server_name: String,
    /// Skip verification of agent server certificates.
    #[clap(long = "agent-skip-verify", env = "CAPTURE_GATEWAY_AGENT_SKIP_VERIFY")]
    pub agent_skip_verify: bool,
    /// Directory of client binaries served for download under /cli/.
    #[clap(long = "cli-root", env = "CAPTURE_GATEWAY_CLI_ROOT", default_value = "cli")]
    pub cli_root: PathBuf,
    /// Certificate used to serve TLS connections. When absent the gateway
    /// serves plain HTTP and should sit behind a TLS-terminating proxy.
    #[clap(
        long = "tls-cert",
        env = "CAPTURE_GATEWAY_TLS_CERT",
        requires = "tls_key"
    )]
    pub tls_cert: Option<PathBuf>,
    /// Key of the serving certificate.
    #[clap(
        long = "tls-key",
        env = "CAPTURE_GATEWAY_TLS_KEY",
        requires = "tls_cert"
    )]
    pub tls_key: Option<PathBuf>,
}

/// Shared, read-only state handed to request handlers.
pub struct App {
    pub control_plane: ControlPlane,
    pub source: Arc<dyn CaptureSource>,
}

/// Build the gateway's router.
pub fn build_router(app: Arc<App>, cli_root: &std::path::Path) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(|| async {}))
        .route("/capture", get(capture::handle_capture))
        .nest_service("/cli", tower_http::services::ServeDir::new(cli_root))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let control_plane = ControlPlane::discover(reqwest::Client::new(), args.platform_api.clone())
        .await
        .context("discovering the control-plane base URL")?;

    let source = AgentClient::new(&AgentConfig {
        port: args.agent_port,
        client_cert: args.agent_client_cert.clone(),
        client_key: args.agent_client_key.clone(),
        ca_bundle: args.agent_ca.clone(),
        server_name: args.agent_server_name.clone(),
        skip_verify: args.agent_skip_verify,
    })
    .context("loading capture agent client TLS material")?;

    let app = Arc::new(App {
        control_plane,
        source: Arc::new(source),
    });
    let router = build_router(app, &args.cli_root);

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .context("loading server TLS material")?;

            tracing::info!(listen = %args.listen, cli_root = %args.cli_root.display(), "capture gateway listening (TLS)");
            axum_server::bind_rustls(args.listen, tls)
                .serve(router.into_make_service())
                .await
                .context("serving HTTPS")?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(args.listen)
                .await
                .context("binding listener")?;

            tracing::info!(listen = %args.listen, cli_root = %args.cli_root.display(), "capture gateway listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("serving HTTP")?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("received shutdown signal");
}
