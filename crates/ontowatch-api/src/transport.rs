// Shared transport configuration for building reqwest::Client instances,
// plus endpoint construction for both change-feed bindings.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::Error;

const SUBSCRIPTIONS_PATH: &str = "api/v2/ontologySubscriptions/ontologies";

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (local development stacks only).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
///
/// Only the connect phase is bounded: SSE responses stay open indefinitely,
/// so a whole-request timeout would cut every stream.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!("ontowatch/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.as_str());

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

// ── Endpoints ────────────────────────────────────────────────────────

fn subscriptions_url(base: &Url, ontology_rid: &str, leaf: &str) -> Result<Url, Error> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&format!("{SUBSCRIPTIONS_PATH}/{ontology_rid}/{leaf}"))?)
}

/// `POST` endpoint for one SSE subscription.
pub fn sse_url(base: &Url, ontology_rid: &str, include_initial_state: bool) -> Result<Url, Error> {
    let mut url = subscriptions_url(base, ontology_rid, "sseSubscriptions")?;
    if include_initial_state {
        url.query_pairs_mut()
            .append_pair("includeInitialState", "true");
    }
    Ok(url)
}

/// Multiplexed WebSocket endpoint; `http(s)` becomes `ws(s)`.
pub fn websocket_url(base: &Url, ontology_rid: &str) -> Result<Url, Error> {
    let mut url = subscriptions_url(base, ontology_rid, "streamSubscriptions")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        _ => "wss",
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocketConnect(format!("cannot use scheme {scheme} for {url}")))?;
    Ok(url)
}
